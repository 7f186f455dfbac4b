// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dialog layer (spec §4.D): synchronous, lock-serialized request/response
//! on the command pipe.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::config::{RuntimeLimits, IMMEDIATE_STACK_RESERVED_WORDS, STACK_MEMORY_WORDS};
use crate::error::{ConfigurationError, Error, ProtocolError, VmeError};
use crate::frame::{self, FrameType, StackFrameHeader};
use crate::proto::{
    stack_commands::VmeDataWidth, StackCommand, StackCommandBuilder, SuperCommand,
    SuperCommandBuilder, SuperResponseItem,
};
use crate::stack_errors::ErrorCounters;
use crate::transport::{Pipe, Transport};

/// Registers assumed for the crate's global control surface. Exact values
/// are not pinned down by the available wire examples; chosen to match the
/// conventional mvlc register map layout and recorded in DESIGN.md.
pub mod registers {
    pub const DAQ_MODE: u16 = 0x1300;
    pub const ETH_DATA_DEST_HOST: u16 = 0x4400;
    pub const STACK_TRIGGER_BASE: u16 = 0x1100;
    pub const STACK_OFFSET_BASE: u16 = 0x1200;
}

/// Result of a `read_stack_info` dialog call (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    pub stack_id: u8,
    pub offset: u16,
    pub trigger_register: u16,
}

/// Reads 32-bit little-endian words off a pipe, buffering partial words
/// across short USB reads.
struct WordReader<'a> {
    transport: &'a dyn Transport,
    pipe: Pipe,
    carry: Vec<u8>,
}

impl<'a> WordReader<'a> {
    fn new(transport: &'a dyn Transport, pipe: Pipe) -> Self {
        WordReader {
            transport,
            pipe,
            carry: Vec::new(),
        }
    }

    /// Blocks until at least one full word is available or `timeout`
    /// elapses, returning the newly completed words.
    fn read_words(&mut self, timeout: Duration) -> Result<Vec<u32>, Error> {
        let mut buf = [0u8; 4096];
        let n = self.transport.read(self.pipe, &mut buf, timeout)?;
        self.carry.extend_from_slice(&buf[..n]);
        let whole = self.carry.len() / 4;
        let mut words = Vec::with_capacity(whole);
        for chunk in self.carry[..whole * 4].chunks_exact(4) {
            words.push(LittleEndian::read_u32(chunk));
        }
        self.carry.drain(..whole * 4);
        Ok(words)
    }
}

/// Everything collected while waiting for one super-command's response.
#[derive(Debug, Default)]
struct PendingResponse {
    mirror_words: Vec<u32>,
    stack_words: Vec<u32>,
    stack_flags_seen: Option<StackFrameHeader>,
    mirror_done: bool,
    complete: bool,
}

pub struct Dialog {
    transport: Arc<dyn Transport>,
    next_ref: AtomicU16,
    error_counters: Arc<ErrorCounters>,
    limits: RuntimeLimits,
}

impl Dialog {
    pub fn new(transport: Arc<dyn Transport>, error_counters: Arc<ErrorCounters>) -> Self {
        Dialog {
            transport,
            next_ref: AtomicU16::new(1),
            error_counters,
            limits: RuntimeLimits::default(),
        }
    }

    fn fresh_reference(&self) -> u16 {
        // Wrap through the 16-bit space, skipping 0 to keep it visually
        // distinguishable from an unset/garbage reference in logs.
        let r = self.next_ref.fetch_add(1, Ordering::Relaxed);
        if r == 0 {
            self.next_ref.store(1, Ordering::Relaxed);
            1
        } else {
            r
        }
    }

    fn write_words(&self, pipe: Pipe, words: &[u32]) -> Result<(), Error> {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let mut sent = 0;
        while sent < bytes.len() {
            let n = self.transport.write(pipe, &bytes[sent..])?;
            if n == 0 {
                return Err(ProtocolError::SuperFormatError.into());
            }
            sent += n;
        }
        Ok(())
    }

    /// Core of spec §4.D: send a super buffer, then loop reading frames
    /// from the command pipe until the mirrored response matching
    /// `reference` is fully collected. `StackErrorNotification` frames are
    /// absorbed into the shared counters and never terminate the wait.
    fn transact(&self, reference: u16, request: &[u32], expect_stack: bool) -> Result<PendingResponse, Error> {
        self.write_words(Pipe::Command, request)?;

        let mut reader = WordReader::new(&*self.transport, Pipe::Command);
        let mut pending = PendingResponse::default();
        let deadline = std::time::Instant::now() + self.limits.default_read_timeout * 10;

        while !pending.complete {
            if std::time::Instant::now() > deadline {
                return Err(crate::error::TransportError::Timeout.into());
            }
            let words = reader.read_words(self.limits.default_read_timeout)?;
            self.consume_response_words(reference, &words, expect_stack, &mut pending)?;
        }
        Ok(pending)
    }

    fn consume_response_words(
        &self,
        reference: u16,
        words: &[u32],
        expect_stack: bool,
        pending: &mut PendingResponse,
    ) -> Result<(), Error> {
        let mut i = 0;
        while i < words.len() {
            let w = words[i];
            match frame::frame_type(w) {
                Some(FrameType::SuperFrame) | Some(FrameType::SuperContinuation)
                    if pending.mirror_words.is_empty() =>
                {
                    // Start of a fresh mirror response: scan to its
                    // terminator (see proto::super_commands doc comment on
                    // why `length` isn't load-bearing here).
                    pending.mirror_words.push(w);
                    i += 1;
                    while i < words.len() {
                        pending.mirror_words.push(words[i]);
                        let done = words[i] & 0xFF00_0000 == 0xF200_0000;
                        i += 1;
                        if done {
                            break;
                        }
                    }
                    if *pending.mirror_words.last().unwrap_or(&0) & 0xFF00_0000 == 0xF200_0000 {
                        let decoded = crate::proto::super_commands::decode_super_response(
                            &pending.mirror_words,
                        )?;
                        match decoded.reference {
                            Some(r) if r == reference => {}
                            Some(_) => {
                                self.error_counters.record_ref_mismatch();
                                return Err(ProtocolError::RefWordMismatch {
                                    expected: reference,
                                    actual: decoded.reference.unwrap_or(0),
                                }
                                .into());
                            }
                            None => return Err(ProtocolError::SuperFormatError.into()),
                        }
                        let stack_done = pending
                            .stack_flags_seen
                            .map(|h| !h.flags.continue_)
                            .unwrap_or(false);
                        if !expect_stack || stack_done {
                            pending.complete = true;
                        }
                        pending.mirror_done = true;
                    }
                }
                Some(FrameType::StackFrame) | Some(FrameType::StackContinuation) => {
                    let header = frame::decode_stack_frame_header(w)
                        .ok_or(ProtocolError::InvalidFrameHeader(w))?;
                    i += 1;
                    let len = header.length as usize;
                    let end = (i + len).min(words.len());
                    pending.stack_words.extend_from_slice(&words[i..end]);
                    i = end;
                    pending.stack_flags_seen = Some(header);
                    if !header.flags.continue_ && pending.mirror_done {
                        pending.complete = true;
                    }
                }
                Some(FrameType::StackErrorNotification) => {
                    let header = frame::decode_stack_frame_header(w)
                        .ok_or(ProtocolError::InvalidFrameHeader(w))?;
                    i += 1;
                    let len = header.length as usize;
                    let line = *words.get(i).unwrap_or(&0) as u8;
                    self.error_counters
                        .record_stack_error(header.stack, line, header.flags);
                    warn!(stack = header.stack, "stack error notification");
                    i = (i + len).min(words.len());
                }
                Some(FrameType::SystemEvent) | Some(FrameType::BlockRead) => {
                    // Not expected on the command pipe outside of
                    // stack-output bodies (handled above); skip defensively.
                    i += 1;
                }
                None => {
                    self.error_counters.record_unknown_header(frame::top_byte(w));
                    i += 1;
                }
                _ => {
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn simple_super_transaction(
        &self,
        build: impl FnOnce(&mut SuperCommandBuilder),
    ) -> Result<crate::proto::SuperResponse, Error> {
        let reference = self.fresh_reference();
        let mut builder = SuperCommandBuilder::new();
        builder.push(SuperCommand::ReferenceWord(reference));
        build(&mut builder);
        let request = builder.encode();
        debug!(reference, words = request.len(), "super transaction");
        let pending = self.transact(reference, &request, false)?;
        crate::proto::super_commands::decode_super_response(&pending.mirror_words)
            .map_err(Error::from)
    }

    pub fn read_register(&self, addr: u16) -> Result<u32, Error> {
        let resp = self.simple_super_transaction(|b| {
            b.push(SuperCommand::ReadLocal(addr));
        })?;
        for item in &resp.items {
            if let SuperResponseItem::ReadLocal { addr: a, result } = item {
                if *a == addr {
                    return Ok(*result);
                }
            }
        }
        Err(ProtocolError::SuperFormatError.into())
    }

    pub fn write_register(&self, addr: u16, value: u32) -> Result<(), Error> {
        self.simple_super_transaction(|b| {
            b.push(SuperCommand::WriteLocal(addr, value));
        })?;
        Ok(())
    }

    fn vme_stack_transaction(
        &self,
        build: impl FnOnce(&mut StackCommandBuilder),
    ) -> Result<(Vec<u32>, StackFrameHeader), Error> {
        let mut stack = StackCommandBuilder::new();
        build(&mut stack);
        let reference = self.fresh_reference();
        let mut builder = SuperCommandBuilder::new();
        builder.push(SuperCommand::ReferenceWord(reference));
        builder.push(SuperCommand::StackUpload {
            stack,
            output_pipe: crate::proto::StackOutputPipe::Command,
            offset: 0,
        });
        builder.push(SuperCommand::StackStart {
            stack_id: 0,
            offset: 0,
        });
        let request = builder.encode();
        let pending = self.transact(reference, &request, true)?;
        let header = pending
            .stack_flags_seen
            .ok_or(ProtocolError::SuperFormatError)?;
        if header.flags.syntax_error {
            return Err(VmeError::SyntaxError.into());
        }
        if header.flags.timeout {
            return Err(VmeError::Timeout.into());
        }
        Ok((pending.stack_words, header))
    }

    pub fn vme_read(&self, addr: u32, amod: u8, width: VmeDataWidth) -> Result<u32, Error> {
        let (words, header) = self.vme_stack_transaction(|s| {
            s.push(StackCommand::VmeRead {
                address: addr,
                amod,
                width,
            });
        })?;
        if header.flags.bus_error {
            return Err(VmeError::BusError.into());
        }
        words
            .first()
            .copied()
            .ok_or_else(|| ProtocolError::SuperFormatError.into())
    }

    pub fn vme_write(&self, addr: u32, value: u32, amod: u8, width: VmeDataWidth) -> Result<(), Error> {
        let (_words, header) = self.vme_stack_transaction(|s| {
            s.push(StackCommand::VmeWrite {
                address: addr,
                value,
                amod,
                width,
            });
        })?;
        if header.flags.bus_error {
            return Err(VmeError::BusError.into());
        }
        Ok(())
    }

    /// VME block read. A `BusError` mid-transfer is how BLT termination is
    /// signaled in normal operation: data read before the BERR is preserved
    /// and returned alongside the error (spec §4.D).
    pub fn vme_block_read(
        &self,
        addr: u32,
        amod: u8,
        max_transfers: u16,
    ) -> Result<Vec<u32>, Error> {
        self.block_read_variant(addr, amod, max_transfers, crate::proto::stack_commands::BlockReadVariant::Blt)
    }

    pub fn vme_mblt_swapped(&self, addr: u32, max_transfers: u16) -> Result<Vec<u32>, Error> {
        let words = self.block_read_variant(
            addr,
            0x0B,
            max_transfers,
            crate::proto::stack_commands::BlockReadVariant::MbltSwapped,
        )?;
        // Swap the two 32-bit halves of each 64-bit MBLT word. Comments and
        // code disagreed on direction upstream (spec §9 open question); we
        // swap low/high consistently and document the choice in DESIGN.md.
        let mut out = Vec::with_capacity(words.len());
        let mut it = words.chunks_exact(2);
        for pair in &mut it {
            out.push(pair[1]);
            out.push(pair[0]);
        }
        out.extend_from_slice(it.remainder());
        Ok(out)
    }

    fn block_read_variant(
        &self,
        addr: u32,
        amod: u8,
        max_transfers: u16,
        variant: crate::proto::stack_commands::BlockReadVariant,
    ) -> Result<Vec<u32>, Error> {
        let result = self.vme_stack_transaction(|s| {
            s.push(StackCommand::VmeBlockRead {
                address: addr,
                amod,
                max_transfers,
                variant,
            });
        });
        match result {
            Ok((words, header)) => {
                if header.flags.bus_error {
                    // Normal BLT termination: preserve whatever was read.
                    return Ok(extract_block_read_payload(&words));
                }
                Ok(extract_block_read_payload(&words))
            }
            Err(e) => Err(e),
        }
    }

    /// Upload a stack program into stack memory at `offset` without
    /// triggering it (spec §4.D `upload_stack`).
    pub fn upload_stack(&self, stack: StackCommandBuilder, offset: u16) -> Result<(), Error> {
        if !stack.fits_within(STACK_MEMORY_WORDS - offset as usize) {
            return Err(ConfigurationError::StackMemoryOverflow {
                requested: stack.encoded_size(),
                available: STACK_MEMORY_WORDS - offset as usize,
            }
            .into());
        }
        self.simple_super_transaction(|b| {
            b.push(SuperCommand::StackUpload {
                stack,
                output_pipe: crate::proto::StackOutputPipe::Data,
                offset,
            });
        })?;
        Ok(())
    }

    /// Upload readout stacks in order: stack 0 is reserved for immediate
    /// execution, stacks 1..=7 are readout stacks (spec §4.K).
    pub fn setup_readout_stacks(&self, stacks: &[(u8, StackCommandBuilder)]) -> Result<(), Error> {
        let mut offset = IMMEDIATE_STACK_RESERVED_WORDS as u16;
        for (stack_id, stack) in stacks {
            if *stack_id == 0 || *stack_id > 7 {
                return Err(ConfigurationError::InvalidStackId(*stack_id).into());
            }
            self.upload_stack(stack.clone(), offset)?;
            self.write_register(
                registers::STACK_OFFSET_BASE + *stack_id as u16,
                offset as u32,
            )?;
            offset += stack.encoded_size() as u16;
        }
        Ok(())
    }

    pub fn setup_readout_triggers(&self, triggers: &[(u8, u32)]) -> Result<(), Error> {
        for (stack_id, trigger_bits) in triggers {
            self.write_register(
                registers::STACK_TRIGGER_BASE + *stack_id as u16,
                *trigger_bits,
            )?;
        }
        Ok(())
    }

    pub fn enable_daq_mode(&self) -> Result<(), Error> {
        self.write_register(registers::DAQ_MODE, 1)
    }

    pub fn disable_daq_mode(&self) -> Result<(), Error> {
        self.write_register(registers::DAQ_MODE, 0)
    }

    pub fn redirect_eth_data_stream(&self, host_word: u32) -> Result<(), Error> {
        self.write_register(registers::ETH_DATA_DEST_HOST, host_word)
    }

    pub fn read_stack_info(&self, stack_id: u8) -> Result<StackInfo, Error> {
        if stack_id > 7 {
            return Err(ConfigurationError::InvalidStackId(stack_id).into());
        }
        let offset = self.read_register(registers::STACK_OFFSET_BASE + stack_id as u16)? as u16;
        let trigger_register = registers::STACK_TRIGGER_BASE + stack_id as u16;
        Ok(StackInfo {
            stack_id,
            offset,
            trigger_register,
        })
    }

    /// Arbitrary stack transaction (spec §4.D `stack_transaction`).
    pub fn stack_transaction(&self, stack: StackCommandBuilder) -> Result<Vec<u32>, Error> {
        let (words, header) = self.vme_stack_transaction(|s| *s = stack)?;
        if header.flags.bus_error {
            return Ok(words);
        }
        Ok(words)
    }

    /// Scan-bus helper (spec §4.D, §8 S6). Builds a stack containing as
    /// many D16 probe reads as fit in the immediate-stack reserve, stepping
    /// the upper 16 bits of the address. An address is a candidate when the
    /// returned word is not exactly `0xFFFFFFnn`.
    pub fn scan_bus(&self, probe_register_offset: u32, amod: u8) -> Result<Vec<u32>, Error> {
        let max_probes = (IMMEDIATE_STACK_RESERVED_WORDS - 2) / 2;
        let mut stack = StackCommandBuilder::new();
        for upper in 0..max_probes as u32 {
            let addr = (upper << 16) | probe_register_offset;
            stack.push(StackCommand::VmeRead {
                address: addr,
                amod,
                width: VmeDataWidth::D16,
            });
        }
        let words = self.stack_transaction(stack)?;
        Ok(words
            .into_iter()
            .enumerate()
            .filter(|(_, w)| w & 0xFFFF_FF00 != 0xFFFF_FF00)
            .map(|(idx, _)| ((idx as u32) << 16) | probe_register_offset)
            .collect())
    }
}

fn extract_block_read_payload(stack_words: &[u32]) -> Vec<u32> {
    // A block read's payload is wrapped in an embedded `BlockRead` (0xF5)
    // sub-frame inside the stack output (spec §3, §4.D).
    let mut i = 0;
    while i < stack_words.len() {
        if let Some(header) = frame::decode_stack_frame_header(stack_words[i]) {
            let start = i + 1;
            let end = (start + header.length as usize).min(stack_words.len());
            return stack_words[start..end].to_vec();
        }
        i += 1;
    }
    stack_words.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_block_read_payload_unwraps_f5_frame() {
        let f5 = frame::encode_stack_frame_header(
            FrameType::BlockRead,
            StackFrameHeader {
                stack: 0,
                flags: Default::default(),
                length: 3,
            },
        );
        let words = vec![f5, 0x1111_1111, 0x2222_2222, 0x3333_3333];
        assert_eq!(
            extract_block_read_payload(&words),
            vec![0x1111_1111, 0x2222_2222, 0x3333_3333]
        );
    }
}
