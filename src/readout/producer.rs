// SPDX-License-Identifier: MIT OR Apache-2.0

//! Readout producer (spec §4.F): fills pooled buffers from the data pipe,
//! applying USB framing fixup or ETH per-packet header stripping so every
//! buffer handed to the parser is a clean stream of frame words.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer_pool::{Buffer, BufferPool};
use crate::config::{RuntimeLimits, JUMBO_FRAME_MAX_SIZE, USB_STREAM_PIPE_READ_SIZE};
use crate::error::TransportError;
use crate::readout::framing_fixup;
use crate::transport::usb::USB_ALIGNMENT;
use crate::transport::{Pipe, Transport, TransportKind};

pub struct Producer {
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    limits: RuntimeLimits,
    usb_carry: Vec<u8>,
}

impl Producer {
    pub fn new(transport: Arc<dyn Transport>, pool: Arc<BufferPool>, limits: RuntimeLimits) -> Self {
        Producer {
            transport,
            pool,
            limits,
            usb_carry: Vec::new(),
        }
    }

    /// Fills and returns one buffer, or `None` if the pool had nothing free
    /// within `producer_poll_timeout` (caller should check `quit` and retry).
    pub fn fill_one(&mut self, quit: &AtomicBool) -> Option<Buffer> {
        let kind = self.transport.kind();
        let mut buffer = self.pool.acquire(kind, self.limits.producer_poll_timeout)?;

        if !self.usb_carry.is_empty() {
            let carry_len = self.usb_carry.len();
            if buffer.spare_capacity_mut().len() < carry_len {
                buffer.spare_capacity_mut().resize(carry_len, 0);
            }
            buffer.spare_capacity_mut()[..carry_len].copy_from_slice(&self.usb_carry);
            buffer.set_used(carry_len);
            self.usb_carry.clear();
        }

        let deadline = Instant::now() + self.limits.flush_buffer_timeout;
        match kind {
            TransportKind::Usb => self.fill_usb(&mut buffer, quit, deadline),
            TransportKind::Eth => self.fill_eth(&mut buffer, quit, deadline),
        }
        Some(buffer)
    }

    fn fill_usb(&mut self, buffer: &mut Buffer, quit: &AtomicBool, deadline: Instant) {
        loop {
            if quit.load(Ordering::Relaxed) || Instant::now() >= deadline {
                break;
            }
            let free = buffer.free_space();
            if free < USB_ALIGNMENT {
                break;
            }
            let chunk = free.min(USB_STREAM_PIPE_READ_SIZE);
            let used = buffer.used();
            let cap = buffer.capacity();
            buffer.spare_capacity_mut().resize(cap, 0);
            let n = match self.transport.read(
                Pipe::Data,
                &mut buffer.spare_capacity_mut()[used..used + chunk],
                self.limits.default_read_timeout,
            ) {
                Ok(n) => n,
                // Idle periods are expected, not an error (spec §7).
                Err(TransportError::Timeout) => break,
                Err(_) => break,
            };
            buffer.set_used(used + n);
            if n == 0 {
                break;
            }
        }

        let (keep_len, carry) = {
            let (keep, carry) = framing_fixup::split_at_fixup(buffer.as_bytes());
            (keep.len(), carry.to_vec())
        };
        buffer.set_used(keep_len);
        self.usb_carry = carry;
    }

    fn fill_eth(&mut self, buffer: &mut Buffer, quit: &AtomicBool, deadline: Instant) {
        loop {
            if quit.load(Ordering::Relaxed) || Instant::now() >= deadline {
                break;
            }
            if buffer.free_space() < JUMBO_FRAME_MAX_SIZE {
                break;
            }
            let used = buffer.used();
            let cap = buffer.capacity();
            buffer.spare_capacity_mut().resize(cap, 0);
            let n = match self.transport.read(
                Pipe::Data,
                &mut buffer.spare_capacity_mut()[used..],
                self.limits.default_read_timeout,
            ) {
                Ok(n) => n,
                Err(TransportError::Timeout) => break,
                Err(_) => break,
            };
            if n < 8 {
                continue;
            }

            let w0 = u32::from_le_bytes(
                buffer.spare_capacity_mut()[used..used + 4].try_into().unwrap(),
            );
            let w1 = u32::from_le_bytes(
                buffer.spare_capacity_mut()[used + 4..used + 8].try_into().unwrap(),
            );
            let header = crate::transport::eth::decode_header([w0, w1]);
            let declared_bytes = header.data_word_count as usize * 4;
            let payload_start = used + 8;
            let payload_len = declared_bytes.min(n.saturating_sub(8));

            // Drop the two ETH header words in place: the parser works on a
            // plain frame-word stream regardless of transport (spec §4.H
            // notes the header is otherwise consumed separately per packet;
            // stripping it here keeps the parser transport-agnostic).
            buffer
                .spare_capacity_mut()
                .copy_within(payload_start..payload_start + payload_len, used);
            buffer.set_used(used + payload_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError as TErr;
    use crate::transport::TransportResult;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct FakeTransport {
        kind: TransportKind,
        chunks: Mutex<VecDeque<Vec<u8>>>,
    }

    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn connect(&self) -> TransportResult<()> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn write(&self, _pipe: Pipe, bytes: &[u8]) -> TransportResult<usize> {
            Ok(bytes.len())
        }
        fn read(&self, _pipe: Pipe, buf: &mut [u8], _timeout: Duration) -> TransportResult<usize> {
            match self.chunks.lock().pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Err(TErr::Timeout),
            }
        }
        fn set_read_timeout(&self, _pipe: Pipe, _timeout: Duration) {}
        fn read_timeout(&self, _pipe: Pipe) -> Duration {
            Duration::from_millis(500)
        }
    }

    #[test]
    fn usb_partial_frame_carries_to_next_buffer() {
        use crate::frame::{encode_super_frame_header, FrameType};

        let complete = encode_super_frame_header(FrameType::SuperFrame, 1);
        let partial_header = encode_super_frame_header(FrameType::SuperFrame, 3);
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&complete.to_le_bytes());
        chunk.extend_from_slice(&0xAAAA_AAAAu32.to_le_bytes());
        chunk.extend_from_slice(&partial_header.to_le_bytes());
        chunk.extend_from_slice(&0xBBBB_BBBBu32.to_le_bytes());

        let transport = Arc::new(FakeTransport {
            kind: TransportKind::Usb,
            chunks: Mutex::new(VecDeque::from([chunk])),
        });
        let pool = Arc::new(BufferPool::new(2, 64));
        let mut producer = Producer::new(transport, pool, RuntimeLimits::default());
        let quit = AtomicBool::new(false);

        let first = producer.fill_one(&quit).unwrap();
        assert_eq!(first.used(), 8); // only the complete frame
        assert_eq!(producer.usb_carry.len(), 8); // partial header + 1 word
    }
}
