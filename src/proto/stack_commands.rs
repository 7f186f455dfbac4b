// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-controller stack instructions (spec §3, §4.C): the program uploaded
//! into stack memory and executed autonomously by the controller on trigger.

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmeDataWidth {
    D16,
    D32,
}

impl VmeDataWidth {
    fn bits(self) -> u32 {
        match self {
            VmeDataWidth::D16 => 0,
            VmeDataWidth::D32 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReadVariant {
    Blt,
    Fifo,
    MbltSwapped,
}

impl BlockReadVariant {
    fn bits(self) -> u32 {
        match self {
            BlockReadVariant::Blt => 0,
            BlockReadVariant::Fifo => 1,
            BlockReadVariant::MbltSwapped => 2,
        }
    }
}

/// A single on-controller stack instruction. Opcodes occupy the top byte of
/// the first word of each instruction, per spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCommand {
    StackStart,
    StackEnd,
    VmeWrite {
        address: u32,
        value: u32,
        amod: u8,
        width: VmeDataWidth,
    },
    VmeRead {
        address: u32,
        amod: u8,
        width: VmeDataWidth,
    },
    VmeBlockRead {
        address: u32,
        amod: u8,
        max_transfers: u16,
        variant: BlockReadVariant,
    },
    WriteMarker(u32),
    WriteSpecial(u32),
    SetAccu(u32),
    ReadToAccu {
        address: u32,
        amod: u8,
        width: VmeDataWidth,
    },
    CompareLoopAccu {
        address: u32,
        amod: u8,
        width: VmeDataWidth,
        mask: u32,
    },
    MaskShiftAccu {
        mask: u32,
        shift: u8,
    },
    SignalAccu,
    Wait(u32),
    SoftwareDelay(u32),
}

const OP_STACK_START: u8 = 0xF3;
const OP_STACK_END: u8 = 0xF4;
const OP_VME_WRITE: u8 = 0x23;
const OP_VME_READ: u8 = 0x12;
const OP_VME_BLOCK_READ: u8 = 0x13;
const OP_WRITE_MARKER: u8 = 0xC2;
const OP_WRITE_SPECIAL: u8 = 0xC1;
const OP_SET_ACCU: u8 = 0x31;
const OP_READ_TO_ACCU: u8 = 0x32;
const OP_COMPARE_LOOP_ACCU: u8 = 0x33;
const OP_MASK_SHIFT_ACCU: u8 = 0x34;
const OP_SIGNAL_ACCU: u8 = 0x35;
const OP_WAIT: u8 = 0x36;
const OP_SOFTWARE_DELAY: u8 = 0x37;

impl StackCommand {
    /// Number of 32-bit words this instruction occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            StackCommand::StackStart
            | StackCommand::StackEnd
            | StackCommand::SignalAccu => 1,
            StackCommand::SetAccu(_)
            | StackCommand::WriteMarker(_)
            | StackCommand::WriteSpecial(_)
            | StackCommand::MaskShiftAccu { .. }
            | StackCommand::Wait(_)
            | StackCommand::SoftwareDelay(_)
            | StackCommand::VmeRead { .. }
            | StackCommand::ReadToAccu { .. } => 2,
            StackCommand::VmeWrite { .. }
            | StackCommand::VmeBlockRead { .. }
            | StackCommand::CompareLoopAccu { .. } => 3,
        }
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        match *self {
            StackCommand::StackStart => out.push((OP_STACK_START as u32) << 24),
            StackCommand::StackEnd => out.push((OP_STACK_END as u32) << 24),
            StackCommand::SignalAccu => out.push((OP_SIGNAL_ACCU as u32) << 24),
            StackCommand::VmeWrite {
                address,
                value,
                amod,
                width,
            } => {
                out.push((OP_VME_WRITE as u32) << 24 | (amod as u32) << 16 | width.bits());
                out.push(address);
                out.push(value);
            }
            StackCommand::VmeRead {
                address,
                amod,
                width,
            } => {
                out.push((OP_VME_READ as u32) << 24 | (amod as u32) << 16 | width.bits());
                out.push(address);
            }
            StackCommand::VmeBlockRead {
                address,
                amod,
                max_transfers,
                variant,
            } => {
                out.push(
                    (OP_VME_BLOCK_READ as u32) << 24
                        | (variant.bits()) << 20
                        | (amod as u32) << 16,
                );
                out.push(address);
                out.push(max_transfers as u32);
            }
            StackCommand::WriteMarker(v) => {
                out.push((OP_WRITE_MARKER as u32) << 24);
                out.push(v);
            }
            StackCommand::WriteSpecial(v) => {
                out.push((OP_WRITE_SPECIAL as u32) << 24);
                out.push(v);
            }
            StackCommand::SetAccu(v) => {
                out.push((OP_SET_ACCU as u32) << 24);
                out.push(v);
            }
            StackCommand::ReadToAccu {
                address,
                amod,
                width,
            } => {
                out.push((OP_READ_TO_ACCU as u32) << 24 | (amod as u32) << 16 | width.bits());
                out.push(address);
            }
            StackCommand::CompareLoopAccu {
                address,
                amod,
                width,
                mask,
            } => {
                out.push(
                    (OP_COMPARE_LOOP_ACCU as u32) << 24 | (amod as u32) << 16 | width.bits(),
                );
                out.push(address);
                out.push(mask);
            }
            StackCommand::MaskShiftAccu { mask, shift } => {
                out.push((OP_MASK_SHIFT_ACCU as u32) << 24 | shift as u32);
                out.push(mask);
            }
            StackCommand::Wait(cycles) => {
                out.push((OP_WAIT as u32) << 24);
                out.push(cycles);
            }
            StackCommand::SoftwareDelay(micros) => {
                out.push((OP_SOFTWARE_DELAY as u32) << 24);
                out.push(micros);
            }
        }
    }

    /// Decode a single instruction starting at `words[0]`. Returns the
    /// instruction and how many words it consumed.
    pub fn decode(words: &[u32]) -> Option<(StackCommand, usize)> {
        let w0 = *words.first()?;
        let opcode = (w0 >> 24) as u8;
        let amod = ((w0 >> 16) & 0xFF) as u8;
        let width = if w0 & 1 != 0 {
            VmeDataWidth::D32
        } else {
            VmeDataWidth::D16
        };
        Some(match opcode {
            OP_STACK_START => (StackCommand::StackStart, 1),
            OP_STACK_END => (StackCommand::StackEnd, 1),
            OP_SIGNAL_ACCU => (StackCommand::SignalAccu, 1),
            OP_VME_WRITE => (
                StackCommand::VmeWrite {
                    address: *words.get(1)?,
                    value: *words.get(2)?,
                    amod,
                    width,
                },
                3,
            ),
            OP_VME_READ => (
                StackCommand::VmeRead {
                    address: *words.get(1)?,
                    amod,
                    width,
                },
                2,
            ),
            OP_VME_BLOCK_READ => {
                let variant = match (w0 >> 20) & 0xF {
                    0 => BlockReadVariant::Blt,
                    1 => BlockReadVariant::Fifo,
                    _ => BlockReadVariant::MbltSwapped,
                };
                (
                    StackCommand::VmeBlockRead {
                        address: *words.get(1)?,
                        amod,
                        max_transfers: *words.get(2)? as u16,
                        variant,
                    },
                    3,
                )
            }
            OP_WRITE_MARKER => (StackCommand::WriteMarker(*words.get(1)?), 2),
            OP_WRITE_SPECIAL => (StackCommand::WriteSpecial(*words.get(1)?), 2),
            OP_SET_ACCU => (StackCommand::SetAccu(*words.get(1)?), 2),
            OP_READ_TO_ACCU => (
                StackCommand::ReadToAccu {
                    address: *words.get(1)?,
                    amod,
                    width,
                },
                2,
            ),
            OP_COMPARE_LOOP_ACCU => (
                StackCommand::CompareLoopAccu {
                    address: *words.get(1)?,
                    amod,
                    width,
                    mask: *words.get(2)?,
                },
                3,
            ),
            OP_MASK_SHIFT_ACCU => (
                StackCommand::MaskShiftAccu {
                    mask: *words.get(1)?,
                    shift: (w0 & 0xFF) as u8,
                },
                2,
            ),
            OP_WAIT => (StackCommand::Wait(*words.get(1)?), 2),
            OP_SOFTWARE_DELAY => (StackCommand::SoftwareDelay(*words.get(1)?), 2),
            _ => return None,
        })
    }
}

/// Accumulates stack opcodes (spec §4.C). Offers `encoded_size` so callers
/// can split oversized uploads across transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackCommandBuilder {
    commands: Vec<StackCommand>,
}

impl StackCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: StackCommand) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn commands(&self) -> &[StackCommand] {
        &self.commands
    }

    /// Total wire size in 32-bit words, including the `StackStart`/`StackEnd`
    /// markers this builder will wrap the body in when encoded.
    pub fn encoded_size(&self) -> usize {
        2 + self.commands.iter().map(StackCommand::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.encoded_size());
        StackCommand::StackStart.encode(&mut out);
        for cmd in &self.commands {
            cmd.encode(&mut out);
        }
        StackCommand::StackEnd.encode(&mut out);
        out
    }

    /// Reconstructs a builder from an encoded stack program. Used by the
    /// encode-decode round trip law (spec §8).
    pub fn from_words(words: &[u32]) -> Result<StackCommandBuilder, ConfigurationError> {
        let mut b = StackCommandBuilder::new();
        let mut i = 0usize;
        let bad = || ConfigurationError::InvalidUri("malformed stack program".into());
        if words.is_empty() || (words[0] >> 24) as u8 != OP_STACK_START {
            return Err(bad());
        }
        i += 1;
        loop {
            if i >= words.len() {
                return Err(bad());
            }
            if (words[i] >> 24) as u8 == OP_STACK_END {
                break;
            }
            let (cmd, n) = StackCommand::decode(&words[i..]).ok_or_else(bad)?;
            b.push(cmd);
            i += n;
        }
        Ok(b)
    }

    /// Whether this program, once encoded, fits within the given stack
    /// memory budget (spec §6: `StackMemoryWords`).
    pub fn fits_within(&self, words_available: usize) -> bool {
        self.encoded_size() <= words_available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trips_through_words() {
        let mut b = StackCommandBuilder::new();
        b.push(StackCommand::VmeWrite {
            address: 0x1000,
            value: 0xDEAD_BEEF,
            amod: 0x09,
            width: VmeDataWidth::D32,
        })
        .push(StackCommand::VmeRead {
            address: 0x1004,
            amod: 0x09,
            width: VmeDataWidth::D16,
        })
        .push(StackCommand::WriteMarker(0x1337_0001));

        let words = b.encode();
        assert_eq!(words.len(), b.encoded_size());
        let b2 = StackCommandBuilder::from_words(&words).unwrap();
        assert_eq!(b, b2);
    }

    #[test]
    fn block_read_variant_round_trips() {
        let mut b = StackCommandBuilder::new();
        b.push(StackCommand::VmeBlockRead {
            address: 0x0000_1000,
            amod: 0x0B,
            max_transfers: 65,
            variant: BlockReadVariant::MbltSwapped,
        });
        let words = b.encode();
        let b2 = StackCommandBuilder::from_words(&words).unwrap();
        assert_eq!(b, b2);
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_vme_ops_round_trip(addr in 0u32..0xFFFF_FFFF, val in 0u32..0xFFFF_FFFF, amod in 0u8..=255) {
            let mut b = StackCommandBuilder::new();
            b.push(StackCommand::VmeWrite { address: addr, value: val, amod, width: VmeDataWidth::D32 });
            let words = b.encode();
            let b2 = StackCommandBuilder::from_words(&words).unwrap();
            proptest::prop_assert_eq!(b, b2);
        }
    }
}
