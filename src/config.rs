// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crate configuration surface (spec §6, SPEC_FULL.md §C).
//!
//! Parsing a user-authored YAML file's full schema, CLI flags, and
//! VME-module register layouts are out of scope (spec §1, "external
//! collaborators"). What stays in scope is the in-band round trip: a
//! [`CrateConfig`] must serialize to YAML for the listfile preamble (spec
//! §6) and deserialize back out of it, because the event builder and parser
//! need the readout structure to reconstruct a run from a listfile.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::proto::StackCommandBuilder;

/// Process-wide stack-memory layout constants (spec §6).
pub const IMMEDIATE_STACK_RESERVED_WORDS: usize = 128;
pub const STACK_MEMORY_WORDS: usize = 4096;
pub const USB_STREAM_PIPE_READ_SIZE: usize = 1024 * 64;
pub const JUMBO_FRAME_MAX_SIZE: usize = 9000;
pub const MIRROR_TRANSACTION_MAX_CONTENTS_WORDS: usize = STACK_MEMORY_WORDS - 1;

/// Per-pipe and flush timeouts (spec §6, §5).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    pub default_read_timeout: Duration,
    pub flush_buffer_timeout: Duration,
    pub producer_poll_timeout: Duration,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        RuntimeLimits {
            default_read_timeout: Duration::from_millis(500),
            flush_buffer_timeout: Duration::from_millis(500),
            producer_poll_timeout: Duration::from_millis(500),
        }
    }
}

/// Declares one module's fixed framing within an event's stack output
/// (spec §4.H `readoutStructure`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReadoutStructure {
    pub prefix_len: u16,
    pub has_dynamic: bool,
    pub suffix_len: u16,
}

/// One stack's trigger configuration (spec §4.K).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    Irq(u8),
    Timer { period_ms: u32 },
    Software,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSetup {
    pub stack_id: u8,
    pub trigger: TriggerCondition,
    pub modules: Vec<ModuleReadoutStructure>,
    #[serde(with = "stack_words")]
    pub commands: StackCommandBuilder,
}

mod stack_words {
    use super::StackCommandBuilder;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(b: &StackCommandBuilder, s: S) -> Result<S::Ok, S::Error> {
        b.encode().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<StackCommandBuilder, D::Error> {
        let words = Vec::<u32>::deserialize(d)?;
        StackCommandBuilder::from_words(&words).map_err(serde::de::Error::custom)
    }
}

/// A crate's declarative run configuration: init commands, readout stacks,
/// and triggers (spec GLOSSARY "Crate config"). Persisted in-band at the
/// start of every listfile (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrateConfig {
    pub name: String,
    #[serde(with = "init_words")]
    pub init_commands: StackCommandBuilder,
    pub readout_stacks: Vec<StackSetup>,
}

mod init_words {
    use super::StackCommandBuilder;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(b: &StackCommandBuilder, s: S) -> Result<S::Ok, S::Error> {
        b.encode().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<StackCommandBuilder, D::Error> {
        let words = Vec::<u32>::deserialize(d)?;
        StackCommandBuilder::from_words(&words).map_err(serde::de::Error::custom)
    }
}

impl CrateConfig {
    pub fn to_yaml(&self) -> Result<Vec<u8>, ConfigurationError> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn from_yaml(bytes: &[u8]) -> Result<CrateConfig, ConfigurationError> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// The per-event readout structure the parser needs (spec §4.H),
    /// indexed by event/stack index.
    pub fn readout_structure(&self) -> Vec<Vec<ModuleReadoutStructure>> {
        self.readout_stacks.iter().map(|s| s.modules.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{StackCommand, VmeDataWidth};

    #[test]
    fn crate_config_round_trips_through_yaml() {
        let mut stack = StackCommandBuilder::new();
        stack.push(StackCommand::VmeRead {
            address: 0x6008,
            amod: 0x09,
            width: VmeDataWidth::D16,
        });

        let cfg = CrateConfig {
            name: "test-crate".into(),
            init_commands: StackCommandBuilder::new(),
            readout_stacks: vec![StackSetup {
                stack_id: 1,
                trigger: TriggerCondition::Irq(1),
                modules: vec![ModuleReadoutStructure {
                    prefix_len: 1,
                    has_dynamic: true,
                    suffix_len: 1,
                }],
                commands: stack,
            }],
        };

        let yaml = cfg.to_yaml().unwrap();
        let back = CrateConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.name, "test-crate");
        assert_eq!(back.readout_stacks.len(), 1);
        assert_eq!(back.readout_stacks[0].modules[0].prefix_len, 1);
        assert_eq!(back.readout_stacks[0].commands, cfg.readout_stacks[0].commands);
    }
}
