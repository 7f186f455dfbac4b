// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command and stack protocol encoder/decoder (spec §4.C).

pub mod stack_commands;
pub mod super_commands;

pub use stack_commands::{BlockReadVariant, StackCommand, StackCommandBuilder, VmeDataWidth};
pub use super_commands::{
    SuperCommand, SuperCommandBuilder, SuperResponse, SuperResponseItem, StackOutputPipe,
};
