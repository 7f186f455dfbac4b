// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming readout pipeline (spec §4.F–§4.H): producer, USB framing
//! fixup, and the format-aware parser.

pub mod framing_fixup;
pub mod parser;
pub mod producer;

pub use parser::{Parser, ParserStats, ParserStatsSnapshot};
pub use producer::Producer;
