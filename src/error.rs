// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crate-wide error taxonomy (spec §7).
//!
//! All fallible public operations return `Result<T, Error>`. Stack-error
//! notifications and parser exceptions are absorbed into counters elsewhere
//! and do not appear here unless they correlate to the call that induced
//! them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Vme(#[from] VmeError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Readout(#[from] ReadoutError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Sticky: once observed, the transport is unusable until reconnect.
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("operation timed out")]
    Timeout,
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("host lookup failed for {0}")]
    HostLookupFailed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid frame header: {0:#010x}")]
    InvalidFrameHeader(u32),
    #[error("frame length mismatch: header declared {declared}, buffer had {available}")]
    LengthMismatch { declared: u32, available: u32 },
    #[error("reference word mismatch: expected {expected:#06x}, got {actual:#06x}")]
    RefWordMismatch { expected: u16, actual: u16 },
    #[error("malformed super-command response buffer")]
    SuperFormatError,
    #[error("unexpected continuation frame")]
    UnexpectedContinuation,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmeError {
    #[error("VME bus error")]
    BusError,
    #[error("VME access timed out")]
    Timeout,
    #[error("VME stack syntax error")]
    SyntaxError,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid stack id: {0}")]
    InvalidStackId(u8),
    #[error("stack memory overflow: {requested} words requested, {available} available")]
    StackMemoryOverflow { requested: usize, available: usize },
    #[error("unknown URI scheme: {0}")]
    UnknownUriScheme(String),
    #[error("invalid controller URI: {0}")]
    InvalidUri(String),
    #[error(transparent)]
    Yaml(#[from] YamlErrorWrapper),
}

/// `serde_yaml::Error` doesn't implement `PartialEq`/`Clone`; wrap it so
/// `ConfigurationError` can still derive the traits the rest of this enum
/// family uses.
#[derive(Debug)]
pub struct YamlErrorWrapper(pub serde_yaml::Error);

impl std::fmt::Display for YamlErrorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for YamlErrorWrapper {}
impl Clone for YamlErrorWrapper {
    fn clone(&self) -> Self {
        YamlErrorWrapper(<serde_yaml::Error as serde::de::Error>::custom(
            self.0.to_string(),
        ))
    }
}
impl PartialEq for YamlErrorWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}
impl Eq for YamlErrorWrapper {}
impl From<serde_yaml::Error> for ConfigurationError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigurationError::Yaml(YamlErrorWrapper(e))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadoutError {
    #[error("readout buffer overrun")]
    BufferOverrun,
    #[error("parser exception: {0}")]
    ParserException(String),
}

pub type Result<T> = std::result::Result<T, Error>;
