// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport abstraction (spec §4.A): two implementations — USB bulk
//! streams and UDP/Ethernet — behind one interface. Callers never see the
//! difference except through [`Transport::kind`] and per-pipe statistics.

pub mod eth;
pub mod usb;

use std::time::Duration;

use crate::error::TransportError;

/// The two logical pipes every MVLC exposes (spec §1, §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    Command,
    Data,
}

impl Pipe {
    pub const ALL: [Pipe; 2] = [Pipe::Command, Pipe::Data];

    pub fn index(self) -> usize {
        match self {
            Pipe::Command => 0,
            Pipe::Data => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Eth,
}

/// Default read timeout (spec §6): 500 ms.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Transport-level result alias, distinct from the crate-wide `Result` to
/// keep this module usable without pulling in the full `Error` enum.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Common interface shared by the USB and ETH transports (spec §4.A).
///
/// Implementors hold an interior mutex per pipe: any caller performing a
/// multi-transfer dialog acquires the pipe's lock for the whole operation
/// (spec §5).
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn connect(&self) -> TransportResult<()>;
    fn disconnect(&self);
    fn is_connected(&self) -> bool;

    /// Write `bytes` to `pipe`, returning the number of bytes actually
    /// written. Writes share a single timeout across both pipes.
    fn write(&self, pipe: Pipe, bytes: &[u8]) -> TransportResult<usize>;

    /// Read up to `buf.len()` bytes from `pipe`, blocking at most
    /// `timeout`. A short read is valid whenever data is available (USB);
    /// ETH reads are packet-atomic (see [`eth::EthTransport`]).
    fn read(&self, pipe: Pipe, buf: &mut [u8], timeout: Duration) -> TransportResult<usize>;

    fn set_read_timeout(&self, pipe: Pipe, timeout: Duration);
    fn read_timeout(&self, pipe: Pipe) -> Duration;
}

/// Once observed, a `ConnectionError` is sticky: every subsequent call
/// returns it until reconnect (spec §7). A small latch shared by both
/// transport implementations.
#[derive(Debug, Default)]
pub struct StickyConnectionError {
    message: parking_lot::Mutex<Option<String>>,
}

impl StickyConnectionError {
    pub fn check(&self) -> TransportResult<()> {
        if let Some(msg) = self.message.lock().clone() {
            return Err(TransportError::ConnectionError(msg));
        }
        Ok(())
    }

    pub fn latch(&self, message: impl Into<String>) {
        let mut guard = self.message.lock();
        if guard.is_none() {
            *guard = Some(message.into());
        }
    }

    pub fn clear(&self) {
        *self.message.lock() = None;
    }
}
