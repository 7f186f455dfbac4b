// SPDX-License-Identifier: MIT OR Apache-2.0

//! USB bulk-pipe transport (spec §4.A). Wraps a device exposing four bulk
//! endpoints (two IN, two OUT — one pair per logical pipe). Reads are
//! framed only by byte counts: a short read is valid whenever data is
//! available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::transfer::RequestBuffer;
use nusb::{Device, Interface};
use parking_lot::Mutex;
use tracing::debug;

use super::{Pipe, StickyConnectionError, Transport, TransportKind, TransportResult};
use crate::error::TransportError;

/// All USB transfers are rounded to this byte granularity.
pub const USB_ALIGNMENT: usize = 8;

pub fn round_up_to_alignment(len: usize) -> usize {
    (len + USB_ALIGNMENT - 1) / USB_ALIGNMENT * USB_ALIGNMENT
}

struct Endpoints {
    cmd_in: u8,
    cmd_out: u8,
    data_in: u8,
    data_out: u8,
}

/// Identifies a device by VID/PID and, optionally, serial number or bus
/// index (spec §6 `usb://` URI forms).
#[derive(Debug, Clone)]
pub enum UsbSelector {
    First,
    Serial(String),
    Index(usize),
}

pub struct UsbTransport {
    selector: UsbSelector,
    endpoints: Endpoints,
    interface: Mutex<Option<Interface>>,
    connected: AtomicBool,
    sticky: StickyConnectionError,
    read_timeouts: Mutex<[Duration; 2]>,
}

impl UsbTransport {
    /// VID/PID for the FTDI-based MVLC USB interface (mesytec's USB vendor
    /// assignment); not validated here beyond device enumeration.
    pub const VENDOR_ID: u16 = 0x0403;
    pub const PRODUCT_ID: u16 = 0x601B;

    pub fn new(selector: UsbSelector) -> Self {
        UsbTransport {
            selector,
            endpoints: Endpoints {
                cmd_in: 0x82,
                cmd_out: 0x02,
                data_in: 0x88,
                data_out: 0x08,
            },
            interface: Mutex::new(None),
            connected: AtomicBool::new(false),
            sticky: StickyConnectionError::default(),
            read_timeouts: Mutex::new([super::DEFAULT_READ_TIMEOUT; 2]),
        }
    }

    fn find_device(&self) -> TransportResult<Device> {
        let mut candidates: Vec<_> = nusb::list_devices()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .filter(|d| d.vendor_id() == Self::VENDOR_ID && d.product_id() == Self::PRODUCT_ID)
            .collect();

        let info = match &self.selector {
            UsbSelector::First => candidates
                .into_iter()
                .next()
                .ok_or_else(|| TransportError::ConnectionError("no MVLC USB device found".into()))?,
            UsbSelector::Index(idx) => {
                if *idx >= candidates.len() {
                    return Err(TransportError::ConnectionError(format!(
                        "no MVLC USB device at index {idx}"
                    )));
                }
                candidates.remove(*idx)
            }
            UsbSelector::Serial(serial) => candidates
                .into_iter()
                .find(|d| d.serial_number() == Some(serial.as_str()))
                .ok_or_else(|| {
                    TransportError::ConnectionError(format!("no MVLC USB device with serial {serial}"))
                })?,
        };

        info.open()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    fn pipe_endpoints(&self, pipe: Pipe) -> (u8, u8) {
        match pipe {
            Pipe::Command => (self.endpoints.cmd_in, self.endpoints.cmd_out),
            Pipe::Data => (self.endpoints.data_in, self.endpoints.data_out),
        }
    }

    /// Unframed read up to `len` bytes (spec §4.F producer call). A short
    /// read is valid and simply returns fewer bytes than requested.
    pub fn read_unbuffered(&self, pipe: Pipe, dest: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        self.read(pipe, dest, timeout)
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn connect(&self) -> TransportResult<()> {
        let device = self.find_device()?;
        let interface = device
            .claim_interface(0)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        debug!("usb transport connected");
        *self.interface.lock() = Some(interface);
        self.connected.store(true, Ordering::Relaxed);
        self.sticky.clear();
        Ok(())
    }

    fn disconnect(&self) {
        *self.interface.lock() = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn write(&self, pipe: Pipe, bytes: &[u8]) -> TransportResult<usize> {
        self.sticky.check()?;
        let guard = self.interface.lock();
        let interface = guard
            .as_ref()
            .ok_or(TransportError::ConnectionError("not connected".into()))?;
        let (_, out_ep) = self.pipe_endpoints(pipe);

        let fut = interface.bulk_out(out_ep, bytes.to_vec());
        let completion = futures_lite::future::block_on(fut);
        completion
            .status
            .map_err(|e| {
                let msg = e.to_string();
                self.sticky.latch(msg.clone());
                TransportError::ConnectionError(msg)
            })?;
        Ok(completion.data.actual_length())
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        self.sticky.check()?;
        let guard = self.interface.lock();
        let interface = guard
            .as_ref()
            .ok_or(TransportError::ConnectionError("not connected".into()))?;
        let (in_ep, _) = self.pipe_endpoints(pipe);

        let request = RequestBuffer::new(buf.len());
        let fut = interface.bulk_in(in_ep, request);
        let timed = futures_lite::future::or(
            async { Some(fut.await) },
            async {
                async_io::Timer::after(timeout).await;
                None
            },
        );

        match futures_lite::future::block_on(timed) {
            None => Err(TransportError::Timeout),
            Some(completion) => {
                completion.status.map_err(|e| {
                    let msg = e.to_string();
                    self.sticky.latch(msg.clone());
                    TransportError::ConnectionError(msg)
                })?;
                let n = completion.data.len();
                buf[..n].copy_from_slice(&completion.data);
                if n == 0 {
                    return Err(TransportError::ShortTransfer { expected: buf.len(), actual: 0 });
                }
                Ok(n)
            }
        }
    }

    fn set_read_timeout(&self, pipe: Pipe, timeout: Duration) {
        self.read_timeouts.lock()[pipe.index()] = timeout;
    }

    fn read_timeout(&self, pipe: Pipe) -> Duration {
        self.read_timeouts.lock()[pipe.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(round_up_to_alignment(0), 0);
        assert_eq!(round_up_to_alignment(1), 8);
        assert_eq!(round_up_to_alignment(8), 8);
        assert_eq!(round_up_to_alignment(9), 16);
    }
}
