// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP/Ethernet transport (spec §4.A). Each pipe is one UDP socket bound to
//! a per-pipe server port; reads are packet-atomic.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Pipe, StickyConnectionError, Transport, TransportKind, TransportResult};
use crate::error::TransportError;

/// Two 32-bit words prepended by the controller to every data-pipe UDP
/// payload (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthPacketHeader {
    pub packet_channel: u8,
    pub packet_number: u16,
    pub controller_id: u8,
    pub data_word_count: u16,
    pub udp_timestamp: u32,
    pub next_header_pointer: u16,
}

pub const SENTINEL_NEXT_HEADER: u16 = 0xFFF;

pub fn decode_header(words: [u32; 2]) -> EthPacketHeader {
    let w0 = words[0];
    let w1 = words[1];
    EthPacketHeader {
        packet_channel: ((w0 >> 29) & 0x7) as u8,
        packet_number: ((w0 >> 16) & 0xFFF) as u16,
        controller_id: ((w0 >> 13) & 0x7) as u8,
        data_word_count: (w0 & 0x1FFF) as u16,
        udp_timestamp: (w1 >> 12) & 0xFFFFF,
        next_header_pointer: (w1 & 0xFFF) as u16,
    }
}

pub fn encode_header(h: EthPacketHeader) -> [u32; 2] {
    let w0 = ((h.packet_channel as u32 & 0x7) << 29)
        | ((h.packet_number as u32 & 0xFFF) << 16)
        | ((h.controller_id as u32 & 0x7) << 13)
        | (h.data_word_count as u32 & 0x1FFF);
    let w1 = ((h.udp_timestamp & 0xFFFFF) << 12) | (h.next_header_pointer as u32 & 0xFFF);
    [w0, w1]
}

/// Packet-loss delta per spec invariant 3: `(current - last - 1) mod 4096`
/// when positive, else zero (no loss, or a duplicate/reorder we don't model).
pub fn packet_loss_delta(last: u16, current: u16) -> u16 {
    let diff = (current.wrapping_sub(last).wrapping_sub(1)) & 0xFFF;
    diff
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EthPipeStats {
    pub receive_attempts: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub short_packets: u64,
    pub packets_with_residue: u64,
    pub no_header: u64,
    pub header_out_of_range: u64,
    pub lost_packets: u64,
}

#[derive(Default)]
struct AtomicEthPipeStats {
    receive_attempts: AtomicU64,
    received_packets: AtomicU64,
    received_bytes: AtomicU64,
    short_packets: AtomicU64,
    packets_with_residue: AtomicU64,
    no_header: AtomicU64,
    header_out_of_range: AtomicU64,
    lost_packets: AtomicU64,
}

impl AtomicEthPipeStats {
    fn snapshot(&self) -> EthPipeStats {
        EthPipeStats {
            receive_attempts: self.receive_attempts.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            short_packets: self.short_packets.load(Ordering::Relaxed),
            packets_with_residue: self.packets_with_residue.load(Ordering::Relaxed),
            no_header: self.no_header.load(Ordering::Relaxed),
            header_out_of_range: self.header_out_of_range.load(Ordering::Relaxed),
            lost_packets: self.lost_packets.load(Ordering::Relaxed),
        }
    }
}

struct PipeState {
    socket: UdpSocket,
    read_timeout: Mutex<Duration>,
    last_packet_number: AtomicU64, // stores Option<u16> as u64::MAX sentinel for "none yet"
    stats: AtomicEthPipeStats,
}

const NO_PACKET_YET: u64 = u64::MAX;

impl PipeState {
    fn bind(local: SocketAddr, read_timeout: Duration) -> TransportResult<Self> {
        let socket = UdpSocket::bind(local)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        socket
            .set_read_timeout(Some(read_timeout))
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        Ok(PipeState {
            socket,
            read_timeout: Mutex::new(read_timeout),
            last_packet_number: AtomicU64::new(NO_PACKET_YET),
            stats: AtomicEthPipeStats::default(),
        })
    }
}

/// UDP/Ethernet transport implementation (spec §4.A).
pub struct EthTransport {
    remote_host: String,
    command_port: u16,
    data_port: u16,
    command: Mutex<Option<PipeState>>,
    data: Mutex<Option<PipeState>>,
    connected: AtomicBool,
    sticky: StickyConnectionError,
}

impl EthTransport {
    pub fn new(remote_host: impl Into<String>, command_port: u16, data_port: u16) -> Self {
        EthTransport {
            remote_host: remote_host.into(),
            command_port,
            data_port,
            command: Mutex::new(None),
            data: Mutex::new(None),
            connected: AtomicBool::new(false),
            sticky: StickyConnectionError::default(),
        }
    }

    fn resolve(&self, port: u16) -> TransportResult<SocketAddr> {
        (self.remote_host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| TransportError::HostLookupFailed(self.remote_host.clone()))?
            .next()
            .ok_or_else(|| TransportError::HostLookupFailed(self.remote_host.clone()))
    }

    fn pipe_mutex(&self, pipe: Pipe) -> &Mutex<Option<PipeState>> {
        match pipe {
            Pipe::Command => &self.command,
            Pipe::Data => &self.data,
        }
    }

    pub fn stats(&self, pipe: Pipe) -> EthPipeStats {
        self.pipe_mutex(pipe)
            .lock()
            .as_ref()
            .map(|p| p.stats.snapshot())
            .unwrap_or_default()
    }

    /// Read exactly one UDP datagram and interpret its two-word header
    /// (spec §4.F, §4.H). Returns the header and the payload words after it.
    pub fn read_packet(
        &self,
        pipe: Pipe,
        dest: &mut [u8],
    ) -> TransportResult<(EthPacketHeader, usize)> {
        self.sticky.check()?;
        let guard = self.pipe_mutex(pipe).lock();
        let state = guard.as_ref().ok_or(TransportError::ConnectionError(
            "not connected".into(),
        ))?;
        state.stats.receive_attempts.fetch_add(1, Ordering::Relaxed);

        let n = match state.socket.recv(dest) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Err(TransportError::Timeout)
            }
            Err(e) => {
                self.sticky.latch(e.to_string());
                return Err(TransportError::ConnectionError(e.to_string()));
            }
        };

        if n < 8 {
            state.stats.short_packets.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::ShortTransfer {
                expected: 8,
                actual: n,
            });
        }

        let w0 = u32::from_le_bytes(dest[0..4].try_into().unwrap());
        let w1 = u32::from_le_bytes(dest[4..8].try_into().unwrap());
        let header = decode_header([w0, w1]);

        state.stats.received_packets.fetch_add(1, Ordering::Relaxed);
        state.stats.received_bytes.fetch_add(n as u64, Ordering::Relaxed);

        // Defensive residue check (spec §4.F): the controller should never
        // produce this, but a mismatch must not corrupt subsequent packets.
        let declared_payload_bytes = header.data_word_count as usize * 4;
        if declared_payload_bytes != n.saturating_sub(8) {
            state
                .stats
                .packets_with_residue
                .fetch_add(1, Ordering::Relaxed);
        }

        if header.next_header_pointer != SENTINEL_NEXT_HEADER {
            let offset_bytes = 8 + header.next_header_pointer as usize * 4;
            if offset_bytes + 4 > n {
                state.stats.header_out_of_range.fetch_add(1, Ordering::Relaxed);
            }
        }

        let last = state.last_packet_number.swap(header.packet_number as u64, Ordering::Relaxed);
        if last != NO_PACKET_YET {
            let loss = packet_loss_delta(last as u16, header.packet_number);
            if loss > 0 {
                state.stats.lost_packets.fetch_add(loss as u64, Ordering::Relaxed);
                warn!(pipe = ?pipe, loss, "eth packet loss detected");
            }
        }

        Ok((header, n))
    }
}

impl Transport for EthTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Eth
    }

    fn connect(&self) -> TransportResult<()> {
        let cmd_remote = self.resolve(self.command_port)?;
        let data_remote = self.resolve(self.data_port)?;

        let cmd_state = PipeState::bind("0.0.0.0:0".parse().unwrap(), super::DEFAULT_READ_TIMEOUT)?;
        cmd_state
            .socket
            .connect(cmd_remote)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        let data_state = PipeState::bind("0.0.0.0:0".parse().unwrap(), super::DEFAULT_READ_TIMEOUT)?;
        data_state
            .socket
            .connect(data_remote)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        // Empty redirection datagram on each pipe so the controller learns
        // the return address (spec §4.A).
        cmd_state
            .socket
            .send(&[])
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        data_state
            .socket
            .send(&[])
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        debug!(host = %self.remote_host, "eth transport connected");
        *self.command.lock() = Some(cmd_state);
        *self.data.lock() = Some(data_state);
        self.connected.store(true, Ordering::Relaxed);
        self.sticky.clear();
        Ok(())
    }

    fn disconnect(&self) {
        *self.command.lock() = None;
        *self.data.lock() = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn write(&self, pipe: Pipe, bytes: &[u8]) -> TransportResult<usize> {
        self.sticky.check()?;
        let guard = self.pipe_mutex(pipe).lock();
        let state = guard
            .as_ref()
            .ok_or(TransportError::ConnectionError("not connected".into()))?;
        state
            .socket
            .send(bytes)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        self.sticky.check()?;
        let guard = self.pipe_mutex(pipe).lock();
        let state = guard
            .as_ref()
            .ok_or(TransportError::ConnectionError("not connected".into()))?;
        if *state.read_timeout.lock() != timeout {
            let _ = state.socket.set_read_timeout(Some(timeout));
            *state.read_timeout.lock() = timeout;
        }
        match state.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Err(TransportError::Timeout)
            }
            Err(e) => {
                self.sticky.latch(e.to_string());
                Err(TransportError::ConnectionError(e.to_string()))
            }
        }
    }

    fn set_read_timeout(&self, pipe: Pipe, timeout: Duration) {
        if let Some(state) = self.pipe_mutex(pipe).lock().as_ref() {
            let _ = state.socket.set_read_timeout(Some(timeout));
            *state.read_timeout.lock() = timeout;
        }
    }

    fn read_timeout(&self, pipe: Pipe) -> Duration {
        self.pipe_mutex(pipe)
            .lock()
            .as_ref()
            .map(|p| *p.read_timeout.lock())
            .unwrap_or(super::DEFAULT_READ_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = EthPacketHeader {
            packet_channel: 1,
            packet_number: 4095,
            controller_id: 2,
            data_word_count: 1000,
            udp_timestamp: 0xABCDE,
            next_header_pointer: 17,
        };
        assert_eq!(decode_header(encode_header(h)), h);
    }

    #[test]
    fn sentinel_next_header_round_trips() {
        let h = EthPacketHeader {
            packet_channel: 0,
            packet_number: 0,
            controller_id: 0,
            data_word_count: 0,
            udp_timestamp: 0,
            next_header_pointer: SENTINEL_NEXT_HEADER,
        };
        assert_eq!(decode_header(encode_header(h)).next_header_pointer, SENTINEL_NEXT_HEADER);
    }

    #[test]
    fn packet_loss_delta_simple_cases() {
        assert_eq!(packet_loss_delta(5, 6), 0);
        assert_eq!(packet_loss_delta(5, 8), 2);
        assert_eq!(packet_loss_delta(4095, 0), 0); // wraps mod 4096
    }

    proptest::proptest! {
        #[test]
        fn header_round_trip_prop(pc in 0u8..8, pn in 0u16..4096, cid in 0u8..8, dwc in 0u16..8192, ts in 0u32..0x100000, nhp in 0u16..4096) {
            let h = EthPacketHeader { packet_channel: pc, packet_number: pn, controller_id: cid, data_word_count: dwc, udp_timestamp: ts, next_header_pointer: nhp };
            proptest::prop_assert_eq!(decode_header(encode_header(h)), h);
        }
    }
}
