// SPDX-License-Identifier: MIT OR Apache-2.0

//! Readout buffer pool (spec §5, §9 design notes): an arena of fixed-size
//! buffers referenced by indices, with ownership flowing through bounded
//! SPSC-style channels. A drop hook returns a buffer's backing storage to
//! its pool once every consumer holding a reference has released it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::transport::TransportKind;

/// Default pool sizing (spec §5): ~10 buffers of 1 MiB each.
pub const DEFAULT_BUFFER_COUNT: usize = 10;
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// One readout buffer. Cheap to share across the listfile-writer and parser
/// fan-out via `Arc`; its backing `Vec<u8>` is returned to the pool's free
/// list when the last `Arc` is dropped.
pub struct Buffer {
    data: Vec<u8>,
    used: usize,
    pub kind: TransportKind,
    pub sequence: u64,
    return_to: Option<Sender<Vec<u8>>>,
}

impl Buffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_shutdown_sentinel(&self) -> bool {
        self.used == 0
    }

    pub fn free_space(&self) -> usize {
        self.data.capacity() - self.used
    }

    /// Raw mutable access for producers filling the buffer. `commit` marks
    /// how many of the written bytes to keep.
    pub fn spare_capacity_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn set_used(&mut self, used: usize) {
        self.used = used.min(self.data.capacity());
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.used = 0;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(sender) = self.return_to.take() {
            let mut data = std::mem::take(&mut self.data);
            data.clear();
            // If the pool's free channel is gone or full (shutdown race),
            // just drop the storage rather than blocking in a destructor.
            let _ = sender.try_send(data);
        }
    }
}

pub type SharedBuffer = Arc<Buffer>;

/// Bounded pool of reusable buffers (spec §5).
pub struct BufferPool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    buffer_size: usize,
    next_sequence: AtomicU64,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let (free_tx, free_rx) = bounded(count);
        for _ in 0..count {
            let _ = free_tx.try_send(Vec::with_capacity(buffer_size));
        }
        BufferPool {
            free_tx,
            free_rx,
            buffer_size,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Block until a free buffer is available (or `timeout` elapses),
    /// stamping it with `kind` and the next sequence number.
    pub fn acquire(&self, kind: TransportKind, timeout: Duration) -> Option<Buffer> {
        let mut data = match self.free_rx.recv_timeout(timeout) {
            Ok(data) => data,
            Err(_) => return None,
        };
        if data.capacity() < self.buffer_size {
            data.reserve(self.buffer_size - data.capacity());
        }
        data.clear();
        Some(Buffer {
            data,
            used: 0,
            kind,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            return_to: Some(self.free_tx.clone()),
        })
    }

    pub fn try_acquire(&self, kind: TransportKind) -> Option<Buffer> {
        let mut data = match self.free_rx.try_recv() {
            Ok(data) => data,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
        };
        data.clear();
        Some(Buffer {
            data,
            used: 0,
            kind,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            return_to: Some(self.free_tx.clone()),
        })
    }

    pub fn shutdown_sentinel(&self, kind: TransportKind) -> Buffer {
        Buffer {
            data: Vec::new(),
            used: 0,
            kind,
            sequence: u64::MAX,
            return_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquired_buffer_returns_to_pool_on_drop() {
        let pool = BufferPool::new(2, 64);
        {
            let _b1 = pool.acquire(TransportKind::Eth, Duration::from_millis(10)).unwrap();
            let _b2 = pool.acquire(TransportKind::Eth, Duration::from_millis(10)).unwrap();
            assert!(pool.try_acquire(TransportKind::Eth).is_none());
        }
        // both dropped, should be back in the free list
        assert!(pool.try_acquire(TransportKind::Eth).is_some());
        assert!(pool.try_acquire(TransportKind::Eth).is_some());
    }

    #[test]
    fn shared_buffer_returns_only_after_all_consumers_drop() {
        let pool = BufferPool::new(1, 64);
        let shared: SharedBuffer = Arc::new(pool.acquire(TransportKind::Usb, Duration::from_millis(10)).unwrap());
        let clone = shared.clone();
        assert!(pool.try_acquire(TransportKind::Usb).is_none());
        drop(shared);
        assert!(pool.try_acquire(TransportKind::Usb).is_none());
        drop(clone);
        assert!(pool.try_acquire(TransportKind::Usb).is_some());
    }
}
