// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stack-error notification bookkeeping (spec §4.I first, §3).
//!
//! Every occurrence of a `(stack_id, line, flags)` triple is tallied. A
//! separate counter tracks unknown header bytes observed by any consumer.
//! All mutation is serialized by a single mutex; readers copy a snapshot
//! (spec data model: "mutation requires holding the counters lock; read
//! snapshots are cheap").

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::frame::StackFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorKey {
    pub stack_id: u8,
    pub line: u8,
    pub flags: u8,
}

impl ErrorKey {
    pub fn new(stack_id: u8, line: u8, flags: StackFlags) -> Self {
        ErrorKey {
            stack_id,
            line,
            flags: flags.to_bits(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ErrorCountersSnapshot {
    pub stack_errors: HashMap<ErrorKey, u64>,
    pub non_error_header_counts: HashMap<u8, u64>,
    pub super_ref_mismatches: u64,
}

#[derive(Debug, Default)]
struct Inner {
    stack_errors: HashMap<ErrorKey, u64>,
    non_error_header_counts: HashMap<u8, u64>,
    super_ref_mismatches: u64,
}

/// Shared, mutex-guarded counters (spec §4.I first, §5 "shared mutable
/// state").
#[derive(Default)]
pub struct ErrorCounters {
    inner: Mutex<Inner>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one `StackErrorNotification` occurrence. The spec flags the
    /// exact body word count per notification as an open question (§9); we
    /// accept any body length the header reports and count by key alone.
    pub fn record_stack_error(&self, stack_id: u8, line: u8, flags: StackFlags) {
        let key = ErrorKey::new(stack_id, line, flags);
        let mut inner = self.inner.lock();
        *inner.stack_errors.entry(key).or_insert(0) += 1;
    }

    pub fn record_unknown_header(&self, top_byte: u8) {
        let mut inner = self.inner.lock();
        *inner.non_error_header_counts.entry(top_byte).or_insert(0) += 1;
    }

    pub fn record_ref_mismatch(&self) {
        self.inner.lock().super_ref_mismatches += 1;
    }

    pub fn snapshot(&self) -> ErrorCountersSnapshot {
        let inner = self.inner.lock();
        ErrorCountersSnapshot {
            stack_errors: inner.stack_errors.clone(),
            non_error_header_counts: inner.non_error_header_counts.clone(),
            super_ref_mismatches: inner.super_ref_mismatches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_accumulates() {
        let counters = ErrorCounters::new();
        let flags = StackFlags {
            bus_error: true,
            ..Default::default()
        };
        counters.record_stack_error(2, 5, flags);
        counters.record_stack_error(2, 5, flags);
        counters.record_stack_error(3, 5, flags);

        let snap = counters.snapshot();
        assert_eq!(snap.stack_errors[&ErrorKey::new(2, 5, flags)], 2);
        assert_eq!(snap.stack_errors[&ErrorKey::new(3, 5, flags)], 1);
    }

    #[test]
    fn unknown_header_counted_independently() {
        let counters = ErrorCounters::new();
        counters.record_unknown_header(0x00);
        counters.record_unknown_header(0x00);
        counters.record_unknown_header(0xAA);
        let snap = counters.snapshot();
        assert_eq!(snap.non_error_header_counts[&0x00], 2);
        assert_eq!(snap.non_error_header_counts[&0xAA], 1);
    }
}
