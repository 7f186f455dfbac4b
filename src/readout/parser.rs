// SPDX-License-Identifier: MIT OR Apache-2.0

//! Readout parser (spec §4.H): a stateful per-stack consumer that walks a
//! stream of 32-bit words, reassembling per-module prefix/dynamic/suffix
//! spans across `StackFrame`/`StackContinuation` boundaries and invoking
//! `event_data`/`system_event` callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ModuleReadoutStructure;
use crate::event_builder::ModuleData;
use crate::frame::{self, FrameType, StackFrameHeader, SystemEventSubtype};
use crate::stack_errors::ErrorCounters;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParserStatsSnapshot {
    pub parser_exceptions: u64,
    pub unused_bytes: u64,
}

/// Exception and resync counters (spec §8 invariant 5). Cheap to read from
/// another thread (e.g. the driver reporting on `stop()`) since the parser
/// thread itself is the sole writer.
#[derive(Default)]
pub struct ParserStats {
    parser_exceptions: AtomicU64,
    unused_bytes: AtomicU64,
}

impl ParserStats {
    pub fn snapshot(&self) -> ParserStatsSnapshot {
        ParserStatsSnapshot {
            parser_exceptions: self.parser_exceptions.load(Ordering::Relaxed),
            unused_bytes: self.unused_bytes.load(Ordering::Relaxed),
        }
    }
}

enum SubPhase {
    Prefix(u16),
    AwaitingDynamicHeader,
    DynamicBody(u32),
    Suffix(u16),
}

struct FrameCursor {
    stack: u8,
    remaining: u32,
    module_idx: usize,
    sub: SubPhase,
    current: ModuleData,
    collected: Vec<ModuleData>,
}

enum Phase {
    WaitingForFrame,
    Inside(FrameCursor),
}

/// Advances `cursor` through any zero-length spans without consuming a
/// stream word. Returns `true` once every module in `structure` has been
/// collected.
fn settle(cursor: &mut FrameCursor, structure: &[ModuleReadoutStructure]) -> bool {
    loop {
        match cursor.sub {
            SubPhase::Prefix(0) => {
                cursor.sub = if structure[cursor.module_idx].has_dynamic {
                    SubPhase::AwaitingDynamicHeader
                } else {
                    SubPhase::Suffix(structure[cursor.module_idx].suffix_len)
                };
            }
            SubPhase::DynamicBody(0) => {
                cursor.sub = SubPhase::Suffix(structure[cursor.module_idx].suffix_len);
            }
            SubPhase::Suffix(0) => {
                let done = std::mem::take(&mut cursor.current);
                cursor.collected.push(done);
                cursor.module_idx += 1;
                if cursor.module_idx >= structure.len() {
                    return true;
                }
                cursor.sub = SubPhase::Prefix(structure[cursor.module_idx].prefix_len);
            }
            _ => return false,
        }
    }
}

/// Per-run parser state (spec: "`ParserState` — exclusively owned by the
/// parser thread"). `readout_structure` is indexed by stack id, matching
/// `CrateConfig::readout_structure()`.
pub struct Parser {
    crate_index: u32,
    readout_structure: Vec<Vec<ModuleReadoutStructure>>,
    phase: Phase,
    stats: Arc<ParserStats>,
}

impl Parser {
    pub fn new(crate_index: u32, readout_structure: Vec<Vec<ModuleReadoutStructure>>) -> Self {
        Parser {
            crate_index,
            readout_structure,
            phase: Phase::WaitingForFrame,
            stats: Arc::new(ParserStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ParserStats> {
        self.stats.clone()
    }

    fn resync(&self, words: &[u32], start: usize) -> usize {
        let mut i = start;
        while i < words.len() && !frame::is_known_frame_header(words[i]) {
            i += 1;
        }
        self.stats
            .unused_bytes
            .fetch_add(((i - start) * 4) as u64, Ordering::Relaxed);
        i
    }

    fn start_frame(&self, header: StackFrameHeader) -> Phase {
        match self.readout_structure.get(header.stack as usize) {
            Some(structure) if !structure.is_empty() => {
                let mut cursor = FrameCursor {
                    stack: header.stack,
                    remaining: header.length as u32,
                    module_idx: 0,
                    sub: SubPhase::Prefix(structure[0].prefix_len),
                    current: ModuleData::default(),
                    collected: Vec::with_capacity(structure.len()),
                };
                settle(&mut cursor, structure);
                Phase::Inside(cursor)
            }
            _ => {
                self.stats.parser_exceptions.fetch_add(1, Ordering::Relaxed);
                Phase::WaitingForFrame
            }
        }
    }

    /// Consumes one buffer's worth of words (spec §4.H). `on_event_data`
    /// receives `(crate_index, event_index, module_spans)` once a stack's
    /// full module list has been collected; `on_system_event` receives the
    /// subtype and body span of every `SystemEvent` frame encountered.
    pub fn feed_words(
        &mut self,
        words: &[u32],
        error_counters: &ErrorCounters,
        mut on_event_data: impl FnMut(u32, usize, &[ModuleData]),
        mut on_system_event: impl FnMut(SystemEventSubtype, &[u32]),
    ) {
        let mut i = 0;
        while i < words.len() {
            let phase = std::mem::replace(&mut self.phase, Phase::WaitingForFrame);
            match phase {
                Phase::WaitingForFrame => {
                    let w = words[i];
                    match frame::frame_type(w) {
                        Some(FrameType::StackFrame) => {
                            let header =
                                frame::decode_stack_frame_header(w).expect("stack frame header");
                            i += 1;
                            self.phase = self.start_frame(header);
                        }
                        Some(FrameType::StackErrorNotification) => {
                            let header =
                                frame::decode_stack_frame_header(w).expect("stack frame header");
                            i += 1;
                            let line = *words.get(i).unwrap_or(&0) as u8;
                            error_counters.record_stack_error(header.stack, line, header.flags);
                            i = (i + header.length as usize).min(words.len());
                        }
                        Some(FrameType::SystemEvent) => {
                            let header = frame::decode_system_event_header(w)
                                .expect("system event header");
                            i += 1;
                            let end = (i + header.length as usize).min(words.len());
                            on_system_event(header.subtype, &words[i..end]);
                            i = end;
                        }
                        Some(FrameType::StackContinuation) => {
                            // Continuation with no frame in progress.
                            self.stats.parser_exceptions.fetch_add(1, Ordering::Relaxed);
                            i = self.resync(words, i + 1);
                        }
                        _ => {
                            error_counters.record_unknown_header(frame::top_byte(w));
                            self.stats.parser_exceptions.fetch_add(1, Ordering::Relaxed);
                            i = self.resync(words, i);
                        }
                    }
                }
                Phase::Inside(mut cursor) => {
                    if cursor.remaining == 0 {
                        let w = words[i];
                        let continuation = frame::decode_stack_frame_header(w)
                            .filter(|_| frame::frame_type(w) == Some(FrameType::StackContinuation))
                            .filter(|h| h.stack == cursor.stack);
                        match continuation {
                            Some(header) => {
                                cursor.remaining = header.length as u32;
                                i += 1;
                                self.phase = Phase::Inside(cursor);
                            }
                            None => {
                                self.stats.parser_exceptions.fetch_add(1, Ordering::Relaxed);
                                i = self.resync(words, i);
                            }
                        }
                        continue;
                    }

                    let w = words[i];
                    i += 1;
                    cursor.remaining -= 1;
                    let mut bad = false;
                    match &mut cursor.sub {
                        SubPhase::Prefix(n) => {
                            cursor.current.prefix.push(w);
                            *n -= 1;
                        }
                        SubPhase::AwaitingDynamicHeader => {
                            match frame::decode_stack_frame_header(w) {
                                Some(h) if frame::frame_type(w) == Some(FrameType::BlockRead) => {
                                    cursor.sub = SubPhase::DynamicBody(h.length as u32);
                                }
                                _ => bad = true,
                            }
                        }
                        SubPhase::DynamicBody(n) => {
                            cursor.current.dynamic.push(w);
                            *n -= 1;
                        }
                        SubPhase::Suffix(n) => {
                            cursor.current.suffix.push(w);
                            *n -= 1;
                        }
                    }

                    if bad {
                        self.stats.parser_exceptions.fetch_add(1, Ordering::Relaxed);
                        i = self.resync(words, i);
                    } else {
                        let finished = {
                            let structure = &self.readout_structure[cursor.stack as usize];
                            settle(&mut cursor, structure)
                        };
                        if finished {
                            on_event_data(self.crate_index, cursor.stack as usize, &cursor.collected);
                        } else {
                            self.phase = Phase::Inside(cursor);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleReadoutStructure;
    use crate::frame::{encode_stack_frame_header, FrameType, StackFlags};

    fn structure(prefix: u16, has_dynamic: bool, suffix: u16) -> Vec<ModuleReadoutStructure> {
        vec![ModuleReadoutStructure {
            prefix_len: prefix,
            has_dynamic,
            suffix_len: suffix,
        }]
    }

    #[test]
    fn single_frame_single_module_emits_one_event() {
        let mut parser = Parser::new(0, vec![structure(1, false, 1)]);
        let counters = ErrorCounters::new();
        let header = encode_stack_frame_header(
            FrameType::StackFrame,
            StackFrameHeader {
                stack: 0,
                flags: StackFlags::default(),
                length: 2,
            },
        );
        let words = vec![header, 0xAAAA_AAAA, 0xBBBB_BBBB];

        let mut events = Vec::new();
        parser.feed_words(
            &words,
            &counters,
            |crate_idx, event_idx, modules| events.push((crate_idx, event_idx, modules.to_vec())),
            |_, _| panic!("no system events expected"),
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 0);
        assert_eq!(events[0].1, 0);
        assert_eq!(events[0].2[0].prefix, vec![0xAAAA_AAAA]);
        assert_eq!(events[0].2[0].suffix, vec![0xBBBB_BBBB]);
    }

    /// Spec §8 scenario S3: a stack frame continues across two headers
    /// before the module (and event) is complete.
    #[test]
    fn continuation_header_extends_the_same_event() {
        let mut parser = Parser::new(0, vec![structure(1, false, 2)]);
        let counters = ErrorCounters::new();

        let first = encode_stack_frame_header(
            FrameType::StackFrame,
            StackFrameHeader {
                stack: 0,
                flags: StackFlags {
                    continue_: true,
                    ..Default::default()
                },
                length: 2,
            },
        );
        let second = encode_stack_frame_header(
            FrameType::StackContinuation,
            StackFrameHeader {
                stack: 0,
                flags: StackFlags::default(),
                length: 1,
            },
        );
        let words = vec![first, 0x1111_1111, 0x2222_2222, second, 0x3333_3333];

        let mut events = Vec::new();
        parser.feed_words(
            &words,
            &counters,
            |c, e, modules| events.push((c, e, modules.to_vec())),
            |_, _| panic!("no system events expected"),
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].2[0].prefix, vec![0x1111_1111]);
        assert_eq!(events[0].2[0].suffix, vec![0x2222_2222, 0x3333_3333]);
    }

    #[test]
    fn dynamic_span_unwraps_embedded_block_read_frame() {
        let mut parser = Parser::new(0, vec![structure(1, true, 1)]);
        let counters = ErrorCounters::new();

        let outer = encode_stack_frame_header(
            FrameType::StackFrame,
            StackFrameHeader {
                stack: 0,
                flags: StackFlags::default(),
                length: 1 + 1 + 2 + 1, // prefix + f5 header + 2 payload words + suffix
            },
        );
        let inner = encode_stack_frame_header(
            FrameType::BlockRead,
            StackFrameHeader {
                stack: 0,
                flags: StackFlags::default(),
                length: 2,
            },
        );
        let words = vec![
            outer,
            0xAAAA_AAAA, // prefix
            inner,
            0x0000_0001,
            0x0000_0002, // dynamic payload
            0xBBBB_BBBB, // suffix
        ];

        let mut events = Vec::new();
        parser.feed_words(
            &words,
            &counters,
            |c, e, modules| events.push((c, e, modules.to_vec())),
            |_, _| panic!("no system events expected"),
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].2[0].dynamic, vec![0x0000_0001, 0x0000_0002]);
    }

    #[test]
    fn unknown_header_triggers_resync_and_is_counted() {
        let mut parser = Parser::new(0, vec![structure(1, false, 0)]);
        let counters = ErrorCounters::new();
        let header = encode_stack_frame_header(
            FrameType::StackFrame,
            StackFrameHeader {
                stack: 0,
                flags: StackFlags::default(),
                length: 1,
            },
        );
        let words = vec![0x0000_0000, header, 0xCCCC_CCCC];

        let mut events = Vec::new();
        parser.feed_words(&words, &counters, |c, e, m| events.push((c, e, m.to_vec())), |_, _| {});

        assert_eq!(events.len(), 1);
        assert_eq!(parser.stats().snapshot().parser_exceptions, 1);
    }
}
