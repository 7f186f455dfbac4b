// SPDX-License-Identifier: MIT OR Apache-2.0

//! Readout driver (spec §4.K): owns the `Idle → Starting → Running →
//! {Paused ⇄ Running} → Stopping → Idle` state machine and the producer,
//! parser, and listfile-writer threads for one run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer_pool::{BufferPool, SharedBuffer, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE};
use crate::config::{CrateConfig, RuntimeLimits, TriggerCondition};
use crate::dialog::Dialog;
use crate::error::{ConfigurationError, Error};
use crate::event_builder::{EventBuilder, ModuleConfig, ModuleData};
use crate::frame::SystemEventSubtype;
use crate::listfile::ListfileWriter;
use crate::readout::{Parser, ParserStats, Producer};
use crate::stack_errors::ErrorCounters;
use crate::transport::{Transport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
}

pub type EventDataCallback = dyn Fn(u32, usize, &[ModuleData]) + Send + Sync;
pub type SystemEventCallback = dyn Fn(SystemEventSubtype, &[u32]) + Send + Sync;

/// Maps a [`TriggerCondition`] onto a trigger register value. The wire
/// encoding isn't pinned down by the available examples; bit 7 selects IRQ
/// vs. timer/software and the low bits carry the IRQ number or period,
/// recorded as an open question in DESIGN.md.
fn encode_trigger(trigger: &TriggerCondition) -> u32 {
    match trigger {
        TriggerCondition::Irq(n) => 0x80 | (*n as u32),
        TriggerCondition::Timer { period_ms } => 0x40 | (period_ms & 0x3F),
        TriggerCondition::Software => 0,
    }
}

enum ControlMsg {
    SystemEvent(SystemEventSubtype),
}

/// Orchestrates one crate's readout run (spec §4.K, §5 "Threading model").
pub struct ReadoutDriver {
    transport: Arc<dyn Transport>,
    dialog: Arc<Dialog>,
    error_counters: Arc<ErrorCounters>,
    limits: RuntimeLimits,
    state: Mutex<DriverState>,
    quit: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    control_tx: Mutex<Option<Sender<ControlMsg>>>,
    parser_stats: Mutex<Option<Arc<ParserStats>>>,
    listfile_path: Option<PathBuf>,
}

impl ReadoutDriver {
    pub fn new(transport: Arc<dyn Transport>, listfile_path: Option<PathBuf>) -> Self {
        let error_counters = Arc::new(ErrorCounters::new());
        let dialog = Arc::new(Dialog::new(transport.clone(), error_counters.clone()));
        ReadoutDriver {
            transport,
            dialog,
            error_counters,
            limits: RuntimeLimits::default(),
            state: Mutex::new(DriverState::Idle),
            quit: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            control_tx: Mutex::new(None),
            parser_stats: Mutex::new(None),
            listfile_path,
        }
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    pub fn error_counters(&self) -> Arc<ErrorCounters> {
        self.error_counters.clone()
    }

    pub fn parser_stats(&self) -> Option<Arc<ParserStats>> {
        self.parser_stats.lock().clone()
    }

    /// Brings the crate up: uploads init and readout stacks, arms triggers,
    /// opens the listfile, and spawns the producer/parser/writer threads
    /// (spec §4.K `start`).
    pub fn start(
        &self,
        config: CrateConfig,
        module_configs: Vec<Vec<ModuleConfig>>,
        event_data_callback: Arc<EventDataCallback>,
        system_event_callback: Arc<SystemEventCallback>,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if *state != DriverState::Idle {
                return Err(ConfigurationError::InvalidUri("driver is not idle".into()).into());
            }
            *state = DriverState::Starting;
        }

        let result = self.start_inner(config, module_configs, event_data_callback, system_event_callback);
        if result.is_err() {
            *self.state.lock() = DriverState::Idle;
        }
        result
    }

    fn start_inner(
        &self,
        config: CrateConfig,
        module_configs: Vec<Vec<ModuleConfig>>,
        event_data_callback: Arc<EventDataCallback>,
        system_event_callback: Arc<SystemEventCallback>,
    ) -> Result<(), Error> {
        self.dialog.upload_stack(config.init_commands.clone(), 0)?;

        let stacks: Vec<(u8, crate::proto::StackCommandBuilder)> = config
            .readout_stacks
            .iter()
            .map(|s| (s.stack_id, s.commands.clone()))
            .collect();
        self.dialog.setup_readout_stacks(&stacks)?;

        let triggers: Vec<(u8, u32)> = config
            .readout_stacks
            .iter()
            .map(|s| (s.stack_id, encode_trigger(&s.trigger)))
            .collect();
        self.dialog.setup_readout_triggers(&triggers)?;

        if self.transport.kind() == TransportKind::Eth {
            self.dialog.redirect_eth_data_stream(0)?;
        }

        let pool = Arc::new(BufferPool::new(DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE));
        self.quit.store(false, Ordering::Relaxed);

        let listfile = match &self.listfile_path {
            Some(path) => Some(ListfileWriter::create(path, self.transport.kind(), &config)?),
            None => None,
        };
        let has_writer = listfile.is_some();

        let (parser_tx, parser_rx) = bounded::<SharedBuffer>(DEFAULT_BUFFER_COUNT);
        let (writer_tx, writer_rx) = bounded::<SharedBuffer>(DEFAULT_BUFFER_COUNT);
        let (control_tx, control_rx) = bounded::<ControlMsg>(8);

        let readout_structure = config.readout_structure();
        let parser = Parser::new(0, readout_structure);
        let parser_stats = parser.stats();
        *self.parser_stats.lock() = Some(parser_stats.clone());
        let event_builder = EventBuilder::new(0, module_configs);

        let mut threads = Vec::new();

        threads.push(self.spawn_producer(pool.clone(), parser_tx, writer_tx, has_writer));
        threads.push(self.spawn_parser(
            parser_rx,
            parser,
            event_builder,
            event_data_callback,
            system_event_callback,
        ));
        if let Some(listfile) = listfile {
            threads.push(spawn_listfile_writer(writer_rx, control_rx, listfile));
        }

        *self.threads.lock() = threads;
        *self.control_tx.lock() = Some(control_tx);
        self.dialog.enable_daq_mode()?;
        *self.state.lock() = DriverState::Running;
        info!("readout driver started");
        Ok(())
    }

    fn spawn_producer(
        &self,
        pool: Arc<BufferPool>,
        parser_tx: Sender<SharedBuffer>,
        writer_tx: Sender<SharedBuffer>,
        has_writer: bool,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let limits = self.limits;
        let quit = self.quit.clone();
        let kind = transport.kind();
        thread::spawn(move || {
            let mut producer = Producer::new(transport, pool.clone(), limits);
            while !quit.load(Ordering::Relaxed) {
                let Some(buffer) = producer.fill_one(&quit) else {
                    continue;
                };
                if buffer.used() == 0 {
                    continue;
                }
                let shared: SharedBuffer = Arc::new(buffer);
                if parser_tx.send(shared.clone()).is_err() {
                    break;
                }
                if has_writer && writer_tx.send(shared).is_err() {
                    break;
                }
            }
            let sentinel: SharedBuffer = Arc::new(pool.shutdown_sentinel(kind));
            let _ = parser_tx.send(sentinel.clone());
            if has_writer {
                let _ = writer_tx.send(sentinel);
            }
        })
    }

    fn spawn_parser(
        &self,
        parser_rx: crossbeam_channel::Receiver<SharedBuffer>,
        mut parser: Parser,
        mut event_builder: EventBuilder,
        event_data_callback: Arc<EventDataCallback>,
        system_event_callback: Arc<SystemEventCallback>,
    ) -> JoinHandle<()> {
        let error_counters = self.error_counters.clone();
        thread::spawn(move || {
            for shared in parser_rx.iter() {
                if shared.is_shutdown_sentinel() {
                    break;
                }
                let words = bytes_to_words(shared.as_bytes());
                parser.feed_words(
                    &words,
                    &error_counters,
                    |_crate_idx, event_idx, modules| {
                        event_builder.record(event_idx, modules);
                    },
                    |subtype, body| system_event_callback(subtype, body),
                );
                event_builder.flush(|crate_idx, event_idx, modules| {
                    event_data_callback(crate_idx, event_idx, modules);
                });
            }
            // Drain whatever didn't close a window before shutdown (spec
            // §4.I second "Force-flush on shutdown").
            event_builder.force_flush(|crate_idx, event_idx, modules| {
                event_data_callback(crate_idx, event_idx, modules);
            });
        })
    }

    /// Disables triggers, signals the producer to stop, and joins every
    /// thread, closing the listfile last (spec §4.K `stop`).
    pub fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if *state == DriverState::Idle {
                return Ok(());
            }
            *state = DriverState::Stopping;
        }

        self.dialog.disable_daq_mode()?;
        self.quit.store(true, Ordering::Relaxed);

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!("readout thread panicked during shutdown");
            }
        }
        *self.control_tx.lock() = None;
        *self.parser_stats.lock() = None;
        *self.state.lock() = DriverState::Idle;
        info!("readout driver stopped");
        Ok(())
    }

    /// Pauses readout without tearing down threads: disables triggers and
    /// records a `Pause` system event in the listfile (spec §4.K `pause`).
    pub fn pause(&self, config: &CrateConfig) -> Result<(), Error> {
        let mut state = self.state.lock();
        if *state != DriverState::Running {
            return Err(ConfigurationError::InvalidUri("driver is not running".into()).into());
        }
        let zeroed: Vec<(u8, u32)> = config.readout_stacks.iter().map(|s| (s.stack_id, 0)).collect();
        self.dialog.setup_readout_triggers(&zeroed)?;
        if let Some(tx) = self.control_tx.lock().as_ref() {
            let _ = tx.send(ControlMsg::SystemEvent(SystemEventSubtype::Pause));
        }
        *state = DriverState::Paused;
        Ok(())
    }

    pub fn resume(&self, config: &CrateConfig) -> Result<(), Error> {
        let mut state = self.state.lock();
        if *state != DriverState::Paused {
            return Err(ConfigurationError::InvalidUri("driver is not paused".into()).into());
        }
        let triggers: Vec<(u8, u32)> = config
            .readout_stacks
            .iter()
            .map(|s| (s.stack_id, encode_trigger(&s.trigger)))
            .collect();
        self.dialog.setup_readout_triggers(&triggers)?;
        if let Some(tx) = self.control_tx.lock().as_ref() {
            let _ = tx.send(ControlMsg::SystemEvent(SystemEventSubtype::Resume));
        }
        *state = DriverState::Running;
        Ok(())
    }
}

fn spawn_listfile_writer(
    writer_rx: crossbeam_channel::Receiver<SharedBuffer>,
    control_rx: crossbeam_channel::Receiver<ControlMsg>,
    mut listfile: ListfileWriter,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            crossbeam_channel::select! {
                recv(writer_rx) -> msg => match msg {
                    Ok(shared) => {
                        if shared.is_shutdown_sentinel() {
                            break;
                        }
                        if listfile.write_buffer(shared.as_bytes()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(control_rx) -> msg => match msg {
                    Ok(ControlMsg::SystemEvent(subtype)) => {
                        let _ = listfile.write_pause_resume(subtype);
                    }
                    Err(_) => {}
                },
            }
        }
        let _ = listfile.close();
    })
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_encoding_distinguishes_kinds() {
        assert_ne!(encode_trigger(&TriggerCondition::Software), encode_trigger(&TriggerCondition::Irq(1)));
        assert_ne!(
            encode_trigger(&TriggerCondition::Irq(1)),
            encode_trigger(&TriggerCondition::Timer { period_ms: 1 })
        );
    }

    #[test]
    fn bytes_to_words_round_trips_little_endian() {
        let words = vec![0x0000_0001u32, 0xDEAD_BEEF];
        let mut bytes = Vec::new();
        for w in &words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(bytes_to_words(&bytes), words);
    }
}
