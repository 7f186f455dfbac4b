// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side driver core for the Mesytec MVLC VME crate controller: wire
//! framing and the command/stack protocol over the command pipe, the
//! streaming readout pipeline from the data pipe, and the event builder
//! that correlates per-module data across modules.

pub mod buffer_pool;
pub mod config;
pub mod dialog;
pub mod driver;
pub mod error;
pub mod event_builder;
pub mod frame;
pub mod listfile;
pub mod proto;
pub mod readout;
pub mod stack_errors;
pub mod transport;
pub mod uri;

use std::path::Path;
use std::sync::Arc;

use crate::config::CrateConfig;
use crate::dialog::Dialog;
use crate::driver::{DriverState, EventDataCallback, ReadoutDriver, SystemEventCallback};
use crate::error::Error;
use crate::event_builder::ModuleConfig;
use crate::stack_errors::ErrorCounters;
use crate::transport::eth::EthTransport;
use crate::transport::usb::UsbTransport;
use crate::transport::Transport;
use crate::uri::{parse_uri, ControllerUri};

/// Default UDP ports for the command and data pipes (spec §4.A). Not pinned
/// down by the available wire examples; chosen to match the conventional
/// mesytec MVLC ETH port assignment and recorded in DESIGN.md.
pub const DEFAULT_ETH_COMMAND_PORT: u16 = 0x8001;
pub const DEFAULT_ETH_DATA_PORT: u16 = 0x8002;

/// Top-level handle to one MVLC crate controller (spec §3: "owned by a
/// `Controller` handle; closed on drop"). Ties the transport, the
/// command-pipe dialog, and the readout driver together behind one type.
pub struct Controller {
    transport: Arc<dyn Transport>,
    dialog: Arc<Dialog>,
    error_counters: Arc<ErrorCounters>,
    driver: ReadoutDriver,
}

impl Controller {
    /// Opens a controller-selection URI (spec §6) and connects its
    /// transport. No listfile is recorded; use [`Controller::with_listfile`]
    /// for that.
    pub fn connect(uri: &str) -> Result<Self, Error> {
        Self::connect_inner(uri, None)
    }

    pub fn with_listfile(uri: &str, listfile_path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::connect_inner(uri, Some(listfile_path.as_ref().to_path_buf()))
    }

    fn connect_inner(uri: &str, listfile_path: Option<std::path::PathBuf>) -> Result<Self, Error> {
        let transport: Arc<dyn Transport> = match parse_uri(uri)? {
            ControllerUri::Usb(selector) => Arc::new(UsbTransport::new(selector.into())),
            ControllerUri::Eth(host) => {
                Arc::new(EthTransport::new(host, DEFAULT_ETH_COMMAND_PORT, DEFAULT_ETH_DATA_PORT))
            }
        };
        transport.connect()?;

        let error_counters = Arc::new(ErrorCounters::new());
        let dialog = Arc::new(Dialog::new(transport.clone(), error_counters.clone()));
        let driver = ReadoutDriver::new(transport.clone(), listfile_path);

        Ok(Controller {
            transport,
            dialog,
            error_counters,
            driver,
        })
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn error_counters(&self) -> Arc<ErrorCounters> {
        self.error_counters.clone()
    }

    pub fn driver_state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn start_readout(
        &self,
        config: CrateConfig,
        module_configs: Vec<Vec<ModuleConfig>>,
        event_data_callback: Arc<EventDataCallback>,
        system_event_callback: Arc<SystemEventCallback>,
    ) -> Result<(), Error> {
        self.driver
            .start(config, module_configs, event_data_callback, system_event_callback)
    }

    pub fn stop_readout(&self) -> Result<(), Error> {
        self.driver.stop()
    }

    pub fn pause_readout(&self, config: &CrateConfig) -> Result<(), Error> {
        self.driver.pause(config)
    }

    pub fn resume_readout(&self, config: &CrateConfig) -> Result<(), Error> {
        self.driver.resume(config)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.driver.stop();
        self.transport.disconnect();
    }
}
