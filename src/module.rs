// Lifecycle coordinator: maps the framework commands {init, conf, start,
// stop} onto the control channel and the readout worker, and guarantees
// socket and thread cleanup on every exit path.

use crate::calibration::CalibrationSink;
use crate::config::Conf;
use crate::control::{ControlClient, HARD_RESET_CMD, START_RUN_CMD, STOP_RUN_CMD};
use crate::error::CtbError;
use crate::hsi::{HsiEvent, HsiFrame};
use crate::readout::ReadoutWorker;
use crate::stats::{self, CounterSnapshot, RunCounters};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// Grace period between requesting the stop and telling the board, so the
// readout can drain instead of reading from an empty buffer.
const STOP_GRACE: Duration = Duration::from_millis(2);

/// Output channels resolved at `init`: two HSI frame links (low-level and
/// high-level) and the summary event stream.
#[derive(Debug, Clone)]
pub struct HsiOutputs {
    pub llt: Sender<HsiFrame>,
    pub hlt: Sender<HsiFrame>,
    pub events: Sender<HsiEvent>,
}

/// Telemetry snapshot of the module, collected on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub num_control_messages_sent: u64,
    pub num_control_responses_received: u64,
    pub ctb_hardware_run_status: bool,
    pub ctb_hardware_configuration_status: bool,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

/// The driver for one Central Trigger Board.
///
/// Commands arrive one at a time from the framework's command thread; the
/// only other thread is the readout worker spawned at `start` and joined at
/// `stop`. Dropping a running module stops it first; the control socket is
/// closed unconditionally on drop.
pub struct CtbModule {
    conf: Option<Conf>,
    outputs: Option<HsiOutputs>,
    control: Option<ControlClient>,
    counters: Arc<RunCounters>,
    stop_requested: Arc<AtomicBool>,
    is_running: Arc<AtomicBool>,
    is_configured: AtomicBool,
    error_state: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    run_number: u32,
}

impl CtbModule {
    pub fn new() -> Self {
        CtbModule {
            conf: None,
            outputs: None,
            control: None,
            counters: Arc::new(RunCounters::new([], [])),
            stop_requested: Arc::new(AtomicBool::new(false)),
            is_running: Arc::new(AtomicBool::new(false)),
            is_configured: AtomicBool::new(false),
            error_state: Arc::new(AtomicBool::new(false)),
            worker: None,
            run_number: 0,
        }
    }

    /// `init`: capture the resolved output channels. No network I/O.
    pub fn init(&mut self, outputs: HsiOutputs) {
        debug!("entering init");
        self.outputs = Some(outputs);
    }

    /// `conf`: decode the configuration, allocate the per-bit counter maps,
    /// connect the control socket and push the board configuration. A
    /// failure at any step fails the configuration.
    pub fn conf(&mut self, args: &serde_json::Value) -> Result<(), CtbError> {
        info!("configuring CTB");
        let conf: Conf = serde_json::from_value(args.clone())
            .map_err(|e| CtbError::Configuration(format!("bad configuration: {e}")))?;

        info!(
            host = %conf.board_config.ctb.sockets.receiver.host,
            port = conf.board_config.ctb.sockets.receiver.port,
            "board receiver network location"
        );

        // Fresh counters: the per-bit maps depend on the enabled triggers.
        self.counters = Arc::new(RunCounters::new(
            conf.enabled_hlt_bits(),
            conf.enabled_llt_bits(),
        ));

        let mut control =
            ControlClient::connect(&conf.ctb_hostname, conf.control_connection_port)?;

        if self.is_configured.load(Ordering::SeqCst) {
            debug!("resetting before configuring");
            match control.send(HARD_RESET_CMD) {
                Ok(()) => {
                    self.is_running.store(false, Ordering::SeqCst);
                    self.is_configured.store(false, Ordering::SeqCst);
                }
                Err(e) => error!(error = %e, "unable to reset CTB"),
            }
        }

        if conf.has_calibration_stream() {
            info!(
                dir = %conf.calibration_stream_output,
                interval = %humantime::format_duration(conf.calibration_interval()),
                "calibration stream enabled"
            );
        }

        debug!("sending config");
        let blob = conf.board_config_json()?;
        control
            .send(&blob)
            .map_err(|e| CtbError::ControlCommunication(format!("unable to configure CTB: {e}")))?;

        self.is_configured.store(true, Ordering::SeqCst);
        self.control = Some(control);
        self.conf = Some(conf);
        Ok(())
    }

    /// `start`: latch the run number, reset the counters, spawn the readout
    /// worker, then command the board. If the board refuses to start, the
    /// worker is torn down again before the error is returned.
    pub fn start(&mut self, run_number: u32) -> Result<(), CtbError> {
        debug!(run_number, "entering start");
        let conf = self
            .conf
            .as_ref()
            .ok_or_else(|| CtbError::Configuration("start issued before conf".to_string()))?;
        let outputs = self
            .outputs
            .clone()
            .ok_or_else(|| CtbError::Configuration("start issued before init".to_string()))?;

        // Clear this early so it cannot interfere with the start.
        self.stop_requested.store(false, Ordering::SeqCst);
        self.error_state.store(false, Ordering::SeqCst);
        self.run_number = run_number;
        self.counters.reset_for_run();

        let calibration = if conf.has_calibration_stream() {
            match CalibrationSink::create(
                &conf.calibration_stream_output,
                &format!("run{run_number}"),
                conf.calibration_interval(),
            ) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!(error = %e, "cannot open calibration stream, continuing without");
                    None
                }
            }
        } else {
            None
        };

        let worker = ReadoutWorker {
            port: conf.board_config.ctb.sockets.receiver.port,
            accept_poll: conf.receiver_timeout(),
            run_number,
            counters: Arc::clone(&self.counters),
            outputs,
            stop_requested: Arc::clone(&self.stop_requested),
            is_running: Arc::clone(&self.is_running),
            error_state: Arc::clone(&self.error_state),
            calibration,
        };
        let handle = thread::Builder::new()
            .name("ctb-readout".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                CtbError::DataCommunication(format!("cannot spawn readout thread: {e}"))
            })?;
        self.worker = Some(handle);

        debug!("sending start of run command");
        match self.send_control(START_RUN_CMD) {
            Ok(()) => {
                self.is_running.store(true, Ordering::SeqCst);
                debug!("successfully started");
                Ok(())
            }
            Err(e) => {
                // The board never started: tear the worker down again.
                self.stop_requested.store(true, Ordering::SeqCst);
                self.join_worker();
                Err(CtbError::ControlCommunication(format!("unable to start CTB: {e}")))
            }
        }
    }

    /// `stop`: request the readout to wind down, command the board, persist
    /// the run-trigger report, join the worker. The worker and data socket
    /// are released before this returns, even when the StopRun exchange
    /// fails.
    pub fn stop(&mut self) -> Result<(), CtbError> {
        debug!("sending stop run command");
        self.stop_requested.store(true, Ordering::SeqCst);
        thread::sleep(STOP_GRACE);

        let send_result = self.send_control(STOP_RUN_CMD);
        if send_result.is_ok() {
            debug!("successfully stopped");
        }
        // Whether or not the board acknowledged, release the worker: it spins
        // on is_running before giving up the data socket.
        self.is_running.store(false, Ordering::SeqCst);

        if let Some(conf) = self.conf.as_ref() {
            if conf.has_run_trigger_report() {
                match stats::write_run_trigger_report(
                    Path::new(&conf.run_trigger_output),
                    self.run_number,
                    &self.counters,
                ) {
                    Ok(path) => info!(path = %path.display(), "run trigger report written"),
                    Err(e) => warn!(error = %e, "cannot write run trigger report"),
                }
            }
        }

        self.join_worker();
        self.counters.reset_run_scoped();

        send_result.map_err(|e| CtbError::ControlCommunication(format!("unable to stop CTB: {e}")))
    }

    /// Snapshot the operational counters. Rate-like counters are delivered
    /// as deltas since the previous collection.
    pub fn telemetry(&self) -> ModuleInfo {
        ModuleInfo {
            num_control_messages_sent: self.control.as_ref().map_or(0, |c| c.messages_sent()),
            num_control_responses_received: self
                .control
                .as_ref()
                .map_or(0, |c| c.responses_received()),
            ctb_hardware_run_status: self.is_running.load(Ordering::SeqCst),
            ctb_hardware_configuration_status: self.is_configured.load(Ordering::SeqCst),
            counters: self.counters.collect(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn is_configured(&self) -> bool {
        self.is_configured.load(Ordering::SeqCst)
    }

    /// True once a feedback word latched the run into the error state.
    pub fn error_state(&self) -> bool {
        self.error_state.load(Ordering::SeqCst)
    }

    fn send_control(&mut self, command: &str) -> Result<(), CtbError> {
        match self.control.as_mut() {
            Some(control) => control.send(command),
            None => Err(CtbError::Configuration(
                "control channel not configured".to_string(),
            )),
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("readout thread panicked");
            }
        }
    }
}

impl Default for CtbModule {
    fn default() -> Self {
        CtbModule::new()
    }
}

impl Drop for CtbModule {
    fn drop(&mut self) {
        if self.is_running.load(Ordering::SeqCst) {
            if let Err(e) = self.stop() {
                error!(error = %e, "stop on drop failed");
            }
        }
        // Dropping the client closes the control socket.
        self.control.take();
    }
}
