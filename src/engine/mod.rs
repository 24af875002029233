//! Divider protocol engine.
//!
//! The engine runs two periodic tasks over a shared [`Controller`]:
//!
//! - the [`dispatch`] loop sends queued commands and proactive polls and drives
//!   bulk-transfer timeouts
//! - the [`receive`] loop drains assembled messages from the link, classifies
//!   them against the current [`CommState`] and publishes [`DividerEvent`]s
//!
//! Callers talk to it through a [`DividerHandle`] (control requests in) and an
//! [`EventStream`] (events out).
//!
//! ```no_run
//! use divider_controller::config::DividerConfig;
//! use divider_controller::engine::{ControlRequest, DividerEngine};
//!
//! # async fn run() -> divider_controller::error::AppResult<()> {
//! let config = DividerConfig::load_from("config/divider.toml")?;
//! let (mut engine, mut events) = DividerEngine::connect(&config).await?;
//! engine.start()?;
//!
//! let handle = engine.handle();
//! handle.submit(ControlRequest::PositionTo(45.0))?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod queue;
pub mod receive;
pub mod state;

pub use queue::CommandQueue;
pub use state::{CommState, Controller, DividerStatus};

use crate::config::{DividerConfig, TimingSettings};
use crate::error::{AppResult, DividerError};
use crate::protocol::program::normalize_program;
use crate::protocol::{Command, DividerCommand};
use crate::transport::{Link, LinkStatus, SerialTransport};
use dispatch::Dispatcher;
use receive::MessageRouter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Requests accepted by [`DividerHandle::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Stop a running program
    QuitProgram,
    /// Start the stored program
    RunProgram,
    /// Ask for the run/halt status
    GetStatus,
    /// Make the current position zero
    ZeroPosition,
    /// Move to an angle in degrees
    PositionTo(f64),
    /// `true` for incremental positioning, `false` for absolute
    SetIncrementalMode(bool),
    /// Jog one step negative
    StepNegative,
    /// Jog one step positive
    StepPositive,
    /// Fetch the stored program from the device
    UploadToHost,
    /// Send a program to the device
    DownloadProgram(String),
    /// Ask for the current angle
    GetPosition,
    /// Ask for the firmware version
    GetVersion,
}

/// Which bulk transfer an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Host to device
    Download,
    /// Device to host
    Upload,
}

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DividerEvent {
    /// Warm-up is over and the device is being addressed
    CommunicationStarted,
    /// The device reported that its program is running
    ProgramIsRunning,
    /// The device reported that it is halted
    ProgramIsHalted,
    /// Current angle in degrees
    GotPosition(f64),
    /// The divider status changed
    GotStatus(DividerStatus),
    /// Absolute positioning is active
    IncrementalIsOff,
    /// Incremental positioning is active
    IncrementalIsOn,
    /// The device's stored program
    UploadedProgram(String),
    /// The device confirmed a download
    DownloadFinished,
    /// A bulk transfer gave up waiting for the device
    TransferTimedOut(Transfer),
    /// Reply to [`ControlRequest::GetVersion`]
    FirmwareVersion(String),
}

/// Receiving end of the engine's events.
pub type EventStream = mpsc::UnboundedReceiver<DividerEvent>;

/// Sending end of the engine's events, shared by both loops.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<DividerEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: DividerEvent) {
        debug!(?event, "Divider event");
        if self.tx.send(event).is_err() {
            tracing::trace!("Event stream closed, event dropped");
        }
    }
}

/// Cloneable entry point for control requests.
#[derive(Debug, Clone)]
pub struct DividerHandle {
    controller: Arc<Controller>,
    stopped: Arc<AtomicBool>,
}

impl DividerHandle {
    /// Submit a control request.
    ///
    /// Steady-state requests are queued and always accepted while the engine
    /// exists; they wait out any bulk transfer in progress.
    ///
    /// # Errors
    /// - [`DividerError::Busy`] for a bulk request unless the controller is
    ///   idle with an empty queue
    /// - [`DividerError::InvalidRequest`] for a non-finite angle or an empty
    ///   program
    /// - [`DividerError::ShutDown`] after the engine was shut down
    pub fn submit(&self, request: ControlRequest) -> AppResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DividerError::ShutDown);
        }

        let command = match request {
            ControlRequest::QuitProgram => DividerCommand::StopRunning,
            ControlRequest::RunProgram => DividerCommand::RunProgram,
            ControlRequest::GetStatus => DividerCommand::GetStatus,
            ControlRequest::ZeroPosition => DividerCommand::ZeroPosition,
            ControlRequest::SetIncrementalMode(true) => DividerCommand::SetIncremental,
            ControlRequest::SetIncrementalMode(false) => DividerCommand::SetAbsolute,
            ControlRequest::StepNegative => DividerCommand::StepMinus,
            ControlRequest::StepPositive => DividerCommand::StepPlus,
            ControlRequest::GetPosition => DividerCommand::GetAngle,
            ControlRequest::GetVersion => DividerCommand::GetVersion,
            ControlRequest::PositionTo(degrees) => {
                if !degrees.is_finite() {
                    return Err(DividerError::InvalidRequest(format!(
                        "position must be a finite angle, got {degrees}"
                    )));
                }
                self.controller.queue().enqueue(Command::position_to(degrees));
                return Ok(());
            }
            ControlRequest::UploadToHost => return self.controller.begin_upload(),
            ControlRequest::DownloadProgram(text) => {
                let program = normalize_program(&text);
                if program.is_empty() {
                    return Err(DividerError::InvalidRequest(
                        "program is empty after removing comments and whitespace".into(),
                    ));
                }
                return self.controller.begin_download(program);
            }
        };

        self.controller.queue().enqueue(Command::new(command));
        Ok(())
    }

    /// Current divider status.
    pub fn status(&self) -> DividerStatus {
        self.controller.status()
    }

    /// Current protocol phase.
    pub fn comm_state(&self) -> CommState {
        self.controller.comm_state()
    }
}

struct Workers {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    receive: JoinHandle<()>,
}

/// Owns the link and the two protocol loops.
pub struct DividerEngine {
    link: Arc<dyn Link>,
    controller: Arc<Controller>,
    events: EventSink,
    timing: TimingSettings,
    workers: Option<Workers>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for DividerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DividerEngine")
            .field("comm_state", &self.comm_state())
            .field("status", &self.status())
            .field("link", &self.link_status())
            .field("running", &self.workers.is_some())
            .finish()
    }
}

impl DividerEngine {
    /// Build an engine over `link`. Nothing runs until [`start`](Self::start).
    pub fn new(link: Arc<dyn Link>, timing: &TimingSettings) -> (Self, EventStream) {
        let (events, stream) = EventSink::channel();
        let engine = Self {
            link,
            controller: Arc::new(Controller::new()),
            events,
            timing: timing.clone(),
            workers: None,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (engine, stream)
    }

    /// Validate `config` and open its serial port.
    ///
    /// # Errors
    /// Configuration errors, or [`DividerError::Transport`] if the port cannot
    /// be opened.
    pub async fn connect(config: &DividerConfig) -> AppResult<(Self, EventStream)> {
        config.validate()?;
        let link = SerialTransport::connect(&config.serial, &config.framing).await?;
        Ok(Self::new(Arc::new(link), &config.timing))
    }

    /// Like [`connect`](Self::connect) but runs with a down link when the
    /// port cannot be opened.
    ///
    /// # Errors
    /// Configuration errors only.
    pub async fn open(config: &DividerConfig) -> AppResult<(Self, EventStream)> {
        config.validate()?;
        let link = SerialTransport::open(&config.serial, &config.framing).await;
        Ok(Self::new(Arc::new(link), &config.timing))
    }

    /// Start the link reader and both loops. Must be called within a tokio
    /// runtime.
    ///
    /// # Errors
    /// [`DividerError::AlreadyStarted`] or [`DividerError::ShutDown`].
    pub fn start(&mut self) -> AppResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DividerError::ShutDown);
        }
        if self.workers.is_some() {
            return Err(DividerError::AlreadyStarted);
        }

        self.link.start_reader();
        let warmup_deadline = Instant::now() + self.timing.warmup();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.link),
            Arc::clone(&self.controller),
            self.events.clone(),
            self.timing.clone(),
            warmup_deadline,
        );
        let router = MessageRouter::new(
            Arc::clone(&self.link),
            Arc::clone(&self.controller),
            self.events.clone(),
        );

        let dispatch = tokio::spawn(dispatcher.run(self.timing.tick(), shutdown_rx.clone()));
        let receive = tokio::spawn(router.run(self.timing.tick(), shutdown_rx));

        self.workers = Some(Workers {
            shutdown,
            dispatch,
            receive,
        });
        info!(
            link = %self.link.status(),
            tick_ms = self.timing.tick_ms,
            warmup_ms = self.timing.warmup_ms,
            "Divider engine started"
        );
        Ok(())
    }

    /// Handle for submitting control requests.
    pub fn handle(&self) -> DividerHandle {
        DividerHandle {
            controller: Arc::clone(&self.controller),
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// Current divider status.
    pub fn status(&self) -> DividerStatus {
        self.controller.status()
    }

    /// Current protocol phase.
    pub fn comm_state(&self) -> CommState {
        self.controller.comm_state()
    }

    /// Current link status.
    pub fn link_status(&self) -> LinkStatus {
        self.link.status()
    }

    /// Stop both loops, wait for them, then close the link.
    ///
    /// Idempotent. Further control requests fail with
    /// [`DividerError::ShutDown`].
    pub async fn shutdown(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(workers) = self.workers.take() {
            let _ = workers.shutdown.send(true);
            for (name, handle) in [("dispatch", workers.dispatch), ("receive", workers.receive)] {
                if let Err(e) = handle.await {
                    warn!(task = name, error = %e, "Divider loop ended abnormally");
                }
            }
        }

        if self.link.close().await {
            info!("Divider engine stopped");
        }
    }
}

impl Drop for DividerEngine {
    fn drop(&mut self) {
        if let Some(workers) = &self.workers {
            let _ = workers.shutdown.send(true);
        }
    }
}
