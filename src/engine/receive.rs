//! Receive loop: classifies every assembled message.
//!
//! The controller phase decides how a message is read. During an upload
//! everything up to the `Upload finished` trailer is program text; during a
//! download only the `Download finished` confirmation matters; otherwise the
//! steady-state reply grammar applies.

use super::state::{CommState, Controller, DividerStatus};
use super::{DividerEvent, EventSink};
use crate::protocol::reply::{DeviceReply, DOWNLOAD_FINISHED, UPLOAD_FINISHED};
use crate::transport::Link;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// State of the receive loop.
pub struct MessageRouter {
    link: Arc<dyn Link>,
    controller: Arc<Controller>,
    events: EventSink,
    /// Last line seen during an upload
    previous: Option<String>,
    /// Transfer the buffered line belongs to
    transfer: u64,
}

impl MessageRouter {
    pub(crate) fn new(link: Arc<dyn Link>, controller: Arc<Controller>, events: EventSink) -> Self {
        Self {
            link,
            controller,
            events,
            previous: None,
            transfer: 0,
        }
    }

    /// Drain the link every `period` until `shutdown` flips or its sender goes away.
    pub(crate) async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => self.tick(),
            }
        }
        debug!("Receive loop stopped");
    }

    /// Route every message currently waiting on the link.
    pub fn tick(&mut self) {
        while let Some(message) = self.link.poll_message() {
            self.route(message);
        }
    }

    /// Classify one message against the current phase.
    pub fn route(&mut self, message: String) {
        let (comm, transfer) = self.controller.phase();
        if transfer != self.transfer {
            self.previous = None;
            self.transfer = transfer;
        }
        match comm {
            CommState::UploadingFromDevice => self.uploading(message),
            CommState::DownloadingToDevice => self.downloading(&message),
            CommState::StartingUp | CommState::Idle => {
                self.previous = None;
                self.steady_state(message);
            }
        }
    }

    fn uploading(&mut self, message: String) {
        if !message.contains(UPLOAD_FINISHED) {
            trace!(line = %message, "Upload line buffered");
            self.previous = Some(message);
            return;
        }

        let program = self.previous.take();
        if !self.controller.end_transfer(CommState::UploadingFromDevice) {
            return;
        }
        let program = program.unwrap_or_else(|| {
            warn!("Upload finished without any program text");
            String::new()
        });
        info!(bytes = program.len(), "Program uploaded");
        self.events.emit(DividerEvent::UploadedProgram(program));
        self.update_status(DividerStatus::WaitingForCommand);
    }

    fn downloading(&mut self, message: &str) {
        if !message.contains(DOWNLOAD_FINISHED) {
            trace!(%message, "Ignored during download");
            return;
        }
        if self.controller.end_transfer(CommState::DownloadingToDevice) {
            info!("Program download confirmed");
            self.events.emit(DividerEvent::DownloadFinished);
        }
    }

    fn steady_state(&mut self, message: String) {
        match DeviceReply::parse(&message) {
            Some(DeviceReply::ProgramStarted) | Some(DeviceReply::Status(3)) => {
                self.events.emit(DividerEvent::ProgramIsRunning);
                self.update_status(DividerStatus::RunningProgram);
            }
            Some(DeviceReply::ProgramStopped) | Some(DeviceReply::Status(0)) => {
                self.events.emit(DividerEvent::ProgramIsHalted);
                self.update_status(DividerStatus::WaitingForCommand);
            }
            Some(DeviceReply::Angle(degrees)) => {
                self.events.emit(DividerEvent::GotPosition(degrees));
            }
            Some(DeviceReply::Incremental(0)) => self.events.emit(DividerEvent::IncrementalIsOff),
            Some(DeviceReply::Incremental(1)) => self.events.emit(DividerEvent::IncrementalIsOn),
            Some(other) => trace!(?other, "Unhandled reply value"),
            None if message.is_empty() || message.starts_with('A') => {
                trace!(%message, "Discarded malformed message");
            }
            None => {
                if self.controller.take_version_request() {
                    info!(version = %message, "Firmware version");
                    self.events.emit(DividerEvent::FirmwareVersion(message));
                } else {
                    trace!(%message, "Discarded unrecognized message");
                }
            }
        }
    }

    fn update_status(&self, status: DividerStatus) {
        if self.controller.set_status(status) {
            self.events.emit(DividerEvent::GotStatus(status));
        }
    }
}
