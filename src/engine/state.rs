//! Controller state shared by the dispatch and receive loops.
//!
//! [`CommState`] gates how both loops behave; [`DividerStatus`] is what the
//! outside world sees. Both live in one mutex-guarded struct together with
//! the staged program text, so every transition is a single compare-and-set.
//!
//! Legal transitions:
//!
//! ```text
//! StartingUp ──warm-up──▶ Idle ──download──▶ DownloadingToDevice ─┐
//!                          ▲ ▲                                     │
//!                          │ └──finished / timeout─────────────────┘
//!                          │
//!                          └──finished / timeout── UploadingFromDevice ◀──upload── Idle
//! ```

use super::queue::CommandQueue;
use crate::error::{AppResult, DividerError};
use crate::protocol::{Command, DividerCommand};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, info};

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommState {
    /// Waiting out the firmware's power-up grace period
    StartingUp,
    /// Steady state: commands and proactive polls
    Idle,
    /// Sending a program to the device
    DownloadingToDevice,
    /// Receiving the stored program from the device
    UploadingFromDevice,
}

impl CommState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: CommState) -> bool {
        use CommState::*;
        matches!(
            (self, next),
            (StartingUp, Idle)
                | (Idle, DownloadingToDevice)
                | (Idle, UploadingFromDevice)
                | (DownloadingToDevice, Idle)
                | (UploadingFromDevice, Idle)
        )
    }

    /// Whether this state is a bulk transfer.
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            CommState::DownloadingToDevice | CommState::UploadingFromDevice
        )
    }
}

impl fmt::Display for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device status as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DividerStatus {
    /// Nothing heard yet
    #[default]
    Unknown,
    /// Halted, accepting commands
    WaitingForCommand,
    /// Executing its stored program
    RunningProgram,
    /// Sending its program to the host
    UploadingToHost,
}

impl fmt::Display for DividerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct ControllerState {
    comm: CommState,
    status: DividerStatus,
    pending_program: Option<String>,
    awaiting_version: bool,
    /// Incremented by every accepted bulk request
    transfers: u64,
}

/// Shared controller: protocol phase, device status and the command queue.
#[derive(Debug)]
pub struct Controller {
    state: Mutex<ControllerState>,
    queue: CommandQueue,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    /// A controller in [`CommState::StartingUp`] with an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControllerState {
                comm: CommState::StartingUp,
                status: DividerStatus::Unknown,
                pending_program: None,
                awaiting_version: false,
                transfers: 0,
            }),
            queue: CommandQueue::new(),
        }
    }

    /// Outbound command queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Current protocol phase.
    pub fn comm_state(&self) -> CommState {
        self.state.lock().comm
    }

    /// Current device status.
    pub fn status(&self) -> DividerStatus {
        self.state.lock().status
    }

    /// Current protocol phase and the number of bulk transfers begun so far.
    ///
    /// The counter tells two consecutive transfers of the same kind apart.
    pub fn phase(&self) -> (CommState, u64) {
        let state = self.state.lock();
        (state.comm, state.transfers)
    }

    /// Set the device status. Returns `true` if it changed.
    pub fn set_status(&self, status: DividerStatus) -> bool {
        let mut state = self.state.lock();
        if state.status == status {
            return false;
        }
        debug!(from = %state.status, to = %status, "Divider status changed");
        state.status = status;
        true
    }

    /// Move from `from` to `to` if the controller is in `from` and the
    /// transition is legal. Returns whether it happened.
    pub fn transition(&self, from: CommState, to: CommState) -> bool {
        let mut state = self.state.lock();
        if state.comm != from || !from.can_transition_to(to) {
            return false;
        }
        state.comm = to;
        info!(%from, %to, "Controller state transition");
        true
    }

    /// End the warm-up period.
    pub fn finish_startup(&self) -> bool {
        self.transition(CommState::StartingUp, CommState::Idle)
    }

    /// Stage `program` and enter [`CommState::DownloadingToDevice`].
    ///
    /// # Errors
    /// [`DividerError::Busy`] unless the controller is idle with nothing queued.
    pub fn begin_download(&self, program: String) -> AppResult<()> {
        let mut state = self.state.lock();
        self.claim_idle(state.comm, DividerCommand::DownloadProgram)?;
        state.pending_program = Some(program);
        state.comm = CommState::DownloadingToDevice;
        state.transfers += 1;
        info!(from = %CommState::Idle, to = %state.comm, "Controller state transition");
        Ok(())
    }

    /// Queue the upload command and enter [`CommState::UploadingFromDevice`].
    ///
    /// # Errors
    /// [`DividerError::Busy`] unless the controller is idle with nothing queued.
    pub fn begin_upload(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        self.claim_idle(state.comm, DividerCommand::UploadProgram)?;
        state.comm = CommState::UploadingFromDevice;
        state.transfers += 1;
        info!(from = %CommState::Idle, to = %state.comm, "Controller state transition");
        Ok(())
    }

    /// Enqueue `command` if `comm` is idle and the queue is empty.
    fn claim_idle(&self, comm: CommState, command: DividerCommand) -> AppResult<()> {
        if comm != CommState::Idle {
            return Err(DividerError::Busy(comm));
        }
        self.queue.with_locked(|queue| {
            if !queue.is_empty() {
                return Err(DividerError::Busy(comm));
            }
            queue.push_back(Command::new(command));
            Ok(())
        })
    }

    /// Leave the bulk-transfer state `from` for [`CommState::Idle`].
    ///
    /// Drops the staged program and any bulk command still queued. Returns
    /// `false` if the controller was not in `from`.
    pub fn end_transfer(&self, from: CommState) -> bool {
        let mut state = self.state.lock();
        if state.comm != from || !from.is_transfer() {
            return false;
        }
        state.comm = CommState::Idle;
        state.pending_program = None;
        let purged = self.queue.remove_where(|c| c.kind().is_bulk());
        info!(%from, to = %CommState::Idle, purged, "Controller state transition");
        true
    }

    /// Program text staged for the current download.
    pub fn pending_program(&self) -> Option<String> {
        self.state.lock().pending_program.clone()
    }

    /// Note that a version reply is expected.
    pub fn expect_version(&self) {
        self.state.lock().awaiting_version = true;
    }

    /// Consume the version-reply expectation.
    pub fn take_version_request(&self) -> bool {
        std::mem::take(&mut self.state.lock().awaiting_version)
    }
}
