//! Dispatch loop: the only writer to the link.
//!
//! Each tick looks at the controller phase:
//!
//! - `StartingUp`: wait for the warm-up deadline, then go idle and schedule
//!   the first proactive polls
//! - `Idle`: send the next queued command, else a due angle poll, else a due
//!   status poll
//! - `DownloadingToDevice`: arm the timeout and send `D`, then send the staged
//!   program followed by EOT, then wait for the device or the timeout
//! - `UploadingFromDevice`: arm the timeout, then for a few ticks send `U` if
//!   it is still queued, then wait for the device or the timeout

use super::state::{CommState, Controller, DividerStatus};
use super::{DividerEvent, EventSink, Transfer};
use crate::config::TimingSettings;
use crate::error::DividerError;
use crate::protocol::{Command, DividerCommand, EOT};
use crate::transport::Link;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Bookkeeping for the bulk transfer currently being driven.
#[derive(Debug, Clone, Copy)]
struct ActiveTransfer {
    id: u64,
    deadline: Instant,
    /// Ticks since the timeout was armed
    ticks: u32,
}

/// State of the dispatch loop.
pub struct Dispatcher {
    link: Arc<dyn Link>,
    controller: Arc<Controller>,
    events: EventSink,
    timing: TimingSettings,
    warmup_deadline: Instant,
    next_angle_poll: Option<Instant>,
    next_status_poll: Option<Instant>,
    active: Option<ActiveTransfer>,
}

impl Dispatcher {
    pub(crate) fn new(
        link: Arc<dyn Link>,
        controller: Arc<Controller>,
        events: EventSink,
        timing: TimingSettings,
        warmup_deadline: Instant,
    ) -> Self {
        Self {
            link,
            controller,
            events,
            timing,
            warmup_deadline,
            next_angle_poll: None,
            next_status_poll: None,
            active: None,
        }
    }

    /// Tick every `period` until `shutdown` flips or its sender goes away.
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
                now = interval.tick() => self.tick(now).await,
            }
        }
        debug!("Dispatch loop stopped");
    }

    /// Run one dispatch cycle at time `now`.
    pub async fn tick(&mut self, now: Instant) {
        let (comm, transfer_id) = self.controller.phase();
        match comm {
            CommState::StartingUp => self.starting_up(now),
            CommState::Idle => {
                self.active = None;
                self.idle(now).await;
            }
            CommState::DownloadingToDevice => self.downloading(now, transfer_id).await,
            CommState::UploadingFromDevice => self.uploading(now, transfer_id).await,
        }
    }

    fn starting_up(&mut self, now: Instant) {
        if now < self.warmup_deadline || !self.controller.finish_startup() {
            return;
        }
        self.next_angle_poll = Some(now + self.timing.first_angle_poll());
        self.next_status_poll = Some(now + self.timing.first_status_poll());
        info!("Warm-up complete, communication started");
        self.events.emit(DividerEvent::CommunicationStarted);
    }

    async fn idle(&mut self, now: Instant) {
        let queued = self
            .controller
            .queue()
            .dequeue_if(|command| !command.kind().is_bulk());

        if let Some(command) = queued {
            if self.send_command(command).await {
                let base = self.next_angle_poll.map_or(now, |deadline| deadline.max(now));
                self.next_angle_poll = Some(base + self.timing.command_poll_deferral());
            }
            return;
        }

        if self.next_angle_poll.is_some_and(|deadline| now >= deadline) {
            self.send_command(DividerCommand::GetAngle.into()).await;
            self.next_angle_poll = Some(now + self.timing.angle_poll_interval());
        } else if self.next_status_poll.is_some_and(|deadline| now >= deadline) {
            self.send_command(DividerCommand::GetStatus.into()).await;
            self.next_status_poll = Some(now + self.timing.status_poll_interval());
        }
    }

    async fn downloading(&mut self, now: Instant, transfer_id: u64) {
        let Some(mut active) = self.active.filter(|a| a.id == transfer_id) else {
            self.arm(now, transfer_id, self.timing.download_timeout());
            let opener = self
                .controller
                .queue()
                .dequeue_if(|command| command.kind() == DividerCommand::DownloadProgram);
            if let Some(command) = opener {
                self.send_command(command).await;
            }
            return;
        };

        if now >= active.deadline {
            self.time_out(CommState::DownloadingToDevice, Transfer::Download);
            return;
        }

        active.ticks += 1;
        self.active = Some(active);
        if active.ticks == 1 {
            self.send_program().await;
        }
    }

    async fn uploading(&mut self, now: Instant, transfer_id: u64) {
        let Some(mut active) = self.active.filter(|a| a.id == transfer_id) else {
            self.arm(now, transfer_id, self.timing.upload_timeout());
            return;
        };

        if now >= active.deadline {
            self.time_out(CommState::UploadingFromDevice, Transfer::Upload);
            return;
        }

        active.ticks += 1;
        self.active = Some(active);
        if active.ticks > self.timing.upload_command_ticks {
            return;
        }

        let request = self
            .controller
            .queue()
            .dequeue_if(|command| command.kind() == DividerCommand::UploadProgram);
        if let Some(command) = request {
            self.send_command(command).await;
        }
        if self.controller.set_status(DividerStatus::UploadingToHost) {
            self.events
                .emit(DividerEvent::GotStatus(DividerStatus::UploadingToHost));
        }
    }

    fn arm(&mut self, now: Instant, id: u64, timeout: Duration) {
        debug!(transfer = id, timeout_ms = timeout.as_millis() as u64, "Transfer timeout armed");
        self.active = Some(ActiveTransfer {
            id,
            deadline: now + timeout,
            ticks: 0,
        });
    }

    fn time_out(&mut self, state: CommState, transfer: Transfer) {
        self.active = None;
        if !self.controller.end_transfer(state) {
            return;
        }
        warn!(?transfer, "Bulk transfer timed out, returning to idle");
        self.events.emit(DividerEvent::TransferTimedOut(transfer));
        if self.controller.set_status(DividerStatus::WaitingForCommand) {
            self.events
                .emit(DividerEvent::GotStatus(DividerStatus::WaitingForCommand));
        }
    }

    /// Send the staged program terminated by EOT as one write.
    async fn send_program(&self) {
        let Some(program) = self.controller.pending_program() else {
            warn!("Download active without a staged program");
            return;
        };
        let mut payload = program.into_bytes();
        payload.push(EOT);

        match self.link.write(&payload).await {
            Ok(()) => debug!(bytes = payload.len(), "Program sent"),
            Err(e) => log_send_failure("program", &e),
        }
    }

    /// Send one command and its payload. Returns `true` if everything was written.
    async fn send_command(&self, command: Command) -> bool {
        if let Err(e) = self.link.send_byte(command.as_byte()).await {
            log_send_failure(&command.to_string(), &e);
            return false;
        }
        if let Some(payload) = command.payload_text() {
            if let Err(e) = self.link.send_text(&payload).await {
                log_send_failure(&command.to_string(), &e);
                return false;
            }
        }

        if command.kind() == DividerCommand::GetVersion {
            self.controller.expect_version();
        }
        debug!(%command, "Command sent");
        true
    }
}

fn log_send_failure(what: &str, error: &DividerError) {
    match error {
        DividerError::LinkDown => trace!(what, "Link down, nothing sent"),
        other => warn!(what, error = %other, "Failed to send to divider"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ControlRequest, DividerHandle, EventStream};
    use crate::error::AppResult;
    use crate::transport::LinkStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    /// Link that records every write.
    #[derive(Default)]
    struct RecordingLink {
        writes: Mutex<Vec<Vec<u8>>>,
        down: AtomicBool,
    }

    impl RecordingLink {
        fn take(&self) -> Vec<String> {
            self.writes
                .lock()
                .drain(..)
                .map(|w| String::from_utf8_lossy(&w).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl Link for RecordingLink {
        fn status(&self) -> LinkStatus {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                LinkStatus::Down
            } else {
                LinkStatus::Up
            }
        }

        fn start_reader(&self) {}

        async fn write(&self, data: &[u8]) -> AppResult<()> {
            if self.status() == LinkStatus::Down {
                return Err(DividerError::LinkDown);
            }
            self.writes.lock().push(data.to_vec());
            Ok(())
        }

        fn poll_message(&self) -> Option<String> {
            None
        }

        async fn close(&self) -> bool {
            true
        }
    }

    struct Fixture {
        link: Arc<RecordingLink>,
        controller: Arc<Controller>,
        handle: DividerHandle,
        events: EventStream,
        dispatcher: Dispatcher,
        start: Instant,
    }

    impl Fixture {
        fn new(timing: TimingSettings) -> Self {
            let link = Arc::new(RecordingLink::default());
            let controller = Arc::new(Controller::new());
            let (sink, events) = EventSink::channel();
            let start = Instant::now();
            let dispatcher = Dispatcher::new(
                link.clone(),
                controller.clone(),
                sink,
                timing.clone(),
                start + timing.warmup(),
            );
            let handle = DividerHandle {
                controller: controller.clone(),
                stopped: Arc::new(AtomicBool::new(false)),
            };
            Self {
                link,
                controller,
                handle,
                events,
                dispatcher,
                start,
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.start + Duration::from_millis(ms)
        }

        async fn tick(&mut self, ms: u64) {
            let now = self.at(ms);
            self.dispatcher.tick(now).await;
        }

        fn events(&mut self) -> Vec<DividerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Finish warm-up at 3000 ms and clear what it produced.
        async fn idle(&mut self) {
            self.tick(3000).await;
            assert_eq!(self.controller.comm_state(), CommState::Idle);
            self.events();
        }
    }

    #[tokio::test]
    async fn test_nothing_sent_during_warmup() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.handle.submit(ControlRequest::RunProgram).unwrap();
        for ms in (0..3000).step_by(500) {
            fx.tick(ms).await;
        }
        assert!(fx.link.take().is_empty());
        assert_eq!(fx.controller.comm_state(), CommState::StartingUp);
        assert!(fx.events().is_empty());
    }

    #[tokio::test]
    async fn test_warmup_ends_with_communication_started() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.tick(3000).await;
        assert_eq!(fx.controller.comm_state(), CommState::Idle);
        assert_eq!(fx.events(), vec![DividerEvent::CommunicationStarted]);
    }

    #[tokio::test]
    async fn test_proactive_poll_schedule() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;

        fx.tick(3500).await;
        assert!(fx.link.take().is_empty());
        // status first at +1 s, angle at +3 s
        fx.tick(4000).await;
        assert_eq!(fx.link.take(), vec!["S"]);
        fx.tick(6000).await;
        assert_eq!(fx.link.take(), vec!["?"]);
        fx.tick(6500).await;
        assert!(fx.link.take().is_empty());
        fx.tick(16000).await;
        assert_eq!(fx.link.take(), vec!["?"]);
        fx.tick(24000).await;
        assert_eq!(fx.link.take(), vec!["S"]);
    }

    #[tokio::test]
    async fn test_position_sends_command_then_payload() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle.submit(ControlRequest::PositionTo(12.5)).unwrap();
        fx.tick(3500).await;
        assert_eq!(fx.link.take(), vec!["P", "12.50"]);
    }

    #[tokio::test]
    async fn test_commands_go_before_polls_and_defer_angle_poll() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle.submit(ControlRequest::ZeroPosition).unwrap();
        fx.handle.submit(ControlRequest::StepPositive).unwrap();

        fx.tick(6000).await;
        fx.tick(6500).await;
        assert_eq!(fx.link.take(), vec!["Z", "+"]);

        // angle poll was due at 6000 ms, pushed out twice by 2 s
        fx.tick(7000).await;
        assert_eq!(fx.link.take(), vec!["S"]);
        fx.tick(9500).await;
        assert!(fx.link.take().is_empty());
        fx.tick(10000).await;
        assert_eq!(fx.link.take(), vec!["?"]);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_defer_poll() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.link.down.store(true, std::sync::atomic::Ordering::SeqCst);
        fx.handle.submit(ControlRequest::RunProgram).unwrap();
        fx.tick(5500).await;
        assert!(fx.controller.queue().is_empty());
        assert_eq!(fx.dispatcher.next_angle_poll, Some(fx.at(6000)));
    }

    #[tokio::test]
    async fn test_version_request_armed_when_sent() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle.submit(ControlRequest::GetVersion).unwrap();
        assert!(!fx.controller.take_version_request());
        fx.tick(3500).await;
        assert_eq!(fx.link.take(), vec!["V"]);
        assert!(fx.controller.take_version_request());
    }

    #[tokio::test]
    async fn test_download_sequence_and_timeout() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle
            .submit(ControlRequest::DownloadProgram("R".into()))
            .unwrap();
        assert_eq!(fx.controller.comm_state(), CommState::DownloadingToDevice);

        fx.tick(3500).await;
        assert_eq!(fx.link.take(), vec!["D"]);
        fx.tick(4000).await;
        assert_eq!(fx.link.take(), vec!["R\u{1b}"]);
        fx.tick(4500).await;
        assert!(fx.link.take().is_empty());

        // armed at 3500 with a 20 s timeout
        fx.tick(23000).await;
        assert_eq!(fx.controller.comm_state(), CommState::DownloadingToDevice);
        fx.tick(23500).await;
        assert_eq!(fx.controller.comm_state(), CommState::Idle);
        assert_eq!(fx.controller.status(), DividerStatus::WaitingForCommand);
        assert_eq!(
            fx.events(),
            vec![
                DividerEvent::TransferTimedOut(Transfer::Download),
                DividerEvent::GotStatus(DividerStatus::WaitingForCommand),
            ]
        );

        fx.handle
            .submit(ControlRequest::DownloadProgram("M1".into()))
            .unwrap();
        fx.tick(24000).await;
        fx.tick(24500).await;
        assert_eq!(fx.link.take(), vec!["D", "M1\u{1b}"]);
    }

    #[tokio::test]
    async fn test_upload_sequence() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle.submit(ControlRequest::UploadToHost).unwrap();

        fx.tick(3500).await;
        assert!(fx.link.take().is_empty());
        fx.tick(4000).await;
        assert_eq!(fx.link.take(), vec!["U"]);
        assert_eq!(fx.controller.status(), DividerStatus::UploadingToHost);
        assert_eq!(
            fx.events(),
            vec![DividerEvent::GotStatus(DividerStatus::UploadingToHost)]
        );
        for ms in [4500, 5000, 5500, 6000] {
            fx.tick(ms).await;
        }
        assert!(fx.link.take().is_empty());
        assert!(fx.events().is_empty());

        fx.tick(23500).await;
        assert_eq!(fx.controller.comm_state(), CommState::Idle);
        assert_eq!(
            fx.events(),
            vec![
                DividerEvent::TransferTimedOut(Transfer::Upload),
                DividerEvent::GotStatus(DividerStatus::WaitingForCommand),
            ]
        );
    }

    #[tokio::test]
    async fn test_queued_commands_wait_for_transfer_to_end() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle.submit(ControlRequest::UploadToHost).unwrap();
        fx.handle.submit(ControlRequest::StepNegative).unwrap();

        fx.tick(3500).await;
        fx.tick(4000).await;
        assert_eq!(fx.link.take(), vec!["U"]);

        assert!(fx.controller.end_transfer(CommState::UploadingFromDevice));
        fx.tick(4500).await;
        assert_eq!(fx.link.take(), vec!["-"]);
    }

    #[tokio::test]
    async fn test_back_to_back_transfers_rearm() {
        let mut fx = Fixture::new(TimingSettings::default());
        fx.idle().await;
        fx.handle
            .submit(ControlRequest::DownloadProgram("B1".into()))
            .unwrap();
        fx.tick(3500).await;
        fx.tick(4000).await;
        assert_eq!(fx.link.take(), vec!["D", "B1\u{1b}"]);

        // completed and re-requested between two ticks
        assert!(fx.controller.end_transfer(CommState::DownloadingToDevice));
        fx.handle
            .submit(ControlRequest::DownloadProgram("B2".into()))
            .unwrap();
        fx.tick(4500).await;
        fx.tick(5000).await;
        assert_eq!(fx.link.take(), vec!["D", "B2\u{1b}"]);
    }
}
