//! End-to-end tests: a full `DividerEngine` over the mock serial port.
//!
//! The tokio clock is paused, so warm-up, polls and bulk-transfer timeouts run
//! in virtual time.

use async_trait::async_trait;
use divider_controller::config::{FramingSettings, TimingSettings};
use divider_controller::engine::{
    CommState, ControlRequest, DividerEngine, DividerEvent, DividerStatus, EventStream, Transfer,
};
use divider_controller::error::{AppResult, DividerError};
use divider_controller::protocol::EOT;
use divider_controller::transport::mock_serial::{self, MockDeviceHarness};
use divider_controller::transport::{Link, LinkStatus, SerialTransport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Serial transport that counts how often it was actually closed.
struct CountingLink {
    inner: SerialTransport,
    closes: AtomicUsize,
}

#[async_trait]
impl Link for CountingLink {
    fn status(&self) -> LinkStatus {
        self.inner.status()
    }

    fn start_reader(&self) {
        self.inner.start_reader()
    }

    async fn write(&self, data: &[u8]) -> AppResult<()> {
        self.inner.write(data).await
    }

    fn poll_message(&self) -> Option<String> {
        self.inner.poll_message()
    }

    async fn close(&self) -> bool {
        let closed = self.inner.close().await;
        if closed {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        closed
    }
}

struct Rig {
    engine: DividerEngine,
    events: EventStream,
    device: MockDeviceHarness,
    link: Arc<CountingLink>,
}

impl Rig {
    fn new() -> Self {
        let (port, device) = mock_serial::new();
        let link = Arc::new(CountingLink {
            inner: SerialTransport::from_stream("mock", Box::new(port), &FramingSettings::default()),
            closes: AtomicUsize::new(0),
        });
        let (engine, events) = DividerEngine::new(link.clone(), &TimingSettings::default());
        Self {
            engine,
            events,
            device,
            link,
        }
    }

    /// Start the engine and wait out the warm-up.
    async fn started() -> Self {
        let mut rig = Self::new();
        rig.engine.start().expect("engine starts");
        rig.wait_for(|e| *e == DividerEvent::CommunicationStarted).await;
        rig
    }

    fn submit(&self, request: ControlRequest) -> AppResult<()> {
        self.engine.handle().submit(request)
    }

    async fn next_event(&mut self) -> DividerEvent {
        timeout(Duration::from_secs(120), self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream closed")
    }

    /// Skip events until one matches.
    async fn wait_for(&mut self, pred: impl Fn(&DividerEvent) -> bool) -> DividerEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn nothing_is_written_during_warmup() {
    let mut rig = Rig::new();
    rig.engine.start().unwrap();
    rig.submit(ControlRequest::RunProgram).unwrap();

    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert!(rig.device.take_written().is_empty());
    assert_eq!(rig.engine.comm_state(), CommState::StartingUp);

    assert_eq!(rig.next_event().await, DividerEvent::CommunicationStarted);
    assert_eq!(rig.engine.comm_state(), CommState::Idle);
    // the queued request goes first, then the first status poll
    rig.device.expect_write(b"R").await;
    rig.device.expect_write(b"S").await;
}

#[tokio::test(start_paused = true)]
async fn position_request_sends_command_then_angle_text() {
    let mut rig = Rig::started().await;
    rig.submit(ControlRequest::PositionTo(12.5)).unwrap();
    rig.device.expect_write(b"P12.50").await;
}

#[tokio::test(start_paused = true)]
async fn status_and_angle_replies_become_events() {
    let mut rig = Rig::started().await;

    rig.device.send_frame("S3").unwrap();
    assert_eq!(rig.next_event().await, DividerEvent::ProgramIsRunning);
    assert_eq!(
        rig.next_event().await,
        DividerEvent::GotStatus(DividerStatus::RunningProgram)
    );
    assert_eq!(rig.engine.status(), DividerStatus::RunningProgram);

    rig.device.send_frame("S0").unwrap();
    assert_eq!(rig.next_event().await, DividerEvent::ProgramIsHalted);
    assert_eq!(rig.engine.status(), DividerStatus::WaitingForCommand);

    rig.device.send_frame("A45.00").unwrap();
    rig.wait_for(|e| matches!(e, DividerEvent::GotPosition(_))).await;

    // a malformed angle yields nothing and the engine keeps going
    rig.device.send_frame("A").unwrap();
    rig.device.send_response(b"A1\r\n.25\x17").unwrap();
    assert_eq!(
        rig.wait_for(|e| matches!(e, DividerEvent::GotPosition(_))).await,
        DividerEvent::GotPosition(1.25)
    );
}

#[tokio::test(start_paused = true)]
async fn download_round_trip() {
    let mut rig = Rig::started().await;
    rig.submit(ControlRequest::DownloadProgram("R".into())).unwrap();
    assert_eq!(rig.engine.comm_state(), CommState::DownloadingToDevice);

    rig.device.expect_write(b"D").await;
    rig.device.expect_write(&[b'R', EOT]).await;

    rig.device.send_frame("Download finished").unwrap();
    rig.wait_for(|e| *e == DividerEvent::DownloadFinished).await;
    assert_eq!(rig.engine.comm_state(), CommState::Idle);
}

#[tokio::test(start_paused = true)]
async fn download_timeout_recovers_to_idle() {
    let mut rig = Rig::started().await;
    rig.submit(ControlRequest::DownloadProgram("R".into())).unwrap();

    let started = Instant::now();
    rig.wait_for(|e| *e == DividerEvent::TransferTimedOut(Transfer::Download))
        .await;
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(rig.engine.comm_state(), CommState::Idle);
    assert_eq!(rig.engine.status(), DividerStatus::WaitingForCommand);

    rig.device.take_written();
    rig.submit(ControlRequest::DownloadProgram("M1".into())).unwrap();
    rig.device.expect_write(b"D").await;
    rig.device.expect_write(&[b'M', b'1', EOT]).await;
}

#[tokio::test(start_paused = true)]
async fn upload_returns_program_line() {
    let mut rig = Rig::started().await;
    rig.submit(ControlRequest::UploadToHost).unwrap();
    assert_eq!(rig.engine.comm_state(), CommState::UploadingFromDevice);

    rig.device.expect_write(b"U").await;
    assert_eq!(
        rig.wait_for(|e| matches!(e, DividerEvent::GotStatus(_))).await,
        DividerEvent::GotStatus(DividerStatus::UploadingToHost)
    );

    rig.device.send_frame("line1").unwrap();
    rig.device.send_frame("Upload finished").unwrap();
    assert_eq!(
        rig.next_event().await,
        DividerEvent::UploadedProgram("line1".into())
    );
    assert_eq!(rig.engine.comm_state(), CommState::Idle);
    assert_eq!(rig.engine.status(), DividerStatus::WaitingForCommand);
}

#[tokio::test(start_paused = true)]
async fn second_bulk_request_is_busy() {
    let rig = Rig::started().await;
    rig.submit(ControlRequest::UploadToHost).unwrap();
    let err = rig
        .submit(ControlRequest::DownloadProgram("R".into()))
        .unwrap_err();
    assert!(matches!(err, DividerError::Busy(CommState::UploadingFromDevice)));
    // steady-state requests still queue up
    rig.submit(ControlRequest::StepPositive).unwrap();
}

#[tokio::test(start_paused = true)]
async fn firmware_version_only_when_requested() {
    let mut rig = Rig::started().await;
    rig.device.send_frame("Divider v0.9").unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(rig.events.try_recv().is_err());

    rig.submit(ControlRequest::GetVersion).unwrap();
    rig.device.expect_write(b"V").await;
    rig.device.send_frame("Divider v1.2").unwrap();
    assert_eq!(
        rig.wait_for(|e| matches!(e, DividerEvent::FirmwareVersion(_))).await,
        DividerEvent::FirmwareVersion("Divider v1.2".into())
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_loops_and_closes_link_once() {
    let mut rig = Rig::started().await;
    let handle = rig.engine.handle();

    let begun = Instant::now();
    rig.engine.shutdown().await;
    assert!(begun.elapsed() <= TimingSettings::default().tick());
    rig.engine.shutdown().await;

    assert_eq!(rig.link.closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.engine.link_status(), LinkStatus::Down);
    assert!(matches!(
        handle.submit(ControlRequest::GetStatus),
        Err(DividerError::ShutDown)
    ));

    rig.device.take_written();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rig.device.take_written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unplugged_device_leaves_engine_running() {
    let Rig {
        mut engine,
        mut events,
        device,
        ..
    } = Rig::started().await;
    drop(device);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.link_status(), LinkStatus::Down);
    engine.handle().submit(ControlRequest::ZeroPosition).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(engine.comm_state(), CommState::Idle);
    assert!(events.try_recv().is_err());

    engine.shutdown().await;
}
