//! Serial transport built on `tokio-serial`.
//!
//! The port is split into halves. The write half sits behind an async mutex
//! and serves [`Link::write`]. The read half is moved into a reader task that
//! feeds a [`FrameAssembler`] and pushes completed messages into a bounded
//! [`MessageQueue`]. Any read or write failure marks the link
//! [`LinkStatus::Down`]; from then on writes are refused without touching the
//! port.

use super::{Link, LinkStats, LinkStatsSnapshot, LinkStatus, MessageQueue};
use crate::config::{FramingSettings, Parity, SerialSettings};
use crate::error::{AppResult, DividerError};
use crate::protocol::FrameAssembler;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, instrument, warn};

/// Anything that can stand in for a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

const READ_CHUNK: usize = 256;

/// State shared with the reader task.
#[derive(Debug)]
struct Inbound {
    up: AtomicBool,
    messages: MessageQueue,
    stats: LinkStats,
}

impl Inbound {
    fn mark_down(&self) -> bool {
        self.up.swap(false, Ordering::SeqCst)
    }
}

enum ReaderSlot {
    /// Read half waiting for `start_reader`
    Pending(ReadHalf<DynSerial>),
    Running {
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// [`Link`] over a serial port.
pub struct SerialTransport {
    port_name: String,
    buffer_capacity: usize,
    inbound: Arc<Inbound>,
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
    reader: parking_lot::Mutex<ReaderSlot>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Open the configured port, failing if it cannot be opened.
    ///
    /// # Errors
    /// Returns [`DividerError::Configuration`] for unusable line settings and
    /// [`DividerError::Transport`] if the port cannot be opened.
    #[instrument(skip_all, fields(port = %serial.port, baud = serial.baud_rate))]
    pub async fn connect(serial: &SerialSettings, framing: &FramingSettings) -> AppResult<Self> {
        let data_bits = data_bits(serial.data_bits)?;
        let stop_bits = stop_bits(serial.stop_bits)?;
        let parity = parity(serial.parity);
        let port_name = serial.port.clone();
        let baud_rate = serial.baud_rate;

        let path = port_name.clone();
        let stream = spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(stop_bits)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| DividerError::Io(std::io::Error::other(e)))?
        .map_err(|source| DividerError::Transport {
            port: port_name.clone(),
            source,
        })?;

        info!("Serial port opened");
        Ok(Self::from_stream(&port_name, Box::new(stream), framing))
    }

    /// Open the configured port, falling back to a down link on failure.
    ///
    /// The failure is logged; the engine then runs with every send ignored.
    pub async fn open(serial: &SerialSettings, framing: &FramingSettings) -> Self {
        match Self::connect(serial, framing).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(port = %serial.port, error = %e, "Serial port unavailable, link is down");
                Self::down(&serial.port, framing)
            }
        }
    }

    /// A link that was never opened.
    pub fn down(port_name: &str, framing: &FramingSettings) -> Self {
        Self::build(port_name, None, framing)
    }

    /// Wrap an already-open stream, e.g. a [`mock_serial`](super::mock_serial) port.
    pub fn from_stream(port_name: &str, stream: DynSerial, framing: &FramingSettings) -> Self {
        Self::build(port_name, Some(stream), framing)
    }

    fn build(port_name: &str, stream: Option<DynSerial>, framing: &FramingSettings) -> Self {
        let (reader, writer, up) = match stream {
            Some(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                (ReaderSlot::Pending(read_half), Some(write_half), true)
            }
            None => (ReaderSlot::Stopped, None, false),
        };

        Self {
            port_name: port_name.to_string(),
            buffer_capacity: framing.buffer_capacity,
            inbound: Arc::new(Inbound {
                up: AtomicBool::new(up),
                messages: MessageQueue::new(framing.message_queue_capacity),
                stats: LinkStats::default(),
            }),
            writer: Mutex::new(writer),
            reader: parking_lot::Mutex::new(reader),
            closed: AtomicBool::new(false),
        }
    }

    /// Configured port name.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Inbound traffic counters.
    pub fn stats(&self) -> LinkStatsSnapshot {
        self.inbound.stats.snapshot()
    }
}

#[async_trait]
impl Link for SerialTransport {
    fn status(&self) -> LinkStatus {
        if self.inbound.up.load(Ordering::SeqCst) {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        }
    }

    fn start_reader(&self) {
        let mut slot = self.reader.lock();
        let read_half = match std::mem::replace(&mut *slot, ReaderSlot::Stopped) {
            ReaderSlot::Pending(read_half) => read_half,
            other => {
                *slot = other;
                return;
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&self.inbound),
            self.port_name.clone(),
            self.buffer_capacity,
            shutdown_rx,
        ));
        *slot = ReaderSlot::Running { shutdown, handle };
        debug!(port = %self.port_name, "Serial reader started");
    }

    async fn write(&self, data: &[u8]) -> AppResult<()> {
        if self.status() == LinkStatus::Down {
            return Err(DividerError::LinkDown);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(DividerError::LinkDown)?;

        let result = match writer.write_all(data).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if self.inbound.mark_down() {
                warn!(port = %self.port_name, error = %e, "Serial write failed, link is down");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn poll_message(&self) -> Option<String> {
        self.inbound.messages.pop()
    }

    async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inbound.mark_down();

        let reader = std::mem::replace(&mut *self.reader.lock(), ReaderSlot::Stopped);
        if let ReaderSlot::Running { shutdown, handle } = reader {
            let _ = shutdown.send(());
            if let Err(e) = handle.await {
                warn!(port = %self.port_name, error = %e, "Serial reader task failed");
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(port = %self.port_name, error = %e, "Error shutting down serial writer");
            }
        }

        info!(port = %self.port_name, "Serial link closed");
        true
    }
}

async fn read_loop(
    mut reader: ReadHalf<DynSerial>,
    inbound: Arc<Inbound>,
    port_name: String,
    capacity: usize,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut assembler = FrameAssembler::new(capacity);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    if inbound.mark_down() {
                        warn!(port = %port_name, "Serial port reached end of stream, link is down");
                    }
                    break;
                }
                Ok(n) => {
                    for message in assembler.feed(&buf[..n]) {
                        inbound.stats.record_frame();
                        debug!(port = %port_name, message = %message, "Message received");
                        if let Some(evicted) = inbound.messages.push(message) {
                            inbound.stats.record_dropped();
                            warn!(port = %port_name, evicted = %evicted, "Message queue full, dropped oldest message");
                        }
                    }
                    inbound.stats.set_overruns(assembler.overruns());
                }
                Err(e) => {
                    if inbound.mark_down() {
                        warn!(port = %port_name, error = %e, "Serial read failed, link is down");
                    }
                    break;
                }
            }
        }
    }
    debug!(port = %port_name, "Serial reader stopped");
}

fn data_bits(bits: u8) -> AppResult<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(DividerError::Configuration(format!(
            "data_bits must be 5-8, got {other}"
        ))),
    }
}

fn stop_bits(bits: u8) -> AppResult<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(DividerError::Configuration(format!(
            "stop_bits must be 1 or 2, got {other}"
        ))),
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}
