//! In-memory serial port for exercising the transport and engine.
//!
//! [`MockSerialPort`] implements `AsyncRead`/`AsyncWrite` and is handed to
//! [`SerialTransport::from_stream`](super::SerialTransport::from_stream) in
//! place of a real port. The paired [`MockDeviceHarness`] stays in the test
//! and plays the divider firmware: it sees every byte the host writes and can
//! emit ETB-terminated replies.
//!
//! Two unbounded channels carry the traffic, one per direction. Dropping the
//! harness looks like the device being unplugged: reads hit end-of-file and
//! writes fail with `BrokenPipe`.
//!
//! ```
//! use divider_controller::transport::mock_serial;
//! use tokio::io::AsyncWriteExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (mut port, mut device) = mock_serial::new();
//! port.write_all(b"?").await.unwrap();
//! device.expect_write(b"?").await;
//! device.send_frame("A12.50").unwrap();
//! # }
//! ```

use crate::protocol::ETB;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Host side of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Bytes written by the host, forwarded to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Chunks emitted by the harness
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Part of the last chunk not yet handed to the reader
    read_buffer: VecDeque<u8>,
}

/// Device side of the mock port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Host bytes received but not yet consumed by an expectation
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx,
        reads_rx,
        read_buffer: VecDeque::new(),
    };
    let harness = MockDeviceHarness {
        writes_rx,
        reads_tx,
        write_buffer: Vec::new(),
    };
    (port, harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock divider disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Emit raw bytes as if the device sent them.
    ///
    /// # Errors
    /// Returns error if the host port has been dropped
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: host port disconnected")
    }

    /// Emit `message` followed by the ETB delimiter.
    ///
    /// # Errors
    /// Returns error if the host port has been dropped
    pub fn send_frame(&self, message: &str) -> Result<(), &'static str> {
        let mut data = message.as_bytes().to_vec();
        data.push(ETB);
        self.send_response(&data)
    }

    /// Wait until the host has written `expected` and consume it.
    ///
    /// Bytes written beyond `expected` are kept for the next expectation.
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or differ from
    /// `expected`.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let wait = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(wait, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Host port closed while expecting a write"),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected {:?}, received {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer),
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Unexpected write. Expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Everything the host has written so far that no expectation consumed.
    ///
    /// Does not wait.
    pub fn take_written(&mut self) -> Vec<u8> {
        loop {
            match self.writes_rx.try_recv() {
                Ok(chunk) => self.write_buffer.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        std::mem::take(&mut self.write_buffer)
    }
}
