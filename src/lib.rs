//! # Divider Controller
//!
//! Serial protocol engine for a motorized rotary dividing head.
//!
//! The divider firmware speaks a small ASCII protocol: single-character
//! commands from the host, ETB-terminated text replies from the device, plus
//! two multi-frame bulk transfers for moving a program to and from the device.
//! This crate turns that byte stream into typed events and control requests
//! into correctly sequenced commands.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: wire-level pieces with no I/O. Frame assembly, the command
//!   set, the reply grammar and program normalization.
//! - **`transport`**: the `Link` trait and its serial implementation on
//!   `tokio-serial`, plus an in-memory mock port.
//! - **`engine`**: the controller state machine and the dispatch and receive
//!   loops, wrapped in `DividerEngine`.
//! - **`config`**: Figment-based configuration (TOML file plus `DIVIDER_`
//!   environment overrides).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the `DividerError` enum shared by all of the above.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use config::DividerConfig;
pub use engine::{ControlRequest, DividerEngine, DividerEvent, DividerHandle, EventStream};
pub use error::{AppResult, DividerError};
