//! Configuration for the divider controller, loaded with Figment.
//!
//! Configuration is assembled from:
//! 1. a TOML file (see `config/divider.toml`)
//! 2. environment variables prefixed with `DIVIDER_`, nested with `__`
//!    (e.g. `DIVIDER_SERIAL__PORT=/dev/ttyACM0`)
//!
//! The resulting [`DividerConfig`] is built once at startup and handed by
//! reference to the transport and engine constructors.
//!
//! # Example
//! ```no_run
//! use divider_controller::config::DividerConfig;
//!
//! let config = DividerConfig::load_from("config/divider.toml")?;
//! config.validate()?;
//! println!("Port: {}", config.serial.port);
//! # Ok::<(), divider_controller::error::DividerError>(())
//! ```

use crate::error::{AppResult, DividerError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DividerConfig {
    /// Serial link parameters
    #[serde(default)]
    pub serial: SerialSettings,
    /// Inbound framing limits
    #[serde(default)]
    pub framing: FramingSettings,
    /// Loop periods, poll intervals and bulk-transfer timeouts
    #[serde(default)]
    pub timing: TimingSettings,
    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Serial port parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Limits for the frame assembler and inbound message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingSettings {
    /// Maximum raw bytes accumulated for one frame before it is dropped as an overrun
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Maximum assembled messages waiting for the receive loop
    #[serde(default = "default_message_queue_capacity")]
    pub message_queue_capacity: usize,
}

/// Timing of the dispatch and receive loops.
///
/// All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Period of both loops
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Grace period after the reader starts before the device is addressed
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    /// Delay from end of warm-up to the first angle poll
    #[serde(default = "default_first_angle_poll_ms")]
    pub first_angle_poll_ms: u64,
    /// Delay from end of warm-up to the first status poll
    #[serde(default = "default_first_status_poll_ms")]
    pub first_status_poll_ms: u64,
    /// Steady-state angle poll interval
    #[serde(default = "default_angle_poll_interval_ms")]
    pub angle_poll_interval_ms: u64,
    /// Steady-state status poll interval
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// How far an explicit command pushes out the next angle poll
    #[serde(default = "default_command_poll_deferral_ms")]
    pub command_poll_deferral_ms: u64,
    /// Download-to-device timeout
    #[serde(default = "default_transfer_timeout_ms")]
    pub download_timeout_ms: u64,
    /// Upload-to-host timeout
    #[serde(default = "default_transfer_timeout_ms")]
    pub upload_timeout_ms: u64,
    /// Number of ticks after arming the upload timeout during which the
    /// upload command may still be sent
    #[serde(default = "default_upload_command_ticks")]
    pub upload_command_ticks: u32,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// ANSI colors for the pretty format
    #[serde(default = "default_log_ansi")]
    pub ansi: bool,
}

// Default value functions
fn default_port() -> String {
    "COM3".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_message_queue_capacity() -> usize {
    256
}

fn default_tick_ms() -> u64 {
    500
}

fn default_warmup_ms() -> u64 {
    3000
}

fn default_first_angle_poll_ms() -> u64 {
    3000
}

fn default_first_status_poll_ms() -> u64 {
    1000
}

fn default_angle_poll_interval_ms() -> u64 {
    10_000
}

fn default_status_poll_interval_ms() -> u64 {
    20_000
}

fn default_command_poll_deferral_ms() -> u64 {
    2000
}

fn default_transfer_timeout_ms() -> u64 {
    20_000
}

fn default_upload_command_ticks() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_ansi() -> bool {
    true
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
        }
    }
}

impl SerialSettings {
    /// Settings for `port` with all other values defaulted.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            message_queue_capacity: default_message_queue_capacity(),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            warmup_ms: default_warmup_ms(),
            first_angle_poll_ms: default_first_angle_poll_ms(),
            first_status_poll_ms: default_first_status_poll_ms(),
            angle_poll_interval_ms: default_angle_poll_interval_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            command_poll_deferral_ms: default_command_poll_deferral_ms(),
            download_timeout_ms: default_transfer_timeout_ms(),
            upload_timeout_ms: default_transfer_timeout_ms(),
            upload_command_ticks: default_upload_command_ticks(),
        }
    }
}

impl TimingSettings {
    /// Loop period.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Warm-up grace period.
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Delay to the first angle poll.
    pub fn first_angle_poll(&self) -> Duration {
        Duration::from_millis(self.first_angle_poll_ms)
    }

    /// Delay to the first status poll.
    pub fn first_status_poll(&self) -> Duration {
        Duration::from_millis(self.first_status_poll_ms)
    }

    /// Angle poll interval.
    pub fn angle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.angle_poll_interval_ms)
    }

    /// Status poll interval.
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Angle poll deferral after an explicit command.
    pub fn command_poll_deferral(&self) -> Duration {
        Duration::from_millis(self.command_poll_deferral_ms)
    }

    /// Download timeout.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    /// Upload timeout.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            ansi: default_log_ansi(),
        }
    }
}

impl Default for DividerConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            framing: FramingSettings::default(),
            timing: TimingSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl DividerConfig {
    /// Load configuration from a TOML file and `DIVIDER_` environment variables.
    ///
    /// Environment variables override the file, with `__` separating nested keys:
    /// `DIVIDER_TIMING__TICK_MS=250`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DIVIDER_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let serial = &self.serial;
        if serial.port.trim().is_empty() {
            return Err(invalid("serial.port must not be empty".into()));
        }
        if serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate must be non-zero".into()));
        }
        if !(5..=8).contains(&serial.data_bits) {
            return Err(invalid(format!(
                "Invalid serial.data_bits {}. Must be 5-8",
                serial.data_bits
            )));
        }
        if !matches!(serial.stop_bits, 1 | 2) {
            return Err(invalid(format!(
                "Invalid serial.stop_bits {}. Must be 1 or 2",
                serial.stop_bits
            )));
        }

        if self.framing.buffer_capacity == 0 {
            return Err(invalid("framing.buffer_capacity must be at least 1".into()));
        }
        if self.framing.message_queue_capacity == 0 {
            return Err(invalid(
                "framing.message_queue_capacity must be at least 1".into(),
            ));
        }

        let timing = &self.timing;
        if timing.tick_ms == 0 {
            return Err(invalid("timing.tick_ms must be non-zero".into()));
        }
        for (name, value) in [
            ("download_timeout_ms", timing.download_timeout_ms),
            ("upload_timeout_ms", timing.upload_timeout_ms),
        ] {
            if value < timing.tick_ms {
                return Err(invalid(format!(
                    "timing.{name} ({value}) must be at least one tick ({})",
                    timing.tick_ms
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(invalid(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }
}

fn invalid(message: String) -> DividerError {
    DividerError::Configuration(message)
}
