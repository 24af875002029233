//! Wire protocol of the divider firmware.
//!
//! Commands are single ASCII characters, optionally followed by a payload
//! (position text for `P`, the program for `D`). Every reply from the device is
//! terminated by [`ETB`]. Inside bulk transfers [`EOT`] marks the end of the
//! program text. CR, LF and EOT never survive into an assembled message.
//!
//! - [`frame`]: byte stream to messages
//! - [`command`]: outbound command set
//! - [`reply`]: steady-state reply grammar
//! - [`program`]: program text normalization for download

pub mod command;
pub mod frame;
pub mod program;
pub mod reply;

pub use command::{Command, DividerCommand};
pub use frame::FrameAssembler;
pub use reply::DeviceReply;

/// End-of-transmission-block: the only frame delimiter on the wire.
pub const ETB: u8 = 23;

/// End-of-transmission marker used inside bulk transfers.
pub const EOT: u8 = 27;

/// Carriage return, stripped from message bodies.
pub const CR: u8 = 13;

/// Line feed, stripped from message bodies.
pub const LF: u8 = 10;
