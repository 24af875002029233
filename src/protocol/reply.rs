//! Steady-state reply grammar.
//!
//! | Message | Meaning |
//! |---|---|
//! | `R` | program started |
//! | `Q` | program stopped |
//! | `S<d>` | status digit (`0` halted, `3` running) |
//! | `A<angle>` | current angle, e.g. `A12.50` |
//! | `I<d>` | incremental mode (`0` off, `1` on) |
//!
//! Anything else (command echoes such as `Z` or `P12.50`, version text,
//! future firmware additions) parses to `None`.

/// Trailer the device sends after an uploaded program.
pub const UPLOAD_FINISHED: &str = "Upload finished";

/// Confirmation the device sends after storing a downloaded program.
pub const DOWNLOAD_FINISHED: &str = "Download finished";

/// A recognized steady-state reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceReply {
    /// `R`
    ProgramStarted,
    /// `Q`
    ProgramStopped,
    /// `S` followed by one digit
    Status(u8),
    /// `A` followed by a decimal angle
    Angle(f64),
    /// `I` followed by one digit
    Incremental(u8),
}

impl DeviceReply {
    /// Classify one assembled message.
    ///
    /// An `A` message whose remainder is not a number is treated as
    /// unrecognized rather than an error.
    pub fn parse(message: &str) -> Option<Self> {
        match message {
            "R" => return Some(Self::ProgramStarted),
            "Q" => return Some(Self::ProgramStopped),
            _ => {}
        }

        if let Some(digit) = tagged_digit(message, 'S') {
            return Some(Self::Status(digit));
        }
        if let Some(rest) = message.strip_prefix('A') {
            return parse_angle(rest).map(Self::Angle);
        }
        if let Some(digit) = tagged_digit(message, 'I') {
            return Some(Self::Incremental(digit));
        }
        None
    }
}

/// Parse the decimal text of an angle reply (`"12.50"` is 12.5 degrees).
pub fn parse_angle(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `<tag><digit>` with nothing else.
fn tagged_digit(message: &str, tag: char) -> Option<u8> {
    let mut chars = message.chars();
    if chars.next()? != tag {
        return None;
    }
    let digit = chars.next()?.to_digit(10)?;
    if chars.next().is_some() {
        return None;
    }
    u8::try_from(digit).ok()
}
