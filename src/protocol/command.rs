//! Outbound command set.

use std::fmt;

/// Divider commands and their wire characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DividerCommand {
    /// `D`: receive a program; followed by the program text and EOT
    DownloadProgram,
    /// `U`: send the stored program to the host
    UploadProgram,
    /// `R`: start automatic execution of the program
    RunProgram,
    /// `+`: jog one step positive
    StepPlus,
    /// `-`: jog one step negative
    StepMinus,
    /// `P`: position to the angle sent as a separate text frame
    PositionTo,
    /// `I`: incremental positioning mode
    SetIncremental,
    /// `A`: absolute positioning mode
    SetAbsolute,
    /// `Z`: set the current position as zero
    ZeroPosition,
    /// `S`: request status (`S0` halted, `S3` running)
    GetStatus,
    /// `?`: request the current angle
    GetAngle,
    /// `Q`: stop a running program
    StopRunning,
    /// `V`: request the firmware version string
    GetVersion,
}

impl DividerCommand {
    /// The ASCII byte sent for this command.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::DownloadProgram => b'D',
            Self::UploadProgram => b'U',
            Self::RunProgram => b'R',
            Self::StepPlus => b'+',
            Self::StepMinus => b'-',
            Self::PositionTo => b'P',
            Self::SetIncremental => b'I',
            Self::SetAbsolute => b'A',
            Self::ZeroPosition => b'Z',
            Self::GetStatus => b'S',
            Self::GetAngle => b'?',
            Self::StopRunning => b'Q',
            Self::GetVersion => b'V',
        }
    }

    /// Whether this command opens a multi-frame bulk transfer.
    pub fn is_bulk(self) -> bool {
        matches!(self, Self::DownloadProgram | Self::UploadProgram)
    }
}

impl fmt::Display for DividerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}('{}')", self, char::from(self.as_byte()))
    }
}

/// A command staged for transmission, with its optional numeric payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    kind: DividerCommand,
    value: Option<f64>,
}

impl Command {
    /// A command without payload.
    pub fn new(kind: DividerCommand) -> Self {
        Self { kind, value: None }
    }

    /// `PositionTo` with its target angle in degrees.
    pub fn position_to(degrees: f64) -> Self {
        Self {
            kind: DividerCommand::PositionTo,
            value: Some(degrees),
        }
    }

    /// Command tag.
    pub fn kind(&self) -> DividerCommand {
        self.kind
    }

    /// Numeric payload, if any.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Wire byte of the command.
    pub fn as_byte(&self) -> u8 {
        self.kind.as_byte()
    }

    /// Payload text sent after the command byte (`12.5` becomes `"12.50"`).
    pub fn payload_text(&self) -> Option<String> {
        self.value.map(format_position)
    }
}

impl From<DividerCommand> for Command {
    fn from(kind: DividerCommand) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload_text() {
            Some(payload) => write!(f, "{} {}", self.kind, payload),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Format an angle the way the firmware expects it: fixed point, hundredths.
pub fn format_position(degrees: f64) -> String {
    format!("{:.2}", degrees)
}
