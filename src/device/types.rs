use serde::{Deserialize, Serialize};

/// Where and what to draw: the peripheral address (or platform id / advertised name) and the
/// panel dimensions as the user sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTarget {
    pub address: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RgbCommandParams {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub on_ms: u16,
    pub off_ms: u16,
    pub work_ms: u32,
}

fn clamp_byte(value: i64) -> u8 {
    value.clamp(0, u8::MAX as i64) as u8
}

impl RgbCommandParams {
    /// Builds params from unchecked values, clamping every field into its wire range.
    pub fn clamped(red: i64, green: i64, blue: i64, on_ms: u64, off_ms: u64, work_ms: u64) -> Self {
        RgbCommandParams {
            red: clamp_byte(red),
            green: clamp_byte(green),
            blue: clamp_byte(blue),
            on_ms: on_ms.min(u16::MAX as u64) as u16,
            off_ms: off_ms.min(u16::MAX as u64) as u16,
            work_ms: work_ms.min(u32::MAX as u64) as u32,
        }
    }
}

/// Conditions reported in the second byte of the status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusError {
    EpdInit,
    EpdWrite,
    Decompression,
    Ota,
    UnlockFailed,
}

impl StatusError {
    pub const ALL: [StatusError; 5] = [
        StatusError::EpdInit,
        StatusError::EpdWrite,
        StatusError::Decompression,
        StatusError::Ota,
        StatusError::UnlockFailed,
    ];

    pub fn bit(self) -> u8 {
        match self {
            StatusError::EpdInit => 1 << 0,
            StatusError::EpdWrite => 1 << 1,
            StatusError::Decompression => 1 << 2,
            StatusError::Ota => 1 << 3,
            StatusError::UnlockFailed => 1 << 5,
        }
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            StatusError::EpdInit => "EPD init error",
            StatusError::EpdWrite => "EPD write error",
            StatusError::Decompression => "Data decompression error",
            StatusError::Ota => "OTA error",
            StatusError::UnlockFailed => "Unlock failed",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub busy: bool,
    pub error_byte: u8,
    pub errors: Vec<StatusError>,
}

impl StatusSnapshot {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Connecting,
    DiscoveringServices,
    Unlocking,
    Ready,
    Disconnecting,
    Closed,
}

/// What a completed command learned about the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: StatusSnapshot,
}
