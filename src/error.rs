use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use image;
use serde_json;

use crate::queue::types::CommandKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: io::Error },

    #[error("Failed to read image file {path}: {source}")]
    ImageFile { path: String, source: io::Error },

    #[error("Command failed: {source}")]
    Command { #[from] source: QueueError },

    #[error("{source}")]
    Device { #[from] source: DeviceError },
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Source image is empty ({width}x{height})")]
    EmptySource { width: u32, height: u32 },

    #[error("RGBA raster of {len} bytes does not match {width}x{height}")]
    RasterLength { width: u32, height: u32, len: usize },

    #[error("Failed to decode image: {source}")]
    Decode { source: image::ImageError },

    #[error("Failed to render preview: {source}")]
    Preview { source: image::ImageError },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Permission to use bluetooth was denied")]
    PermissionDenied,

    #[error("Bluetooth adapter did not power on within {timeout:?}")]
    AdapterUnavailable { timeout: Duration },

    #[error("Bluetooth adapter stopped reporting events during discovery")]
    EventStreamClosed,

    #[error("Peripheral not found within {timeout:?}: {target}")]
    DiscoveryTimeout { target: String, timeout: Duration },

    #[error("Failed to connect to peripheral: {source}")]
    ConnectFailed { source: btleplug::Error },

    #[error("No vendor ESL service found on this device")]
    NoVendorService,

    #[error("No writable characteristics on vendor service")]
    NoWritableCharacteristic,

    #[error("Could not find security characteristic (no 16-byte random read)")]
    MissingSecurityCharacteristic,

    #[error("Failed to write to characteristic: {source}")]
    WriteFailed { source: btleplug::Error },

    #[error("Frame of {size} bytes does not fit the chunked transfer protocol")]
    FrameTooLarge { size: usize },

    #[error("Chunk size {size} is not usable, expected 1..={max}")]
    InvalidChunkSize { size: usize, max: usize },

    #[error("Failed to encode frame: {source}")]
    Encode { #[from] source: EncodeError },

    #[error("Unknown device: {id}")]
    UnknownDevice { id: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{source}")]
    Task { #[from] source: DeviceError },

    #[error("Task {kind} timeout after {} seconds", .timeout.as_secs())]
    Timeout { kind: CommandKind, timeout: Duration },

    #[error("Task was abandoned before it produced a result")]
    Abandoned,

    #[error("Unsupported command kind: {kind}")]
    UnsupportedCommand { kind: String },
}

impl QueueError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::Timeout { .. })
    }
}
