use std::collections::HashSet;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{
    CHUNK_BYTES, INTER_CHUNK_DELAY, MAX_CHUNK_BYTES, SCAN_TIMEOUT, STATUS_POLL_INTERVAL, STATUS_POLL_TIMEOUT,
    UNLOCK_SETTLE_DELAY,
};
use crate::device::types::{DeviceTarget, RgbCommandParams};
use crate::error::ConfigError;

/**
 * Default panel size of a registered device.
 */
pub const DEFAULT_WIDTH: u32 = 400;
pub const DEFAULT_HEIGHT: u32 = 300;

/**
 * Default number of errors kept in a device shadow.
 */
pub const ERROR_HISTORY: usize = 10;

fn default_width() -> u32 { DEFAULT_WIDTH }
fn default_height() -> u32 { DEFAULT_HEIGHT }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub scan_timeout_ms: u64,
    pub chunk_bytes: usize,
    pub inter_chunk_delay_ms: u64,
    pub unlock_settle_ms: u64,
    pub status_poll_timeout_ms: u64,
    pub status_poll_interval_ms: u64,
    pub poll_status: bool,
}

impl TransportConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn unlock_settle(&self) -> Duration {
        Duration::from_millis(self.unlock_settle_ms)
    }

    pub fn status_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.status_poll_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            scan_timeout_ms: SCAN_TIMEOUT,
            chunk_bytes: CHUNK_BYTES,
            inter_chunk_delay_ms: INTER_CHUNK_DELAY,
            unlock_settle_ms: UNLOCK_SETTLE_DELAY,
            status_poll_timeout_ms: STATUS_POLL_TIMEOUT,
            status_poll_interval_ms: STATUS_POLL_INTERVAL,
            poll_status: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub image_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl QueueConfig {
    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            image_timeout_secs: 180,
            command_timeout_secs: 60,
            retention_secs: 60,
            cleanup_interval_secs: 30,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlashConfig {
    pub on_ms: u16,
    pub off_ms: u16,
    pub work_ms: u32,
}

impl FlashConfig {
    pub fn params(&self, red: u8, green: u8, blue: u8) -> RgbCommandParams {
        RgbCommandParams {
            red,
            green,
            blue,
            on_ms: self.on_ms,
            off_ms: self.off_ms,
            work_ms: self.work_ms,
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig { on_ms: 500, off_ms: 500, work_ms: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl DeviceConfig {
    pub fn target(&self) -> DeviceTarget {
        DeviceTarget {
            address: self.address.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub flash: FlashConfig,
    pub error_history: usize,
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });

        if self.transport.chunk_bytes == 0 || self.transport.chunk_bytes > MAX_CHUNK_BYTES {
            return invalid(format!("chunkBytes must be between 1 and {}", MAX_CHUNK_BYTES));
        }

        if self.queue.image_timeout_secs == 0 || self.queue.command_timeout_secs == 0 {
            return invalid(String::from("queue timeouts must be positive"));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() || device.address.trim().is_empty() {
                return invalid(String::from("devices need a non-empty id and address"));
            }

            if device.width == 0 || device.height == 0 {
                return invalid(format!("device {} has an empty panel size", device.id));
            }

            if !ids.insert(device.id.as_str()) {
                return invalid(format!("device {} is configured more than once", device.id));
            }
        }

        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.id == id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transport: TransportConfig::default(),
            queue: QueueConfig::default(),
            flash: FlashConfig::default(),
            error_history: ERROR_HISTORY,
            devices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{
            "transport": { "chunkBytes": 100 },
            "devices": [{ "id": "kitchen", "address": "A4:C1:38:0B:12:EF" }]
        }"#).unwrap();

        assert_eq!(config.transport.chunk_bytes, 100);
        assert_eq!(config.transport.scan_timeout_ms, 30_000);
        assert_eq!(config.transport.inter_chunk_delay_ms, 4);
        assert_eq!(config.queue.image_timeout_secs, 180);
        assert_eq!(config.error_history, 10);
        assert_eq!(config.device("kitchen").unwrap().width, 400);
        assert_eq!(config.device("kitchen").unwrap().height, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.transport.chunk_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let device = DeviceConfig { id: String::from("a"), address: String::from("x"), width: 296, height: 128 };
        config.devices = vec![device.clone(), device];
        assert!(config.validate().is_err());
    }
}
