//! The command boundary: set an image, clear the screen or flash a colour on a device known by
//! its id. Every command goes through the device queue, in blocking mode (the caller gets the
//! outcome) or background mode (the caller only gets the command id).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use chrono::Utc;
use log::{info, warn};

use crate::config::types::{Config, FlashConfig};
use crate::device::transport::EslTransport;
use crate::device::types::{CommandOutcome, DeviceTarget, RgbCommandParams};
use crate::error::{DeviceError, QueueError};
use crate::frame::{decode_image, encode_frame, render_preview};
use crate::queue::{CommandHandle, CommandId, CommandKind, CommandRecord, CommandStatus, DeviceQueue};
use crate::shadow::{DeviceShadow, ImagePreview, ShadowBook};

/// Parses `#RRGGBB` or `RRGGBB` (any case). Anything else is pure red.
pub fn parse_hex_color(color: &str) -> (u8, u8, u8) {
    const RED: (u8, u8, u8) = (255, 0, 0);

    let hex = color.trim();
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return RED;
    }

    let channel = |at: usize| u8::from_str_radix(&hex[at..at + 2], 16);
    match (channel(0), channel(2), channel(4)) {
        (Ok(r), Ok(g), Ok(b)) => (r, g, b),
        _ => RED,
    }
}

/// What a successful command changes on the device shadow. Produced by the command task and
/// applied by the queue only when the command finished within its timeout.
#[derive(Debug, Clone)]
enum ShadowUpdate {
    Image { preview: ImagePreview, outcome: CommandOutcome },
    Cleared { outcome: CommandOutcome },
    Flashed { work_ms: u32, outcome: CommandOutcome },
}

impl ShadowUpdate {
    fn outcome(&self) -> &CommandOutcome {
        match self {
            ShadowUpdate::Image { outcome, .. } => outcome,
            ShadowUpdate::Cleared { outcome } => outcome,
            ShadowUpdate::Flashed { outcome, .. } => outcome,
        }
    }

    fn apply(&self, shadows: &ShadowBook, device_id: &str) {
        let now = Utc::now();
        shadows.update(device_id, |shadow| {
            shadow.record_success(now);

            match self {
                ShadowUpdate::Image { preview, .. } => shadow.current_image_preview = Some(preview.clone()),
                ShadowUpdate::Cleared { .. } => shadow.current_image_preview = None,
                ShadowUpdate::Flashed { work_ms, .. } => shadow.record_flash(now, *work_ms),
            }
        });

        for error in &self.outcome().status.errors {
            shadows.record_error(device_id, &format!("Device reported: {}", error));
        }
    }
}

#[derive(Clone)]
pub struct EslService {
    queue: DeviceQueue,
    transport: Arc<dyn EslTransport>,
    shadows: ShadowBook,
    devices: Arc<Mutex<HashMap<String, DeviceTarget>>>,
    flash: FlashConfig,
}

impl EslService {
    pub fn new(config: &Config, transport: Arc<dyn EslTransport>) -> Self {
        EslService::with_shadows(config, transport, ShadowBook::new(config.error_history))
    }

    pub fn with_shadows(config: &Config, transport: Arc<dyn EslTransport>, shadows: ShadowBook) -> Self {
        let observed = shadows.clone();
        let queue = DeviceQueue::with_observer(config.queue.clone(), Arc::new(move |record: &CommandRecord| {
            if record.status == CommandStatus::Failed {
                let message = record.error.as_deref().unwrap_or("Unknown error");
                observed.record_error(&record.device_id, message);
            }
        }));

        let devices = config.devices
            .iter()
            .map(|device| (device.id.clone(), device.target()))
            .collect();

        EslService {
            queue,
            transport,
            shadows,
            devices: Arc::new(Mutex::new(devices)),
            flash: config.flash,
        }
    }

    pub fn register_device(&self, device_id: &str, target: DeviceTarget) {
        info!("Registered device {} at {} ({}x{})", device_id, target.address, target.width, target.height);
        self.devices.lock().expect("Failed to lock devices").insert(device_id.to_string(), target);
    }

    pub fn target(&self, device_id: &str) -> Result<DeviceTarget, DeviceError> {
        self.devices
            .lock()
            .expect("Failed to lock devices")
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDevice { id: device_id.to_string() })
    }

    pub fn queue(&self) -> &DeviceQueue {
        &self.queue
    }

    pub fn shadows(&self) -> &ShadowBook {
        &self.shadows
    }

    pub fn shadow(&self, device_id: &str) -> Option<DeviceShadow> {
        self.shadows.get(device_id)
    }

    fn set_image_task(&self, device_id: &str, raw: Vec<u8>) -> Result<impl Future<Output = Result<ShadowUpdate, DeviceError>> + Send + 'static, DeviceError> {
        let target = self.target(device_id)?;
        let transport = self.transport.clone();

        Ok(async move {
            let image = decode_image(&raw)?;
            let frame = encode_frame(&image, target.width, target.height)?;
            let preview = render_preview(&image, target.width, target.height)?;

            let outcome = transport.write_frame(&target, &frame).await?;
            Ok(ShadowUpdate::Image { preview: ImagePreview::from(&preview), outcome })
        })
    }

    fn clear_image_task(&self, device_id: &str) -> Result<impl Future<Output = Result<ShadowUpdate, DeviceError>> + Send + 'static, DeviceError> {
        let target = self.target(device_id)?;
        let transport = self.transport.clone();

        Ok(async move {
            let outcome = transport.clear(&target).await?;
            Ok(ShadowUpdate::Cleared { outcome })
        })
    }

    fn flash_task(&self, device_id: &str, params: RgbCommandParams) -> Result<impl Future<Output = Result<ShadowUpdate, DeviceError>> + Send + 'static, DeviceError> {
        let target = self.target(device_id)?;
        let transport = self.transport.clone();

        Ok(async move {
            let outcome = transport.flash(&target, params).await?;
            Ok(ShadowUpdate::Flashed { work_ms: params.work_ms, outcome })
        })
    }

    fn enqueue<F>(&self, device_id: &str, kind: CommandKind, task: F) -> CommandHandle<ShadowUpdate>
    where
        F: Future<Output = Result<ShadowUpdate, DeviceError>> + Send + 'static,
    {
        let shadows = self.shadows.clone();
        let owner = device_id.to_string();
        self.queue.enqueue_with_commit(device_id, kind, task, move |update: &ShadowUpdate| {
            update.apply(&shadows, &owner);
        })
    }

    /// Flash params for a hex colour, using the configured timings.
    pub fn flash_params(&self, color: &str) -> RgbCommandParams {
        let (red, green, blue) = parse_hex_color(color);
        self.flash.params(red, green, blue)
    }

    fn reject(&self, device_id: &str, err: DeviceError) -> QueueError {
        warn!("Rejected command for {}: {}", device_id, err);
        QueueError::from(err)
    }

    pub async fn set_image(&self, device_id: &str, raw: Vec<u8>) -> Result<(), QueueError> {
        let task = self.set_image_task(device_id, raw).map_err(|err| self.reject(device_id, err))?;
        self.enqueue(device_id, CommandKind::SetImage, task).wait().await.map(|_| ())
    }

    pub fn set_image_background(&self, device_id: &str, raw: Vec<u8>) -> Result<CommandId, QueueError> {
        let task = self.set_image_task(device_id, raw).map_err(|err| self.reject(device_id, err))?;
        Ok(self.enqueue(device_id, CommandKind::SetImage, task).id())
    }

    pub async fn clear_image(&self, device_id: &str) -> Result<(), QueueError> {
        let task = self.clear_image_task(device_id).map_err(|err| self.reject(device_id, err))?;
        self.enqueue(device_id, CommandKind::ClearImage, task).wait().await.map(|_| ())
    }

    pub fn clear_image_background(&self, device_id: &str) -> Result<CommandId, QueueError> {
        let task = self.clear_image_task(device_id).map_err(|err| self.reject(device_id, err))?;
        Ok(self.enqueue(device_id, CommandKind::ClearImage, task).id())
    }

    pub async fn flash(&self, device_id: &str, color: &str) -> Result<(), QueueError> {
        self.flash_with(device_id, self.flash_params(color)).await
    }

    pub async fn flash_with(&self, device_id: &str, params: RgbCommandParams) -> Result<(), QueueError> {
        let task = self.flash_task(device_id, params).map_err(|err| self.reject(device_id, err))?;
        self.enqueue(device_id, CommandKind::Flash, task).wait().await.map(|_| ())
    }

    pub fn flash_background(&self, device_id: &str, color: &str) -> Result<CommandId, QueueError> {
        let task = self.flash_task(device_id, self.flash_params(color)).map_err(|err| self.reject(device_id, err))?;
        Ok(self.enqueue(device_id, CommandKind::Flash, task).id())
    }

    pub fn records(&self, device_id: &str) -> Vec<CommandRecord> {
        self.queue.records(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#FF00AA"), (255, 0, 170));
        assert_eq!(parse_hex_color("ff00aa"), (255, 0, 170));
        assert_eq!(parse_hex_color("#00fF10"), (0, 255, 16));
        assert_eq!(parse_hex_color(" #123456 "), (0x12, 0x34, 0x56));
    }

    #[test]
    fn test_parse_hex_color_falls_back_to_red() {
        assert_eq!(parse_hex_color(""), (255, 0, 0));
        assert_eq!(parse_hex_color("#FFF"), (255, 0, 0));
        assert_eq!(parse_hex_color("#GG0000"), (255, 0, 0));
        assert_eq!(parse_hex_color("##00FF00"), (255, 0, 0));
        assert_eq!(parse_hex_color("blue"), (255, 0, 0));
        assert_eq!(parse_hex_color("#ÿÿÿ"), (255, 0, 0));
    }
}
