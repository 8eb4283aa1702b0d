//! Last known state of each device. The surrounding system persists these; the core only
//! fills them in.

pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::frame::{Preview, PREVIEW_MIME};

pub use store::ShadowStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePreview {
    pub base64: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

impl From<&Preview> for ImagePreview {
    fn from(preview: &Preview) -> Self {
        ImagePreview {
            base64: BASE64.encode(&preview.jpeg),
            mime_type: String::from(PREVIEW_MIME),
            width: preview.width,
            height: preview.height,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceShadow {
    pub current_image_preview: Option<ImagePreview>,
    pub last_successful_action_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Oldest first, bounded.
    pub last_errors: Vec<String>,
    pub last_flashed: Option<DateTime<Utc>>,
    /// Milliseconds.
    pub flashed_for: Option<u32>,
}

impl DeviceShadow {
    pub fn record_error(&mut self, message: &str, history: usize) {
        self.last_error = Some(message.to_string());
        self.last_errors.push(message.to_string());

        if self.last_errors.len() > history {
            let excess = self.last_errors.len() - history;
            self.last_errors.drain(..excess);
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_successful_action_at = Some(at);
        self.last_seen_at = Some(at);
    }

    pub fn record_flash(&mut self, at: DateTime<Utc>, work_ms: u32) {
        self.last_flashed = Some(at);
        self.flashed_for = Some(work_ms);
    }

    pub fn is_flashing(&self, now: DateTime<Utc>) -> bool {
        match (self.last_flashed, self.flashed_for) {
            (Some(at), Some(work_ms)) => now < at + ChronoDuration::milliseconds(work_ms as i64),
            _ => false,
        }
    }
}

/// Shadows of all devices, shared between the command tasks and the queue observer.
#[derive(Clone)]
pub struct ShadowBook {
    inner: Arc<Mutex<HashMap<String, DeviceShadow>>>,
    history: usize,
}

impl ShadowBook {
    pub fn new(history: usize) -> Self {
        ShadowBook::with_shadows(history, HashMap::new())
    }

    pub fn with_shadows(history: usize, shadows: HashMap<String, DeviceShadow>) -> Self {
        ShadowBook {
            inner: Arc::new(Mutex::new(shadows)),
            history,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceShadow> {
        self.inner.lock().expect("Failed to lock shadows").get(device_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, DeviceShadow> {
        self.inner.lock().expect("Failed to lock shadows").clone()
    }

    pub fn update<F>(&self, device_id: &str, f: F)
    where
        F: FnOnce(&mut DeviceShadow),
    {
        let mut shadows = self.inner.lock().expect("Failed to lock shadows");
        f(shadows.entry(device_id.to_string()).or_default());
    }

    pub fn record_error(&self, device_id: &str, message: &str) {
        let history = self.history;
        self.update(device_id, |shadow| shadow.record_error(message, history));
    }
}
