use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use log::info;
use serde_json;

use crate::error::ConfigError;
use crate::shadow::DeviceShadow;

/// JSON file holding the shadows of all devices, keyed by device id.
#[derive(Debug, Clone)]
pub struct ShadowStore {
    path: PathBuf,
}

impl ShadowStore {
    pub fn new(path: &Path) -> Self {
        ShadowStore { path: path.to_path_buf() }
    }

    /// Places the store next to the config file: `esl-controller.json` => `esl-controller.shadows.json`.
    pub fn beside_config(config_path: &Path) -> Self {
        let mut path = config_path.to_path_buf();
        path.set_extension("shadows.json");
        ShadowStore::new(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<HashMap<String, DeviceShadow>, ConfigError> {
        match tokio::fs::read(&self.path).await {
            Ok(content) if content.is_empty() => Ok(HashMap::new()),
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, shadows: &HashMap<String, DeviceShadow>) -> Result<(), ConfigError> {
        info!("Saving device shadows to {}", self.path.to_string_lossy());
        let content = serde_json::to_string_pretty(shadows)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_beside_config() {
        let store = ShadowStore::beside_config(Path::new("/etc/esl/esl-controller.json"));
        assert_eq!(store.path(), Path::new("/etc/esl/esl-controller.shadows.json"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShadowStore::new(&dir.path().join("shadows.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShadowStore::new(&dir.path().join("shadows.json"));

        let mut shadow = DeviceShadow::default();
        shadow.record_success(Utc::now());
        shadow.record_error("Unlock failed", 10);

        let mut shadows = HashMap::new();
        shadows.insert(String::from("kitchen"), shadow);
        store.save(&shadows).await.unwrap();

        assert_eq!(store.load().await.unwrap(), shadows);
    }
}
