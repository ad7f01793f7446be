use std::sync::Arc;

use tracing::{error, warn};

use crate::db::kv_store::KeyValueStore;
use crate::errors::AppError;
use crate::models::GenerationSettings;

pub const SETTINGS_KEY: &str = "ollama-settings";

#[derive(Clone)]
pub struct SettingsRepository {
    kv: Arc<dyn KeyValueStore>,
}

impl SettingsRepository {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Stored settings, or the defaults when nothing usable is stored.
    pub async fn load(&self) -> Result<GenerationSettings, AppError> {
        let Some(json) = self.kv.get(SETTINGS_KEY).await? else {
            return Ok(GenerationSettings::default());
        };
        match serde_json::from_str::<GenerationSettings>(&json) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Stored settings are unreadable, using defaults: {e}");
                Ok(GenerationSettings::default())
            }
        }
    }

    pub async fn save(&self, settings: &GenerationSettings) -> Result<(), AppError> {
        let json = serde_json::to_string(settings)?;
        self.kv.set(SETTINGS_KEY, &json).await.map_err(|e| {
            error!("Failed to persist settings: {e}");
            AppError::PersistenceFailed { key: SETTINGS_KEY.to_string(), message: e.to_string() }
        })
    }
}
