//! Per-guild settings that survive pipeline restarts.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    audio::filters::EqGains,
    common::{EngineError, GuildId},
    configs::{StorageBackend, StorageConfig},
    quality::QualityLevel,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuildSettings {
    pub volume: f32,
    pub eq: EqGains,
    /// Name of the preset the EQ gains came from, if any.
    pub preset: Option<String>,
    pub quality_ceiling: QualityLevel,
    /// Loudness target override; `None` keeps the configured one.
    pub normalization_target: Option<f32>,
    pub auto_gain: Option<bool>,
    /// Compression amount in `0.0..=1.0`.
    pub compression: Option<f32>,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            eq: EqGains::FLAT,
            preset: None,
            quality_ceiling: QualityLevel::Ultra,
            normalization_target: None,
            auto_gain: None,
            compression: None,
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self, guild_id: &GuildId) -> Result<Option<GuildSettings>, EngineError>;
    async fn save(&self, guild_id: &GuildId, settings: &GuildSettings) -> Result<(), EngineError>;
}

/// Builds the store selected in `[storage]`.
pub fn from_config(config: &StorageConfig) -> Arc<dyn SettingsStore> {
    match config.backend {
        StorageBackend::Memory => Arc::new(MemorySettingsStore::default()),
        StorageBackend::Json => Arc::new(JsonSettingsStore::new(&config.path)),
    }
}

#[derive(Default)]
pub struct MemorySettingsStore {
    settings: DashMap<GuildId, GuildSettings>,
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self, guild_id: &GuildId) -> Result<Option<GuildSettings>, EngineError> {
        Ok(self.settings.get(guild_id).map(|s| s.clone()))
    }

    async fn save(&self, guild_id: &GuildId, settings: &GuildSettings) -> Result<(), EngineError> {
        self.settings.insert(guild_id.clone(), settings.clone());
        Ok(())
    }
}

/// One `<guild>.json` file per guild.
pub struct JsonSettingsStore {
    dir: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, guild_id: &GuildId) -> PathBuf {
        let name: String = guild_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load(&self, guild_id: &GuildId) -> Result<Option<GuildSettings>, EngineError> {
        let path = self.path_for(guild_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn save(&self, guild_id: &GuildId, settings: &GuildSettings) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(guild_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(settings)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("[{}] Settings written to {}", guild_id, path.display());
        Ok(())
    }
}
