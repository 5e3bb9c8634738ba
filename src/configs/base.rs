use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
  common::{errors::EngineError, types::AnyResult},
  configs::*,
};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
  pub engine: EngineConfig,
  pub dsp: DspConfig,
  pub mixer: MixerConfig,
  pub quality: QualityConfig,
  pub health: HealthConfig,
  pub recovery: RecoveryConfig,
  pub storage: StorageConfig,
  pub logging: LoggingConfig,
}

const CONFIG_CANDIDATES: [&str; 2] = ["config.toml", "config.default.toml"];

impl Config {
  /// Reads `config.toml`, falling back to `config.default.toml`, then to built-in defaults.
  pub fn load() -> AnyResult<Self> {
    let Some(config_path) = CONFIG_CANDIDATES
      .iter()
      .find(|candidate| Path::new(candidate).exists())
    else {
      crate::log_println!("No configuration file found, using built-in defaults");
      return Ok(Self::default());
    };

    crate::log_println!("Loading configuration from: {}", config_path);
    Self::from_file(config_path)
  }

  pub fn from_file(path: impl AsRef<Path>) -> AnyResult<Self> {
    let path = path.as_ref();
    let config_str = std::fs::read_to_string(path)?;
    if config_str.trim().is_empty() {
      return Err(format!("{} is empty", path.display()).into());
    }
    let config = Self::from_toml(&config_str)?;
    Ok(config)
  }

  pub fn from_toml(config_str: &str) -> Result<Self, EngineError> {
    let config: Config =
      toml::from_str(config_str).map_err(|e| EngineError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Rejects values the engine cannot run with.
  pub fn validate(&self) -> Result<(), EngineError> {
    let engine = &self.engine;
    ensure(engine.sample_rate > 0, "engine.sample_rate must be positive")?;
    ensure(
      (1..=8).contains(&engine.channels),
      "engine.channels must be between 1 and 8",
    )?;
    ensure(
      engine.frame_ms > 0 && engine.samples_per_channel() > 0,
      "engine.frame_ms must yield at least one sample",
    )?;
    ensure(
      engine.control_queue > 0 && engine.event_queue > 0 && engine.notice_queue > 0,
      "engine queue capacities must be positive",
    )?;
    ensure(engine.source_wait_ms > 0, "engine.source_wait_ms must be positive")?;
    ensure(
      engine.source_wait_ms < self.health.evaluate_interval_ms
        && engine.source_wait_ms < self.quality.evaluate_interval_ms,
      "engine.source_wait_ms must be shorter than the health and quality intervals",
    )?;
    ensure(
      engine.terminal_event_wait_ms < engine.stop_timeout_ms,
      "engine.terminal_event_wait_ms must be shorter than engine.stop_timeout_ms",
    )?;

    let dsp = &self.dsp;
    ensure(
      dsp.normalizer.window_ms >= engine.frame_ms,
      "dsp.normalizer.window_ms must cover at least one frame",
    )?;
    ensure(
      dsp.normalizer.min_gain_db <= dsp.normalizer.max_gain_db,
      "dsp.normalizer gain bounds are inverted",
    )?;
    ensure(
      dsp.agc.target_rms_low > 0.0 && dsp.agc.target_rms_low < dsp.agc.target_rms_high,
      "dsp.agc target range must satisfy 0 < low < high",
    )?;
    ensure(
      dsp.agc.min_gain > 0.0 && dsp.agc.min_gain <= dsp.agc.max_gain,
      "dsp.agc gain bounds are invalid",
    )?;
    ensure(dsp.compressor.ratio >= 1.0, "dsp.compressor.ratio must be >= 1")?;
    ensure(
      (0.0..=1.0).contains(&dsp.ducking.depth),
      "dsp.ducking.depth must be within 0..=1",
    )?;
    ensure(
      (0.0..=1.0).contains(&dsp.volume.default_volume),
      "dsp.volume.default_volume must be within 0..=1",
    )?;
    ensure(dsp.equalizer.block_size > 0, "dsp.equalizer.block_size must be positive")?;

    ensure(
      (0.0..=1.0).contains(&self.mixer.priority_floor),
      "mixer.priority_floor must be within 0..=1",
    )?;
    ensure(self.mixer.max_sources >= 1, "mixer.max_sources must be >= 1")?;
    ensure(
      dsp.compressor.max_ratio >= 1.0,
      "dsp.compressor.max_ratio must be >= 1",
    )?;

    let quality = &self.quality;
    ensure(
      quality.cpu_low < quality.cpu_high && quality.underrun_low < quality.underrun_high,
      "quality lower thresholds must sit below the upper thresholds",
    )?;
    ensure(quality.initial <= quality.ceiling, "quality.initial exceeds quality.ceiling")?;
    ensure(quality.degrade_after >= 1, "quality.degrade_after must be >= 1")?;

    ensure(self.health.stall_timeout_ms > 0, "health.stall_timeout_ms must be positive")?;
    ensure(
      self.health.evaluate_interval_ms > 0,
      "health.evaluate_interval_ms must be positive",
    )?;

    let recovery = &self.recovery;
    ensure(recovery.max_attempts >= 1, "recovery.max_attempts must be >= 1")?;
    ensure(
      recovery.base_delay_ms <= recovery.max_delay_ms,
      "recovery.base_delay_ms exceeds recovery.max_delay_ms",
    )?;
    ensure(
      (0.0..1.0).contains(&recovery.jitter),
      "recovery.jitter must be within 0..1",
    )?;
    Ok(())
  }
}

fn ensure(condition: bool, message: &str) -> Result<(), EngineError> {
  if condition {
    Ok(())
  } else {
    Err(EngineError::Config(message.to_string()))
  }
}
