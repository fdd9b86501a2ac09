//! # Agent Configuration
//!
//! `AgentConfig` is loaded once at startup from a TOML file, then overlaid with any
//! `VISIONOPS_`-prefixed environment variables, then validated. A reconfigure at runtime
//! (SIGHUP or admin call) repeats the same three steps and atomically swaps the result
//! into the running process via `RwLock<Arc<AgentConfig>>` — no component holds a long-lived
//! reference to individual fields, only to the `Arc` snapshot current at the time it reads.

use crate::error::VisionOpsError;
use crate::model::CameraSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub cameras: Vec<CameraSpec>,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default = "default_buffer_pool_cap_mb")]
    pub buffer_pool_cap_mb: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            database_path: default_database_path(),
            model: ModelConfig::default(),
            replication: ReplicationConfig::default(),
            governor: GovernorConfig::default(),
            scheduler: SchedulerConfig::default(),
            aggregation: AggregationConfig::default(),
            buffer_pool_cap_mb: default_buffer_pool_cap_mb(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/visionops/agent.db")
}

fn default_buffer_pool_cap_mb() -> u64 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_detector_model_path")]
    pub detector_model_path: PathBuf,
    #[serde(default = "default_captioner_model_path")]
    pub captioner_model_path: PathBuf,
    #[serde(default = "default_labels_path")]
    pub labels_path: PathBuf,
    #[serde(default = "default_vocab_path")]
    pub vocab_path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_model_path: default_detector_model_path(),
            captioner_model_path: default_captioner_model_path(),
            labels_path: default_labels_path(),
            vocab_path: default_vocab_path(),
        }
    }
}

fn default_detector_model_path() -> PathBuf {
    PathBuf::from("/etc/visionops/models/detector.bin")
}
fn default_captioner_model_path() -> PathBuf {
    PathBuf::from("/etc/visionops/models/captioner.bin")
}
fn default_labels_path() -> PathBuf {
    PathBuf::from("/etc/visionops/models/labels.txt")
}
fn default_vocab_path() -> PathBuf {
    PathBuf::from("/etc/visionops/models/vocab.txt")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub endpoint_base_url: String,
    /// Name of an environment variable holding the bearer token, never the token itself.
    #[serde(default = "default_credential_env_var")]
    pub credential_env_var: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            endpoint_base_url: String::new(),
            credential_env_var: default_credential_env_var(),
            batch_size: default_batch_size(),
            lease_seconds: default_lease_seconds(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_credential_env_var() -> String {
    "VISIONOPS_REPLICATION_TOKEN".to_string()
}
fn default_batch_size() -> usize {
    crate::model::QUEUE_BATCH_SIZE
}
fn default_lease_seconds() -> i64 {
    crate::model::QUEUE_LEASE_SECONDS
}
fn default_max_attempts() -> u32 {
    crate::model::QUEUE_MAX_ATTEMPTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_warm_temp")]
    pub warm_temp_celsius: f32,
    #[serde(default = "default_hot_temp")]
    pub hot_temp_celsius: f32,
    #[serde(default = "default_critical_temp")]
    pub critical_temp_celsius: f32,
    #[serde(default = "default_memory_warn_mb")]
    pub memory_warn_mb: f64,
    #[serde(default = "default_memory_hot_mb")]
    pub memory_hot_mb: f64,
    #[serde(default = "default_memory_critical_mb")]
    pub memory_critical_mb: f64,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_growth_warm_mb_per_hour")]
    pub growth_warm_mb_per_hour: f64,
    #[serde(default = "default_growth_hot_mb_per_hour")]
    pub growth_hot_mb_per_hour: f64,
    #[serde(default = "default_growth_critical_mb_per_hour")]
    pub growth_critical_mb_per_hour: f64,
    #[serde(default = "default_restart_grace_minutes")]
    pub restart_grace_minutes: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            warm_temp_celsius: default_warm_temp(),
            hot_temp_celsius: default_hot_temp(),
            critical_temp_celsius: default_critical_temp(),
            memory_warn_mb: default_memory_warn_mb(),
            memory_hot_mb: default_memory_hot_mb(),
            memory_critical_mb: default_memory_critical_mb(),
            sample_interval_secs: default_sample_interval_secs(),
            growth_warm_mb_per_hour: default_growth_warm_mb_per_hour(),
            growth_hot_mb_per_hour: default_growth_hot_mb_per_hour(),
            growth_critical_mb_per_hour: default_growth_critical_mb_per_hour(),
            restart_grace_minutes: default_restart_grace_minutes(),
        }
    }
}

fn default_warm_temp() -> f32 {
    65.0
}
fn default_hot_temp() -> f32 {
    70.0
}
fn default_critical_temp() -> f32 {
    75.0
}
fn default_memory_warn_mb() -> f64 {
    4000.0
}
fn default_memory_hot_mb() -> f64 {
    5000.0
}
fn default_memory_critical_mb() -> f64 {
    6000.0
}
fn default_sample_interval_secs() -> u64 {
    10
}
fn default_growth_warm_mb_per_hour() -> f64 {
    10.0
}
fn default_growth_hot_mb_per_hour() -> f64 {
    25.0
}
fn default_growth_critical_mb_per_hour() -> f64 {
    50.0
}
fn default_restart_grace_minutes() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_capture_interval_secs")]
    pub capture_interval_secs: u64,
    #[serde(default = "default_keyframe_interval_secs")]
    pub keyframe_interval_secs: u64,
    #[serde(default = "default_stale_age_secs")]
    pub stale_age_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capture_interval_secs: default_capture_interval_secs(),
            keyframe_interval_secs: default_keyframe_interval_secs(),
            stale_age_secs: default_stale_age_secs(),
        }
    }
}

fn default_capture_interval_secs() -> u64 {
    3
}
fn default_keyframe_interval_secs() -> u64 {
    10
}
fn default_stale_age_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u32,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

fn default_window_seconds() -> u32 {
    60
}
fn default_grace_seconds() -> u32 {
    60
}

impl AgentConfig {
    /// Loads a TOML file, applies the `VISIONOPS_` environment overlay, then validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VisionOpsError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VisionOpsError::configuration(
                "file",
                format!("cannot read {}: {e}", path.as_ref().display()),
            )
        })?;
        let mut config: AgentConfig = toml::from_str(&raw)?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    /// Overlays `VISIONOPS_*` environment variables on top of file-sourced values.
    /// Only a small, explicit set of fields are overlay-able — broad enough for
    /// container deployments that inject secrets and endpoints via environment,
    /// narrow enough to stay auditable.
    fn apply_env_overlay(&mut self) {
        if let Ok(v) = std::env::var("VISIONOPS_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VISIONOPS_REPLICATION_ENDPOINT") {
            self.replication.endpoint_base_url = v;
        }
        if let Ok(v) = std::env::var("VISIONOPS_REPLICATION_CREDENTIAL_ENV") {
            self.replication.credential_env_var = v;
        }
        if let Ok(v) = std::env::var("VISIONOPS_SCHEDULER_CAPTURE_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.scheduler.capture_interval_secs = n;
            }
        }
    }

    /// Leaf validation: every field is checked independently and the first violation
    /// found is returned. Call this after loading and after every reconfigure.
    pub fn validate(&self) -> Result<(), VisionOpsError> {
        if self.cameras.is_empty() {
            return Err(VisionOpsError::configuration(
                "cameras",
                "at least one camera must be configured",
            ));
        }
        let mut seen_ids = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(VisionOpsError::configuration("cameras[].id", "must not be empty"));
            }
            if !seen_ids.insert(camera.id.clone()) {
                return Err(VisionOpsError::configuration(
                    "cameras[].id",
                    format!("duplicate camera id '{}'", camera.id),
                ));
            }
            if camera.url.trim().is_empty() {
                return Err(VisionOpsError::configuration(
                    "cameras[].url",
                    format!("camera '{}' has no url", camera.id),
                ));
            }
        }
        if self.replication.endpoint_base_url.trim().is_empty() {
            return Err(VisionOpsError::configuration(
                "replication.endpoint_base_url",
                "must be set",
            ));
        }
        if self.replication.batch_size == 0 {
            return Err(VisionOpsError::configuration(
                "replication.batch_size",
                "must be greater than 0",
            ));
        }
        if !(self.governor.warm_temp_celsius
            < self.governor.hot_temp_celsius)
            || !(self.governor.hot_temp_celsius < self.governor.critical_temp_celsius)
        {
            return Err(VisionOpsError::configuration(
                "governor.*_temp_celsius",
                "thresholds must be strictly increasing: warm < hot < critical",
            ));
        }
        if !(self.governor.memory_warn_mb < self.governor.memory_hot_mb)
            || !(self.governor.memory_hot_mb < self.governor.memory_critical_mb)
        {
            return Err(VisionOpsError::configuration(
                "governor.memory_*_mb",
                "thresholds must be strictly increasing: warn < hot < critical",
            ));
        }
        if self.scheduler.capture_interval_secs == 0 {
            return Err(VisionOpsError::configuration(
                "scheduler.capture_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.aggregation.window_seconds == 0 {
            return Err(VisionOpsError::configuration(
                "aggregation.window_seconds",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolves the bearer token for replication from the environment variable named
    /// by `replication.credential_env_var`. Absent at startup is a configuration error;
    /// absent at reconfigure time degrades replication until corrected.
    pub fn replication_token(&self) -> Result<String, VisionOpsError> {
        std::env::var(&self.replication.credential_env_var).map_err(|_| {
            VisionOpsError::configuration(
                "replication.credential_env_var",
                format!(
                    "environment variable '{}' is not set",
                    self.replication.credential_env_var
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CameraSpec;

    fn valid_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.cameras.push(CameraSpec {
            id: "cam-1".into(),
            url: "rtsp://127.0.0.1/stream".into(),
            credential_ref: None,
            enabled: true,
            zones: Vec::new(),
        });
        config.replication.endpoint_base_url = "https://example.invalid".into();
        config
    }

    #[test]
    fn default_config_fails_validation_with_no_cameras() {
        assert!(AgentConfig::default().validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn duplicate_camera_ids_rejected() {
        let mut config = valid_config();
        let dup = config.cameras[0].clone();
        config.cameras.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn governor_thresholds_must_be_increasing() {
        let mut config = valid_config();
        config.governor.hot_temp_celsius = config.governor.warm_temp_celsius;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overlay_applies_over_file_value() {
        let mut config = valid_config();
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe { std::env::set_var("VISIONOPS_DATABASE_PATH", "/tmp/visionops-test.db") };
        config.apply_env_overlay();
        unsafe { std::env::remove_var("VISIONOPS_DATABASE_PATH") };
        assert_eq!(config.database_path, PathBuf::from("/tmp/visionops-test.db"));
    }
}
