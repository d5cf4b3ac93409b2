//! Configuration: layered TOML file + env overrides, in the style of
//! `MitigationConfig` in the teacher, plus a resolved `ThresholdPolicy`
//! tagged variant in place of a loosely-typed partial threshold config.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ControllerError, Result};
use crate::model::ThresholdPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub instance: String,
    pub max_instances: i64,
    pub min_instances: i64,
    pub max_requests_per_instance: Option<i64>,
    pub scale_up_capacity_threshold: f32,

    pub heartbeat_interval_ms: u64,
    pub stale_threshold_ms: u64,

    pub scale_threshold_cpu: Option<f32>,
    pub scale_threshold_memory: Option<f32>,
    pub scale_threshold_disk: Option<f32>,
    pub scale_threshold: f32,

    pub scale_up_cooldown_ms: u64,
    pub scale_down_cooldown_ms: u64,

    pub scale_down_threshold_cpu: Option<f32>,
    pub scale_down_threshold_memory: Option<f32>,
    pub scale_down_threshold_disk: Option<f32>,
    pub scale_down_threshold: Option<f32>,

    pub health_check_retries: i64,
    pub drain_timeout_ms: u64,

    pub monitoring_endpoint: String,
    pub monitorz_url: String,
    pub provisioning_webhook_url: String,

    pub listen_addr: String,
    pub metrics_addr: String,
    pub sqlite_path: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "fleet_controller=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: "standard-1".to_string(),
            max_instances: 10,
            min_instances: 0,
            max_requests_per_instance: None,
            scale_up_capacity_threshold: 0.7,

            heartbeat_interval_ms: 30_000,
            stale_threshold_ms: 120_000,

            scale_threshold_cpu: None,
            scale_threshold_memory: None,
            scale_threshold_disk: None,
            scale_threshold: 75.0,

            scale_up_cooldown_ms: 60_000,
            scale_down_cooldown_ms: 120_000,

            scale_down_threshold_cpu: None,
            scale_down_threshold_memory: None,
            scale_down_threshold_disk: None,
            scale_down_threshold: None,

            health_check_retries: 3,
            drain_timeout_ms: 60_000,

            monitoring_endpoint: "/healthz".to_string(),
            monitorz_url: "http://localhost:81/monitorz".to_string(),
            provisioning_webhook_url: "http://localhost:9000/provision".to_string(),

            listen_addr: "0.0.0.0:8080".to_string(),
            metrics_addr: "0.0.0.0:9090".to_string(),
            sqlite_path: "fleet-controller.sqlite3".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Layered load: defaults, then an optional TOML file, then
    /// `FLEET_*` environment overrides — mirrors
    /// `MitigationConfig::from_file`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if std::path::Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            }
        }

        let builder = builder.add_source(config::Environment::with_prefix("FLEET").separator("__"));

        // `#[serde(default)]` on `Config` and `LoggingConfig` fills in any
        // field absent from both the file and the environment, so an empty
        // source set still deserializes to `Config::default()`.
        let cfg: Config = builder
            .build()
            .map_err(|e| ControllerError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ControllerError::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_instances < 0 {
            return Err(ControllerError::Config("minInstances must be >= 0".into()));
        }
        if self.min_instances > self.max_instances {
            return Err(ControllerError::Config(
                "minInstances must be <= maxInstances".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_up_capacity_threshold) || self.scale_up_capacity_threshold <= 0.0 {
            return Err(ControllerError::Config(
                "scaleUpCapacityThreshold must be in (0.0, 1.0]".into(),
            ));
        }
        self.check_partial_specifics();
        Ok(())
    }

    fn check_partial_specifics(&self) {
        let specifics = [
            self.scale_threshold_cpu,
            self.scale_threshold_memory,
            self.scale_threshold_disk,
        ];
        let set_count = specifics.iter().filter(|v| v.is_some()).count();
        if set_count > 0 && set_count < 3 {
            warn!(
                "partial scale-up threshold specification detected (cpu={:?}, memory={:?}, disk={:?}); \
                 missing metrics are treated as unthresholded, not as falling back to the general threshold",
                self.scale_threshold_cpu, self.scale_threshold_memory, self.scale_threshold_disk
            );
        }
    }

    /// Resolves the scale-up threshold policy: all-three-specifics, or
    /// general, never a silent partial mix.
    pub fn threshold_policy(&self) -> ThresholdPolicy {
        match (
            self.scale_threshold_cpu,
            self.scale_threshold_memory,
            self.scale_threshold_disk,
        ) {
            (Some(cpu), Some(memory), Some(disk)) => ThresholdPolicy::Specific { cpu, memory, disk },
            (None, None, None) => ThresholdPolicy::General(self.scale_threshold),
            _ => {
                // Already warned in validate(); disabled metrics resolve to
                // whichever specific value is present, `None` otherwise —
                // expressed here as a Specific policy with implausibly high
                // sentinels would be wrong, so callers must consult
                // `for_metric` per-metric rather than assume all three.
                ThresholdPolicy::Specific {
                    cpu: self.scale_threshold_cpu.unwrap_or(f32::INFINITY),
                    memory: self.scale_threshold_memory.unwrap_or(f32::INFINITY),
                    disk: self.scale_threshold_disk.unwrap_or(f32::INFINITY),
                }
            }
        }
    }

    /// Derives the scale-down policy: explicit overrides, else up − 45.
    pub fn scale_down_policy(&self) -> ThresholdPolicy {
        match self.threshold_policy() {
            ThresholdPolicy::General(up) => {
                ThresholdPolicy::General(self.scale_down_threshold.unwrap_or(up - 45.0))
            }
            ThresholdPolicy::Specific { cpu, memory, disk } => ThresholdPolicy::Specific {
                cpu: self.scale_down_threshold_cpu.unwrap_or(cpu - 45.0),
                memory: self.scale_down_threshold_memory.unwrap_or(memory - 45.0),
                disk: self.scale_down_threshold_disk.unwrap_or(disk - 45.0),
            },
            ThresholdPolicy::None => ThresholdPolicy::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn min_greater_than_max_is_rejected() {
        let mut cfg = Config::default();
        cfg.min_instances = 5;
        cfg.max_instances = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn all_three_specifics_yield_specific_policy() {
        let mut cfg = Config::default();
        cfg.scale_threshold_cpu = Some(80.0);
        cfg.scale_threshold_memory = Some(85.0);
        cfg.scale_threshold_disk = Some(90.0);
        assert_eq!(
            cfg.threshold_policy(),
            ThresholdPolicy::Specific {
                cpu: 80.0,
                memory: 85.0,
                disk: 90.0
            }
        );
    }

    #[test]
    fn no_specifics_yield_general_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.threshold_policy(), ThresholdPolicy::General(75.0));
    }

    #[test]
    fn scale_down_defaults_to_up_minus_45() {
        let cfg = Config::default();
        assert_eq!(cfg.scale_down_policy(), ThresholdPolicy::General(30.0));
    }
}
