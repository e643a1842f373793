use std::{fs, path::Path, time::Duration};

use comms::{Backend, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};

use crate::{OrchestraErr, Result};

/// The amount of batches a split keeps in debug mode.
pub const DEBUG_BATCHES: usize = 50;

/// How, and whether, to join a distributed group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedConfig {
    pub enabled: bool,
    pub backend: Backend,
    pub init_method: String,
    pub use_alternate_backend: bool,
    pub timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: Backend::Gloo,
            init_method: "local://orchestra".into(),
            use_alternate_backend: false,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl DistributedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Dynamic loss scaling settings, only used under mixed precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LossScaleConfig {
    pub initial: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min: f32,
    pub max: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min: 1.0,
            max: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(OrchestraErr::Configuration(format!("loss_scale: {msg}")));

        if !(self.min > 0.0 && self.min <= self.max) {
            return invalid("min must be positive and not above max");
        }
        if !(self.min..=self.max).contains(&self.initial) {
            return invalid("initial must lie within [min, max]");
        }
        if !(self.growth_factor >= 1.0) {
            return invalid("growth_factor must be at least 1");
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return invalid("backoff_factor must lie within (0, 1)");
        }
        if self.growth_interval == 0 {
            return invalid("growth_interval must be positive");
        }

        Ok(())
    }
}

/// Everything a training session is configured with. Read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub distributed: DistributedConfig,
    /// Per process batch size.
    pub batch_size: usize,
    pub epochs: usize,
    /// The learning rate constant, scaled by the global batch size.
    pub base_lr: f32,
    pub milestones: Vec<usize>,
    pub gamma: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub mixed_precision: bool,
    pub loss_scale: LossScaleConfig,
    pub data_parallel: bool,
    pub replicas: usize,
    pub sync_normalization: bool,
    pub non_blocking: bool,
    pub prefetch_depth: usize,
    pub topk: usize,
    pub seed: u64,
    /// Caps every split to a few batches, for quick runs.
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            distributed: DistributedConfig::default(),
            batch_size: 256,
            epochs: 90,
            base_lr: 0.1,
            milestones: vec![30, 60, 80],
            gamma: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
            mixed_precision: false,
            loss_scale: LossScaleConfig::default(),
            data_parallel: false,
            replicas: 1,
            sync_normalization: false,
            non_blocking: true,
            prefetch_depth: 2,
            topk: 5,
            seed: 0,
            debug: false,
        }
    }
}

impl SessionConfig {
    /// Reads a JSON configuration; missing fields take their default value.
    ///
    /// # Errors
    /// `OrchestraErr::Io` if the file can't be read, `OrchestraErr::Configuration`
    /// if it is not a valid configuration.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| OrchestraErr::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The most rows a split may keep, if capped.
    pub fn split_cap(&self) -> Option<usize> {
        self.debug.then(|| self.batch_size * DEBUG_BATCHES)
    }

    /// Checks the settings that don't depend on the model or the distributed context.
    ///
    /// # Errors
    /// `OrchestraErr::Configuration` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(OrchestraErr::Configuration(msg.to_string()));

        if self.data_parallel && self.distributed.enabled {
            return invalid("data_parallel and distributed are mutually exclusive");
        }
        if self.data_parallel && self.replicas == 0 {
            return invalid("data_parallel needs at least one replica");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.topk == 0 {
            return invalid("topk must be positive");
        }
        if self.non_blocking && self.prefetch_depth == 0 {
            return invalid("non_blocking needs a positive prefetch_depth");
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return invalid("gamma must lie within (0, 1]");
        }
        if self.distributed.timeout_ms == 0 {
            return invalid("distributed.timeout_ms must be positive");
        }
        if self.mixed_precision {
            self.loss_scale.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = SessionConfig::from_json(r#"{ "epochs": 3, "distributed": { "backend": "nccl" } }"#)
            .unwrap();

        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.milestones, vec![30, 60, 80]);
        assert_eq!(config.distributed.backend, Backend::Nccl);
        assert_eq!(config.distributed.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = SessionConfig::from_json(r#"{ "epoch": 3 }"#).unwrap_err();
        assert!(matches!(err, OrchestraErr::Configuration(_)));
    }

    #[test]
    fn data_parallel_excludes_distributed() {
        let mut config = SessionConfig {
            data_parallel: true,
            replicas: 2,
            ..Default::default()
        };
        config.distributed.enabled = true;

        assert!(matches!(config.validate(), Err(OrchestraErr::Configuration(_))));
    }

    #[test]
    fn loss_scale_is_checked_only_under_mixed_precision() {
        let mut config = SessionConfig::default();
        config.loss_scale.backoff_factor = 1.5;
        assert!(config.validate().is_ok());

        config.mixed_precision = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn gamma_must_decay_the_rate() {
        for gamma in [0.0, -0.5, 1.5, f32::NAN] {
            let config = SessionConfig {
                gamma,
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(OrchestraErr::Configuration(_))),
                "gamma {gamma} was accepted"
            );
        }

        let config = SessionConfig {
            gamma: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rendezvous_timeout_must_be_positive() {
        let err = SessionConfig::from_json(r#"{ "distributed": { "timeout_ms": 0 } }"#).unwrap_err();
        assert!(matches!(err, OrchestraErr::Configuration(msg) if msg.contains("timeout_ms")));
    }

    #[test]
    fn debug_caps_splits_to_a_few_batches() {
        let config = SessionConfig::from_json(r#"{ "batch_size": 4, "debug": true }"#).unwrap();
        assert_eq!(config.split_cap(), Some(4 * DEBUG_BATCHES));
        assert_eq!(SessionConfig::default().split_cap(), None);
    }
}
