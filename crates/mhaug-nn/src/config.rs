//! Training and augmentation configuration.
//!
//! Every field has a serde default, so a JSON file only needs the values it
//! changes:
//!
//! ```json
//! { "num_epochs": 5, "fan_out": "5,10", "augment": { "max_drop": 0.3 } }
//! ```

use crate::{Error, Result};
use mhaug_core::parse_fanout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Metropolis-Hastings augmentation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Upper bound for both drop ratios (default: 0.5).
    pub max_drop: f64,
    /// Random-walk step size of the proposal (default: 0.05).
    pub step: f64,
    /// Edge drop ratio the target density is centered on (default: 0.2).
    pub target_edge_drop: f64,
    /// Node drop ratio the target density is centered on (default: 0.1).
    pub target_node_drop: f64,
    /// Width of the strength prior (default: 0.1).
    pub sigma: f64,
    /// Weight of the divergence term in the target (default: 1.0).
    pub lambda: f64,
    /// Aligned batches used to score a proposal (default: 1).
    pub score_batches: usize,
    /// Proposals tried before giving up (default: 100).
    pub max_attempts: usize,
    /// Wall-clock bound on the acceptance loop in seconds (default: 60).
    pub timeout_secs: f64,
    /// Write accepted masks back to the store (default: true).
    pub commit: bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            max_drop: 0.5,
            step: 0.05,
            target_edge_drop: 0.2,
            target_node_drop: 0.1,
            sigma: 0.1,
            lambda: 1.0,
            score_batches: 1,
            max_attempts: 100,
            timeout_secs: 60.0,
            commit: true,
        }
    }
}

impl AugmentConfig {
    pub fn with_max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Wall-clock bound of the acceptance loop.
    pub fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout_secs).map_err(|_| {
            Error::InvalidConfig(format!(
                "augment.timeout_secs {} is not a representable duration",
                self.timeout_secs
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.max_drop) {
            return Err(Error::InvalidConfig(format!(
                "augment.max_drop must lie in [0, 1), got {}",
                self.max_drop
            )));
        }
        for (name, value) in [
            ("target_edge_drop", self.target_edge_drop),
            ("target_node_drop", self.target_node_drop),
        ] {
            if !(0.0..=self.max_drop).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "augment.{name} = {value} is outside [0, max_drop]"
                )));
            }
        }
        for (name, value) in [
            ("step", self.step),
            ("sigma", self.sigma),
            ("lambda", self.lambda),
        ] {
            if !value.is_finite() {
                return Err(Error::InvalidConfig(format!(
                    "augment.{name} must be finite, got {value}"
                )));
            }
        }
        if self.step < 0.0 || self.sigma <= 0.0 || self.lambda < 0.0 {
            return Err(Error::InvalidConfig(
                "augment.step and augment.lambda must be non-negative, augment.sigma positive"
                    .into(),
            ));
        }
        if self.score_batches == 0 || self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "augment.score_batches and augment.max_attempts must be positive".into(),
            ));
        }
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "augment.timeout_secs must be positive, got {}",
                self.timeout_secs
            )));
        }
        self.timeout().map(|_| ())
    }
}

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Per-layer fan-out, input layer first (default: "10,25").
    pub fan_out: String,
    /// Seeds per training step (default: 1000).
    pub batch_size: usize,
    /// Seeds per evaluation batch (default: 100000).
    pub batch_size_eval: usize,
    /// Shuffle seeds each epoch (default: true).
    pub shuffle: bool,
    /// Drop the last incomplete batch (default: false).
    pub drop_last: bool,
    /// Number of epochs (default: 20).
    pub num_epochs: usize,
    /// Hidden width (default: 16).
    pub num_hidden: usize,
    /// Number of SAGE layers; must match the fan-out length (default: 2).
    pub num_layers: usize,
    /// Dropout between layers (default: 0.5).
    pub dropout: f32,
    /// Learning rate (default: 0.003).
    pub lr: f64,
    /// Weight decay (default: 0.0005).
    pub decay: f64,
    /// Weight of the consistency term (default: 1.0).
    pub kl: f64,
    /// Weight of the entropy term (default: 0.1).
    pub h: f64,
    /// 0 = joint soft cross-entropy, otherwise asymmetric Jensen-Shannon (default: 1).
    pub option_loss: u8,
    /// Log every n steps (default: 20).
    pub log_every: usize,
    /// Evaluate every n epochs (default: 5).
    pub eval_every: usize,
    /// Number of classes, 0 = infer from labels (default: 0).
    pub n_classes: usize,
    /// Number of partitions, one worker each (default: 1).
    pub num_parts: usize,
    /// Pad per-worker train seeds to equal length (default: false).
    pub pad_data: bool,
    /// Random seed (default: 42).
    pub seed: u64,
    pub augment: AugmentConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            fan_out: "10,25".into(),
            batch_size: 1000,
            batch_size_eval: 100_000,
            shuffle: true,
            drop_last: false,
            num_epochs: 20,
            num_hidden: 16,
            num_layers: 2,
            dropout: 0.5,
            lr: 0.003,
            decay: 0.0005,
            kl: 1.0,
            h: 0.1,
            option_loss: 1,
            log_every: 20,
            eval_every: 5,
            n_classes: 0,
            num_parts: 1,
            pad_data: false,
            seed: 42,
            augment: AugmentConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_fan_out(mut self, fan_out: impl Into<String>) -> Self {
        self.fan_out = fan_out.into();
        self.num_layers = self.fan_out.split(',').filter(|s| !s.trim().is_empty()).count();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.num_epochs = epochs;
        self
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.num_hidden = hidden;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_parts(mut self, num_parts: usize) -> Self {
        self.num_parts = num_parts;
        self
    }

    pub fn with_option_loss(mut self, option_loss: u8) -> Self {
        self.option_loss = option_loss;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_augment(mut self, augment: AugmentConfig) -> Self {
        self.augment = augment;
        self
    }

    /// Parsed fan-out schedule.
    pub fn fanout(&self) -> Result<Vec<usize>> {
        Ok(parse_fanout(&self.fan_out)?)
    }

    pub fn validate(&self) -> Result<()> {
        let fanout = self.fanout()?;
        if fanout.len() != self.num_layers {
            return Err(Error::InvalidConfig(format!(
                "fan_out {:?} has {} entries but num_layers is {}",
                self.fan_out,
                fanout.len(),
                self.num_layers
            )));
        }
        let positive = [
            ("batch_size", self.batch_size),
            ("batch_size_eval", self.batch_size_eval),
            ("num_epochs", self.num_epochs),
            ("num_hidden", self.num_hidden),
            ("log_every", self.log_every),
            ("eval_every", self.eval_every),
            ("num_parts", self.num_parts),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        let weights = [self.lr, self.decay, self.kl, self.h];
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(Error::InvalidConfig("lr, decay, kl and h must be finite".into()));
        }
        if self.lr <= 0.0 || self.decay < 0.0 || self.kl < 0.0 || self.h < 0.0 {
            return Err(Error::InvalidConfig(
                "lr must be positive; decay, kl and h non-negative".into(),
            ));
        }
        self.augment.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fanout().unwrap(), vec![10, 25]);
        assert_eq!(config.batch_size_eval, 100_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"num_epochs": 3, "augment": {"max_drop": 0.3}}"#).unwrap();
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.lr, 0.003);
        assert_eq!(config.augment.max_drop, 0.3);
        assert_eq!(config.augment.max_attempts, 100);
    }

    #[test]
    fn test_fan_out_must_match_layers() {
        let mut config = TrainConfig::default();
        config.fan_out = "5".into();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert!(config.with_fan_out("5").validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_augment() {
        let augment = AugmentConfig {
            target_edge_drop: 0.9,
            ..Default::default()
        };
        assert!(augment.validate().is_err());
        assert!(AugmentConfig::default().with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_timeout() {
        let augment = AugmentConfig {
            timeout_secs: 1e20,
            ..Default::default()
        };
        assert!(matches!(augment.validate(), Err(Error::InvalidConfig(_))));
        assert!(augment.timeout().is_err());
        assert_eq!(
            AugmentConfig::default().timeout().unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_rejects_non_finite_augment_values() {
        for config in [
            AugmentConfig {
                step: f64::NAN,
                ..Default::default()
            },
            AugmentConfig {
                sigma: f64::INFINITY,
                ..Default::default()
            },
            AugmentConfig {
                lambda: f64::NAN,
                ..Default::default()
            },
        ] {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
        let mut train = TrainConfig::default();
        train.lr = f64::NAN;
        assert!(train.validate().is_err());
    }

    #[test]
    fn test_json_timeout_overflow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, r#"{"augment": {"timeout_secs": 1e20}}"#).unwrap();
        assert!(matches!(
            TrainConfig::from_json_file(&path),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, r#"{"batch_size": 64, "seed": 7}"#).unwrap();
        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.seed, 7);

        std::fs::write(&path, r#"{"batch_size": 0}"#).unwrap();
        assert!(TrainConfig::from_json_file(&path).is_err());
    }
}
