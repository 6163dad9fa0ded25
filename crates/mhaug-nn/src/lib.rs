//! Model, augmentation and training for multi-view GNN node classification.
//!
//! `mhaug-nn` sits on top of `mhaug-core`: it owns the parameters, decides
//! which augmentation becomes authoritative, and turns three aligned
//! prediction streams into one loss.
//!
//! # Modules
//!
//! - [`model`]: GraphSAGE layers over sampled blocks ([`DistSage`])
//! - [`loss`]: hard, consistency and entropy terms ([`ConsistencyMode`])
//! - [`augment`]: Metropolis-Hastings mask controller ([`AugmentationController`])
//! - [`collective`]: barrier / all-reduce / leave for worker threads ([`LocalGroup`])
//! - [`train`]: the epoch loop ([`Trainer`])
//! - [`config`]: [`TrainConfig`] and [`AugmentConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mhaug_core::PlantedPartition;
//! use mhaug_nn::{TrainConfig, Trainer};
//!
//! let ds = PlantedPartition::default().generate()?;
//! let (store, splits) = ds.into_store(2)?;
//!
//! let config = TrainConfig::default().with_parts(2).with_epochs(5);
//! let summary = Trainer::new(config)?.fit(Arc::new(store), &splits)?;
//! println!("test accuracy {:.4}", summary.test_acc);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod augment;
pub mod collective;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod train;

pub use augment::{
    AcceptanceRule, AugmentStrength, AugmentationController, Decision, FixedRatio,
    MetropolisHastings, MhTarget, ProposalScore,
};
pub use collective::{LocalGroup, Membership};
pub use config::{AugmentConfig, TrainConfig};
pub use error::{Error, Result};
pub use loss::{assemble, ConsistencyMode, LossTerms, LossWeights};
pub use model::{mean_aggregate, DistSage, NodeClassifier, SageConv};
pub use train::{
    split_seeds, EpochStats, EvalCounts, Replica, TrainOutput, TrainSummary, Trainer, WorkerSeeds,
};
