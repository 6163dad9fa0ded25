//! Node classification datasets.
//!
//! Two sources:
//!
//! - [`Dataset::from_json_file`] - a serialized dataset (see [`Dataset`] for the layout)
//! - [`PlantedPartition`] - a synthetic homophilous graph whose features are
//!   noisy class centroids, handy for smoke tests and demos

use crate::graph::GraphViewStore;
use crate::partition::PartitionBook;
use crate::{Error, NodeId, Result};
use rand::prelude::*;
use rand_distr::Normal;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Boolean train/val/test membership per node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitMasks {
    pub train: Vec<bool>,
    pub val: Vec<bool>,
    pub test: Vec<bool>,
}

impl SplitMasks {
    pub fn counts(&self) -> (usize, usize, usize) {
        let count = |m: &[bool]| m.iter().filter(|&&b| b).count();
        (count(&self.train), count(&self.val), count(&self.test))
    }
}

/// A node classification dataset.
///
/// JSON layout:
///
/// ```text
/// {
///   "num_nodes": 4,
///   "feature_dim": 2,
///   "edges": [[0, 1], [1, 2]],
///   "features": [0.1, 0.2, ...],      // row-major, num_nodes * feature_dim
///   "labels": [0, 1, 1, 0],
///   "splits": { "train": [...], "val": [...], "test": [...] }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub num_nodes: usize,
    pub feature_dim: usize,
    pub edges: Vec<(NodeId, NodeId)>,
    pub features: Vec<f32>,
    pub labels: Vec<u32>,
    pub splits: SplitMasks,
}

impl Dataset {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let dataset: Self = serde_json::from_reader(reader)?;
        dataset.validate()?;
        Ok(dataset)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Check that every per-node array has `num_nodes` entries.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_nodes;
        let checks = [
            ("features", self.features.len(), n * self.feature_dim),
            ("labels", self.labels.len(), n),
            ("train split", self.splits.train.len(), n),
            ("val split", self.splits.val.len(), n),
            ("test split", self.splits.test.len(), n),
        ];
        for (name, got, expected) in checks {
            if got != expected {
                return Err(Error::Dataset(format!(
                    "{name} has {got} entries, expected {expected}"
                )));
            }
        }
        if let Some(&(s, d)) = self.edges.iter().find(|&&(s, d)| s >= n || d >= n) {
            return Err(Error::Dataset(format!(
                "edge ({s}, {d}) references a node outside 0..{n}"
            )));
        }
        Ok(())
    }

    /// Build the partitioned store; the split masks are returned alongside.
    pub fn into_store(self, num_parts: usize) -> Result<(GraphViewStore, SplitMasks)> {
        self.validate()?;
        let book = PartitionBook::contiguous(self.num_nodes, num_parts)?;
        let store = GraphViewStore::new(
            self.num_nodes,
            &self.edges,
            self.features,
            self.feature_dim,
            self.labels,
            book,
        )?;
        Ok((store, self.splits))
    }
}

/// Synthetic planted-partition graph generator.
///
/// Each node gets a class; each node receives `avg_degree` incoming edges,
/// drawn from its own class with probability `homophily` and from anywhere
/// otherwise. Features are the class centroid (ones on the dimensions
/// `d % num_classes == class`) plus Gaussian noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantedPartition {
    pub num_nodes: usize,
    pub num_classes: usize,
    pub feature_dim: usize,
    pub avg_degree: usize,
    pub homophily: f64,
    pub noise: f32,
    pub train_frac: f64,
    pub val_frac: f64,
    pub seed: u64,
}

impl Default for PlantedPartition {
    fn default() -> Self {
        Self {
            num_nodes: 1000,
            num_classes: 4,
            feature_dim: 16,
            avg_degree: 8,
            homophily: 0.8,
            noise: 1.0,
            train_frac: 0.6,
            val_frac: 0.2,
            seed: 42,
        }
    }
}

impl PlantedPartition {
    pub fn with_num_nodes(mut self, n: usize) -> Self {
        self.num_nodes = n;
        self
    }

    pub fn with_num_classes(mut self, k: usize) -> Self {
        self.num_classes = k;
        self
    }

    pub fn with_feature_dim(mut self, d: usize) -> Self {
        self.feature_dim = d;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn generate(&self) -> Result<Dataset> {
        if self.num_nodes == 0 || self.num_classes == 0 || self.feature_dim == 0 {
            return Err(Error::InvalidConfig(
                "num_nodes, num_classes and feature_dim must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.homophily)
            || self.train_frac + self.val_frac > 1.0
            || self.train_frac < 0.0
            || self.val_frac < 0.0
        {
            return Err(Error::InvalidConfig(
                "homophily and split fractions must lie in [0, 1]".into(),
            ));
        }
        let noise = Normal::new(0.0f32, self.noise)
            .map_err(|e| Error::InvalidConfig(format!("noise: {e}")))?;

        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        let n = self.num_nodes;
        let labels: Vec<u32> = (0..n)
            .map(|_| rng.gen_range(0..self.num_classes) as u32)
            .collect();

        let mut by_class: Vec<Vec<NodeId>> = vec![Vec::new(); self.num_classes];
        for (node, &label) in labels.iter().enumerate() {
            by_class[label as usize].push(node);
        }

        let mut edges = Vec::with_capacity(n * self.avg_degree);
        for dst in 0..n {
            let own = &by_class[labels[dst] as usize];
            for _ in 0..self.avg_degree {
                let src = if rng.gen_bool(self.homophily) && own.len() > 1 {
                    own[rng.gen_range(0..own.len())]
                } else {
                    rng.gen_range(0..n)
                };
                if src != dst {
                    edges.push((src, dst));
                }
            }
        }

        let mut features = Vec::with_capacity(n * self.feature_dim);
        for &label in &labels {
            for d in 0..self.feature_dim {
                let centroid = if d % self.num_classes == label as usize {
                    1.0
                } else {
                    0.0
                };
                features.push(centroid + noise.sample(&mut rng));
            }
        }

        let mut order: Vec<NodeId> = (0..n).collect();
        order.shuffle(&mut rng);
        let n_train = (n as f64 * self.train_frac).round() as usize;
        let n_val = (n as f64 * self.val_frac).round() as usize;
        let mut splits = SplitMasks {
            train: vec![false; n],
            val: vec![false; n],
            test: vec![false; n],
        };
        for (rank, &node) in order.iter().enumerate() {
            if rank < n_train {
                splits.train[node] = true;
            } else if rank < n_train + n_val {
                splits.val[node] = true;
            } else {
                splits.test[node] = true;
            }
        }

        Ok(Dataset {
            num_nodes: n,
            feature_dim: self.feature_dim,
            edges,
            features,
            labels,
            splits,
        })
    }
}
