//! Graph substrate for multi-view augmented GNN training.
//!
//! `mhaug-core` owns everything below the neural network: the partitioned
//! graph, the per-view masks, neighbor sampling and the loader that keeps
//! three stochastic samplers in lockstep.
//!
//! # Views
//!
//! Training looks at the same seeds through three topologies at once:
//!
//! | View | Sampling | Changed by |
//! |------|----------|------------|
//! | org  | uniform  | never |
//! | prev | `prev_emask` | augmentation commit |
//! | cur  | `cur_emask`  | augmentation commit |
//!
//! The loss compares predictions across views node by node, so the three
//! sampled subgraphs of a step *must* share destination nodes in the same
//! order. [`MultiViewLoader`] guarantees this by drawing one permutation,
//! draining each view into an arena, and zipping by index.
//!
//! # Modules
//!
//! - [`graph`] - [`GraphViewStore`]: topology, features, labels, masks
//! - [`mask`] - [`MaskStore`]: versioned masks with atomic commits
//! - [`partition`] - [`PartitionBook`] and per-worker seed splits
//! - [`sampling`] - weighted multi-hop [`NeighborSampler`]
//! - [`loader`] - [`MultiViewLoader`] and [`AlignedEpoch`]
//! - [`datasets`] - JSON datasets and a planted-partition generator
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mhaug_core::{MultiViewLoader, PlantedPartition};
//!
//! let ds = PlantedPartition::default().with_num_nodes(100).generate().unwrap();
//! let (store, splits) = ds.into_store(1).unwrap();
//! let seeds: Vec<usize> = (0..100).filter(|&n| splits.train[n]).collect();
//!
//! let loader = MultiViewLoader::single(Arc::new(store), seeds, 16, vec![5, 5], true, false)
//!     .unwrap();
//! let epoch = loader.epoch(0).unwrap();
//! assert_eq!(epoch.len(), loader.num_batches());
//! for step in &epoch {
//!     assert_eq!(step.org.output_nodes, step.cur.output_nodes);
//! }
//! ```

pub mod datasets;
mod error;
pub mod graph;
pub mod loader;
pub mod mask;
pub mod partition;
pub mod sampling;

/// Global node id.
pub type NodeId = usize;
/// Global edge id (index into edge masks).
pub type EdgeId = usize;

pub use datasets::{Dataset, PlantedPartition, SplitMasks};
pub use error::{Error, Result};
pub use graph::{GraphStats, GraphViewStore};
pub use loader::{AlignedEpoch, MultiViewLoader, ViewLoaderConfig, ViewTriple, ViewWeights};
pub use mask::{MaskKind, MaskPatch, MaskSet, MaskStore, View};
pub use partition::{node_split, pad_to, PartitionBook};
pub use sampling::{parse_fanout, Block, NeighborSampler, SampledView};
