//! Synchronized multi-view loader.
//!
//! Every training step needs three sampled subgraphs over the *same* seeds:
//!
//! | View | Edge probability | Purpose |
//! |------|------------------|---------|
//! | org  | uniform          | entropy regularizer |
//! | prev | `prev_emask`     | supervised + consistency |
//! | cur  | `cur_emask`      | consistency |
//!
//! The three samplers are independent random generators with no way to zip
//! them step by step, so the loader works in two phases:
//!
//! 1. **Drain**: one seed permutation and one set of batch boundaries are
//!    drawn, then each view is sampled to completion into its own arena
//!    (the three drains run in parallel, each with its own RNG stream).
//! 2. **Zip**: step `i` yields the `i`-th entry of every arena.
//!
//! Alignment is checked once at construction (same seeds, batch size and
//! `drop_last` for all views) and again after draining (same batch count and
//! destination lists). A mismatch is an [`Error::Alignment`]; iteration is
//! never truncated to the shortest view.

use crate::graph::GraphViewStore;
use crate::mask::{MaskSet, View};
use crate::sampling::{NeighborSampler, SampledView};
use crate::{Error, NodeId, Result};
use rand::prelude::*;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

/// Per-view data loader settings.
///
/// The three configs handed to [`MultiViewLoader::new`] must agree on
/// everything except `view`.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewLoaderConfig {
    pub view: View,
    pub seeds: Vec<NodeId>,
    pub batch_size: usize,
    pub drop_last: bool,
}

impl ViewLoaderConfig {
    pub fn new(view: View, seeds: Vec<NodeId>, batch_size: usize) -> Self {
        Self {
            view,
            seeds,
            batch_size,
            drop_last: false,
        }
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }
}

/// Edge sampling weights for the prev and cur views (org is always uniform).
#[derive(Debug, Clone, Copy)]
pub struct ViewWeights<'a> {
    pub prev: &'a [f32],
    pub cur: &'a [f32],
}

impl<'a> ViewWeights<'a> {
    pub fn from_masks(masks: &'a MaskSet) -> Self {
        Self {
            prev: masks.edge_weights(View::Prev).unwrap_or_default(),
            cur: masks.edge_weights(View::Cur).unwrap_or_default(),
        }
    }

    pub fn for_view(&self, view: View) -> Option<&'a [f32]> {
        match view {
            View::Org => None,
            View::Prev => Some(self.prev),
            View::Cur => Some(self.cur),
        }
    }
}

/// Aligned `(org, prev, cur)` views for one step.
#[derive(Debug, Clone, Copy)]
pub struct ViewTriple<'a> {
    pub org: &'a SampledView,
    pub prev: &'a SampledView,
    pub cur: &'a SampledView,
}

impl<'a> ViewTriple<'a> {
    /// The seed batch shared by all three views.
    pub fn seeds(&self) -> &'a [NodeId] {
        &self.org.output_nodes
    }

    pub fn view(&self, view: View) -> &'a SampledView {
        match view {
            View::Org => self.org,
            View::Prev => self.prev,
            View::Cur => self.cur,
        }
    }
}

/// One epoch worth of drained, index-aligned batches.
#[derive(Debug, Clone)]
pub struct AlignedEpoch {
    org: Vec<SampledView>,
    prev: Vec<SampledView>,
    cur: Vec<SampledView>,
    mask_version: u64,
}

impl AlignedEpoch {
    pub fn len(&self) -> usize {
        self.org.len()
    }

    pub fn is_empty(&self) -> bool {
        self.org.is_empty()
    }

    /// Mask version the prev/cur views were sampled from.
    pub fn mask_version(&self) -> u64 {
        self.mask_version
    }

    pub fn get(&self, step: usize) -> Option<ViewTriple<'_>> {
        Some(ViewTriple {
            org: self.org.get(step)?,
            prev: self.prev.get(step)?,
            cur: self.cur.get(step)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = ViewTriple<'_>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

impl<'a> IntoIterator for &'a AlignedEpoch {
    type Item = ViewTriple<'a>;
    type IntoIter = Box<dyn Iterator<Item = ViewTriple<'a>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Drives three neighbor samplers over one shared seed order.
#[derive(Debug, Clone)]
pub struct MultiViewLoader {
    store: Arc<GraphViewStore>,
    sampler: NeighborSampler,
    seeds: Vec<NodeId>,
    batch_size: usize,
    drop_last: bool,
    shuffle: bool,
}

impl MultiViewLoader {
    /// Build a loader from one config per view.
    ///
    /// Fails with [`Error::Alignment`] if the configs disagree on seeds, batch
    /// size or `drop_last`, or do not cover org, prev and cur in that order.
    pub fn new(
        store: Arc<GraphViewStore>,
        configs: [ViewLoaderConfig; 3],
        fanout: Vec<usize>,
        shuffle: bool,
    ) -> Result<Self> {
        for (config, expected) in configs.iter().zip(View::ALL) {
            if config.view != expected {
                return Err(Error::Alignment(format!(
                    "expected a {expected} loader in this slot, got {}",
                    config.view
                )));
            }
        }

        let [org, prev, cur] = configs;
        let mut reference = org.seeds.clone();
        reference.sort_unstable();
        for other in [&prev, &cur] {
            if other.seeds.len() != org.seeds.len() {
                return Err(Error::Alignment(format!(
                    "{} loader has {} seeds, org has {}",
                    other.view,
                    other.seeds.len(),
                    org.seeds.len()
                )));
            }
            let mut sorted = other.seeds.clone();
            sorted.sort_unstable();
            if sorted != reference {
                return Err(Error::Alignment(format!(
                    "{} loader seeds differ from org seeds",
                    other.view
                )));
            }
            if other.batch_size != org.batch_size || other.drop_last != org.drop_last {
                return Err(Error::Alignment(format!(
                    "{} loader batching ({}, drop_last={}) differs from org ({}, drop_last={})",
                    other.view, other.batch_size, other.drop_last, org.batch_size, org.drop_last
                )));
            }
        }

        if org.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if fanout.is_empty() {
            return Err(Error::InvalidConfig("fan-out schedule is empty".into()));
        }
        if let Some(&bad) = org.seeds.iter().find(|&&s| s >= store.num_nodes()) {
            return Err(Error::Dataset(format!("seed node {bad} not in graph")));
        }

        Ok(Self {
            store,
            sampler: NeighborSampler::new(fanout),
            seeds: org.seeds,
            batch_size: org.batch_size,
            drop_last: org.drop_last,
            shuffle,
        })
    }

    /// Loader whose three views share `seeds` and batching by construction.
    pub fn single(
        store: Arc<GraphViewStore>,
        seeds: Vec<NodeId>,
        batch_size: usize,
        fanout: Vec<usize>,
        shuffle: bool,
        drop_last: bool,
    ) -> Result<Self> {
        let configs = View::ALL.map(|view| {
            ViewLoaderConfig::new(view, seeds.clone(), batch_size).with_drop_last(drop_last)
        });
        Self::new(store, configs, fanout, shuffle)
    }

    pub fn store(&self) -> &Arc<GraphViewStore> {
        &self.store
    }

    /// Steps per epoch: `ceil(n / b)`, or `floor(n / b)` with `drop_last`.
    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.seeds.len() / self.batch_size
        } else {
            self.seeds.len().div_ceil(self.batch_size)
        }
    }

    /// The seed order for an epoch: one permutation shared by all views.
    pub fn seed_order(&self, seed: u64) -> Vec<NodeId> {
        let mut order = self.seeds.clone();
        if self.shuffle {
            let mut rng = XorShiftRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        order
    }

    /// Index ranges into the seed order, one per step.
    pub fn batch_bounds(&self) -> Vec<Range<usize>> {
        let n = self.seeds.len();
        (0..self.num_batches())
            .map(|i| {
                let start = i * self.batch_size;
                start..(start + self.batch_size).min(n)
            })
            .collect()
    }

    /// Drain a full epoch against the current masks.
    pub fn epoch(&self, seed: u64) -> Result<AlignedEpoch> {
        let (version, masks) = self.store.masks().current()?;
        self.drain_with(&ViewWeights::from_masks(&masks), version, seed, None)
    }

    /// Drain with explicit prev/cur weights, e.g. to score a candidate mask.
    ///
    /// `limit` caps the number of steps for all views alike.
    pub fn drain_with(
        &self,
        weights: &ViewWeights<'_>,
        mask_version: u64,
        seed: u64,
        limit: Option<usize>,
    ) -> Result<AlignedEpoch> {
        let order = self.seed_order(seed);
        let mut bounds = self.batch_bounds();
        if let Some(limit) = limit {
            bounds.truncate(limit);
        }

        let arenas = View::ALL
            .as_slice()
            .par_iter()
            .map(|&view| {
                let mut rng = XorShiftRng::seed_from_u64(stream_seed(seed, view));
                bounds
                    .iter()
                    .map(|range| {
                        self.sampler.sample(
                            &self.store,
                            &order[range.clone()],
                            weights.for_view(view),
                            &mut rng,
                        )
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let [org, prev, cur]: [Vec<SampledView>; 3] = arenas
            .try_into()
            .map_err(|_| Error::Alignment("expected exactly three view arenas".into()))?;
        check_aligned(&org, &prev, &cur)?;

        tracing::debug!(
            steps = org.len(),
            mask_version,
            shuffle = self.shuffle,
            "drained aligned views"
        );
        Ok(AlignedEpoch {
            org,
            prev,
            cur,
            mask_version,
        })
    }
}

/// Independent RNG stream per view, derived from the epoch seed.
fn stream_seed(seed: u64, view: View) -> u64 {
    let salt = (view.index() as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    seed ^ salt
}

fn check_aligned(org: &[SampledView], prev: &[SampledView], cur: &[SampledView]) -> Result<()> {
    if org.len() != prev.len() || org.len() != cur.len() {
        return Err(Error::Alignment(format!(
            "batch counts differ: org={}, prev={}, cur={}",
            org.len(),
            prev.len(),
            cur.len()
        )));
    }
    for (step, ((o, p), c)) in org.iter().zip(prev).zip(cur).enumerate() {
        if o.output_nodes != p.output_nodes || o.output_nodes != c.output_nodes {
            return Err(Error::Alignment(format!(
                "destination nodes differ at step {step}"
            )));
        }
    }
    Ok(())
}
