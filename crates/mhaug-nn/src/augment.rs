//! Metropolis-Hastings graph augmentation.
//!
//! Once per outer iteration a worker proposes a new augmentation strength,
//! materializes candidate masks for the edges and nodes its partition owns,
//! scores the frozen model on them and accepts or rejects:
//!
//! ```text
//! strength  s = (edge_drop, node_drop), reflected random walk in [0, max_drop]^2
//! target    log p(s) = -|s - mu|^2 / (2 sigma^2) - lambda * D(s)
//! D(s)      mean KL(softmax(org) || softmax(view under s)) over scored seeds
//! accept    u < min(1, exp(log p(candidate) - log p(current)))
//! ```
//!
//! On acceptance the candidate is committed (`prev <- cur`, `cur <- candidate`)
//! and the view that stays closer to org becomes the consistency teacher.
//! Nothing is written while proposals are being rejected; the loop gives up
//! after `max_attempts` proposals or `timeout_secs`.

use crate::config::AugmentConfig;
use crate::loss::{kl_divergence, ConsistencyMode};
use crate::model::{view_inputs, NodeClassifier};
use crate::{Error, Result};
use candle_core::Device;
use mhaug_core::{
    AlignedEpoch, EdgeId, GraphViewStore, MaskKind, MaskPatch, MaskSet, MultiViewLoader, NodeId,
    View, ViewWeights,
};
use rand::prelude::*;
use rand_xorshift::XorShiftRng;
use std::ops::Range;
use std::time::Instant;

/// Drop ratios of one augmentation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AugmentStrength {
    pub edge_drop: f64,
    pub node_drop: f64,
}

impl AugmentStrength {
    /// Symmetric random-walk proposal, reflected into `[0, max_drop]`.
    pub fn propose<R: Rng + ?Sized>(&self, step: f64, max_drop: f64, rng: &mut R) -> Self {
        let mut jitter = |x: f64| reflect(x + rng.gen_range(-1.0..=1.0) * step, max_drop);
        Self {
            edge_drop: jitter(self.edge_drop),
            node_drop: jitter(self.node_drop),
        }
    }
}

/// Fold `x` back into `[0, max]`.
fn reflect(x: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    let period = 2.0 * max;
    let folded = x.rem_euclid(period);
    if folded > max {
        period - folded
    } else {
        folded
    }
}

/// A strength together with its measured divergence from org.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalScore {
    pub edge_drop: f64,
    pub node_drop: f64,
    pub divergence: f64,
}

impl ProposalScore {
    fn new(strength: AugmentStrength, divergence: f64) -> Self {
        Self {
            edge_drop: strength.edge_drop,
            node_drop: strength.node_drop,
            divergence,
        }
    }
}

/// Decides how likely a candidate is to replace the current state.
pub trait AcceptanceRule: Send {
    /// Acceptance probability in `[0, 1]`.
    fn ratio(&self, current: &ProposalScore, candidate: &ProposalScore) -> f64;
}

/// Unnormalized log target density over strengths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MhTarget {
    pub mu_edge: f64,
    pub mu_node: f64,
    pub sigma: f64,
    pub lambda: f64,
}

impl MhTarget {
    pub fn from_config(config: &AugmentConfig) -> Self {
        Self {
            mu_edge: config.target_edge_drop,
            mu_node: config.target_node_drop,
            sigma: config.sigma,
            lambda: config.lambda,
        }
    }

    pub fn log_density(&self, score: &ProposalScore) -> f64 {
        let de = score.edge_drop - self.mu_edge;
        let dn = score.node_drop - self.mu_node;
        -(de * de + dn * dn) / (2.0 * self.sigma * self.sigma) - self.lambda * score.divergence
    }
}

/// Metropolis-Hastings rule for a symmetric proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetropolisHastings {
    pub target: MhTarget,
}

impl AcceptanceRule for MetropolisHastings {
    fn ratio(&self, current: &ProposalScore, candidate: &ProposalScore) -> f64 {
        let log_alpha = self.target.log_density(candidate) - self.target.log_density(current);
        log_alpha.min(0.0).exp()
    }
}

/// Constant acceptance probability, for ablations and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRatio(pub f64);

impl AcceptanceRule for FixedRatio {
    fn ratio(&self, _current: &ProposalScore, _candidate: &ProposalScore) -> f64 {
        self.0
    }
}

/// Outcome of one accepted augmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// View whose predictions act as the consistency target.
    pub teacher: View,
    /// Mask version after the commit (unchanged in a dry run).
    pub version: u64,
    /// Proposals evaluated, including the accepted one.
    pub attempts: usize,
    /// Whether masks were written.
    pub committed: bool,
    pub strength: AugmentStrength,
    /// `D` of the view that becomes prev.
    pub prev_divergence: f64,
    /// `D` of the accepted candidate.
    pub cur_divergence: f64,
}

impl Decision {
    /// Consistency loss for the steps of this iteration.
    pub fn mode(&self, option_loss: u8) -> ConsistencyMode {
        ConsistencyMode::select(option_loss, self.teacher)
    }
}

/// Per-worker augmentation controller.
pub struct AugmentationController<A: AcceptanceRule = MetropolisHastings> {
    config: AugmentConfig,
    rule: A,
    device: Device,
    owned_edges: Vec<EdgeId>,
    owned_nodes: Range<NodeId>,
    strength: AugmentStrength,
    rng: XorShiftRng,
}

impl AugmentationController<MetropolisHastings> {
    /// Controller with the Metropolis-Hastings rule built from `config`.
    pub fn metropolis(
        config: AugmentConfig,
        store: &GraphViewStore,
        part: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        let rule = MetropolisHastings {
            target: MhTarget::from_config(&config),
        };
        Self::new(config, rule, store, part, device, seed)
    }
}

impl<A: AcceptanceRule> AugmentationController<A> {
    pub fn new(
        config: AugmentConfig,
        rule: A,
        store: &GraphViewStore,
        part: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let owned_nodes = store.partition_book().part_nodes(part)?;
        let owned_edges = store.owned_edges(part)?;
        Ok(Self {
            config,
            rule,
            device,
            owned_edges,
            owned_nodes,
            strength: AugmentStrength::default(),
            rng: XorShiftRng::seed_from_u64(seed),
        })
    }

    /// Strength of the currently accepted augmentation.
    pub fn strength(&self) -> AugmentStrength {
        self.strength
    }

    /// Run the acceptance loop until one candidate is accepted.
    ///
    /// `model` is only evaluated, never updated. `seed` fixes the scoring
    /// batches for this iteration.
    pub fn step(
        &mut self,
        model: &dyn NodeClassifier,
        loader: &MultiViewLoader,
        seed: u64,
    ) -> Result<Decision> {
        let store = loader.store();
        let (version, masks) = store.masks().current()?;
        let started = Instant::now();
        let timeout = self.config.timeout()?;
        let warn_after = self.config.max_attempts.saturating_mul(3) / 4;

        for attempt in 1..=self.config.max_attempts {
            let candidate = self.strength.propose(
                self.config.step,
                self.config.max_drop,
                &mut self.rng,
            );
            let patch = self.materialize(candidate);
            let (prev_divergence, cur_divergence) =
                self.score(model, loader, &masks, &patch, version, seed)?;

            let current = ProposalScore::new(self.strength, prev_divergence);
            let proposed = ProposalScore::new(candidate, cur_divergence);
            let alpha = self.rule.ratio(&current, &proposed).clamp(0.0, 1.0);
            let u: f64 = self.rng.gen();
            tracing::debug!(
                attempt,
                edge_drop = candidate.edge_drop,
                node_drop = candidate.node_drop,
                prev_divergence,
                cur_divergence,
                alpha,
                "augmentation proposal"
            );

            if u < alpha {
                let teacher = if prev_divergence <= cur_divergence {
                    View::Prev
                } else {
                    View::Cur
                };
                let (version, committed) = if self.config.commit {
                    self.strength = candidate;
                    (store.masks().commit(&patch)?, true)
                } else {
                    (version, false)
                };
                let (_, after) = store.masks().current()?;
                tracing::info!(
                    attempt,
                    version,
                    committed,
                    %teacher,
                    edge_drop = candidate.edge_drop,
                    node_drop = candidate.node_drop,
                    cur_edges_dropped = after.edge_drop_ratio(View::Cur),
                    cur_nodes_dropped = after.node_drop_ratio(View::Cur),
                    "augmentation accepted"
                );
                return Ok(Decision {
                    teacher,
                    version,
                    attempts: attempt,
                    committed,
                    strength: candidate,
                    prev_divergence,
                    cur_divergence,
                });
            }

            if attempt == warn_after {
                tracing::warn!(
                    attempt,
                    max_attempts = self.config.max_attempts,
                    "augmentation proposals keep getting rejected"
                );
            }
            if started.elapsed() >= timeout {
                return Err(Error::AcceptanceTimeout {
                    secs: started.elapsed().as_secs_f64(),
                    attempts: attempt,
                });
            }
        }

        Err(Error::AcceptanceExhausted {
            attempts: self.config.max_attempts,
        })
    }

    /// Draw keep/drop values for every owned edge and node.
    fn materialize(&mut self, strength: AugmentStrength) -> MaskPatch {
        let mut patch = MaskPatch::new();
        let keep_edge = 1.0 - strength.edge_drop;
        let keep_node = 1.0 - strength.node_drop;
        for &edge in &self.owned_edges {
            let w = if self.rng.gen_bool(keep_edge) { 1.0 } else { 0.0 };
            patch.push_edge(edge, w);
        }
        for node in self.owned_nodes.clone() {
            let w = if self.rng.gen_bool(keep_node) { 1.0 } else { 0.0 };
            patch.push_node(node, w);
        }
        patch
    }

    /// `(D(prev), D(candidate))`; the prev side is the current `cur` mask.
    fn score(
        &self,
        model: &dyn NodeClassifier,
        loader: &MultiViewLoader,
        masks: &MaskSet,
        patch: &MaskPatch,
        version: u64,
        seed: u64,
    ) -> Result<(f64, f64)> {
        let cur_edges = masks.get(View::Cur, MaskKind::Edge);
        let candidate_edges = patch.candidate_edge_weights(masks);
        let weights = ViewWeights {
            prev: cur_edges,
            cur: &candidate_edges,
        };
        let epoch = loader.drain_with(&weights, version, seed, Some(self.config.score_batches))?;

        let cur_nodes = masks.get(View::Cur, MaskKind::Node);
        let candidate_nodes = patch.candidate_node_weights(masks);
        divergences(
            model,
            loader.store(),
            &epoch,
            cur_nodes,
            &candidate_nodes,
            &self.device,
        )
    }
}

/// Seed-weighted mean divergence of the prev and cur streams from org.
#[allow(clippy::cast_precision_loss)]
fn divergences(
    model: &dyn NodeClassifier,
    store: &GraphViewStore,
    epoch: &AlignedEpoch,
    prev_nmask: &[f32],
    cur_nmask: &[f32],
    device: &Device,
) -> Result<(f64, f64)> {
    let mut total = (0.0, 0.0);
    let mut seeds = 0usize;
    for triple in epoch {
        let org_x = view_inputs(store, triple.org, None, device)?;
        let prev_x = view_inputs(store, triple.prev, Some(prev_nmask), device)?;
        let cur_x = view_inputs(store, triple.cur, Some(cur_nmask), device)?;
        let org = model.forward_t(&triple.org.blocks, &org_x, false)?.detach();
        let prev = model.forward_t(&triple.prev.blocks, &prev_x, false)?.detach();
        let cur = model.forward_t(&triple.cur.blocks, &cur_x, false)?.detach();

        let n = triple.seeds().len();
        total.0 += f64::from(kl_divergence(&org, &prev)?.to_scalar::<f32>()?) * n as f64;
        total.1 += f64::from(kl_divergence(&org, &cur)?.to_scalar::<f32>()?) * n as f64;
        seeds += n;
    }
    if seeds == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((total.0 / seeds as f64, total.1 / seeds as f64))
}
