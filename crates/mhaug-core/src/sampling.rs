//! Weighted neighbor sampling for mini-batch GNN training.
//!
//! Produces the layered "block" structure GraphSAGE-style training consumes.
//!
//! # Key Types
//!
//! - [`NeighborSampler`] - Multi-hop sampler with a fixed fan-out per layer
//! - [`Block`] - One bipartite hop: sources -> destinations
//! - [`SampledView`] - Blocks plus the input/output node lists of one view
//!
//! # Block Layout
//!
//! Sampling starts at the seeds and walks outward. Each hop's destination
//! nodes are a prefix of its source nodes, so a layer can read "self"
//! features by slicing the first `num_dst` rows:
//!
//! ```text
//! blocks[L-1]: src = [seeds..., hop-1 nbrs...]        dst = seeds
//! blocks[L-2]: src = [blocks[L-1].src..., hop-2 ...]  dst = blocks[L-1].src
//! ...
//! blocks[0]:   src = input nodes
//! ```
//!
//! The seed-side hop uses the *last* fan-out entry, so `fanout = [10, 25]`
//! samples 25 neighbors per seed and 10 per hop-1 node.
//!
//! # Weights
//!
//! With an edge-weight slice, neighbors are drawn without replacement with
//! probability proportional to weight; zero-weight edges are never drawn.
//! Without one, sampling is uniform.

use crate::graph::GraphViewStore;
use crate::{EdgeId, Error, NodeId, Result};
use rand::prelude::*;
use std::collections::HashMap;

/// Parse a comma separated fan-out schedule such as `"10,25"`.
///
/// `-1` means "take every neighbor".
pub fn parse_fanout(spec: &str) -> Result<Vec<usize>> {
    let fanout = spec
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<i64>() {
            Ok(-1) => Ok(usize::MAX),
            Ok(k) if k > 0 => usize::try_from(k)
                .map_err(|_| Error::InvalidConfig(format!("fan-out {k} too large"))),
            _ => Err(Error::InvalidConfig(format!(
                "invalid fan-out entry {s:?} in {spec:?}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    if fanout.is_empty() {
        return Err(Error::InvalidConfig(format!("empty fan-out {spec:?}")));
    }
    Ok(fanout)
}

/// One bipartite hop of a sampled subgraph.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Source nodes (global ids). The first `num_dst` are the destinations.
    pub src_nodes: Vec<NodeId>,
    /// Number of destination nodes.
    pub num_dst: usize,
    /// Edges as `(src_local, dst_local)`, message direction src -> dst.
    pub edges: Vec<(usize, usize)>,
    /// Global edge id of each entry in `edges`.
    pub edge_ids: Vec<EdgeId>,
}

impl Block {
    pub fn num_src(&self) -> usize {
        self.src_nodes.len()
    }

    pub fn num_dst(&self) -> usize {
        self.num_dst
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Destination nodes (global ids).
    pub fn dst_nodes(&self) -> &[NodeId] {
        &self.src_nodes[..self.num_dst]
    }
}

/// The sampled subgraph of one view for one seed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledView {
    /// Nodes whose features feed the first layer.
    pub input_nodes: Vec<NodeId>,
    /// The seed batch, in batch order.
    pub output_nodes: Vec<NodeId>,
    /// One block per layer, input side first.
    pub blocks: Vec<Block>,
}

impl SampledView {
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }
}

/// Multi-hop neighbor sampler for GraphSAGE-style mini-batch training.
///
/// # Example
///
/// ```rust
/// use mhaug_core::{GraphViewStore, PartitionBook};
/// use mhaug_core::sampling::NeighborSampler;
/// use rand::SeedableRng;
/// use rand_xorshift::XorShiftRng;
///
/// // 1 -> 0, 2 -> 0, 3 -> 1
/// let store = GraphViewStore::new(
///     4,
///     &[(1, 0), (2, 0), (3, 1)],
///     vec![0.0; 4],
///     1,
///     vec![0; 4],
///     PartitionBook::contiguous(4, 1).unwrap(),
/// )
/// .unwrap();
///
/// let sampler = NeighborSampler::new(vec![2, 2]);
/// let mut rng = XorShiftRng::seed_from_u64(42);
/// let view = sampler.sample(&store, &[0], None, &mut rng).unwrap();
///
/// assert_eq!(view.output_nodes, vec![0]);
/// assert_eq!(view.num_layers(), 2);
/// assert!(view.input_nodes.contains(&3));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSampler {
    /// Neighbors per layer, input side first; `usize::MAX` takes all.
    fanout: Vec<usize>,
}

impl NeighborSampler {
    /// Create a new sampler.
    ///
    /// # Arguments
    /// * `fanout` - Number of neighbors to sample per layer, input layer first
    pub fn new(fanout: Vec<usize>) -> Self {
        Self { fanout }
    }

    pub fn fanout(&self) -> &[usize] {
        &self.fanout
    }

    pub fn num_layers(&self) -> usize {
        self.fanout.len()
    }

    /// Sample the blocks for one seed batch.
    ///
    /// # Arguments
    /// * `store` - Graph to sample from
    /// * `seeds` - Destination nodes of the last layer
    /// * `weights` - Per-edge sampling weights (`None` = uniform)
    /// * `rng` - Random source; the caller owns the stream
    pub fn sample<R: Rng + ?Sized>(
        &self,
        store: &GraphViewStore,
        seeds: &[NodeId],
        weights: Option<&[f32]>,
        rng: &mut R,
    ) -> Result<SampledView> {
        if let Some(w) = weights {
            if w.len() != store.num_edges() {
                return Err(Error::Mask(format!(
                    "edge weights cover {} edges, graph has {}",
                    w.len(),
                    store.num_edges()
                )));
            }
        }
        if let Some(&bad) = seeds.iter().find(|&&s| s >= store.num_nodes()) {
            return Err(Error::Dataset(format!("seed node {bad} not in graph")));
        }

        let mut blocks = Vec::with_capacity(self.fanout.len());
        let mut dst: Vec<NodeId> = seeds.to_vec();

        for &k in self.fanout.iter().rev() {
            let mut src = dst.clone();
            let mut node_to_idx: HashMap<NodeId, usize> = HashMap::with_capacity(dst.len());
            for (i, &node) in dst.iter().enumerate() {
                node_to_idx.entry(node).or_insert(i);
            }

            let mut edges = Vec::new();
            let mut edge_ids = Vec::new();
            for (dst_idx, &node) in dst.iter().enumerate() {
                for (edge, neighbor) in sample_in_edges(store, node, k, weights, rng)? {
                    let src_idx = *node_to_idx.entry(neighbor).or_insert_with(|| {
                        src.push(neighbor);
                        src.len() - 1
                    });
                    edges.push((src_idx, dst_idx));
                    edge_ids.push(edge);
                }
            }

            blocks.push(Block {
                src_nodes: src.clone(),
                num_dst: dst.len(),
                edges,
                edge_ids,
            });
            dst = src;
        }

        blocks.reverse();
        Ok(SampledView {
            input_nodes: dst,
            output_nodes: seeds.to_vec(),
            blocks,
        })
    }
}

/// Draw up to `k` incoming edges of `node`.
fn sample_in_edges<R: Rng + ?Sized>(
    store: &GraphViewStore,
    node: NodeId,
    k: usize,
    weights: Option<&[f32]>,
    rng: &mut R,
) -> Result<Vec<(EdgeId, NodeId)>> {
    let candidates: Vec<(EdgeId, NodeId)> = store
        .in_edges(node)
        .filter(|(e, _)| weights.map_or(true, |w| w[*e] > 0.0))
        .collect();

    if candidates.len() <= k {
        return Ok(candidates);
    }

    match weights {
        None => Ok(candidates.choose_multiple(rng, k).copied().collect()),
        Some(w) => candidates
            .choose_multiple_weighted(rng, k, |(e, _)| f64::from(w[*e]))
            .map(|picked| picked.copied().collect())
            .map_err(|e| Error::Mask(format!("invalid sampling weights: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartitionBook;
    use rand_xorshift::XorShiftRng;
    use std::collections::HashSet;

    /// Star: nodes 1..=n all point at node 0.
    fn star(n: usize) -> GraphViewStore {
        let edges: Vec<_> = (1..=n).map(|i| (i, 0)).collect();
        GraphViewStore::new(
            n + 1,
            &edges,
            vec![0.0; n + 1],
            1,
            vec![0; n + 1],
            PartitionBook::contiguous(n + 1, 1).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_fanout() {
        assert_eq!(parse_fanout("10,25").unwrap(), vec![10, 25]);
        assert_eq!(parse_fanout(" 5 ").unwrap(), vec![5]);
        assert_eq!(parse_fanout("-1,3").unwrap(), vec![usize::MAX, 3]);
        assert!(parse_fanout("").is_err());
        assert!(parse_fanout("0").is_err());
        assert!(parse_fanout("a,3").is_err());
    }

    #[test]
    fn test_single_hop_respects_fanout() {
        let store = star(5);
        let sampler = NeighborSampler::new(vec![2]);
        let mut rng = XorShiftRng::seed_from_u64(42);
        let view = sampler.sample(&store, &[0], None, &mut rng).unwrap();

        assert_eq!(view.num_layers(), 1);
        let block = &view.blocks[0];
        assert_eq!(block.dst_nodes(), &[0]);
        assert_eq!(block.num_edges(), 2);
        assert_eq!(block.num_src(), 3);
        for &(s, d) in &block.edges {
            assert_eq!(d, 0);
            assert!(s >= 1);
        }
    }

    #[test]
    fn test_takes_all_when_degree_below_fanout() {
        let store = star(3);
        let sampler = NeighborSampler::new(vec![10]);
        let mut rng = XorShiftRng::seed_from_u64(1);
        let view = sampler.sample(&store, &[0], None, &mut rng).unwrap();
        assert_eq!(view.blocks[0].num_edges(), 3);
    }

    #[test]
    fn test_zero_weight_edges_never_sampled() {
        let store = star(6);
        // only edges 0 and 3 (sources 1 and 4) carry weight
        let weights = vec![1.0, 0.0, 0.0, 2.0, 0.0, 0.0];
        let sampler = NeighborSampler::new(vec![4]);
        for seed in 0..20 {
            let mut rng = XorShiftRng::seed_from_u64(seed);
            let view = sampler
                .sample(&store, &[0], Some(&weights), &mut rng)
                .unwrap();
            let ids: HashSet<_> = view.blocks[0].edge_ids.iter().copied().collect();
            assert_eq!(ids, HashSet::from([0, 3]));
        }
    }

    #[test]
    fn test_weighted_sampling_bounded_by_fanout() {
        let store = star(6);
        let weights = vec![1.0, 5.0, 0.5, 2.0, 3.0, 1.0];
        let sampler = NeighborSampler::new(vec![2]);
        let mut rng = XorShiftRng::seed_from_u64(9);
        let view = sampler
            .sample(&store, &[0], Some(&weights), &mut rng)
            .unwrap();
        assert_eq!(view.blocks[0].num_edges(), 2);
    }

    #[test]
    fn test_multi_hop_prefix_layout() {
        // 2 -> 1 -> 0, 3 -> 1
        let store = GraphViewStore::new(
            4,
            &[(1, 0), (2, 1), (3, 1)],
            vec![0.0; 4],
            1,
            vec![0; 4],
            PartitionBook::contiguous(4, 1).unwrap(),
        )
        .unwrap();
        let sampler = NeighborSampler::new(vec![usize::MAX, 1]);
        let mut rng = XorShiftRng::seed_from_u64(3);
        let view = sampler.sample(&store, &[0], None, &mut rng).unwrap();

        assert_eq!(view.num_layers(), 2);
        let (first, last) = (&view.blocks[0], &view.blocks[1]);
        assert_eq!(last.dst_nodes(), &[0]);
        assert_eq!(last.src_nodes, vec![0, 1]);
        // the input block's destinations are the last block's sources
        assert_eq!(first.dst_nodes(), last.src_nodes.as_slice());
        assert_eq!(view.input_nodes, first.src_nodes);
        assert!(view.input_nodes.contains(&2));
        assert!(view.input_nodes.contains(&3));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let store = star(2);
        let sampler = NeighborSampler::new(vec![1]);
        let mut rng = XorShiftRng::seed_from_u64(0);
        assert!(sampler.sample(&store, &[9], None, &mut rng).is_err());
        assert!(sampler
            .sample(&store, &[0], Some(&[1.0]), &mut rng)
            .is_err());
    }
}
