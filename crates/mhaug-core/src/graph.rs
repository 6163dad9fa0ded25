//! The graph view store: fixed topology, node features, labels and masks.
//!
//! Topology is a `petgraph` [`DiGraph`] whose edge index *is* the global edge
//! id, so mask vectors can be indexed directly by `EdgeIndex::index()`.
//! Messages flow along edge direction: the neighbors sampled for a node are
//! the sources of its incoming edges.

use crate::mask::{MaskKind, MaskSet, MaskStore, View};
use crate::partition::PartitionBook;
use crate::{EdgeId, Error, NodeId, Result};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::BTreeSet;

/// Summary statistics about a store.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStats {
    pub num_nodes: usize,
    pub num_edges: usize,
    pub feature_dim: usize,
    pub num_classes: usize,
    pub num_parts: usize,
    pub avg_in_degree: f64,
    pub max_in_degree: usize,
    /// Nodes without incoming edges (they only ever aggregate themselves).
    pub isolated: usize,
}

/// A partitioned graph with per-view masks.
#[derive(Debug)]
pub struct GraphViewStore {
    graph: DiGraph<(), ()>,
    features: Vec<f32>,
    feature_dim: usize,
    labels: Vec<u32>,
    partitions: PartitionBook,
    masks: MaskStore,
}

impl GraphViewStore {
    /// Build a store from an edge list `(src, dst)`.
    ///
    /// `features` is row-major `num_nodes x feature_dim`. All masks start at one.
    pub fn new(
        num_nodes: usize,
        edges: &[(NodeId, NodeId)],
        features: Vec<f32>,
        feature_dim: usize,
        labels: Vec<u32>,
        partitions: PartitionBook,
    ) -> Result<Self> {
        if features.len() != num_nodes * feature_dim {
            return Err(Error::Dataset(format!(
                "expected {} feature values ({num_nodes} x {feature_dim}), got {}",
                num_nodes * feature_dim,
                features.len()
            )));
        }
        if labels.len() != num_nodes {
            return Err(Error::Dataset(format!(
                "expected {num_nodes} labels, got {}",
                labels.len()
            )));
        }
        if partitions.num_nodes() != num_nodes {
            return Err(Error::Partition(format!(
                "partition book covers {} nodes, graph has {num_nodes}",
                partitions.num_nodes()
            )));
        }

        let mut graph = DiGraph::with_capacity(num_nodes, edges.len());
        for _ in 0..num_nodes {
            graph.add_node(());
        }
        for &(src, dst) in edges {
            if src >= num_nodes || dst >= num_nodes {
                return Err(Error::Dataset(format!(
                    "edge ({src}, {dst}) references a node outside 0..{num_nodes}"
                )));
            }
            graph.add_edge(NodeIndex::new(src), NodeIndex::new(dst), ());
        }

        let masks = MaskStore::new(MaskSet::ones(num_nodes, edges.len()));
        Ok(Self {
            graph,
            features,
            feature_dim,
            labels,
            partitions,
            masks,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn partition_book(&self) -> &PartitionBook {
        &self.partitions
    }

    /// The versioned mask owner.
    pub fn masks(&self) -> &MaskStore {
        &self.masks
    }

    /// Copy of the current `view`/`kind` mask.
    pub fn get_mask(&self, view: View, kind: MaskKind) -> Result<Vec<f32>> {
        let (_, masks) = self.masks.current()?;
        Ok(masks.get(view, kind).to_vec())
    }

    /// Replace a prev/cur mask wholesale. Returns the new mask version.
    pub fn set_mask(&self, view: View, kind: MaskKind, values: Vec<f32>) -> Result<u64> {
        self.masks.overwrite(view, kind, values)
    }

    /// Incoming edges of `node` as `(edge_id, source)` pairs.
    pub fn in_edges(&self, node: NodeId) -> impl Iterator<Item = (EdgeId, NodeId)> + '_ {
        self.graph
            .edges_directed(NodeIndex::new(node), Direction::Incoming)
            .map(|e| (e.id().index(), e.source().index()))
    }

    pub fn in_degree(&self, node: NodeId) -> usize {
        self.graph
            .edges_directed(NodeIndex::new(node), Direction::Incoming)
            .count()
    }

    /// `(src, dst)` of an edge.
    #[must_use]
    pub fn edge_endpoints(&self, edge: EdgeId) -> Option<(NodeId, NodeId)> {
        self.graph
            .edge_endpoints(EdgeIndex::new(edge))
            .map(|(s, d)| (s.index(), d.index()))
    }

    /// Edges owned by partition `part`: those whose destination it owns.
    pub fn owned_edges(&self, part: usize) -> Result<Vec<EdgeId>> {
        let range = self.partitions.part_nodes(part)?;
        let mut edges = Vec::new();
        for node in range {
            edges.extend(self.in_edges(node).map(|(e, _)| e));
        }
        edges.sort_unstable();
        Ok(edges)
    }

    /// Feature row of `node`.
    pub fn features(&self, node: NodeId) -> &[f32] {
        let start = node * self.feature_dim;
        &self.features[start..start + self.feature_dim]
    }

    /// Row-major features for `nodes`, each row scaled by `nmask[node]` if given.
    pub fn gather_features(&self, nodes: &[NodeId], nmask: Option<&[f32]>) -> Vec<f32> {
        let mut out = Vec::with_capacity(nodes.len() * self.feature_dim);
        for &node in nodes {
            let row = self.features(node);
            match nmask.map(|m| m[node]) {
                Some(scale) if scale != 1.0 => out.extend(row.iter().map(|x| x * scale)),
                _ => out.extend_from_slice(row),
            }
        }
        out
    }

    pub fn gather_labels(&self, nodes: &[NodeId]) -> Vec<u32> {
        nodes.iter().map(|&n| self.labels[n]).collect()
    }

    /// Number of classes: one past the largest label.
    ///
    /// Labels are expected to be dense in `0..k`; the distinct count is logged
    /// when it disagrees.
    pub fn num_classes(&self) -> usize {
        let max = self.labels.iter().copied().max().map_or(0, |m| m as usize + 1);
        let distinct = self.labels.iter().collect::<BTreeSet<_>>().len();
        if distinct != max {
            tracing::warn!(distinct, max, "labels are not dense, using max label + 1");
        }
        max
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> GraphStats {
        let n = self.num_nodes();
        let degrees: Vec<usize> = (0..n).map(|v| self.in_degree(v)).collect();
        GraphStats {
            num_nodes: n,
            num_edges: self.num_edges(),
            feature_dim: self.feature_dim,
            num_classes: self.num_classes(),
            num_parts: self.partitions.num_parts(),
            avg_in_degree: if n == 0 {
                0.0
            } else {
                self.num_edges() as f64 / n as f64
            },
            max_in_degree: degrees.iter().copied().max().unwrap_or(0),
            isolated: degrees.iter().filter(|&&d| d == 0).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_store() -> GraphViewStore {
        // 0 -> 1 -> 2, 2 -> 1
        let edges = vec![(0, 1), (1, 2), (2, 1)];
        let features = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        GraphViewStore::new(
            3,
            &edges,
            features,
            2,
            vec![0, 1, 1],
            PartitionBook::contiguous(3, 2).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_edge_ids_follow_insertion_order() {
        let store = path_store();
        assert_eq!(store.num_edges(), 3);
        assert_eq!(store.edge_endpoints(0), Some((0, 1)));
        assert_eq!(store.edge_endpoints(2), Some((2, 1)));

        let mut incoming: Vec<_> = store.in_edges(1).collect();
        incoming.sort_unstable();
        assert_eq!(incoming, vec![(0, 0), (2, 2)]);
    }

    #[test]
    fn test_owned_edges_by_destination() {
        let store = path_store();
        // partition 0 owns nodes 0..2, i.e. edges into 0 and 1
        assert_eq!(store.owned_edges(0).unwrap(), vec![0, 2]);
        assert_eq!(store.owned_edges(1).unwrap(), vec![1]);
    }

    #[test]
    fn test_gather_features_scales_by_node_mask() {
        let store = path_store();
        let plain = store.gather_features(&[2, 0], None);
        assert_eq!(plain, vec![1.0, 1.0, 1.0, 0.0]);

        let nmask = vec![0.0, 1.0, 0.5];
        let masked = store.gather_features(&[2, 0], Some(&nmask));
        assert_eq!(masked, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let result = GraphViewStore::new(
            2,
            &[(0, 5)],
            vec![0.0; 2],
            1,
            vec![0, 0],
            PartitionBook::contiguous(2, 1).unwrap(),
        );
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_set_mask_roundtrip() {
        let store = path_store();
        let v = store
            .set_mask(View::Cur, MaskKind::Edge, vec![0.0, 1.0, 0.5])
            .unwrap();
        assert_eq!(v, 1);
        assert_eq!(
            store.get_mask(View::Cur, MaskKind::Edge).unwrap(),
            vec![0.0, 1.0, 0.5]
        );
        assert!(store
            .set_mask(View::Org, MaskKind::Node, vec![1.0; 3])
            .is_err());
    }

    #[test]
    fn test_stats() {
        let stats = path_store().stats();
        assert_eq!(stats.num_nodes, 3);
        assert_eq!(stats.num_edges, 3);
        assert_eq!(stats.num_classes, 2);
        assert_eq!(stats.max_in_degree, 2);
        assert_eq!(stats.isolated, 1);
    }
}
