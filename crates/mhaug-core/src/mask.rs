//! Versioned node and edge masks for the three graph views.
//!
//! Every edge and node carries one scalar weight per view:
//!
//! | View | Edge mask    | Node mask    | Writable |
//! |------|--------------|--------------|----------|
//! | org  | `org_emask`  | `org_nmask`  | no (all ones) |
//! | prev | `prev_emask` | `prev_nmask` | by commit |
//! | cur  | `cur_emask`  | `cur_nmask`  | by commit |
//!
//! Edge masks are unnormalized sampling weights; node masks scale the input
//! features of the corresponding view.
//!
//! [`MaskStore`] is the only owner of the masks. Readers take a snapshot
//! `(version, Arc<MaskSet>)`; a commit installs a new set and bumps the
//! version, so a reader holding an older snapshot can tell it is stale.

use crate::{EdgeId, Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

/// One of the three parallel views sampled every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// Unaugmented baseline, uniform sampling.
    Org,
    /// Previously accepted augmentation.
    Prev,
    /// Currently accepted augmentation.
    Cur,
}

impl View {
    /// All views, in loader order.
    pub const ALL: [View; 3] = [View::Org, View::Prev, View::Cur];

    pub fn name(self) -> &'static str {
        match self {
            View::Org => "org",
            View::Prev => "prev",
            View::Cur => "cur",
        }
    }

    /// Name of the edge attribute used as sampling probability (`None` = uniform).
    pub fn prob_attr(self) -> Option<&'static str> {
        match self {
            View::Org => None,
            View::Prev => Some("prev_emask"),
            View::Cur => Some("cur_emask"),
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            View::Org => 0,
            View::Prev => 1,
            View::Cur => 2,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a mask is indexed by edge or by node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskKind {
    Edge,
    Node,
}

/// Dense masks for all views.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskSet {
    emask: [Vec<f32>; 3],
    nmask: [Vec<f32>; 3],
}

impl MaskSet {
    /// All-ones masks for every view.
    pub fn ones(num_nodes: usize, num_edges: usize) -> Self {
        Self {
            emask: [
                vec![1.0; num_edges],
                vec![1.0; num_edges],
                vec![1.0; num_edges],
            ],
            nmask: [
                vec![1.0; num_nodes],
                vec![1.0; num_nodes],
                vec![1.0; num_nodes],
            ],
        }
    }

    pub fn num_edges(&self) -> usize {
        self.emask[0].len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nmask[0].len()
    }

    /// The mask of `kind` for `view`.
    pub fn get(&self, view: View, kind: MaskKind) -> &[f32] {
        match kind {
            MaskKind::Edge => &self.emask[view.index()],
            MaskKind::Node => &self.nmask[view.index()],
        }
    }

    /// Edge sampling weights for `view`; `None` means uniform.
    pub fn edge_weights(&self, view: View) -> Option<&[f32]> {
        view.prob_attr().map(|_| self.emask[view.index()].as_slice())
    }

    /// Fraction of edges with zero weight in `view`.
    pub fn edge_drop_ratio(&self, view: View) -> f64 {
        drop_ratio(&self.emask[view.index()])
    }

    /// Fraction of nodes with zero weight in `view`.
    pub fn node_drop_ratio(&self, view: View) -> f64 {
        drop_ratio(&self.nmask[view.index()])
    }

    fn slot_mut(&mut self, view: View, kind: MaskKind) -> &mut Vec<f32> {
        match kind {
            MaskKind::Edge => &mut self.emask[view.index()],
            MaskKind::Node => &mut self.nmask[view.index()],
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn drop_ratio(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|&&w| w == 0.0).count() as f64 / values.len() as f64
}

fn check_weight(w: f32) -> Result<()> {
    if w.is_finite() && w >= 0.0 {
        Ok(())
    } else {
        Err(Error::Mask(format!("mask weight {w} is not a finite non-negative number")))
    }
}

/// A candidate mask state for the entries one partition owns.
///
/// Committing a patch shifts `cur` into `prev` for the listed ids and writes the
/// new values into `cur`. Ids not listed are left alone, so patches from
/// different partitions never overwrite each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskPatch {
    edges: Vec<(EdgeId, f32)>,
    nodes: Vec<(NodeId, f32)>,
}

impl MaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_edge(&mut self, edge: EdgeId, weight: f32) {
        self.edges.push((edge, weight));
    }

    pub fn push_node(&mut self, node: NodeId, weight: f32) {
        self.nodes.push((node, weight));
    }

    pub fn edges(&self) -> &[(EdgeId, f32)] {
        &self.edges
    }

    pub fn nodes(&self) -> &[(NodeId, f32)] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.nodes.is_empty()
    }

    /// Apply the patch on top of `base`'s current view, producing the cur edge weights
    /// a loader should use to score this candidate.
    pub fn candidate_edge_weights(&self, base: &MaskSet) -> Vec<f32> {
        let mut weights = base.get(View::Cur, MaskKind::Edge).to_vec();
        for &(e, w) in &self.edges {
            if let Some(slot) = weights.get_mut(e) {
                *slot = w;
            }
        }
        weights
    }

    /// Same as [`Self::candidate_edge_weights`] for node masks.
    pub fn candidate_node_weights(&self, base: &MaskSet) -> Vec<f32> {
        let mut weights = base.get(View::Cur, MaskKind::Node).to_vec();
        for &(n, w) in &self.nodes {
            if let Some(slot) = weights.get_mut(n) {
                *slot = w;
            }
        }
        weights
    }

    fn validate(&self, masks: &MaskSet) -> Result<()> {
        for &(e, w) in &self.edges {
            if e >= masks.num_edges() {
                return Err(Error::Mask(format!("edge {e} out of range")));
            }
            check_weight(w)?;
        }
        for &(n, w) in &self.nodes {
            if n >= masks.num_nodes() {
                return Err(Error::Mask(format!("node {n} out of range")));
            }
            check_weight(w)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Snapshot {
    version: u64,
    masks: Arc<MaskSet>,
}

/// Shared, versioned owner of the view masks.
#[derive(Debug)]
pub struct MaskStore {
    state: RwLock<Snapshot>,
}

impl MaskStore {
    /// Start at version 0 with the given masks.
    pub fn new(masks: MaskSet) -> Self {
        Self {
            state: RwLock::new(Snapshot {
                version: 0,
                masks: Arc::new(masks),
            }),
        }
    }

    /// Current version and masks.
    pub fn current(&self) -> Result<(u64, Arc<MaskSet>)> {
        let state = self
            .state
            .read()
            .map_err(|_| Error::Mask("mask store lock poisoned".into()))?;
        Ok((state.version, Arc::clone(&state.masks)))
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.current()?.0)
    }

    /// Atomically commit `patch`: `prev <- cur`, `cur <- patch` for the listed ids.
    ///
    /// The patch is validated before anything is written; on error the store is
    /// unchanged. Returns the new version.
    pub fn commit(&self, patch: &MaskPatch) -> Result<u64> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Mask("mask store lock poisoned".into()))?;
        patch.validate(&state.masks)?;

        let masks = Arc::make_mut(&mut state.masks);
        for &(e, w) in &patch.edges {
            let cur = masks.emask[View::Cur.index()][e];
            masks.emask[View::Prev.index()][e] = cur;
            masks.emask[View::Cur.index()][e] = w;
        }
        for &(n, w) in &patch.nodes {
            let cur = masks.nmask[View::Cur.index()][n];
            masks.nmask[View::Prev.index()][n] = cur;
            masks.nmask[View::Cur.index()][n] = w;
        }
        state.version += 1;
        Ok(state.version)
    }

    /// Replace a whole prev/cur mask. The org view is immutable.
    pub fn overwrite(&self, view: View, kind: MaskKind, values: Vec<f32>) -> Result<u64> {
        if view == View::Org {
            return Err(Error::Mask("org masks are immutable".into()));
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Mask("mask store lock poisoned".into()))?;
        let expected = state.masks.get(view, kind).len();
        if values.len() != expected {
            return Err(Error::Mask(format!(
                "{view} {kind:?} mask needs {expected} values, got {}",
                values.len()
            )));
        }
        for &w in &values {
            check_weight(w)?;
        }
        *Arc::make_mut(&mut state.masks).slot_mut(view, kind) = values;
        state.version += 1;
        Ok(state.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ones_and_weights() {
        let masks = MaskSet::ones(3, 4);
        assert_eq!(masks.get(View::Org, MaskKind::Edge), &[1.0; 4]);
        assert!(masks.edge_weights(View::Org).is_none());
        assert_eq!(masks.edge_weights(View::Cur).unwrap().len(), 4);
        assert_eq!(masks.edge_drop_ratio(View::Cur), 0.0);
    }

    #[test]
    fn test_commit_shifts_cur_into_prev() {
        let store = MaskStore::new(MaskSet::ones(2, 3));
        let mut first = MaskPatch::new();
        first.push_edge(1, 0.0);
        first.push_node(0, 0.0);
        assert_eq!(store.commit(&first).unwrap(), 1);

        let (_, masks) = store.current().unwrap();
        assert_eq!(masks.get(View::Cur, MaskKind::Edge), &[1.0, 0.0, 1.0]);
        assert_eq!(masks.get(View::Prev, MaskKind::Edge), &[1.0, 1.0, 1.0]);
        assert_eq!(masks.get(View::Cur, MaskKind::Node), &[0.0, 1.0]);
        assert_eq!(masks.node_drop_ratio(View::Cur), 0.5);
        assert!((masks.edge_drop_ratio(View::Cur) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(masks.node_drop_ratio(View::Prev), 0.0);

        let mut second = MaskPatch::new();
        second.push_edge(1, 1.0);
        assert_eq!(store.commit(&second).unwrap(), 2);
        let (version, masks) = store.current().unwrap();
        assert_eq!(version, 2);
        assert_eq!(masks.get(View::Prev, MaskKind::Edge), &[1.0, 0.0, 1.0]);
        assert_eq!(masks.get(View::Cur, MaskKind::Edge), &[1.0, 1.0, 1.0]);
        // org never moves
        assert_eq!(masks.get(View::Org, MaskKind::Edge), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_old_snapshot_is_untouched_by_commit() {
        let store = MaskStore::new(MaskSet::ones(1, 2));
        let (v0, before) = store.current().unwrap();
        let mut patch = MaskPatch::new();
        patch.push_edge(0, 0.0);
        store.commit(&patch).unwrap();
        let (v1, after) = store.current().unwrap();
        assert!(v1 > v0);
        assert_eq!(before.get(View::Cur, MaskKind::Edge), &[1.0, 1.0]);
        assert_eq!(after.get(View::Cur, MaskKind::Edge), &[0.0, 1.0]);
    }

    #[test]
    fn test_invalid_patch_leaves_store_unchanged() {
        let store = MaskStore::new(MaskSet::ones(1, 2));
        let mut patch = MaskPatch::new();
        patch.push_edge(0, 0.0);
        patch.push_edge(7, 1.0);
        assert!(store.commit(&patch).is_err());

        let mut negative = MaskPatch::new();
        negative.push_node(0, -1.0);
        assert!(store.commit(&negative).is_err());

        let (version, masks) = store.current().unwrap();
        assert_eq!(version, 0);
        assert_eq!(masks.get(View::Cur, MaskKind::Edge), &[1.0, 1.0]);
    }

    #[test]
    fn test_overwrite_rejects_org_and_bad_length() {
        let store = MaskStore::new(MaskSet::ones(2, 2));
        assert!(store.overwrite(View::Org, MaskKind::Edge, vec![0.0, 0.0]).is_err());
        assert!(store.overwrite(View::Prev, MaskKind::Edge, vec![0.0]).is_err());
        assert_eq!(
            store.overwrite(View::Prev, MaskKind::Node, vec![0.5, 2.0]).unwrap(),
            1
        );
    }

    #[test]
    fn test_candidate_weights() {
        let base = MaskSet::ones(2, 3);
        let mut patch = MaskPatch::new();
        patch.push_edge(2, 0.0);
        patch.push_node(1, 0.0);
        assert_eq!(patch.candidate_edge_weights(&base), vec![1.0, 1.0, 0.0]);
        assert_eq!(patch.candidate_node_weights(&base), vec![1.0, 0.0]);
    }
}
