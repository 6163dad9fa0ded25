//! Node partitioning and per-worker seed splits.
//!
//! Nodes are assigned to partitions in contiguous id ranges. A partition owns
//! its nodes and every edge whose destination it owns, which is what makes the
//! augmentation commit single-writer per partition.
//!
//! ```text
//! bounds = [0, 4, 8, 10]
//! part 0 -> nodes 0..4
//! part 1 -> nodes 4..8
//! part 2 -> nodes 8..10
//! ```

use crate::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Maps global node ids to partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBook {
    bounds: Vec<usize>,
}

impl PartitionBook {
    /// Split `num_nodes` into `num_parts` contiguous ranges whose sizes differ by at most one.
    pub fn contiguous(num_nodes: usize, num_parts: usize) -> Result<Self> {
        if num_parts == 0 {
            return Err(Error::Partition("num_parts must be at least 1".into()));
        }
        if num_parts > num_nodes.max(1) {
            return Err(Error::Partition(format!(
                "cannot split {num_nodes} nodes into {num_parts} partitions"
            )));
        }
        let base = num_nodes / num_parts;
        let extra = num_nodes % num_parts;
        let mut bounds = Vec::with_capacity(num_parts + 1);
        bounds.push(0);
        for p in 0..num_parts {
            let size = base + usize::from(p < extra);
            bounds.push(bounds[p] + size);
        }
        Ok(Self { bounds })
    }

    pub fn num_parts(&self) -> usize {
        self.bounds.len() - 1
    }

    pub fn num_nodes(&self) -> usize {
        self.bounds.last().copied().unwrap_or(0)
    }

    /// Partition owning `node`, or `None` if the id is out of range.
    #[must_use]
    pub fn partition_of(&self, node: NodeId) -> Option<usize> {
        if node >= self.num_nodes() {
            return None;
        }
        // bounds is sorted; the owner is the last bound <= node
        Some(self.bounds.partition_point(|&b| b <= node) - 1)
    }

    /// Global id range owned by partition `part`.
    pub fn part_nodes(&self, part: usize) -> Result<Range<NodeId>> {
        if part >= self.num_parts() {
            return Err(Error::Partition(format!(
                "partition {part} out of range (have {})",
                self.num_parts()
            )));
        }
        Ok(self.bounds[part]..self.bounds[part + 1])
    }

    /// Partition-local id of a global node, if `part` owns it.
    #[must_use]
    pub fn local_id(&self, part: usize, node: NodeId) -> Option<usize> {
        let range = self.part_nodes(part).ok()?;
        range.contains(&node).then(|| node - range.start)
    }

    #[must_use]
    pub fn is_local(&self, part: usize, node: NodeId) -> bool {
        self.local_id(part, node).is_some()
    }
}

/// Split the nodes selected by `mask` for trainer `rank`.
///
/// With `force_even`, all selected nodes are dealt out in id order so that
/// every rank gets the same count to within one, regardless of locality.
/// Without it, a rank gets exactly the selected nodes its partition owns.
pub fn node_split(
    mask: &[bool],
    book: &PartitionBook,
    rank: usize,
    force_even: bool,
) -> Result<Vec<NodeId>> {
    if mask.len() != book.num_nodes() {
        return Err(Error::Partition(format!(
            "mask covers {} nodes, partition book covers {}",
            mask.len(),
            book.num_nodes()
        )));
    }
    let parts = book.num_parts();
    if rank >= parts {
        return Err(Error::Partition(format!(
            "rank {rank} out of range (have {parts} partitions)"
        )));
    }

    if !force_even {
        let range = book.part_nodes(rank)?;
        return Ok(range.filter(|&n| mask[n]).collect());
    }

    let selected: Vec<NodeId> = (0..mask.len()).filter(|&n| mask[n]).collect();
    let base = selected.len() / parts;
    let extra = selected.len() % parts;
    let start = rank * base + rank.min(extra);
    let len = base + usize::from(rank < extra);
    Ok(selected[start..start + len].to_vec())
}

/// Pad `nids` to `len` by cycling from the front, so every worker runs the
/// same number of batches. Empty inputs stay empty.
pub fn pad_to(nids: &mut Vec<NodeId>, len: usize) {
    if nids.is_empty() || nids.len() >= len {
        return;
    }
    let original = nids.len();
    for i in 0..len - original {
        nids.push(nids[i % original]);
    }
}
