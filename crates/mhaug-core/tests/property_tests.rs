//! Property-based tests for the multi-view loader and its building blocks.
//!
//! These tests verify invariants that must hold for any graph and batching:
//! - Destination alignment across org/prev/cur
//! - Step counts independent of the probability source
//! - Zero-weight edges are never sampled
//! - Even seed splits

use mhaug_core::{
    node_split, pad_to, GraphViewStore, MaskKind, MultiViewLoader, PartitionBook, View,
    ViewWeights,
};
use proptest::prelude::*;
use std::sync::Arc;

/// Random graph with `n` nodes and edges drawn from the given pairs.
fn build_store(n: usize, pairs: &[(usize, usize)]) -> Arc<GraphViewStore> {
    let edges: Vec<_> = pairs.iter().map(|&(s, d)| (s % n, d % n)).collect();
    Arc::new(
        GraphViewStore::new(
            n,
            &edges,
            vec![0.0; n],
            1,
            vec![0; n],
            PartitionBook::contiguous(n, 1).unwrap(),
        )
        .unwrap(),
    )
}

fn arb_graph() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..40).prop_flat_map(|n| (Just(n), prop::collection::vec((0..n, 0..n), 0..120)))
}

mod loader_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn destinations_aligned_across_views(
            (n, pairs) in arb_graph(),
            batch_size in 1usize..10,
            shuffle in any::<bool>(),
            seed in any::<u64>(),
            weight_seed in any::<u64>(),
        ) {
            let store = build_store(n, &pairs);
            let m = store.num_edges();
            // arbitrary non-negative weights, some zero
            let prev: Vec<f32> = (0..m).map(|i| ((i as u64 ^ weight_seed) % 3) as f32).collect();
            let cur: Vec<f32> = (0..m).map(|i| ((i as u64 + weight_seed) % 4) as f32).collect();
            store.set_mask(View::Prev, MaskKind::Edge, prev).unwrap();
            store.set_mask(View::Cur, MaskKind::Edge, cur).unwrap();

            let seeds: Vec<usize> = (0..n).collect();
            let loader =
                MultiViewLoader::single(store, seeds, batch_size, vec![2, 3], shuffle, false)
                    .unwrap();
            let epoch = loader.epoch(seed).unwrap();

            for triple in &epoch {
                prop_assert_eq!(&triple.org.output_nodes, &triple.prev.output_nodes);
                prop_assert_eq!(&triple.org.output_nodes, &triple.cur.output_nodes);
                for view in View::ALL {
                    let sampled = triple.view(view);
                    let last = sampled.blocks.last().unwrap();
                    prop_assert_eq!(last.dst_nodes(), sampled.output_nodes.as_slice());
                }
            }
        }

        #[test]
        fn step_count_matches_batching(
            (n, pairs) in arb_graph(),
            batch_size in 1usize..12,
            drop_last in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let store = build_store(n, &pairs);
            let seeds: Vec<usize> = (0..n).collect();
            let loader = MultiViewLoader::single(store, seeds, batch_size, vec![1], true, drop_last)
                .unwrap();

            let expected = if drop_last { n / batch_size } else { n.div_ceil(batch_size) };
            prop_assert_eq!(loader.num_batches(), expected);

            // same count whether prev/cur weights are uniform, sparse or all zero
            let m = loader.store().num_edges();
            let ones = vec![1.0; m];
            let zeros = vec![0.0; m];
            for (prev, cur) in [(&ones, &ones), (&ones, &zeros), (&zeros, &zeros)] {
                let weights = ViewWeights { prev, cur };
                let epoch = loader.drain_with(&weights, 0, seed, None).unwrap();
                prop_assert_eq!(epoch.len(), expected);
            }
        }

        #[test]
        fn zero_weight_edges_never_sampled(
            (n, pairs) in arb_graph(),
            seed in any::<u64>(),
        ) {
            let store = build_store(n, &pairs);
            let m = store.num_edges();
            let cur: Vec<f32> = (0..m).map(|i| if i % 2 == 0 { 0.0 } else { 1.5 }).collect();
            let prev = vec![1.0; m];
            let seeds: Vec<usize> = (0..n).collect();
            let loader = MultiViewLoader::single(store, seeds, 4, vec![3, 3], true, false).unwrap();
            let weights = ViewWeights { prev: &prev, cur: &cur };
            let epoch = loader.drain_with(&weights, 0, seed, None).unwrap();

            for triple in &epoch {
                for block in &triple.cur.blocks {
                    prop_assert!(block.edge_ids.iter().all(|&e| cur[e] > 0.0));
                }
            }
        }
    }
}

mod split_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn force_even_split_is_balanced_and_disjoint(
            mask in prop::collection::vec(any::<bool>(), 4..200),
            parts in 1usize..4,
        ) {
            let book = PartitionBook::contiguous(mask.len(), parts).unwrap();
            let splits: Vec<Vec<usize>> = (0..parts)
                .map(|r| node_split(&mask, &book, r, true).unwrap())
                .collect();

            let sizes: Vec<usize> = splits.iter().map(Vec::len).collect();
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            prop_assert!(max - min <= 1);

            let mut all: Vec<usize> = splits.concat();
            all.sort_unstable();
            let expected: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
            prop_assert_eq!(all, expected);

            let mut padded = splits.clone();
            for split in &mut padded {
                pad_to(split, max);
            }
            for split in &padded {
                if !split.is_empty() {
                    prop_assert_eq!(split.len(), max);
                }
            }
        }
    }
}

#[test]
fn four_seeds_batch_two_yields_two_aligned_steps() {
    let store = build_store(6, &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0)]);
    let loader =
        MultiViewLoader::single(store, vec![1, 2, 3, 4], 2, vec![2], false, false).unwrap();
    let epoch = loader.epoch(123).unwrap();

    assert_eq!(epoch.len(), 2);
    let expected = [vec![1, 2], vec![3, 4]];
    for (triple, want) in epoch.iter().zip(expected.iter()) {
        assert_eq!(&triple.org.output_nodes, want);
        assert_eq!(&triple.prev.output_nodes, want);
        assert_eq!(&triple.cur.output_nodes, want);
    }
}
