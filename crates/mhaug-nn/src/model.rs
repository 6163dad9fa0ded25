//! GraphSAGE encoder over sampled blocks.
//!
//! Each [`SageConv`] consumes one [`Block`]: source features in, destination
//! features out. Because the block's destinations are a prefix of its
//! sources, the "self" term is a row slice of the input:
//!
//! ```text
//! h_dst' = W_self * h_src[..num_dst] + W_neigh * mean({h_src[j] : j -> dst})
//! ```

use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};
use mhaug_core::{Block, GraphViewStore, NodeId, SampledView};

/// A node classifier driven by sampled blocks.
///
/// `x` holds the features of `blocks[0]`'s source nodes; the result holds one
/// row of logits per destination node of the last block.
pub trait NodeClassifier: Send + Sync {
    fn forward_t(&self, blocks: &[Block], x: &Tensor, train: bool) -> Result<Tensor>;
}

/// Mean of the source rows of `x` over each destination's sampled in-edges.
///
/// Messages are gathered per edge and scattered onto destinations, so memory
/// grows with the number of sampled edges. Destinations without sampled
/// neighbors get an all-zero row.
pub fn mean_aggregate(block: &Block, x: &Tensor) -> Result<Tensor> {
    let (rows, dim) = (block.num_dst(), x.dim(1)?);
    if block.edges.is_empty() {
        return Ok(Tensor::zeros((rows, dim), x.dtype(), x.device())?);
    }
    let mut src = Vec::with_capacity(block.num_edges());
    let mut dst = Vec::with_capacity(block.num_edges());
    let mut degree = vec![0f32; rows];
    for &(s, d) in &block.edges {
        src.push(index_u32(s)?);
        dst.push(index_u32(d)?);
        *degree
            .get_mut(d)
            .ok_or_else(|| Error::Training(format!("edge targets row {d} of {rows}")))? += 1.0;
    }
    let inv_degree: Vec<f32> = degree
        .into_iter()
        .map(|d| if d > 0.0 { 1.0 / d } else { 0.0 })
        .collect();

    let device = x.device();
    let src = Tensor::from_vec(src, block.num_edges(), device)?;
    let dst = Tensor::from_vec(dst, block.num_edges(), device)?;
    let messages = x.index_select(&src, 0)?;
    let summed = Tensor::zeros((rows, dim), x.dtype(), device)?.index_add(&dst, &messages, 0)?;
    let scale = Tensor::from_vec(inv_degree, (rows, 1), device)?.to_dtype(x.dtype())?;
    Ok(summed.broadcast_mul(&scale)?)
}

fn index_u32(i: usize) -> Result<u32> {
    u32::try_from(i).map_err(|_| Error::Training(format!("block index {i} exceeds u32")))
}

/// GraphSAGE layer with a mean aggregator.
///
/// # Reference
///
/// Hamilton et al., "Inductive Representation Learning on Large Graphs",
/// NeurIPS 2017.
pub struct SageConv {
    lin_self: Linear,
    lin_neighbor: Linear,
}

impl SageConv {
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let lin_self = linear(in_features, out_features, vb.pp("lin_self"))?;
        let lin_neighbor = linear(in_features, out_features, vb.pp("lin_neighbor"))?;
        Ok(Self {
            lin_self,
            lin_neighbor,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `block`: the hop to aggregate over
    /// - `x`: source node features (num_src x in_features)
    ///
    /// # Returns
    /// - Destination node embeddings (num_dst x out_features)
    pub fn forward(&self, block: &Block, x: &Tensor) -> Result<Tensor> {
        let rows = x.dim(0)?;
        if rows != block.num_src() {
            return Err(Error::Training(format!(
                "block has {} source nodes but got {rows} feature rows",
                block.num_src()
            )));
        }
        let h_self = self.lin_self.forward(&x.narrow(0, 0, block.num_dst())?)?;
        let h_neighbor = self.lin_neighbor.forward(&mean_aggregate(block, x)?)?;
        Ok((h_self + h_neighbor)?)
    }
}

/// Multi-layer GraphSAGE classifier: ReLU and dropout between layers, raw
/// logits out of the last one.
pub struct DistSage {
    layers: Vec<SageConv>,
    dropout: f32,
}

impl DistSage {
    pub fn new(
        in_features: usize,
        hidden: usize,
        n_classes: usize,
        num_layers: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::InvalidConfig("num_layers must be positive".into()));
        }
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let input = if i == 0 { in_features } else { hidden };
            let output = if i + 1 == num_layers { n_classes } else { hidden };
            layers.push(SageConv::new(input, output, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self { layers, dropout })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl NodeClassifier for DistSage {
    fn forward_t(&self, blocks: &[Block], x: &Tensor, train: bool) -> Result<Tensor> {
        if blocks.len() != self.layers.len() {
            return Err(Error::Training(format!(
                "model has {} layers but got {} blocks",
                self.layers.len(),
                blocks.len()
            )));
        }
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, (layer, block)) in self.layers.iter().zip(blocks).enumerate() {
            h = layer.forward(block, &h)?;
            if i != last {
                h = h.relu()?;
                if train && self.dropout > 0.0 {
                    h = ops::dropout(&h, self.dropout)?;
                }
            }
        }
        Ok(h)
    }
}

/// Input features of a sampled view, scaled by that view's node mask.
pub fn view_inputs(
    store: &GraphViewStore,
    view: &SampledView,
    nmask: Option<&[f32]>,
    device: &Device,
) -> Result<Tensor> {
    let data = store.gather_features(&view.input_nodes, nmask);
    Ok(Tensor::from_vec(
        data,
        (view.input_nodes.len(), store.feature_dim()),
        device,
    )?)
}

/// Labels of `seeds` as a `u32` tensor.
pub fn seed_labels(store: &GraphViewStore, seeds: &[NodeId], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(store.gather_labels(seeds), seeds.len(), device)?)
}

/// Number of rows whose argmax matches `labels`.
pub fn correct(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let predicted = logits.argmax(candle_core::D::Minus1)?;
    let hits = predicted
        .eq(labels)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

/// Fraction of rows whose argmax matches `labels`.
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let n = labels.dim(0)?;
    if n == 0 {
        return Ok(0.0);
    }
    Ok(correct(logits, labels)? as f64 / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;
    use candle_nn::VarMap;
    use mhaug_core::PartitionBook;

    fn block() -> Block {
        // dst = [0, 1]; 2 -> 0, 3 -> 0, 2 -> 1
        Block {
            src_nodes: vec![10, 11, 12, 13],
            num_dst: 2,
            edges: vec![(2, 0), (3, 0), (2, 1)],
            edge_ids: vec![0, 1, 2],
        }
    }

    #[test]
    fn test_mean_aggregate_rows() {
        let x = Tensor::new(
            &[[1f32, 0.0], [2.0, 0.0], [4.0, 1.0], [8.0, 3.0]],
            &Device::Cpu,
        )
        .unwrap();
        let rows = mean_aggregate(&block(), &x).unwrap().to_vec2::<f32>().unwrap();
        // dst 0 averages src 2 and 3, dst 1 only sees src 2
        assert_eq!(rows, vec![vec![6.0, 2.0], vec![4.0, 1.0]]);
    }

    #[test]
    fn test_repeated_edges_count_twice() {
        let repeated = Block {
            src_nodes: vec![0, 1, 2],
            num_dst: 1,
            edges: vec![(1, 0), (1, 0), (2, 0)],
            edge_ids: vec![0, 1, 2],
        };
        let x = Tensor::new(&[[0f32], [3.0], [6.0]], &Device::Cpu).unwrap();
        let rows = mean_aggregate(&repeated, &x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows, vec![vec![4.0]]);
    }

    #[test]
    fn test_edgeless_block_has_zero_rows() {
        let empty = Block {
            src_nodes: vec![0, 1],
            num_dst: 2,
            edges: vec![],
            edge_ids: vec![],
        };
        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let agg = mean_aggregate(&empty, &x).unwrap();
        assert_eq!(agg.dims(), &[2, 3]);
        assert_eq!(agg.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_aggregate_gradient_reaches_sources() {
        let ones = Tensor::ones((4, 2), DType::F32, &Device::Cpu).unwrap();
        let x = Var::from_tensor(&ones).unwrap();
        let loss = mean_aggregate(&block(), x.as_tensor()).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(x.as_tensor()).unwrap().to_vec2::<f32>().unwrap();
        // src 2 feeds dst 0 (weight 1/2) and dst 1 (weight 1); src 3 feeds dst 0
        assert_eq!(
            g,
            vec![vec![0.0, 0.0], vec![0.0, 0.0], vec![1.5, 1.5], vec![0.5, 0.5]]
        );
    }

    #[test]
    fn test_dist_sage_output_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DistSage::new(3, 8, 5, 2, 0.5, vb).unwrap();

        let first = Block {
            src_nodes: vec![0, 1, 2, 3, 4],
            num_dst: 3,
            edges: vec![(3, 0), (4, 1), (0, 2)],
            edge_ids: vec![0, 1, 2],
        };
        let second = Block {
            src_nodes: vec![0, 1, 2],
            num_dst: 1,
            edges: vec![(1, 0), (2, 0)],
            edge_ids: vec![3, 4],
        };
        let x = Tensor::ones((5, 3), DType::F32, &Device::Cpu).unwrap();
        let out = model.forward_t(&[first, second], &x, true).unwrap();
        assert_eq!(out.dims(), &[1, 5]);
    }

    #[test]
    fn test_rejects_wrong_block_count() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DistSage::new(3, 4, 2, 2, 0.0, vb).unwrap();
        let x = Tensor::ones((4, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward_t(&[block()], &x, false).is_err());
    }

    #[test]
    fn test_view_inputs_scaled_by_node_mask() {
        let store = GraphViewStore::new(
            2,
            &[(0, 1)],
            vec![1.0, 2.0, 3.0, 4.0],
            2,
            vec![0, 1],
            PartitionBook::contiguous(2, 1).unwrap(),
        )
        .unwrap();
        let view = SampledView {
            input_nodes: vec![1, 0],
            output_nodes: vec![1],
            blocks: vec![],
        };
        let nmask = vec![0.0, 1.0];
        let x = view_inputs(&store, &view, Some(&nmask), &Device::Cpu).unwrap();
        assert_eq!(
            x.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 4.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn test_accuracy() {
        let logits = Tensor::new(&[[2f32, 0.0], [0.0, 1.0], [3.0, 1.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1], &Device::Cpu).unwrap();
        let acc = accuracy(&logits, &labels).unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-9);
    }
}
