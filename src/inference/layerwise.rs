use candle_core::{DType, Tensor};

use super::{DistTensorInput, InferenceParams, InputEmbeds, SyncStep, SynchronizedIter, TaskTracker};
use crate::dist::DistTensor;
use crate::graph::DistGraph;
use crate::nn::{GnnEncoder, GnnLayer};
use crate::sampling::{NeighborSampler, NodeDataLoader};
use crate::{Error, NodeMap, Result};

/// Rank 0 reports loop progress every this many iterations.
pub const LOG_EVERY: usize = 100_000;

pub(crate) fn log_progress(g: &DistGraph, step: usize, tracker: Option<&dyn TaskTracker>) {
    if step % LOG_EVERY == 0 && g.rank() == 0 {
        tracing::info!(step, "[Rank 0] dist inference: finishes iterations");
    }
    if let Some(tracker) = tracker {
        tracker.keep_alive(step);
    }
}

fn infer_dim(h: &NodeMap<Tensor>) -> Result<Option<(usize, DType)>> {
    let mut found = None;
    for (ntype, x) in h {
        let dims = x.dims();
        if dims.len() != 2 {
            return Err(Error::DimInference(format!(
                "the embeddings of {ntype} should have two dimensions, got {dims:?}"
            )));
        }
        if dims[1] > 0 {
            found = Some((dims[1], x.dtype()));
        }
    }
    Ok(found)
}

/// Runs one GNN layer over every node of `target_ntypes` this worker owns
/// and stores the output in `h-{layer_id}` tensors.
///
/// The tensors are created once the first batch shows the output size; the
/// size is then checked against every other worker's. A size conflict fails
/// on every worker, after all of them have finished the loop.
#[allow(clippy::too_many_arguments)]
pub fn dist_inference_one_layer(
    layer_id: usize,
    g: &DistGraph,
    loader: NodeDataLoader<'_>,
    target_ntypes: &[String],
    layer: &dyn GnnLayer,
    input: &dyn InputEmbeds,
    persistent: bool,
    tracker: Option<&dyn TaskTracker>,
) -> Result<NodeMap<DistTensor>> {
    let ntypes = g.ntypes();
    let name = format!("h-{layer_id}");
    let create = |dim: usize, dtype: DType| -> Result<NodeMap<DistTensor>> {
        target_ntypes
            .iter()
            .map(|ntype| {
                let policy = g.partition_policy(ntype)?;
                let shape = (policy.num_nodes(), dim);
                let t = g.store().create(&name, shape, dtype, policy, persistent)?;
                Ok((ntype.clone(), t))
            })
            .collect()
    };

    let len = loader.expected_batches();
    let mut iter = SynchronizedIter::new(loader, len, g.comm())?;
    let mut y: Option<NodeMap<DistTensor>> = None;
    // output width seen by this worker, whether or not its tensors exist
    let mut local_dim = 0;
    let mut conflict = false;
    while let Some(item) = iter.next_or_empty() {
        log_progress(g, iter.step() - 1, tracker);
        let batch = match item {
            SyncStep::Batch(batch) => batch?,
            SyncStep::Padding => {
                // every worker runs the input lookup each iteration
                let empty = ntypes.iter().map(|t| (t.clone(), Vec::new())).collect();
                input.node_embeds(&empty)?;
                continue;
            }
        };
        let mut input_nodes = batch.input_nodes.into_typed(&ntypes)?;
        let output_nodes = batch.output_nodes.into_typed(&ntypes)?;
        for ntype in &ntypes {
            input_nodes.entry(ntype.clone()).or_default();
        }
        let h = input.node_embeds(&input_nodes)?;
        let block = batch.blocks.first().ok_or_else(|| {
            Error::Config(format!("layer {layer_id} received a batch without blocks"))
        })?;
        let h = layer.forward(block, &h, None)?;

        if local_dim == 0 {
            if let Some((dim, dtype)) = infer_dim(&h)? {
                local_dim = dim;
                match create(dim, dtype) {
                    Ok(tensors) => y = Some(tensors),
                    // another worker created them with a different width
                    Err(Error::ShapeMismatch { .. }) => conflict = true,
                    Err(e) => return Err(e),
                }
            }
        }
        for (ntype, emb) in &h {
            let Some(ids) = output_nodes.get(ntype) else {
                continue;
            };
            let Some(out) = y.as_ref().and_then(|y| y.get(ntype)) else {
                continue;
            };
            if emb.dims().get(1) != Some(&out.dim()) {
                conflict |= emb.dim(0)? > 0;
                continue;
            }
            out.write(g.rank(), ids, emb)?;
        }
    }

    let global_dim = g.comm().all_reduce_max(local_dim as u64)? as usize;
    let mismatch = conflict || (local_dim != 0 && local_dim != global_dim);
    let any_mismatch = g.comm().all_reduce_max(mismatch as u64)? != 0;
    if global_dim == 0 {
        return Err(Error::DimInference(format!(
            "layer {layer_id} produced no output on any worker"
        )));
    }
    if any_mismatch {
        return Err(Error::DimInference(format!(
            "layer {layer_id} produced outputs of different sizes across workers \
             ({local_dim} columns on rank {}, up to {global_dim})",
            g.rank()
        )));
    }
    let y = match y {
        Some(y) => y,
        None => create(global_dim, DType::F32)?,
    };
    g.store().flush(g.comm())?;
    Ok(y)
}

/// Layer-by-layer inference: every layer is computed for all nodes before
/// the next one starts, so only one layer's neighborhoods are in memory.
///
/// Intermediate layers cover every node type; the last layer only the
/// target node types. An intermediate layer's tensors are dropped once the
/// following layer is done, unless `keep_intermediate` is set.
pub fn dist_inference(
    g: &DistGraph,
    encoder: &dyn GnnEncoder,
    input: &dyn InputEmbeds,
    params: &InferenceParams<'_>,
) -> Result<NodeMap<DistTensor>> {
    let num_layers = encoder.num_layers();
    if num_layers == 0 {
        return Err(Error::Config("the GNN encoder has no layers".to_string()));
    }
    let fanouts = params.layer_fanouts(num_layers)?;
    let ntypes = g.ntypes();
    let targets = params.target_ntypes(g)?;

    let mut prev: Option<DistTensorInput> = None;
    for (i, fanout) in fanouts.into_iter().enumerate() {
        let last = i + 1 == num_layers;
        let layer_ntypes = if last { &targets } else { &ntypes };
        let infer_nodes = layer_ntypes
            .iter()
            .map(|ntype| Ok((ntype.clone(), g.node_split(ntype)?)))
            .collect::<Result<NodeMap<_>>>()?;
        let sampler = NeighborSampler::new(vec![fanout])
            .with_edge_mask(params.edge_mask.as_deref())
            .with_seed(params.seed);
        let loader = NodeDataLoader::new(g.graph(), &infer_nodes, sampler, params.batch_size)?;
        let persistent = last && params.persistent_outputs;
        let source: &dyn InputEmbeds = match &prev {
            Some(prev) => prev,
            None => input,
        };
        let out = dist_inference_one_layer(
            i,
            g,
            loader,
            layer_ntypes,
            encoder.layer(i),
            source,
            persistent,
            params.tracker,
        )?;
        if let Some(prev) = prev.take() {
            if !params.keep_intermediate {
                for (ntype, t) in prev.tensors() {
                    if !t.is_persistent() {
                        g.store().drop_tensor(ntype, t.name())?;
                    }
                }
            }
        }
        if g.rank() == 0 {
            tracing::debug!(layer = i, "finished inference of one GNN layer");
        }
        prev = Some(DistTensorInput::new(out, &params.device));
    }
    Ok(prev.map(|p| p.tensors().clone()).unwrap_or_default())
}
