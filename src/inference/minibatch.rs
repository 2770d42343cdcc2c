use candle_core::DType;

use super::layerwise::log_progress;
use super::{InferenceParams, InputEmbeds, SyncStep, SynchronizedIter};
use crate::dist::DistTensor;
use crate::graph::DistGraph;
use crate::nn::GnnEncoder;
use crate::sampling::{NeighborSampler, NodeDataLoader};
use crate::{Error, NodeMap, Result};

/// Mini-batch inference: every batch samples all layers at once and runs the
/// whole encoder, writing straight into the `h-last` tensors.
pub fn dist_minibatch_inference(
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

    let mut out_embs = NodeMap::new();
    let mut infer_nodes = NodeMap::new();
    for ntype in &targets {
        let policy = g.partition_policy(ntype)?;
        let t = g.store().create(
            "h-last",
            (policy.num_nodes(), encoder.out_dims()),
            DType::F32,
            policy,
            params.persistent_outputs,
        )?;
        out_embs.insert(ntype.clone(), t);
        infer_nodes.insert(ntype.clone(), g.node_split(ntype)?);
    }

    let sampler = NeighborSampler::new(fanouts)
        .with_edge_mask(params.edge_mask.as_deref())
        .with_seed(params.seed);
    let loader = NodeDataLoader::new(g.graph(), &infer_nodes, sampler, params.batch_size)?;
    let len = loader.expected_batches();
    let mut iter = SynchronizedIter::new(loader, len, g.comm())?;
    while let Some(item) = iter.next_or_empty() {
        log_progress(g, iter.step() - 1, params.tracker);
        let batch = match item {
            SyncStep::Batch(batch) => batch?,
            SyncStep::Padding => continue,
        };
        let input_nodes = batch.input_nodes.into_typed(&ntypes)?;
        let output_nodes = batch.output_nodes.into_typed(&ntypes)?;
        let (n_h, e_hs) = input.with_edge_embeds(&input_nodes, &batch.blocks)?;
        let output = if e_hs.iter().any(|e| !e.is_empty()) {
            encoder.forward(&batch.blocks, n_h, Some(&e_hs))?
        } else {
            encoder.forward(&batch.blocks, n_h, None)?
        };

        for (ntype, ids) in &output_nodes {
            if ids.is_empty() {
                continue;
            }
            let emb = output.get(ntype).ok_or_else(|| {
                Error::DimInference(format!("the encoder produced no embeddings for {ntype}"))
            })?;
            if let Some(out) = out_embs.get(ntype) {
                out.write(g.rank(), ids, emb)?;
            }
        }
    }
    // Each worker only writes the rows it owns, so one barrier makes the
    // whole result readable.
    g.store().flush(g.comm())?;
    Ok(out_embs)
}
