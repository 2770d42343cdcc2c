use std::time::Instant;

use candle_core::Device;

use crate::dist::DistTensor;
use crate::graph::DistGraph;
use crate::nn::{compute_node_input_embeddings, GnnEncoder};
use crate::sampling::{full_fanout, LayerFanout};
use crate::{Error, NodeMap, Result};

mod config;
pub use config::*;

mod input;
pub use input::*;

mod layerwise;
pub use layerwise::*;

mod minibatch;
pub use minibatch::*;

mod sync_iter;
pub use sync_iter::*;

mod tracker;
pub use tracker::*;

/// Arguments shared by the inference engines.
#[derive(Clone)]
pub struct InferenceParams<'a> {
    pub batch_size: usize,
    /// One entry per GNN layer; empty means all neighbors in every layer.
    pub fanout: Vec<LayerFanout>,
    pub edge_mask: Option<String>,
    /// Node types to compute the final embeddings of; every type when unset.
    pub target_ntypes: Option<Vec<String>>,
    pub keep_intermediate: bool,
    pub persistent_outputs: bool,
    pub seed: u64,
    pub tracker: Option<&'a dyn TaskTracker>,
    pub device: Device,
}

impl<'a> InferenceParams<'a> {
    pub fn new(batch_size: usize, device: &Device) -> Self {
        Self {
            batch_size,
            fanout: Vec::new(),
            edge_mask: None,
            target_ntypes: None,
            keep_intermediate: false,
            persistent_outputs: true,
            seed: 0,
            tracker: None,
            device: device.clone(),
        }
    }

    pub fn from_config(config: &InferenceConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            batch_size: config.eval_batch_size,
            fanout: config.eval_fanout()?,
            edge_mask: config.edge_mask.clone(),
            target_ntypes: config.target_ntypes.clone(),
            keep_intermediate: config.keep_intermediate,
            persistent_outputs: config.persistent_outputs,
            seed: config.sampler_seed,
            tracker: None,
            device: device.clone(),
        })
    }

    pub fn with_tracker(mut self, tracker: &'a dyn TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub(crate) fn layer_fanouts(&self, num_layers: usize) -> Result<Vec<LayerFanout>> {
        if self.fanout.is_empty() {
            return Ok(full_fanout(num_layers));
        }
        if self.fanout.len() != num_layers {
            return Err(Error::Config(format!(
                "fanout has {} layers, the GNN encoder has {num_layers}",
                self.fanout.len()
            )));
        }
        Ok(self.fanout.clone())
    }

    pub(crate) fn target_ntypes(&self, g: &DistGraph) -> Result<Vec<String>> {
        let ntypes = g.ntypes();
        match &self.target_ntypes {
            None => Ok(ntypes),
            Some(targets) => {
                if let Some(unknown) = targets.iter().find(|t| !ntypes.contains(t)) {
                    return Err(Error::UnknownNodeType(unknown.clone()));
                }
                Ok(targets.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStrategy {
    /// Sample all layers per batch and run the whole encoder.
    MiniBatch,
    /// Compute one layer for every node at a time.
    LayerByLayer,
}

impl InferenceStrategy {
    pub fn from_config(config: &InferenceConfig) -> Self {
        if config.use_mini_batch_infer {
            Self::MiniBatch
        } else {
            Self::LayerByLayer
        }
    }
}

/// Computes the embeddings of every target node of the graph.
///
/// Without a GNN encoder the result is the input layer's output. Edge
/// features in message passing require mini-batch inference.
pub fn do_full_graph_inference(
    g: &DistGraph,
    encoder: Option<&dyn GnnEncoder>,
    input: &FeatureInput<'_>,
    strategy: InferenceStrategy,
    params: &InferenceParams<'_>,
) -> Result<NodeMap<DistTensor>> {
    let start = Instant::now();
    let embs = match encoder {
        None => compute_node_input_embeddings(
            g,
            params.batch_size,
            input.node_layer(),
            params.tracker,
            input.feat_field(),
            params.target_ntypes.as_deref(),
            &params.device,
        )?,
        Some(encoder) => match strategy {
            InferenceStrategy::MiniBatch => dist_minibatch_inference(g, encoder, input, params)?,
            InferenceStrategy::LayerByLayer => {
                if encoder.is_using_edge_feat() {
                    return Err(Error::Config(
                        "layer-by-layer inference does not support edge features in message \
                         passing, use mini-batch inference instead"
                            .to_string(),
                    ));
                }
                dist_inference(g, encoder, input, params)?
            }
        },
    };
    if g.rank() == 0 {
        tracing::info!(
            ?strategy,
            elapsed = ?start.elapsed(),
            "computing GNN embeddings finished"
        );
    }
    Ok(embs)
}
