use candle_core::{Device, Tensor};

use crate::dist::DistTensor;
use crate::graph::{prepare_batch_input, prepare_edge_input, FeatField, HeteroGraph};
use crate::nn::{EdgeEncoderInputLayer, NodeInputLayer};
use crate::sampling::Block;
use crate::{EdgeMap, NodeMap, Result};

/// Source of the input embeddings of a mini-batch.
///
/// A node type requested with no ids yields a `(0, dim)` tensor; node types
/// the source knows nothing about are left out of the result.
pub trait InputEmbeds {
    fn node_embeds(&self, input_nodes: &NodeMap<Vec<u32>>) -> Result<NodeMap<Tensor>>;

    /// Node embeddings plus the edge embeddings of every block. Sources
    /// without edge features return one empty map per block.
    fn with_edge_embeds(
        &self,
        input_nodes: &NodeMap<Vec<u32>>,
        blocks: &[Block],
    ) -> Result<(NodeMap<Tensor>, Vec<EdgeMap<Tensor>>)> {
        Ok((
            self.node_embeds(input_nodes)?,
            vec![EdgeMap::new(); blocks.len()],
        ))
    }
}

impl<F> InputEmbeds for F
where
    F: Fn(&NodeMap<Vec<u32>>) -> Result<NodeMap<Tensor>>,
{
    fn node_embeds(&self, input_nodes: &NodeMap<Vec<u32>>) -> Result<NodeMap<Tensor>> {
        self(input_nodes)
    }
}

/// Raw graph features passed through the input layers.
pub struct FeatureInput<'a> {
    graph: &'a HeteroGraph,
    feat_field: FeatField,
    node_layer: &'a dyn NodeInputLayer,
    edge_layer: Option<(&'a EdgeEncoderInputLayer, EdgeMap<Vec<String>>)>,
    device: Device,
}

impl<'a> FeatureInput<'a> {
    pub fn new(
        graph: &'a HeteroGraph,
        feat_field: FeatField,
        node_layer: &'a dyn NodeInputLayer,
        device: &Device,
    ) -> Self {
        Self {
            graph,
            feat_field,
            node_layer,
            edge_layer: None,
            device: device.clone(),
        }
    }

    /// Also encodes the `edge_feat_field` features of every sampled edge.
    pub fn with_edge_layer(
        mut self,
        edge_layer: &'a EdgeEncoderInputLayer,
        edge_feat_field: EdgeMap<Vec<String>>,
    ) -> Self {
        self.edge_layer = Some((edge_layer, edge_feat_field));
        self
    }

    pub fn node_layer(&self) -> &'a dyn NodeInputLayer {
        self.node_layer
    }

    pub fn feat_field(&self) -> &FeatField {
        &self.feat_field
    }
}

impl InputEmbeds for FeatureInput<'_> {
    fn node_embeds(&self, input_nodes: &NodeMap<Vec<u32>>) -> Result<NodeMap<Tensor>> {
        let feats = prepare_batch_input(self.graph, input_nodes, &self.feat_field, &self.device)?;
        self.node_layer.forward(&feats, input_nodes)
    }

    fn with_edge_embeds(
        &self,
        input_nodes: &NodeMap<Vec<u32>>,
        blocks: &[Block],
    ) -> Result<(NodeMap<Tensor>, Vec<EdgeMap<Tensor>>)> {
        let n_h = self.node_embeds(input_nodes)?;
        let e_hs = match &self.edge_layer {
            Some((layer, field)) => {
                let feats = prepare_edge_input(self.graph, blocks, field, &self.device)?;
                layer.forward(&feats)?
            }
            None => vec![EdgeMap::new(); blocks.len()],
        };
        Ok((n_h, e_hs))
    }
}

/// Rows of previously computed distributed tensors, e.g. the output of the
/// previous GNN layer.
#[derive(Debug, Clone)]
pub struct DistTensorInput {
    tensors: NodeMap<DistTensor>,
    device: Device,
}

impl DistTensorInput {
    pub fn new(tensors: NodeMap<DistTensor>, device: &Device) -> Self {
        Self {
            tensors,
            device: device.clone(),
        }
    }

    pub fn tensors(&self) -> &NodeMap<DistTensor> {
        &self.tensors
    }
}

impl InputEmbeds for DistTensorInput {
    fn node_embeds(&self, input_nodes: &NodeMap<Vec<u32>>) -> Result<NodeMap<Tensor>> {
        input_nodes
            .iter()
            .filter_map(|(ntype, ids)| {
                let tensor = self.tensors.get(ntype)?;
                Some(tensor.read(ids, &self.device).map(|h| (ntype.clone(), h)))
            })
            .collect()
    }
}
