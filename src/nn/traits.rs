use candle_core::{Device, Tensor};

use crate::sampling::Block;
use crate::{CanonicalEtype, EdgeMap, NodeMap, Result};

/// The subgraph induced by one edge type.
///
/// `edge_index` has shape `(2, num_edges)`: row 0 holds source indices,
/// row 1 destination indices, both local to this relation's node lists.
#[derive(Debug, Clone)]
pub struct RelGraph {
    pub edge_index: Tensor,
    pub num_src: usize,
    pub num_dst: usize,
    pub num_edges: usize,
}

/// A graph a heterogeneous convolution can run on: a sampled block or a
/// whole graph.
pub trait ConvGraph {
    fn canonical_etypes(&self) -> Vec<CanonicalEtype>;
    fn rel_graph(&self, etype: &CanonicalEtype, device: &Device) -> Result<RelGraph>;
    fn num_dst_nodes(&self, ntype: &str) -> usize;
}

/// Inputs of one relation module call.
#[derive(Debug, Clone, Copy)]
pub struct RelInput<'a> {
    pub src: &'a Tensor,
    pub dst: &'a Tensor,
    pub edge: Option<&'a Tensor>,
}

/// The transformation applied to one edge type.
pub trait RelationModule: Send + Sync {
    /// Returns one row per destination node of `g`.
    fn forward(&self, g: &RelGraph, input: RelInput<'_>) -> Result<Tensor>;
    fn out_dim(&self) -> usize;
}

/// One message-passing layer over all edge types.
pub trait GnnLayer: Send + Sync {
    fn forward(
        &self,
        g: &dyn ConvGraph,
        h: &NodeMap<Tensor>,
        e_h: Option<&EdgeMap<Tensor>>,
    ) -> Result<NodeMap<Tensor>>;
    fn out_dim(&self) -> usize;
}

/// A stack of GNN layers.
pub trait GnnEncoder: Send + Sync {
    fn num_layers(&self) -> usize;
    fn layer(&self, i: usize) -> &dyn GnnLayer;
    fn h_dims(&self) -> usize;
    fn out_dims(&self) -> usize;

    /// Whether message passing consumes edge features.
    fn is_using_edge_feat(&self) -> bool {
        false
    }

    /// Applies every layer, `blocks[i]` feeding layer `i`.
    fn forward(
        &self,
        blocks: &[Block],
        h: NodeMap<Tensor>,
        e_h: Option<&[EdgeMap<Tensor>]>,
    ) -> Result<NodeMap<Tensor>> {
        let mut h = h;
        for (i, block) in blocks.iter().enumerate().take(self.num_layers()) {
            let e = e_h.and_then(|e| e.get(i));
            h = self.layer(i).forward(block, &h, e)?;
        }
        Ok(h)
    }
}
