use candle_core::{Device, Tensor};

use crate::graph::HeteroGraph;
use crate::nn::{ConvGraph, RelGraph};
use crate::{CanonicalEtype, EdgeMap, NodeMap, Result};

/// Sampled edges of one edge type. `src`/`dst` index into the block's
/// source/destination node lists, `eids` are global edge ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockEdges {
    pub src: Vec<u32>,
    pub dst: Vec<u32>,
    pub eids: Vec<u32>,
}

impl BlockEdges {
    pub fn len(&self) -> usize {
        self.src.len()
    }
    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

/// One layer of message passing for a mini-batch.
///
/// For every node type, the destination nodes are the leading entries of
/// the source nodes of the same type.
#[derive(Debug, Clone, Default)]
pub struct Block {
    src_nodes: NodeMap<Vec<u32>>,
    dst_nodes: NodeMap<Vec<u32>>,
    edges: EdgeMap<BlockEdges>,
}

impl Block {
    pub fn new(
        src_nodes: NodeMap<Vec<u32>>,
        dst_nodes: NodeMap<Vec<u32>>,
        edges: EdgeMap<BlockEdges>,
    ) -> Self {
        Self {
            src_nodes,
            dst_nodes,
            edges,
        }
    }

    pub fn src_nodes(&self) -> &NodeMap<Vec<u32>> {
        &self.src_nodes
    }
    pub fn dst_nodes(&self) -> &NodeMap<Vec<u32>> {
        &self.dst_nodes
    }
    pub fn num_src_nodes(&self, ntype: &str) -> usize {
        self.src_nodes.get(ntype).map_or(0, Vec::len)
    }
    pub fn edges(&self, etype: &CanonicalEtype) -> Option<&BlockEdges> {
        self.edges.get(etype)
    }
    pub fn num_edges(&self, etype: &CanonicalEtype) -> usize {
        self.edges.get(etype).map_or(0, BlockEdges::len)
    }
}

fn edge_index(src: &[u32], dst: &[u32], device: &Device) -> Result<Tensor> {
    let mut flat = Vec::with_capacity(src.len() * 2);
    flat.extend_from_slice(src);
    flat.extend_from_slice(dst);
    Ok(Tensor::from_vec(flat, (2, src.len()), device)?)
}

impl ConvGraph for Block {
    fn canonical_etypes(&self) -> Vec<CanonicalEtype> {
        self.edges.keys().cloned().collect()
    }

    fn rel_graph(&self, etype: &CanonicalEtype, device: &Device) -> Result<RelGraph> {
        let edges = self.edges.get(etype).cloned().unwrap_or_default();
        Ok(RelGraph {
            edge_index: edge_index(&edges.src, &edges.dst, device)?,
            num_edges: edges.len(),
            num_src: self.num_src_nodes(&etype.0),
            num_dst: self.num_dst_nodes(&etype.2),
        })
    }

    fn num_dst_nodes(&self, ntype: &str) -> usize {
        self.dst_nodes.get(ntype).map_or(0, Vec::len)
    }
}

impl ConvGraph for HeteroGraph {
    fn canonical_etypes(&self) -> Vec<CanonicalEtype> {
        HeteroGraph::canonical_etypes(self)
    }

    fn rel_graph(&self, etype: &CanonicalEtype, device: &Device) -> Result<RelGraph> {
        let store = self.edges(etype)?;
        Ok(RelGraph {
            edge_index: edge_index(store.src(), store.dst(), device)?,
            num_edges: store.num_edges(),
            num_src: self.number_of_nodes(&etype.0)?,
            num_dst: self.number_of_nodes(&etype.2)?,
        })
    }

    fn num_dst_nodes(&self, ntype: &str) -> usize {
        self.number_of_nodes(ntype).unwrap_or(0)
    }
}
