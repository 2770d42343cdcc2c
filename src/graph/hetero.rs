use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::{CanonicalEtype, EdgeMap, Error, NodeMap, Result};

/// The edges of one canonical edge type, with an in-edge index by destination.
#[derive(Debug, Clone)]
pub struct EdgeStore {
    src: Vec<u32>,
    dst: Vec<u32>,
    in_ptr: Vec<usize>,
    in_eids: Vec<u32>,
}

impl EdgeStore {
    fn new(src: Vec<u32>, dst: Vec<u32>, num_dst: usize) -> Self {
        let mut in_ptr = vec![0usize; num_dst + 1];
        for &v in &dst {
            in_ptr[v as usize + 1] += 1;
        }
        for i in 0..num_dst {
            in_ptr[i + 1] += in_ptr[i];
        }
        let mut fill = in_ptr.clone();
        let mut in_eids = vec![0u32; dst.len()];
        for (eid, &v) in dst.iter().enumerate() {
            in_eids[fill[v as usize]] = eid as u32;
            fill[v as usize] += 1;
        }
        Self {
            src,
            dst,
            in_ptr,
            in_eids,
        }
    }

    pub fn num_edges(&self) -> usize {
        self.src.len()
    }
    pub fn src(&self) -> &[u32] {
        &self.src
    }
    pub fn dst(&self) -> &[u32] {
        &self.dst
    }

    /// Edge ids of the in-edges of destination node `v`, in insertion order.
    pub fn in_edges(&self, v: u32) -> &[u32] {
        let v = v as usize;
        if v + 1 >= self.in_ptr.len() {
            return &[];
        }
        &self.in_eids[self.in_ptr[v]..self.in_ptr[v + 1]]
    }
}

/// An in-memory heterogeneous graph with node and edge data fields.
#[derive(Debug, Clone, Default)]
pub struct HeteroGraph {
    num_nodes: NodeMap<usize>,
    edges: EdgeMap<EdgeStore>,
    ndata: NodeMap<BTreeMap<String, Tensor>>,
    edata: EdgeMap<BTreeMap<String, Tensor>>,
}

impl HeteroGraph {
    pub fn new<I, S>(num_nodes: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self {
            num_nodes: num_nodes.into_iter().map(|(k, n)| (k.into(), n)).collect(),
            ..Default::default()
        }
    }

    pub fn add_edges(&mut self, etype: CanonicalEtype, src: Vec<u32>, dst: Vec<u32>) -> Result<()> {
        let num_src = self.number_of_nodes(&etype.0)?;
        let num_dst = self.number_of_nodes(&etype.2)?;
        if src.len() != dst.len() {
            return Err(Error::ShapeMismatch {
                name: format!("edges of {etype:?}"),
                expected: vec![src.len()],
                actual: vec![dst.len()],
            });
        }
        for (&u, &v) in src.iter().zip(&dst) {
            if u as usize >= num_src {
                return Err(Error::NodeOutOfRange {
                    ntype: etype.0.clone(),
                    node: u,
                    num_nodes: num_src,
                });
            }
            if v as usize >= num_dst {
                return Err(Error::NodeOutOfRange {
                    ntype: etype.2.clone(),
                    node: v,
                    num_nodes: num_dst,
                });
            }
        }
        self.edges.insert(etype, EdgeStore::new(src, dst, num_dst));
        Ok(())
    }

    pub fn set_node_data(&mut self, ntype: &str, name: &str, data: Tensor) -> Result<()> {
        let n = self.number_of_nodes(ntype)?;
        if data.dim(0)? != n {
            return Err(Error::ShapeMismatch {
                name: format!("{ntype}/{name}"),
                expected: vec![n],
                actual: data.dims().to_vec(),
            });
        }
        self.ndata
            .entry(ntype.to_string())
            .or_default()
            .insert(name.to_string(), data);
        Ok(())
    }

    pub fn set_edge_data(&mut self, etype: &CanonicalEtype, name: &str, data: Tensor) -> Result<()> {
        let n = self.edges(etype)?.num_edges();
        if data.dim(0)? != n {
            return Err(Error::ShapeMismatch {
                name: format!("{etype:?}/{name}"),
                expected: vec![n],
                actual: data.dims().to_vec(),
            });
        }
        self.edata
            .entry(etype.clone())
            .or_default()
            .insert(name.to_string(), data);
        Ok(())
    }

    pub fn ntypes(&self) -> Vec<String> {
        self.num_nodes.keys().cloned().collect()
    }

    pub fn canonical_etypes(&self) -> Vec<CanonicalEtype> {
        self.edges.keys().cloned().collect()
    }

    pub fn is_homogeneous(&self) -> bool {
        self.num_nodes.len() == 1
    }

    pub fn number_of_nodes(&self, ntype: &str) -> Result<usize> {
        self.num_nodes
            .get(ntype)
            .copied()
            .ok_or_else(|| Error::UnknownNodeType(ntype.to_string()))
    }

    pub fn num_nodes(&self) -> &NodeMap<usize> {
        &self.num_nodes
    }

    pub fn edges(&self, etype: &CanonicalEtype) -> Result<&EdgeStore> {
        self.edges.get(etype).ok_or_else(|| Error::UnknownEdgeType {
            etype: etype.clone(),
        })
    }

    pub fn node_data(&self, ntype: &str, name: &str) -> Option<&Tensor> {
        self.ndata.get(ntype).and_then(|d| d.get(name))
    }

    pub fn edge_data(&self, etype: &CanonicalEtype, name: &str) -> Option<&Tensor> {
        self.edata.get(etype).and_then(|d| d.get(name))
    }
}
