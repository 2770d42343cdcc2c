use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::graph::HeteroGraph;
use crate::{EdgeMap, Error, NodeMap, Result};

use super::{Block, NeighborSampler};

/// Node ids of a batch. Graphs with a single node type yield `Homogeneous`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeIds {
    Homogeneous(Vec<u32>),
    Typed(NodeMap<Vec<u32>>),
}

impl NodeIds {
    /// Wraps homogeneous ids into a single-key map of the graph's only
    /// node type.
    pub fn into_typed(self, ntypes: &[String]) -> Result<NodeMap<Vec<u32>>> {
        match self {
            Self::Typed(ids) => Ok(ids),
            Self::Homogeneous(ids) => match ntypes {
                [ntype] => Ok(NodeMap::from([(ntype.clone(), ids)])),
                _ => Err(Error::Config(format!(
                    "homogeneous node ids on a graph with node types {ntypes:?}"
                ))),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Homogeneous(ids) => ids.len(),
            Self::Typed(ids) => ids.values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct SampledBatch {
    pub input_nodes: NodeIds,
    pub output_nodes: NodeIds,
    pub blocks: Vec<Block>,
}

/// Iterates the seed nodes in batches of `batch_size` (node types in sorted
/// order, no shuffling, the last batch may be short) and samples the blocks
/// of each batch.
pub struct NodeDataLoader<'a> {
    graph: &'a HeteroGraph,
    sampler: NeighborSampler,
    masks: EdgeMap<Vec<bool>>,
    seeds: Vec<(usize, u32)>,
    ntypes: Vec<String>,
    batch_size: usize,
    cursor: usize,
    batch_idx: u64,
}

impl<'a> NodeDataLoader<'a> {
    pub fn new(
        graph: &'a HeteroGraph,
        nodes: &NodeMap<Vec<u32>>,
        sampler: NeighborSampler,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        let mut ntypes = Vec::with_capacity(nodes.len());
        let mut seeds = Vec::new();
        for (ntype, ids) in nodes {
            let n = graph.number_of_nodes(ntype)?;
            if let Some(&node) = ids.iter().find(|&&v| v as usize >= n) {
                return Err(Error::NodeOutOfRange {
                    ntype: ntype.clone(),
                    node,
                    num_nodes: n,
                });
            }
            seeds.extend(ids.iter().map(|&v| (ntypes.len(), v)));
            ntypes.push(ntype.clone());
        }
        let masks = sampler.edge_masks(graph)?;
        Ok(Self {
            graph,
            sampler,
            masks,
            seeds,
            ntypes,
            batch_size,
            cursor: 0,
            batch_idx: 0,
        })
    }

    /// Number of batches a full pass yields.
    pub fn expected_batches(&self) -> usize {
        self.seeds.len().div_ceil(self.batch_size)
    }

    fn wrap(&self, ids: NodeMap<Vec<u32>>) -> NodeIds {
        if self.graph.is_homogeneous() {
            NodeIds::Homogeneous(ids.into_values().next().unwrap_or_default())
        } else {
            NodeIds::Typed(ids)
        }
    }

    fn sample(&self, batch: &[(usize, u32)]) -> Result<SampledBatch> {
        let mut seeds: NodeMap<Vec<u32>> = NodeMap::new();
        for &(t, v) in batch {
            seeds.entry(self.ntypes[t].clone()).or_default().push(v);
        }
        let mut rng = StdRng::seed_from_u64(self.sampler.seed().wrapping_add(self.batch_idx));
        let blocks = self
            .sampler
            .sample_blocks(self.graph, &seeds, &self.masks, &mut rng)?;
        let input_nodes = match blocks.first() {
            Some(block) => block.src_nodes().clone(),
            None => seeds.clone(),
        };
        Ok(SampledBatch {
            input_nodes: self.wrap(input_nodes),
            output_nodes: self.wrap(seeds),
            blocks,
        })
    }
}

impl Iterator for NodeDataLoader<'_> {
    type Item = Result<SampledBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.seeds.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.seeds.len());
        let batch = self.sample(&self.seeds[self.cursor..end]);
        self.cursor = end;
        self.batch_idx += 1;
        Some(batch)
    }
}
