use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::index;

use crate::graph::HeteroGraph;
use crate::utils::mask_to_bools;
use crate::{EdgeMap, Error, NodeMap, Result};

use super::{Block, BlockEdges, Fanout, LayerFanout};

/// Multi-layer neighbor sampler producing one [`Block`] per layer.
#[derive(Debug, Clone)]
pub struct NeighborSampler {
    fanouts: Vec<LayerFanout>,
    edge_mask: Option<String>,
    seed: u64,
}

impl NeighborSampler {
    pub fn new(fanouts: Vec<LayerFanout>) -> Self {
        Self {
            fanouts,
            edge_mask: None,
            seed: 0,
        }
    }

    /// Only edges whose `u8` edge-data field `name` is non-zero are sampled.
    pub fn with_edge_mask(mut self, name: Option<&str>) -> Self {
        self.edge_mask = name.map(str::to_string);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_layers(&self) -> usize {
        self.fanouts.len()
    }
    pub fn seed(&self) -> u64 {
        self.seed
    }
    pub fn edge_mask(&self) -> Option<&str> {
        self.edge_mask.as_deref()
    }

    /// Per edge type, which edges may be sampled. Edge types without the
    /// mask field are absent, meaning all of their edges participate.
    pub fn edge_masks(&self, g: &HeteroGraph) -> Result<EdgeMap<Vec<bool>>> {
        let Some(name) = &self.edge_mask else {
            return Ok(EdgeMap::new());
        };
        let mut masks = EdgeMap::new();
        for etype in g.canonical_etypes() {
            if let Some(mask) = g.edge_data(&etype, name) {
                masks.insert(etype, mask_to_bools(&mask.flatten_all()?)?);
            }
        }
        Ok(masks)
    }

    /// Samples the blocks computing `seeds`, ordered from the input layer to
    /// the output layer.
    pub fn sample_blocks(
        &self,
        g: &HeteroGraph,
        seeds: &NodeMap<Vec<u32>>,
        masks: &EdgeMap<Vec<bool>>,
        rng: &mut StdRng,
    ) -> Result<Vec<Block>> {
        let mut frontier: NodeMap<Vec<u32>> = g
            .ntypes()
            .into_iter()
            .map(|ntype| {
                let ids = seeds.get(&ntype).cloned().unwrap_or_default();
                (ntype, ids)
            })
            .collect();
        for ntype in seeds.keys() {
            if !frontier.contains_key(ntype) {
                return Err(Error::UnknownNodeType(ntype.clone()));
            }
        }

        let mut blocks = Vec::with_capacity(self.fanouts.len());
        for fanout in self.fanouts.iter().rev() {
            let block = self.sample_layer(g, &frontier, fanout, masks, rng)?;
            frontier = block.src_nodes().clone();
            blocks.push(block);
        }
        blocks.reverse();
        Ok(blocks)
    }

    fn sample_layer(
        &self,
        g: &HeteroGraph,
        dst_nodes: &NodeMap<Vec<u32>>,
        fanout: &LayerFanout,
        masks: &EdgeMap<Vec<bool>>,
        rng: &mut StdRng,
    ) -> Result<Block> {
        let mut src_nodes = dst_nodes.clone();
        let mut local: NodeMap<HashMap<u32, u32>> = dst_nodes
            .iter()
            .map(|(ntype, ids)| {
                let map = ids.iter().enumerate().map(|(i, &v)| (v, i as u32)).collect();
                (ntype.clone(), map)
            })
            .collect();

        let mut edges = EdgeMap::new();
        for etype in g.canonical_etypes() {
            let store = g.edges(&etype)?;
            let mask = masks.get(&etype);
            let mut sampled = BlockEdges::default();
            let dsts = dst_nodes.get(&etype.2).map(Vec::as_slice).unwrap_or(&[]);
            for (i, &v) in dsts.iter().enumerate() {
                let candidates: Vec<u32> = store
                    .in_edges(v)
                    .iter()
                    .copied()
                    .filter(|&eid| mask.map_or(true, |m| m[eid as usize]))
                    .collect();
                let chosen = match fanout.for_etype(&etype) {
                    Fanout::Limit(k) if k < candidates.len() => {
                        let mut picked = index::sample(rng, candidates.len(), k).into_vec();
                        picked.sort_unstable();
                        picked.into_iter().map(|j| candidates[j]).collect()
                    }
                    _ => candidates,
                };
                let srcs = src_nodes.entry(etype.0.clone()).or_default();
                let ids = local.entry(etype.0.clone()).or_default();
                for eid in chosen {
                    let u = store.src()[eid as usize];
                    let next = srcs.len() as u32;
                    let lu = *ids.entry(u).or_insert_with(|| {
                        srcs.push(u);
                        next
                    });
                    sampled.src.push(lu);
                    sampled.dst.push(i as u32);
                    sampled.eids.push(eid);
                }
            }
            edges.insert(etype, sampled);
        }
        Ok(Block::new(src_nodes, dst_nodes.clone(), edges))
    }
}
