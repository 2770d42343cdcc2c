use crate::{Error, NodeMap, Result};

/// Range partitioning of every node type: rank `r` owns
/// `offsets[r]..offsets[r + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBook {
    num_parts: usize,
    offsets: NodeMap<Vec<u32>>,
}

impl PartitionBook {
    /// Splits each node type into `num_parts` contiguous ranges of (almost) equal size.
    pub fn even(num_nodes: &NodeMap<usize>, num_parts: usize) -> Result<Self> {
        if num_parts == 0 {
            return Err(Error::Config("the number of partitions must be positive".into()));
        }
        let offsets = num_nodes
            .iter()
            .map(|(ntype, &n)| {
                let chunk = n.div_ceil(num_parts);
                let offsets = (0..=num_parts).map(|r| (r * chunk).min(n) as u32).collect();
                (ntype.clone(), offsets)
            })
            .collect();
        Ok(Self { num_parts, offsets })
    }

    pub fn from_offsets(offsets: NodeMap<Vec<u32>>) -> Result<Self> {
        let mut num_parts = None;
        for (ntype, off) in &offsets {
            if off.len() < 2 || off[0] != 0 || off.windows(2).any(|w| w[0] > w[1]) {
                return Err(Error::Config(format!(
                    "invalid partition offsets for node type {ntype}: {off:?}"
                )));
            }
            match num_parts {
                None => num_parts = Some(off.len() - 1),
                Some(p) if p != off.len() - 1 => {
                    return Err(Error::Config(format!(
                        "node type {ntype} has {} partitions, expected {p}",
                        off.len() - 1
                    )))
                }
                _ => {}
            }
        }
        Ok(Self {
            num_parts: num_parts.unwrap_or(1),
            offsets,
        })
    }

    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    pub fn partition_policy(&self, ntype: &str) -> Result<PartitionPolicy> {
        let offsets = self
            .offsets
            .get(ntype)
            .ok_or_else(|| Error::UnknownNodeType(ntype.to_string()))?;
        Ok(PartitionPolicy {
            ntype: ntype.to_string(),
            offsets: offsets.clone(),
        })
    }

    pub fn owner(&self, ntype: &str, node: u32) -> Result<usize> {
        self.partition_policy(ntype)?.owner(node)
    }

    /// The node ids of `ntype` owned by `rank`.
    pub fn node_split(&self, ntype: &str, rank: usize) -> Result<Vec<u32>> {
        self.partition_policy(ntype)?.local_nodes(rank)
    }
}

/// The owner lookup of a single node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPolicy {
    ntype: String,
    offsets: Vec<u32>,
}

impl PartitionPolicy {
    pub fn ntype(&self) -> &str {
        &self.ntype
    }

    pub fn num_nodes(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0) as usize
    }

    pub fn num_parts(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn owner(&self, node: u32) -> Result<usize> {
        if node as usize >= self.num_nodes() {
            return Err(Error::NodeOutOfRange {
                ntype: self.ntype.clone(),
                node,
                num_nodes: self.num_nodes(),
            });
        }
        // empty partitions repeat an offset; the last one not above `node` wins
        Ok(self.offsets.partition_point(|&o| o <= node) - 1)
    }

    pub fn local_nodes(&self, rank: usize) -> Result<Vec<u32>> {
        if rank >= self.num_parts() {
            return Err(Error::Config(format!(
                "rank {rank} out of range for {} partitions",
                self.num_parts()
            )));
        }
        Ok((self.offsets[rank]..self.offsets[rank + 1]).collect())
    }
}
