use std::sync::Arc;

use crate::dist::{
    Communicator, DistTensorStore, LocalCluster, PartitionBook, PartitionPolicy, SingleProcess,
};
use crate::{CanonicalEtype, Error, Result};

use super::HeteroGraph;

/// One worker's handle on a partitioned graph.
///
/// All handles of a group share the graph structure, the partition book and
/// the tensor store; each carries its own communicator.
#[derive(Clone)]
pub struct DistGraph {
    graph: Arc<HeteroGraph>,
    book: Arc<PartitionBook>,
    store: DistTensorStore,
    comm: Arc<dyn Communicator>,
}

impl DistGraph {
    pub fn new(
        graph: Arc<HeteroGraph>,
        book: Arc<PartitionBook>,
        store: DistTensorStore,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        if book.num_parts() != comm.world_size() {
            return Err(Error::Config(format!(
                "partition book has {} partitions but the world size is {}",
                book.num_parts(),
                comm.world_size()
            )));
        }
        for (ntype, &n) in graph.num_nodes() {
            let policy = book.partition_policy(ntype)?;
            if policy.num_nodes() != n {
                return Err(Error::Config(format!(
                    "partition book covers {} nodes of {ntype}, graph has {n}",
                    policy.num_nodes()
                )));
            }
        }
        Ok(Self {
            graph,
            book,
            store,
            comm,
        })
    }

    /// The whole graph on a single worker.
    pub fn single(graph: HeteroGraph) -> Result<Self> {
        let book = PartitionBook::even(graph.num_nodes(), 1)?;
        Self::new(
            Arc::new(graph),
            Arc::new(book),
            DistTensorStore::new(),
            Arc::new(SingleProcess),
        )
    }

    /// One handle per simulated worker, in rank order.
    pub fn local_cluster(graph: HeteroGraph, book: PartitionBook) -> Result<Vec<Self>> {
        let graph = Arc::new(graph);
        let book = Arc::new(book);
        let store = DistTensorStore::new();
        LocalCluster::new(book.num_parts())
            .into_iter()
            .map(|comm| Self::new(graph.clone(), book.clone(), store.clone(), Arc::new(comm)))
            .collect()
    }

    pub fn graph(&self) -> &HeteroGraph {
        &self.graph
    }
    pub fn store(&self) -> &DistTensorStore {
        &self.store
    }
    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }
    pub fn partition_book(&self) -> &PartitionBook {
        &self.book
    }
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }
    pub fn ntypes(&self) -> Vec<String> {
        self.graph.ntypes()
    }
    pub fn canonical_etypes(&self) -> Vec<CanonicalEtype> {
        self.graph.canonical_etypes()
    }
    pub fn number_of_nodes(&self, ntype: &str) -> Result<usize> {
        self.graph.number_of_nodes(ntype)
    }
    pub fn partition_policy(&self, ntype: &str) -> Result<PartitionPolicy> {
        self.book.partition_policy(ntype)
    }

    /// The nodes of `ntype` this worker computes: its own partition.
    pub fn node_split(&self, ntype: &str) -> Result<Vec<u32>> {
        self.book.node_split(ntype, self.rank())
    }

    pub fn barrier(&self) -> Result<()> {
        self.comm.barrier()
    }
}
