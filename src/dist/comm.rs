use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use super::HostBuffer;
use crate::{Error, Result};

/// Collective operations every worker issues in lockstep.
///
/// Each call blocks until all workers of the group have made the matching
/// call. A worker that never arrives stalls the rest; there is no timeout.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn all_reduce_max(&self, value: u64) -> Result<u64>;
    /// Element-wise sum of equally sized vectors.
    fn all_reduce_sum(&self, values: &[u64]) -> Result<Vec<u64>>;
    /// Every worker receives every worker's payload, indexed by rank.
    fn all_gather(&self, data: HostBuffer) -> Result<Vec<HostBuffer>>;
    fn barrier(&self) -> Result<()>;
}

/// A group of one. Every collective is a local no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }
    fn world_size(&self) -> usize {
        1
    }
    fn all_reduce_max(&self, value: u64) -> Result<u64> {
        Ok(value)
    }
    fn all_reduce_sum(&self, values: &[u64]) -> Result<Vec<u64>> {
        Ok(values.to_vec())
    }
    fn all_gather(&self, data: HostBuffer) -> Result<Vec<HostBuffer>> {
        Ok(vec![data])
    }
    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct Exchange {
    barrier: Barrier,
    ints: Mutex<Vec<Vec<u64>>>,
    buffers: Mutex<Vec<HostBuffer>>,
}

/// Factory for an in-process group of workers, one handle per thread.
pub struct LocalCluster;

impl LocalCluster {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(world_size: usize) -> Vec<LocalComm> {
        let shared = Arc::new(Exchange {
            barrier: Barrier::new(world_size),
            ints: Mutex::new(vec![Vec::new(); world_size]),
            buffers: Mutex::new(vec![HostBuffer::F32(Vec::new()); world_size]),
        });
        (0..world_size)
            .map(|rank| LocalComm {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

pub struct LocalComm {
    rank: usize,
    world_size: usize,
    shared: Arc<Exchange>,
}

impl LocalComm {
    // Publish, wait for everyone, snapshot, then wait again so no worker
    // overwrites its slot before the slowest reader has taken its copy.
    fn exchange<T: Clone>(&self, slots: &Mutex<Vec<T>>, value: T) -> Vec<T> {
        slots.lock()[self.rank] = value;
        self.shared.barrier.wait();
        let all = slots.lock().clone();
        self.shared.barrier.wait();
        all
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn world_size(&self) -> usize {
        self.world_size
    }
    fn all_reduce_max(&self, value: u64) -> Result<u64> {
        let all = self.exchange(&self.shared.ints, vec![value]);
        Ok(all.iter().flatten().copied().max().unwrap_or(value))
    }
    fn all_reduce_sum(&self, values: &[u64]) -> Result<Vec<u64>> {
        let all = self.exchange(&self.shared.ints, values.to_vec());
        let mut out = vec![0u64; values.len()];
        for (rank, contrib) in all.iter().enumerate() {
            if contrib.len() != values.len() {
                return Err(Error::Comm(format!(
                    "all_reduce_sum: rank {rank} sent {} values, expected {}",
                    contrib.len(),
                    values.len()
                )));
            }
            for (acc, v) in out.iter_mut().zip(contrib) {
                *acc += v;
            }
        }
        Ok(out)
    }
    fn all_gather(&self, data: HostBuffer) -> Result<Vec<HostBuffer>> {
        Ok(self.exchange(&self.shared.buffers, data))
    }
    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_process_is_identity() -> Result<()> {
        let comm = SingleProcess;
        assert_eq!(comm.all_reduce_max(7)?, 7);
        assert_eq!(comm.all_reduce_sum(&[1, 2])?, vec![1, 2]);
        let data = HostBuffer::F32(vec![1.0]);
        assert_eq!(comm.all_gather(data.clone())?, vec![data]);
        Ok(())
    }

    #[test]
    fn local_cluster_collectives() {
        let handles: Vec<_> = LocalCluster::new(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank() as u64;
                    let max = comm.all_reduce_max(rank * 10).unwrap();
                    let sum = comm.all_reduce_sum(&[rank, 1]).unwrap();
                    let gathered = comm
                        .all_gather(HostBuffer::I64(vec![rank as i64; rank as usize]))
                        .unwrap();
                    comm.barrier().unwrap();
                    (max, sum, gathered)
                })
            })
            .collect();
        for h in handles {
            let (max, sum, gathered) = h.join().unwrap();
            assert_eq!(max, 20);
            assert_eq!(sum, vec![3, 3]);
            assert_eq!(
                gathered,
                vec![
                    HostBuffer::I64(vec![]),
                    HostBuffer::I64(vec![1]),
                    HostBuffer::I64(vec![2, 2])
                ]
            );
        }
    }
}
