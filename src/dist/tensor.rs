use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use parking_lot::{Mutex, RwLock};

use super::{Communicator, HostBuffer, PartitionPolicy};
use crate::{Error, Result};

struct Rows {
    data: HostBuffer,
    writers: Vec<Option<usize>>,
}

/// A `(num_nodes, dim)` array addressed by global node id and shared by
/// every worker of the group.
///
/// Rows are kept in a [`HostBuffer`] wide enough for the tensor's dtype and
/// converted back to that dtype on read.
/// A row may only be written by the rank owning it under the partition
/// policy; rows never written read as zeros.
#[derive(Clone)]
pub struct DistTensor {
    name: String,
    shape: (usize, usize),
    dtype: DType,
    persistent: bool,
    policy: PartitionPolicy,
    rows: Arc<RwLock<Rows>>,
}

impl fmt::Debug for DistTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistTensor")
            .field("name", &self.name)
            .field("ntype", &self.policy.ntype())
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl DistTensor {
    fn new(
        name: &str,
        shape: (usize, usize),
        dtype: DType,
        policy: PartitionPolicy,
        persistent: bool,
    ) -> Self {
        let (num_rows, dim) = shape;
        Self {
            name: name.to_string(),
            shape,
            dtype,
            persistent,
            policy,
            rows: Arc::new(RwLock::new(Rows {
                data: HostBuffer::zeros(dtype, num_rows * dim),
                writers: vec![None; num_rows],
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }
    pub fn dim(&self) -> usize {
        self.shape.1
    }
    pub fn dtype(&self) -> DType {
        self.dtype
    }
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
    pub fn partition_policy(&self) -> &PartitionPolicy {
        &self.policy
    }

    fn shape_error(&self, actual: &[usize]) -> Error {
        Error::ShapeMismatch {
            name: self.name.clone(),
            expected: vec![self.shape.0, self.shape.1],
            actual: actual.to_vec(),
        }
    }

    /// Writes `values` (one row per id) on behalf of `rank`.
    pub fn write(&self, rank: usize, node_ids: &[u32], values: &Tensor) -> Result<()> {
        let dims = values.dims();
        if dims.len() != 2 || dims[0] != node_ids.len() || dims[1] != self.shape.1 {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                expected: vec![node_ids.len(), self.shape.1],
                actual: dims.to_vec(),
            });
        }
        for &node in node_ids {
            let owner = self.policy.owner(node)?;
            if owner != rank {
                return Err(Error::NotOwner {
                    name: self.name.clone(),
                    node,
                    rank,
                    owner,
                });
            }
        }
        if node_ids.is_empty() {
            return Ok(());
        }
        let values = HostBuffer::from_tensor(values, self.dtype)?;
        let mut rows = self.rows.write();
        rows.data.scatter_rows(node_ids, &values, self.shape.1)?;
        for &node in node_ids {
            rows.writers[node as usize] = Some(rank);
        }
        Ok(())
    }

    /// Gathers the rows of `node_ids` onto `device`.
    pub fn read(&self, node_ids: &[u32], device: &Device) -> Result<Tensor> {
        if let Some(&node) = node_ids.iter().find(|&&v| v as usize >= self.shape.0) {
            return Err(Error::NodeOutOfRange {
                ntype: self.policy.ntype().to_string(),
                node,
                num_nodes: self.shape.0,
            });
        }
        let dim = self.shape.1;
        let buf = self.rows.read().data.gather_rows(node_ids, dim);
        buf.into_tensor((node_ids.len(), dim), self.dtype, device)
    }

    /// The rank that last wrote `node`, if any.
    pub fn writer_of(&self, node: u32) -> Option<usize> {
        self.rows.read().writers.get(node as usize).copied().flatten()
    }
}

/// Registry of the distributed tensors of one worker group, keyed by
/// `(node type, name)`.
///
/// `create` is called by every worker; the first call allocates and the
/// others receive the same handle.
#[derive(Clone, Default)]
pub struct DistTensorStore {
    tensors: Arc<Mutex<HashMap<(String, String), DistTensor>>>,
}

impl DistTensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        name: &str,
        shape: (usize, usize),
        dtype: DType,
        policy: PartitionPolicy,
        persistent: bool,
    ) -> Result<DistTensor> {
        if policy.num_nodes() != shape.0 {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: vec![policy.num_nodes(), shape.1],
                actual: vec![shape.0, shape.1],
            });
        }
        let key = (policy.ntype().to_string(), name.to_string());
        let mut tensors = self.tensors.lock();
        if let Some(existing) = tensors.get(&key) {
            if existing.shape != shape {
                return Err(existing.shape_error(&[shape.0, shape.1]));
            }
            return Ok(existing.clone());
        }
        tracing::debug!(name, ntype = policy.ntype(), ?shape, persistent, "create dist tensor");
        let tensor = DistTensor::new(name, shape, dtype, policy, persistent);
        tensors.insert(key, tensor.clone());
        Ok(tensor)
    }

    pub fn get(&self, ntype: &str, name: &str) -> Option<DistTensor> {
        self.tensors
            .lock()
            .get(&(ntype.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tensors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every worker's completed writes visible to every other worker.
    pub fn flush(&self, comm: &dyn Communicator) -> Result<()> {
        comm.barrier()
    }

    /// Releases a non-persistent tensor. Returns whether it was still registered;
    /// every worker may call this for the same tensor.
    pub fn drop_tensor(&self, ntype: &str, name: &str) -> Result<bool> {
        let key = (ntype.to_string(), name.to_string());
        let mut tensors = self.tensors.lock();
        match tensors.get(&key) {
            Some(t) if t.persistent => Err(Error::PersistentDrop(name.to_string())),
            Some(_) => {
                tensors.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_persistent(&self, ntype: &str, name: &str) -> Option<DistTensor> {
        self.tensors
            .lock()
            .remove(&(ntype.to_string(), name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::PartitionBook;
    use crate::NodeMap;

    fn policy() -> PartitionPolicy {
        PartitionBook::even(&NodeMap::from([("user".to_string(), 4)]), 2)
            .and_then(|b| b.partition_policy("user"))
            .unwrap()
    }

    #[test]
    fn write_then_read() -> Result<()> {
        let store = DistTensorStore::new();
        let t = store.create("h-0", (4, 2), DType::F32, policy(), false)?;
        let v = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?;
        t.write(1, &[2, 3], &v)?;
        let out = t.read(&[3, 0, 2], &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(out, vec![vec![3., 4.], vec![0., 0.], vec![1., 2.]]);
        // re-reading has no side effect
        let again = t.read(&[3, 0, 2], &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(out, again);
        assert_eq!(t.writer_of(2), Some(1));
        assert_eq!(t.writer_of(0), None);
        Ok(())
    }

    #[test]
    fn write_outside_partition_fails() -> Result<()> {
        let store = DistTensorStore::new();
        let t = store.create("h-0", (4, 1), DType::F32, policy(), false)?;
        let v = Tensor::new(&[[1f32]], &Device::Cpu)?;
        assert!(matches!(
            t.write(0, &[3], &v),
            Err(Error::NotOwner { owner: 1, .. })
        ));
        assert!(matches!(
            t.write(0, &[0, 1], &v),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn create_is_shared_and_checks_shape() -> Result<()> {
        let store = DistTensorStore::new();
        let a = store.create("h-last", (4, 3), DType::F32, policy(), true)?;
        let b = store.create("h-last", (4, 3), DType::F32, policy(), true)?;
        a.write(0, &[1], &Tensor::ones((1, 3), DType::F32, &Device::Cpu)?)?;
        assert_eq!(b.read(&[1], &Device::Cpu)?.to_vec2::<f32>()?, vec![vec![1.; 3]]);
        assert!(store
            .create("h-last", (4, 5), DType::F32, policy(), true)
            .is_err());
        Ok(())
    }

    #[test]
    fn only_non_persistent_tensors_drop() -> Result<()> {
        let store = DistTensorStore::new();
        store.create("h-0", (4, 1), DType::F32, policy(), false)?;
        store.create("h-last", (4, 1), DType::F32, policy(), true)?;
        assert!(store.drop_tensor("user", "h-0")?);
        assert!(!store.drop_tensor("user", "h-0")?);
        assert!(matches!(
            store.drop_tensor("user", "h-last"),
            Err(Error::PersistentDrop(_))
        ));
        assert!(store.remove_persistent("user", "h-last").is_some());
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn read_keeps_dtype() -> Result<()> {
        let store = DistTensorStore::new();
        let t = store.create("h", (4, 2), DType::F64, policy(), false)?;
        let out = t.read(&[], &Device::Cpu)?;
        assert_eq!(out.dims(), &[0, 2]);
        assert_eq!(out.dtype(), DType::F64);
        Ok(())
    }

    #[test]
    fn rows_keep_full_precision() -> Result<()> {
        let store = DistTensorStore::new();
        let t = store.create("score", (4, 1), DType::F64, policy(), false)?;
        t.write(0, &[1], &Tensor::new(&[[1.000000000001f64]], &Device::Cpu)?)?;
        assert_eq!(t.read(&[1], &Device::Cpu)?.to_vec2::<f64>()?, vec![vec![1.000000000001]]);

        let ids = store.create("ids", (4, 1), DType::I64, policy(), false)?;
        ids.write(1, &[3], &Tensor::new(&[[16_777_217i64]], &Device::Cpu)?)?;
        assert_eq!(ids.read(&[3], &Device::Cpu)?.to_vec2::<i64>()?, vec![vec![16_777_217]]);
        Ok(())
    }
}
