use crate::dist::Communicator;
use crate::Result;

/// One iteration of a [`SynchronizedIter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep<T> {
    Batch(T),
    /// The local iterator is exhausted but other workers still have batches.
    Padding,
}

impl<T> SyncStep<T> {
    pub fn is_real(&self) -> bool {
        matches!(self, Self::Batch(_))
    }
}

/// Runs a local iterator for the largest local length of the group.
///
/// Collective backends require every worker to issue the same number of
/// collective calls per loop, so workers with fewer batches keep iterating
/// with [`SyncStep::Padding`] until every worker is done.
pub struct SynchronizedIter<I> {
    inner: I,
    local_len: usize,
    global_len: usize,
    step: usize,
}

impl<I: Iterator> SynchronizedIter<I> {
    /// Collective: all-reduces `local_len` with MAX over the group.
    pub fn new(inner: I, local_len: usize, comm: &dyn Communicator) -> Result<Self> {
        let global_len = comm.all_reduce_max(local_len as u64)? as usize;
        Ok(Self {
            inner,
            local_len,
            global_len,
            step: 0,
        })
    }

    pub fn local_len(&self) -> usize {
        self.local_len
    }

    /// Number of iterations every worker performs.
    pub fn global_len(&self) -> usize {
        self.global_len
    }

    /// Index of the next step.
    pub fn step(&self) -> usize {
        self.step
    }

    /// The next local item, `Padding` once the local iterator is exhausted,
    /// or `None` after `global_len` steps.
    pub fn next_or_empty(&mut self) -> Option<SyncStep<I::Item>> {
        if self.step >= self.global_len {
            return None;
        }
        self.step += 1;
        Some(match self.inner.next() {
            Some(item) => SyncStep::Batch(item),
            None => SyncStep::Padding,
        })
    }
}

impl<I: Iterator> Iterator for SynchronizedIter<I> {
    type Item = SyncStep<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_or_empty()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.global_len - self.step;
        (left, Some(left))
    }
}
