//! Call-order recording wrapper.
//!
//! Lock-step traversal across ranks cannot be checked by the type system, so
//! it is checked by observation: wrap each rank's group, run the same step on
//! every rank, and compare the recorded call sequences.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::comm::{CollectiveCall, CollectiveKind, ProcessGroup, barrier_call, call_of};
use crate::error::Result;

/// Shared, append-only log of collective calls.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<CollectiveCall>>,
}

impl CallLog {
    fn push(&self, call: CollectiveCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Copy of every call recorded so far, in order.
    pub fn snapshot(&self) -> Vec<CollectiveCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of recorded calls of `kind`.
    pub fn count(&self, kind: CollectiveKind) -> usize {
        self.snapshot().iter().filter(|c| c.kind == kind).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

/// Forwards every collective to `inner` after logging its signature.
#[derive(Debug)]
pub struct RecordingProcessGroup<R, G> {
    inner: G,
    log: Arc<CallLog>,
    _runtime: PhantomData<fn() -> R>,
}

impl<R: Runtime, G: ProcessGroup<R>> RecordingProcessGroup<R, G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            log: Arc::new(CallLog::default()),
            _runtime: PhantomData,
        }
    }

    /// Handle onto the log that outlives moving the group elsewhere.
    pub fn log(&self) -> Arc<CallLog> {
        self.log.clone()
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

impl<R: Runtime, G: ProcessGroup<R>> ProcessGroup<R> for RecordingProcessGroup<R, G> {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn device(&self) -> &R::Device {
        self.inner.device()
    }

    fn all_gather(&self, local: &Tensor<R>) -> Result<Tensor<R>> {
        self.log.push(call_of(CollectiveKind::AllGather, local));
        self.inner.all_gather(local)
    }

    fn reduce_scatter(&self, full: &Tensor<R>) -> Result<Tensor<R>> {
        self.log.push(call_of(CollectiveKind::ReduceScatter, full));
        self.inner.reduce_scatter(full)
    }

    fn all_reduce(&self, t: &Tensor<R>) -> Result<Tensor<R>> {
        self.log.push(call_of(CollectiveKind::AllReduce, t));
        self.inner.all_reduce(t)
    }

    fn broadcast(&self, t: &Tensor<R>, root: usize) -> Result<Tensor<R>> {
        self.log.push(call_of(CollectiveKind::Broadcast { root }, t));
        self.inner.broadcast(t, root)
    }

    fn barrier(&self) -> Result<()> {
        self.log.push(barrier_call());
        self.inner.barrier()
    }
}

#[cfg(test)]
mod tests {
    use numr::runtime::cpu::CpuRuntime;

    use super::*;
    use crate::comm::LocalProcessGroup;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_records_calls() {
        let (_, device) = cpu_setup();
        let pg = RecordingProcessGroup::new(LocalProcessGroup::<CpuRuntime>::new_group(1).remove(0));
        let log = pg.log();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        pg.all_gather(&t).unwrap();
        pg.reduce_scatter(&t).unwrap();
        pg.all_reduce(&t).unwrap();
        pg.barrier().unwrap();

        assert_eq!(log.len(), 4);
        assert_eq!(log.count(CollectiveKind::AllGather), 1);
        assert_eq!(log.count(CollectiveKind::AllReduce), 1);
        assert_eq!(log.snapshot()[1].numel, 2);
        log.clear();
        assert!(log.is_empty());
    }
}
