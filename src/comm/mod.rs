//! Collective gateway.
//!
//! [`ProcessGroup`] is the narrow transport contract the coordinator needs:
//! all-gather, reduce-scatter, all-reduce, broadcast and barrier over
//! device tensors. Every rank must issue the same collectives in the same order;
//! [`CommStream`] preserves issue order while letting callers overlap
//! communication with compute.

pub mod local;
pub mod recording;
pub mod stream;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};

pub use local::LocalProcessGroup;
pub use recording::{CallLog, RecordingProcessGroup};
pub use stream::{CommStream, PendingCollective};

/// Which collective a call was.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    AllGather,
    ReduceScatter,
    AllReduce,
    Broadcast { root: usize },
    Barrier,
}

impl CollectiveKind {
    pub fn name(&self) -> &'static str {
        match self {
            CollectiveKind::AllGather => "all_gather",
            CollectiveKind::ReduceScatter => "reduce_scatter",
            CollectiveKind::AllReduce => "all_reduce",
            CollectiveKind::Broadcast { .. } => "broadcast",
            CollectiveKind::Barrier => "barrier",
        }
    }
}

/// Signature of one collective call: every rank must agree on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectiveCall {
    pub kind: CollectiveKind,
    /// Elements contributed by each rank
    pub numel: usize,
    pub dtype: DType,
}

/// Collective-communication capability over a fixed, ordered set of ranks.
///
/// Inputs and outputs are 1-D tensors on [`device`](Self::device).
/// Implementations block until the collective completes on this rank. All
/// methods are synchronization points: every rank of the group must call
/// the matching method, in the same relative order.
pub trait ProcessGroup<R: Runtime>: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Device this rank's tensors live on.
    fn device(&self) -> &R::Device;

    /// Concatenate every rank's `local` (equal lengths) in rank order.
    fn all_gather(&self, local: &Tensor<R>) -> Result<Tensor<R>>;

    /// Sum `full` element-wise across ranks and return this rank's
    /// `1 / world_size` partition of the sum.
    fn reduce_scatter(&self, full: &Tensor<R>) -> Result<Tensor<R>>;

    /// Element-wise sum across ranks, delivered to every rank.
    fn all_reduce(&self, t: &Tensor<R>) -> Result<Tensor<R>>;

    /// `root`'s `t`, delivered to every rank.
    fn broadcast(&self, t: &Tensor<R>, root: usize) -> Result<Tensor<R>>;

    fn barrier(&self) -> Result<()>;
}

/// Signature of `t` as a collective of `kind`.
pub(crate) fn call_of<R: Runtime>(kind: CollectiveKind, t: &Tensor<R>) -> CollectiveCall {
    CollectiveCall {
        kind,
        numel: t.numel(),
        dtype: t.dtype(),
    }
}

/// Signature shared by every barrier.
pub(crate) fn barrier_call() -> CollectiveCall {
    CollectiveCall {
        kind: CollectiveKind::Barrier,
        numel: 0,
        dtype: DType::F32,
    }
}

/// Check that `full` can be evenly reduce-scattered over `world` ranks.
pub(crate) fn check_divisible<R: Runtime>(full: &Tensor<R>, world: usize) -> Result<()> {
    if world == 0 || full.numel() % world != 0 {
        return Err(Error::comm(
            "reduce_scatter",
            format!("{} elements not divisible by world size {world}", full.numel()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use numr::runtime::cpu::CpuRuntime;

    use super::*;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_kind_names() {
        assert_eq!(CollectiveKind::AllGather.name(), "all_gather");
        assert_eq!(CollectiveKind::Broadcast { root: 1 }.name(), "broadcast");
    }

    #[test]
    fn test_check_divisible() {
        let (_, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 6], &[6], &device);
        assert!(check_divisible(&t, 3).is_ok());
        assert!(check_divisible(&t, 4).unwrap_err().is_communication());
        assert_eq!(call_of(CollectiveKind::AllReduce, &t).numel, 6);
    }
}
