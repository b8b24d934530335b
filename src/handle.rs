//! Unshard/reshard controller.
//!
//! One [`FlatParamHandle`] per shard group drives the cycle
//!
//! ```text
//! Sharded ──unshard──► Unsharding ──wait_unshard──► Unsharded
//!    ▲                                                  │
//!    └──────────────── Resharding ◄─────reshard─────────┘
//! ```
//!
//! Parameters never alias the flat buffer directly. Each one carries a
//! [`ParamStorage`] that is re-pointed on every transition: a range into the
//! full buffer while unsharded, a shape-only placeholder otherwise.
//!
//! Offloaded shards are copied from host memory to the accelerator on
//! unshard; the staged copy is dropped again on reshard.

use std::ops::Range;

use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, ShapeOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use tracing::{debug, trace};

use crate::comm::{CommStream, PendingCollective};
use crate::error::{Error, Result};
use crate::flat_param::{FlatLayout, FlatParamInfo, pad_to};
use crate::precision::{CpuOffload, MixedPrecision};
use crate::store::{Residency, ShardData, ShardId, ShardStore};
use crate::tensor;

/// Lifecycle state of a shard group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Only the local shard is materialized
    Sharded,
    /// All-gather issued, not yet waited on
    Unsharding,
    /// Full buffer materialized, parameters are views into it
    Unsharded,
    /// Full buffer being released
    Resharding,
}

/// Where a parameter's data currently lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamStorage {
    /// Shape and dtype only; no data is addressable
    Placeholder,
    /// Elements of the full flat buffer backing the parameter
    View { range: Range<usize> },
}

/// Per-group behaviour fixed at construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct HandlePolicy {
    pub precision: MixedPrecision,
    pub offload: CpuOffload,
    /// When false every rank holds the whole flat buffer and unsharding
    /// needs no collective.
    pub replicate: bool,
}

enum Gather<R: Runtime> {
    InFlight(PendingCollective<Tensor<R>>),
    Ready(Tensor<R>),
}

impl<R: Runtime> std::fmt::Debug for Gather<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gather::InFlight(p) => write!(f, "InFlight(seq {})", p.seq()),
            Gather::Ready(t) => write!(f, "Ready({} elements)", t.numel()),
        }
    }
}

#[derive(Debug)]
struct PendingGrad<R: Runtime> {
    pending: PendingCollective<Tensor<R>>,
    postdivide: f64,
}

/// Pre- and post-reduction divisors whose product is `world_size`.
///
/// The pre-divisor is the smallest power of two that is at least
/// `sqrt(world_size)`, stopping early at the first power of two that does
/// not divide `world_size`; the post-divisor is the remainder, so it need
/// not be integral (3 ranks give `(2, 1.5)`).
pub fn divide_factors(world_size: usize) -> (f64, f64) {
    let mut factor = 1usize;
    while world_size % factor == 0 && world_size / factor > factor {
        factor *= 2;
    }
    let pre = factor as f64;
    (pre, world_size as f64 / pre)
}

/// Controller for one shard group's flat parameter.
#[derive(Debug)]
pub struct FlatParamHandle<R: Runtime> {
    index: usize,
    unit_path: String,
    layout: FlatLayout,
    shard_id: ShardId,
    rank: usize,
    world_size: usize,
    policy: HandlePolicy,
    state: HandleState,
    gather: Option<Gather<R>>,
    full: Option<Tensor<R>>,
    staged: Option<Tensor<R>>,
    storage: Vec<ParamStorage>,
    pending_grad: Option<PendingGrad<R>>,
}

impl<R: Runtime> FlatParamHandle<R> {
    /// `layout` is in storage dtype and sized for the ranks that split the
    /// buffer (one rank when replicating).
    pub fn new(
        index: usize,
        unit_path: impl Into<String>,
        layout: FlatLayout,
        shard_id: ShardId,
        rank: usize,
        world_size: usize,
        policy: HandlePolicy,
    ) -> Self {
        let storage = vec![ParamStorage::Placeholder; layout.params().len()];
        Self {
            index,
            unit_path: unit_path.into(),
            layout,
            shard_id,
            rank,
            world_size,
            policy,
            state: HandleState::Sharded,
            gather: None,
            full: None,
            staged: None,
            storage,
            pending_grad: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn unit_path(&self) -> &str {
        &self.unit_path
    }

    pub fn layout(&self) -> &FlatLayout {
        &self.layout
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn policy(&self) -> &HandlePolicy {
        &self.policy
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank index into the layout's partition (always 0 when replicating).
    pub fn shard_rank(&self) -> usize {
        if self.policy.replicate { 0 } else { self.rank }
    }

    pub fn storage(&self) -> &[ParamStorage] {
        &self.storage
    }

    /// Dtype parameters take while unsharded.
    pub fn compute_dtype(&self) -> DType {
        self.policy.precision.param_dtype
    }

    /// Where the full buffer lives, if one is materialized.
    pub fn full_residency(&self) -> Option<Residency> {
        self.full.as_ref().map(|_| Residency::Accelerator)
    }

    /// Bytes of transient full and staging buffers.
    pub fn transient_bytes(&self) -> usize {
        self.full.as_ref().map_or(0, tensor::nbytes)
            + self.staged.as_ref().map_or(0, tensor::nbytes)
    }

    pub fn has_staged_copy(&self) -> bool {
        self.staged.is_some()
    }

    fn invalid(&self, expected: HandleState) -> Error {
        Error::InvalidState {
            group: self.index,
            expected,
            actual: self.state,
        }
    }

    /// Issue the all-gather for this group.
    ///
    /// Returns `true` if a new gather was started and `false` if the call was
    /// coalesced with one already in flight or completed. Never blocks.
    pub fn unshard<C>(
        &mut self,
        client: &C,
        store: &ShardStore<R>,
        stream: &mut CommStream<R>,
    ) -> Result<bool>
    where
        C: TypeConversionOps<R>,
    {
        match self.state {
            HandleState::Unsharding | HandleState::Unsharded => {
                trace!(group = self.index, state = ?self.state, "unshard coalesced");
                return Ok(false);
            }
            HandleState::Resharding => return Err(self.invalid(HandleState::Sharded)),
            HandleState::Sharded => {}
        }

        let local = match store.shard(self.shard_id)? {
            ShardData::Accelerator(shard) => client.cast(shard, self.compute_dtype())?,
            ShardData::Host(host) => {
                // Host shard stays put; compute reads the staged accelerator copy
                let staged = tensor::to_device::<R>(host, stream.device())?;
                let local = client.cast(&staged, self.compute_dtype())?;
                self.staged = Some(staged);
                local
            }
        };

        self.gather = Some(if self.policy.replicate {
            Gather::Ready(local)
        } else {
            Gather::InFlight(stream.all_gather_async(local)?)
        });
        self.state = HandleState::Unsharding;
        debug!(
            rank = self.rank,
            group = self.index,
            numel = self.layout.padded_numel(),
            "unshard issued"
        );
        Ok(true)
    }

    /// Block until the gather lands and point every parameter at its view.
    ///
    /// A no-op when already unsharded. On a failed collective the group falls
    /// back to `Sharded` and the error is returned.
    pub fn wait_unshard(&mut self) -> Result<()> {
        match self.state {
            HandleState::Unsharded => return Ok(()),
            HandleState::Unsharding => {}
            _ => return Err(self.invalid(HandleState::Unsharding)),
        }
        let gathered = match self.gather.take() {
            Some(Gather::InFlight(pending)) => pending.wait(),
            Some(Gather::Ready(t)) => Ok(t),
            None => Err(Error::comm("all_gather", "no gather in flight")),
        };
        let full = match gathered {
            Ok(full) if full.numel() == self.layout.padded_numel() => full,
            Ok(full) => {
                self.abort_unshard();
                return Err(Error::comm(
                    "all_gather",
                    format!(
                        "gathered {} elements for group {}, expected {}",
                        full.numel(),
                        self.index,
                        self.layout.padded_numel()
                    ),
                ));
            }
            Err(e) => {
                self.abort_unshard();
                return Err(e);
            }
        };

        self.storage = self
            .layout
            .params()
            .iter()
            .map(|p| ParamStorage::View {
                range: p.offset..p.offset + p.numel,
            })
            .collect();
        self.full = Some(full);
        self.state = HandleState::Unsharded;
        debug!(rank = self.rank, group = self.index, "unsharded");
        Ok(())
    }

    fn abort_unshard(&mut self) {
        self.staged = None;
        self.state = HandleState::Sharded;
    }

    /// Release the full buffer and restore placeholders.
    ///
    /// A gather still in flight is waited on first so every rank consumes the
    /// same collectives. Any gradient reduction must be finished beforehand.
    pub fn reshard(&mut self) -> Result<()> {
        match self.state {
            HandleState::Sharded => return Ok(()),
            HandleState::Resharding => return Err(self.invalid(HandleState::Unsharded)),
            HandleState::Unsharding => self.wait_unshard()?,
            HandleState::Unsharded => {}
        }
        if self.pending_grad.is_some() {
            return Err(Error::InvalidArgument {
                arg: "reshard",
                reason: format!("group {} still has a gradient reduction in flight", self.index),
            });
        }

        self.state = HandleState::Resharding;
        self.full = None;
        self.staged = None;
        self.storage.fill(ParamStorage::Placeholder);
        self.state = HandleState::Sharded;
        debug!(rank = self.rank, group = self.index, "resharded");
        Ok(())
    }

    /// Start reducing a full flat gradient (compute dtype, padded or not).
    ///
    /// The result lands in the shard store on
    /// [`finish_reduce_grad`](Self::finish_reduce_grad).
    pub fn reduce_grad<C>(
        &mut self,
        client: &C,
        stream: &mut CommStream<R>,
        full_grad: &Tensor<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + TypeConversionOps<R> + ShapeOps<R> + ScalarOps<R>,
    {
        if self.state != HandleState::Unsharded {
            return Err(self.invalid(HandleState::Unsharded));
        }
        if self.pending_grad.is_some() {
            return Err(Error::InvalidArgument {
                arg: "full_grad",
                reason: format!("group {} already has a gradient reduction in flight", self.index),
            });
        }
        let len = full_grad.numel();
        if len != self.layout.numel() && len != self.layout.padded_numel() {
            return Err(Error::InvalidArgument {
                arg: "full_grad",
                reason: format!(
                    "gradient has {len} elements, group {} has {}",
                    self.index,
                    self.layout.numel()
                ),
            });
        }

        let grad = client.cast(full_grad, self.policy.precision.reduce_dtype)?;
        let mut grad = pad_to(client, &grad, self.layout.padded_numel())?;
        let (predivide, postdivide) = divide_factors(self.world_size);
        if predivide > 1.0 {
            grad = client.mul_scalar(&grad, 1.0 / predivide)?;
        }
        let pending = if self.policy.replicate {
            stream.all_reduce_async(grad)?
        } else {
            stream.reduce_scatter_async(grad)?
        };
        self.pending_grad = Some(PendingGrad {
            pending,
            postdivide,
        });
        Ok(())
    }

    /// Wait for the gradient reduction and accumulate it into the shard's
    /// gradient. No-op when nothing is in flight.
    pub fn finish_reduce_grad<C>(&mut self, client: &C, store: &mut ShardStore<R>) -> Result<()>
    where
        C: TypeConversionOps<R> + ScalarOps<R> + BinaryOps<R>,
    {
        let Some(PendingGrad {
            pending,
            postdivide,
        }) = self.pending_grad.take()
        else {
            return Ok(());
        };
        let mut reduced = pending.wait()?;
        if postdivide > 1.0 {
            reduced = client.mul_scalar(&reduced, 1.0 / postdivide)?;
        }
        let reduced = client.cast(&reduced, self.layout.dtype())?;
        store.accumulate_grad(client, self.shard_id, reduced)?;
        trace!(rank = self.rank, group = self.index, "gradient shard accumulated");
        Ok(())
    }

    pub fn has_pending_grad(&self) -> bool {
        self.pending_grad.is_some()
    }

    /// Views of every parameter; only valid while unsharded.
    pub fn param_views(&self) -> Result<Vec<ParamView<'_, R>>> {
        let full = match (&self.full, self.state) {
            (Some(full), HandleState::Unsharded) => full,
            _ => return Err(self.invalid(HandleState::Unsharded)),
        };
        self.layout
            .params()
            .iter()
            .zip(&self.storage)
            .map(|(info, storage)| match storage {
                ParamStorage::View { range } => Ok(ParamView {
                    info,
                    full,
                    range: range.clone(),
                }),
                ParamStorage::Placeholder => Err(self.invalid(HandleState::Unsharded)),
            })
            .collect()
    }
}

/// Read-only view of one unsharded parameter.
#[derive(Clone, Debug)]
pub struct ParamView<'a, R: Runtime> {
    info: &'a FlatParamInfo,
    full: &'a Tensor<R>,
    range: Range<usize>,
}

impl<'a, R: Runtime> ParamView<'a, R> {
    pub fn name(&self) -> &'a str {
        &self.info.name
    }

    pub fn shape(&self) -> &'a [usize] {
        &self.info.shape
    }

    pub fn numel(&self) -> usize {
        self.info.numel
    }

    pub fn dtype(&self) -> DType {
        self.full.dtype()
    }

    /// Zero-copy tensor over the parameter's elements of the full buffer.
    pub fn tensor(&self) -> Result<Tensor<R>> {
        tensor::view(self.full, self.range.start, &self.info.shape)
    }

    /// Owned copy with the parameter's shape.
    pub fn to_tensor(&self) -> Result<Tensor<R>> {
        let flat = tensor::copy_range(self.full, self.range.start, self.range.len())?;
        Ok(flat.reshape(&self.info.shape)?)
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        tensor::to_f64_vec(&self.to_tensor()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalProcessGroup, ProcessGroup};
    use crate::flat_param::{flatten, shard};
    use crate::test_utils::{cpu_setup, run_ranks};
    use numr::runtime::cpu::{CpuClient, CpuRuntime};
    use std::sync::Arc;

    type Handle = FlatParamHandle<CpuRuntime>;

    fn f32s(values: &[f32]) -> Tensor<CpuRuntime> {
        Tensor::from_slice(values, &[values.len()], &cpu_setup().1)
    }

    fn single_rank_handle(
        values: Vec<f32>,
        policy: HandlePolicy,
    ) -> (CpuClient, Handle, ShardStore<CpuRuntime>, CommStream<CpuRuntime>) {
        let (client, _) = cpu_setup();
        let layout = FlatLayout::new(
            vec![("a".to_string(), vec![2]), ("b".to_string(), vec![values.len() - 2])],
            DType::F32,
            1,
        )
        .unwrap();
        let flat = flatten(&client, &layout, &[f32s(&values[..2]), f32s(&values[2..])]).unwrap();
        let mut store = ShardStore::new();
        let id = store.insert(flat, policy.offload.shard_residency()).unwrap();
        let handle = FlatParamHandle::new(0, "unit", layout, id, 0, 1, policy);
        let pg = LocalProcessGroup::<CpuRuntime>::new_group(1).remove(0);
        let stream = CommStream::new(Arc::new(pg)).unwrap();
        (client, handle, store, stream)
    }

    #[test]
    fn test_divide_factors() {
        assert_eq!(divide_factors(1), (1.0, 1.0));
        assert_eq!(divide_factors(2), (2.0, 1.0));
        assert_eq!(divide_factors(8), (4.0, 2.0));
        assert_eq!(divide_factors(16), (4.0, 4.0));
        // 2 does not divide 3 evenly, so the loop stops after one doubling
        assert_eq!(divide_factors(3), (2.0, 1.5));
        for world in 1..=64 {
            let (pre, post) = divide_factors(world);
            assert!((pre * post - world as f64).abs() < 1e-12, "world_size={world}");
        }
    }

    #[test]
    fn test_cycle_and_views() {
        let (client, mut h, store, mut stream) =
            single_rank_handle(vec![1.0, 2.0, 3.0], HandlePolicy::default());
        assert_eq!(h.state(), HandleState::Sharded);
        assert!(h.param_views().is_err());

        assert!(h.unshard(&client, &store, &mut stream).unwrap());
        assert_eq!(h.state(), HandleState::Unsharding);
        h.wait_unshard().unwrap();
        assert_eq!(h.state(), HandleState::Unsharded);
        assert_eq!(h.storage()[1], ParamStorage::View { range: 2..3 });

        let views = h.param_views().unwrap();
        assert_eq!(views[0].name(), "a");
        assert_eq!(views[0].to_tensor().unwrap().to_vec::<f32>(), vec![1.0, 2.0]);
        assert_eq!(views[1].to_f64_vec().unwrap(), vec![3.0]);
        let b = views[1].tensor().unwrap();
        assert_eq!(b.storage().ptr(), h.full.as_ref().unwrap().storage().ptr());
        assert_eq!(b.contiguous().to_vec::<f32>(), vec![3.0]);
        drop(views);

        h.reshard().unwrap();
        assert_eq!(h.state(), HandleState::Sharded);
        assert!(h.storage().iter().all(|s| *s == ParamStorage::Placeholder));
        assert_eq!(h.transient_bytes(), 0);
    }

    #[test]
    fn test_unshard_coalesces() {
        let (client, mut h, store, mut stream) =
            single_rank_handle(vec![1.0, 2.0, 3.0], HandlePolicy::default());
        assert!(h.unshard(&client, &store, &mut stream).unwrap());
        assert!(!h.unshard(&client, &store, &mut stream).unwrap());
        h.wait_unshard().unwrap();
        assert!(!h.unshard(&client, &store, &mut stream).unwrap());
        assert_eq!(stream.issued(), 1);
    }

    #[test]
    fn test_invalid_transitions() {
        let (client, mut h, _store, mut stream) =
            single_rank_handle(vec![1.0, 2.0, 3.0], HandlePolicy::default());
        let err = h.wait_unshard().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                expected: HandleState::Unsharding,
                actual: HandleState::Sharded,
                ..
            }
        ));
        let grad = f32s(&[0.0; 3]);
        assert!(h.reduce_grad(&client, &mut stream, &grad).is_err());
        // Resharding an already sharded group is harmless
        h.reshard().unwrap();
    }

    #[test]
    fn test_reshard_consumes_inflight_gather() {
        let (client, mut h, store, mut stream) =
            single_rank_handle(vec![1.0, 2.0, 3.0], HandlePolicy::default());
        h.unshard(&client, &store, &mut stream).unwrap();
        h.reshard().unwrap();
        assert_eq!(h.state(), HandleState::Sharded);
        assert!(h.unshard(&client, &store, &mut stream).unwrap());
    }

    #[test]
    fn test_offload_stages_device_copy() {
        let policy = HandlePolicy {
            offload: CpuOffload {
                offload_params: true,
            },
            ..Default::default()
        };
        let (client, mut h, store, mut stream) = single_rank_handle(vec![1.0, 2.0, 3.0], policy);
        let ShardData::Host(host) = store.shard(h.shard_id()).unwrap() else {
            panic!("offloaded shard should live in host memory");
        };
        let host_ptr = host.storage().ptr();

        h.unshard(&client, &store, &mut stream).unwrap();
        h.wait_unshard().unwrap();
        assert!(h.has_staged_copy());
        let staged = h.staged.as_ref().unwrap();
        assert_ne!(staged.storage().ptr(), host_ptr);
        assert_eq!(staged.to_vec::<f32>(), vec![1.0, 2.0, 3.0]);
        assert_eq!(h.transient_bytes(), 2 * 3 * 4);
        assert_eq!(h.full_residency(), Some(Residency::Accelerator));
        assert_eq!(store.residency(h.shard_id()).unwrap(), Residency::Host);

        h.reshard().unwrap();
        assert!(!h.has_staged_copy());
        assert_eq!(h.full_residency(), None);
        assert_eq!(store.shard(h.shard_id()).unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_compute_dtype_cast() {
        let policy = HandlePolicy {
            precision: MixedPrecision::bf16(),
            ..Default::default()
        };
        let (client, mut h, store, mut stream) = single_rank_handle(vec![1.0, 2.0, 3.0], policy);
        h.unshard(&client, &store, &mut stream).unwrap();
        h.wait_unshard().unwrap();
        let views = h.param_views().unwrap();
        assert_eq!(views[0].dtype(), DType::BF16);
        assert_eq!(views[0].to_tensor().unwrap().dtype(), DType::BF16);
        // Shard itself stays in storage dtype
        assert_eq!(store.shard(h.shard_id()).unwrap().dtype(), DType::F32);
    }

    #[test]
    fn test_grad_reduce_averages_across_ranks() {
        let results = run_ranks(2, |pg| {
            let (client, device) = cpu_setup();
            let rank = pg.rank();
            let layout =
                FlatLayout::new(vec![("w".to_string(), vec![3])], DType::F32, 2).unwrap();
            let flat = flatten(&client, &layout, &[f32s(&[1.0, 2.0, 3.0])]).unwrap();
            let mut store = ShardStore::new();
            let local = shard(&client, &layout, &flat, rank).unwrap();
            let id = store.insert(local, Residency::Accelerator).unwrap();
            let mut h = FlatParamHandle::new(0, "", layout, id, rank, 2, HandlePolicy::default());
            let mut stream = CommStream::new(Arc::new(pg)).unwrap();

            h.unshard(&client, &store, &mut stream).unwrap();
            h.wait_unshard().unwrap();
            let full = h.param_views().unwrap()[0].to_f64_vec().unwrap();

            // rank 0 contributes [2, 4, 6], rank 1 contributes [4, 8, 12]
            let scale = (rank + 1) as f32 * 2.0;
            let grad =
                Tensor::<CpuRuntime>::from_slice(&[scale, 2.0 * scale, 3.0 * scale], &[3], &device);
            h.reduce_grad(&client, &mut stream, &grad).unwrap();
            assert!(h.reshard().is_err());
            h.finish_reduce_grad(&client, &mut store).unwrap();
            h.reshard().unwrap();
            let grad = store.grad(id).unwrap().map(|g| g.to_f64_vec().unwrap());
            (full, grad)
        });

        assert_eq!(results[0].0, vec![1.0, 2.0, 3.0]);
        assert_eq!(results[0].0, results[1].0);
        // mean over ranks: [3, 6, 9], padded to 4 and split in two
        assert_eq!(results[0].1, Some(vec![3.0, 6.0]));
        assert_eq!(results[1].1, Some(vec![9.0, 0.0]));
    }
}
