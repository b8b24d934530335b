//! Sharded module coordinator.
//!
//! [`ShardedModule`] owns one worker's share of a wrapped model: the shard
//! store, one [`FlatParamHandle`] per group, the communication stream and the
//! prefetch scheduler. Compute stays with the caller; it drives the groups
//! through [`ForwardContext`] and [`BackwardContext`].
//!
//! Every rank must build its module from an identical tree and policy and
//! then drive the same units in the same order. Collectives are issued in
//! that order, which is what keeps all ranks in lock-step.

use std::collections::BTreeMap;
use std::sync::Arc;

use numr::ops::{ScalarOps, TensorOps, TypeConversionOps};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::{debug, info, warn};

use crate::comm::{CommStream, ProcessGroup};
use crate::config::ShardingConfig;
use crate::error::{Error, Result};
use crate::flat_param::{flatten, flatten_params, shard};
use crate::handle::{FlatParamHandle, HandlePolicy, HandleState, ParamView};
use crate::module::ModuleNode;
use crate::prefetch::{BackwardPrefetch, ExecOrder, Prefetcher};
use crate::state_dict::{self, FullStateDictConfig, StateDict, StateDictType};
use crate::store::{Residency, ShardData, ShardStore};
use crate::tensor;
use crate::wrap::{WrapPolicy, partition};

/// Memory held by one worker, by residency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Shards and gradients resting in host memory
    pub host_bytes: usize,
    /// Shards, gradients, full buffers and staging copies on the accelerator
    pub accelerator_bytes: usize,
    /// Groups currently not `Sharded`
    pub unsharded_groups: usize,
    /// Most groups simultaneously not `Sharded` since the last reset
    pub peak_unsharded_groups: usize,
}

/// One worker's view of a sharded model.
pub struct ShardedModule<R: Runtime>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    rank: usize,
    world_size: usize,
    config: ShardingConfig,
    client: R::Client,
    store: ShardStore<R>,
    handles: Vec<FlatParamHandle<R>>,
    stream: CommStream<R>,
    prefetcher: Prefetcher,
    state_dict_type: StateDictType,
    full_state_dict: FullStateDictConfig,
    peak_unsharded: usize,
}

impl<R: Runtime> ShardedModule<R>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    /// Wrap `root` using the wrap policy from `config`.
    pub fn new(
        root: ModuleNode<R>,
        group: Arc<dyn ProcessGroup<R>>,
        config: ShardingConfig,
    ) -> Result<Self> {
        let policy = WrapPolicy::from(&config.wrap);
        Self::with_policy(root, group, config, &policy)
    }

    /// Wrap `root` with an explicit policy (custom predicates, explicit
    /// groups), ignoring `config.wrap`.
    ///
    /// Any error leaves nothing constructed.
    pub fn with_policy(
        root: ModuleNode<R>,
        group: Arc<dyn ProcessGroup<R>>,
        config: ShardingConfig,
        policy: &WrapPolicy,
    ) -> Result<Self> {
        config.validate()?;
        let rank = group.rank();
        let world_size = group.world_size();
        if world_size == 0 || rank >= world_size {
            return Err(Error::Config {
                reason: format!("rank {rank} is not part of a world of size {world_size}"),
            });
        }

        let client = R::default_client(group.device());
        let groups = partition(root, policy)?.into_groups();
        let replicate = config.strategy.replicates();
        let split_world = if replicate { 1 } else { world_size };
        let shard_rank = if replicate { 0 } else { rank };
        let handle_policy = HandlePolicy {
            precision: config.mixed_precision,
            offload: config.cpu_offload,
            replicate,
        };
        let residency = config.cpu_offload.shard_residency();
        let mut stream = CommStream::with_timeout(group, Some(config.collective_timeout()))?;

        let mut store = ShardStore::new();
        let mut handles = Vec::with_capacity(groups.len());
        let mut total_numel = 0usize;
        for (index, spec) in groups.into_iter().enumerate() {
            let (layout, mut flat) = flatten_params(
                &client,
                &spec.params,
                split_world,
                config.mixed_precision.storage_dtype,
                config.require_uniform_dtype,
            )?;
            if config.sync_module_states {
                flat = stream.broadcast(flat, 0)?;
            }
            total_numel += layout.numel();
            let id = store.insert(shard(&client, &layout, &flat, shard_rank)?, residency)?;
            debug!(
                rank,
                group = index,
                unit = %spec.unit_path,
                params = layout.params().len(),
                numel = layout.numel(),
                padding = layout.padding(),
                "shard group created"
            );
            handles.push(FlatParamHandle::new(
                index,
                spec.unit_path,
                layout,
                id,
                rank,
                world_size,
                handle_policy,
            ));
        }

        info!(
            rank,
            world_size,
            groups = handles.len(),
            numel = total_numel,
            strategy = ?config.strategy,
            "sharded module ready"
        );
        Ok(Self {
            rank,
            world_size,
            prefetcher: Prefetcher::new(
                config.backward_prefetch,
                config.forward_prefetch,
                config.prefetch_depth,
            ),
            state_dict_type: config.state_dict_type,
            full_state_dict: config.full_state_dict,
            config,
            client,
            store,
            handles,
            stream,
            peak_unsharded: 0,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Client every tensor op of this module runs through.
    pub fn client(&self) -> &R::Client {
        &self.client
    }

    /// Device compute and collectives run on.
    pub fn device(&self) -> &R::Device {
        self.stream.device()
    }

    pub fn num_groups(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &[FlatParamHandle<R>] {
        &self.handles
    }

    pub fn handle(&self, group: usize) -> Result<&FlatParamHandle<R>> {
        self.handles.get(group).ok_or_else(|| Error::InvalidArgument {
            arg: "group",
            reason: format!("no group {group}, module has {}", self.handles.len()),
        })
    }

    /// Index of the group rooted at `unit_path`.
    pub fn group_index(&self, unit_path: &str) -> Option<usize> {
        self.handles.iter().position(|h| h.unit_path() == unit_path)
    }

    pub fn group_state(&self, group: usize) -> Result<HandleState> {
        Ok(self.handle(group)?.state())
    }

    pub fn store(&self) -> &ShardStore<R> {
        &self.store
    }

    /// This rank's shard of `group`, in storage dtype.
    pub fn local_shard(&self, group: usize) -> Result<&ShardData<R>> {
        self.store.shard(self.handle(group)?.shard_id())
    }

    /// Accumulated shard-sized gradient of `group`.
    pub fn local_grad(&self, group: usize) -> Result<Option<&ShardData<R>>> {
        self.store.grad(self.handle(group)?.shard_id())
    }

    pub fn exec_order(&self) -> &ExecOrder {
        self.prefetcher.order()
    }

    /// Collectives issued on this rank's stream so far.
    pub fn collectives_issued(&self) -> u64 {
        self.stream.issued()
    }

    pub fn barrier(&mut self) -> Result<()> {
        self.stream.barrier()
    }

    fn check_all_sharded(&self) -> Result<()> {
        match self.handles.iter().find(|h| h.state() != HandleState::Sharded) {
            Some(h) => Err(Error::InvalidState {
                group: h.index(),
                expected: HandleState::Sharded,
                actual: h.state(),
            }),
            None => Ok(()),
        }
    }

    fn track_peak(&mut self) {
        let live = self
            .handles
            .iter()
            .filter(|h| h.state() != HandleState::Sharded)
            .count();
        self.peak_unsharded = self.peak_unsharded.max(live);
    }

    fn unshard_group(&mut self, group: usize) -> Result<()> {
        self.handles[group].unshard(&self.client, &self.store, &mut self.stream)?;
        Ok(())
    }

    fn prefetch(&mut self, targets: Vec<usize>) -> Result<()> {
        for target in targets {
            if self.handles[target].unshard(&self.client, &self.store, &mut self.stream)? {
                debug!(rank = self.rank, group = target, "prefetched");
            }
        }
        Ok(())
    }

    fn check_group(&self, group: usize) -> Result<()> {
        self.handle(group).map(|_| ())
    }

    fn pre_forward(&mut self, group: usize) -> Result<()> {
        self.check_group(group)?;
        self.prefetcher.order_mut().record(group);
        self.unshard_group(group)?;
        let targets = self.prefetcher.forward_targets(group);
        self.prefetch(targets)?;
        self.handles[group].wait_unshard()?;
        self.track_peak();
        Ok(())
    }

    fn post_forward(&mut self, group: usize) -> Result<()> {
        self.check_group(group)?;
        if self.config.strategy.reshard_after_forward() {
            self.handles[group].reshard()?;
        }
        Ok(())
    }

    fn finish_forward(&mut self) -> Result<()> {
        self.prefetcher.order_mut().finish_pass();
        let reshard_all = self.config.strategy.reshard_after_forward();
        for h in &mut self.handles {
            // Prefetched groups that were never entered still hold a gather
            if h.state() == HandleState::Unsharding
                || (reshard_all && h.state() == HandleState::Unsharded)
            {
                h.reshard()?;
            }
        }
        Ok(())
    }

    fn pre_backward(&mut self, group: usize) -> Result<()> {
        self.check_group(group)?;
        self.unshard_group(group)?;
        let targets = self
            .prefetcher
            .backward_targets(group, BackwardPrefetch::BackwardPre);
        self.prefetch(targets)?;
        self.handles[group].wait_unshard()?;
        self.track_peak();
        Ok(())
    }

    fn post_backward(&mut self, group: usize, grads: &[Tensor<R>]) -> Result<()> {
        let flat = self.flatten_grads(group, grads)?;
        self.handles[group].reduce_grad(&self.client, &mut self.stream, &flat)?;
        let targets = self
            .prefetcher
            .backward_targets(group, BackwardPrefetch::BackwardPost);
        self.prefetch(targets)?;
        self.track_peak();
        self.handles[group].finish_reduce_grad(&self.client, &mut self.store)?;
        self.handles[group].reshard()
    }

    fn finish_backward(&mut self) -> Result<()> {
        for h in &mut self.handles {
            h.finish_reduce_grad(&self.client, &mut self.store)?;
            h.reshard()?;
        }
        Ok(())
    }

    /// Per-parameter gradients (layout order) as one flat tensor in reduce dtype.
    fn flatten_grads(&self, group: usize, grads: &[Tensor<R>]) -> Result<Tensor<R>> {
        let layout = self.handle(group)?.layout();
        if grads.len() != layout.params().len() {
            return Err(Error::InvalidArgument {
                arg: "grads",
                reason: format!(
                    "group {group} has {} parameters, got {} gradients",
                    layout.params().len(),
                    grads.len()
                ),
            });
        }
        let reduce_dtype = self.config.mixed_precision.reduce_dtype;
        let cast: Vec<Tensor<R>> = grads
            .iter()
            .map(|g| -> Result<Tensor<R>> { Ok(self.client.cast(g, reduce_dtype)?) })
            .collect::<Result<_>>()?;
        flatten(&self.client, &layout.with_dtype(reduce_dtype), &cast)
    }

    /// Reshard everything after a failed step, consuming any in-flight
    /// collectives so later steps stay aligned.
    fn unwind(&mut self, phase: &'static str) -> Result<()> {
        let mut failures = Vec::new();
        for h in &mut self.handles {
            if let Err(e) = h.finish_reduce_grad(&self.client, &mut self.store) {
                failures.push(format!("group {}: {e}", h.index()));
            }
            if let Err(e) = h.reshard() {
                failures.push(format!("group {}: {e}", h.index()));
            }
        }
        if failures.is_empty() {
            warn!(rank = self.rank, phase, "step failed; all groups resharded");
            Ok(())
        } else {
            Err(Error::ResourceLeak {
                reason: format!("reshard after failed {phase}: {}", failures.join("; ")),
            })
        }
    }

    /// Run one forward pass.
    ///
    /// `f` enters units through the context; on return every group is
    /// resharded according to the strategy. If `f` fails, every group is
    /// resharded before its error is returned unchanged. A failure to
    /// reshard is reported as [`Error::ResourceLeak`] instead.
    pub fn forward<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut ForwardContext<'_, R>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        self.check_all_sharded_or_retained()?;
        let out = {
            let mut ctx = ForwardContext { module: self };
            f(&mut ctx)
        };
        match out {
            Ok(value) => {
                self.finish_forward()?;
                Ok(value)
            }
            Err(e) => {
                self.prefetcher.order_mut().abandon_pass();
                self.unwind("forward")?;
                Err(e)
            }
        }
    }

    /// Run one backward pass. Units should be entered in reverse forward
    /// order; every group ends `Sharded` with its gradient shard accumulated.
    pub fn backward<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut BackwardContext<'_, R>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let out = {
            let mut ctx = BackwardContext { module: self };
            f(&mut ctx)
        };
        match out {
            Ok(value) => {
                self.finish_backward()?;
                Ok(value)
            }
            Err(e) => {
                self.unwind("backward")?;
                Err(e)
            }
        }
    }

    /// `ShardGradOp` keeps groups unsharded between forward and backward, so
    /// only a group mid-transition blocks a new forward.
    fn check_all_sharded_or_retained(&self) -> Result<()> {
        match self
            .handles
            .iter()
            .find(|h| !matches!(h.state(), HandleState::Sharded | HandleState::Unsharded))
        {
            Some(h) => Err(Error::InvalidState {
                group: h.index(),
                expected: HandleState::Sharded,
                actual: h.state(),
            }),
            None => Ok(()),
        }
    }

    fn gather_params(&mut self) -> Result<BTreeMap<String, Tensor<R>>> {
        self.check_all_sharded()?;
        let config = FullStateDictConfig::default();
        let gathered =
            state_dict::full_state_dict(&self.handles, &self.store, &mut self.stream, &config)?;
        match gathered {
            StateDict::Full(params) => Ok(params),
            _ => Err(Error::StateDict {
                reason: "gather produced a non-full state dict".into(),
            }),
        }
    }

    /// Gather every group in storage dtype and hand the named parameters to
    /// `f`. Collective; nothing stays materialized afterwards.
    pub fn summon_full_params<T>(
        &mut self,
        f: impl FnOnce(&BTreeMap<String, Tensor<R>>) -> T,
    ) -> Result<T> {
        let params = self.gather_params()?;
        Ok(f(&params))
    }

    /// Like [`summon_full_params`](Self::summon_full_params), but changes made
    /// by `f` are written back into each rank's shard. Every rank must make
    /// the same changes.
    pub fn summon_full_params_mut<T>(
        &mut self,
        f: impl FnOnce(&mut BTreeMap<String, Tensor<R>>) -> T,
    ) -> Result<T> {
        let mut params = self.gather_params()?;
        let out = f(&mut params);
        state_dict::load_full(
            &self.client,
            &self.handles,
            &mut self.store,
            &mut self.stream,
            &StateDict::Full(params),
            &FullStateDictConfig::default(),
        )?;
        Ok(out)
    }

    /// Clip accumulated gradients to a global L2 norm of `max_norm`.
    ///
    /// Collective when sharded. Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64> {
        if max_norm <= 0.0 || !max_norm.is_finite() {
            return Err(Error::InvalidArgument {
                arg: "max_norm",
                reason: format!("must be positive and finite, got {max_norm}"),
            });
        }
        let mut local_sq = 0.0;
        for h in &self.handles {
            if let Some(grad) = self.store.grad(h.shard_id())? {
                let grad = grad.to_device(self.stream.device())?;
                local_sq += tensor::sum_squares(&self.client, &grad)?;
            }
        }
        let total_sq = if self.config.strategy.replicates() {
            local_sq
        } else {
            let partial = Tensor::<R>::try_from_slice(&[local_sq], &[1], self.stream.device())?;
            let reduced = self.stream.all_reduce(partial)?;
            if reduced.numel() != 1 {
                return Err(Error::comm(
                    "all_reduce",
                    format!(
                        "gradient norm reduced to {} elements, expected 1",
                        reduced.numel()
                    ),
                ));
            }
            reduced.item::<f64>()?
        };
        let total_norm = total_sq.sqrt();
        if total_norm > max_norm {
            let scale = max_norm / (total_norm + 1e-6);
            for h in &self.handles {
                let id = h.shard_id();
                let Some(grad) = self.store.grad(id)? else {
                    continue;
                };
                let grad = grad.to_device(self.stream.device())?;
                let clipped = self.client.mul_scalar(&grad, scale)?;
                self.store.set_grad(id, clipped)?;
            }
            debug!(rank = self.rank, total_norm, scale, "gradients clipped");
        }
        Ok(total_norm)
    }

    /// Replace every group's shard with the tensor `f` returns for it.
    ///
    /// `f` sees the group index, the shard and its accumulated gradient on
    /// the compute device, as an optimizer step would. Only valid while every
    /// group is `Sharded`. All replacements are validated before any shard is
    /// swapped in; offloaded shards are copied back to host memory.
    pub fn update_shards<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Tensor<R>, Option<&Tensor<R>>) -> Result<Tensor<R>>,
    {
        self.check_all_sharded()?;
        let device = self.stream.device();
        let mut updates = Vec::with_capacity(self.handles.len());
        for h in &self.handles {
            let id = h.shard_id();
            let shard = self.store.shard(id)?.to_device(device)?;
            let grad = match self.store.grad(id)? {
                Some(g) => Some(g.to_device(device)?),
                None => None,
            };
            let next = f(h.index(), &shard, grad.as_ref())?;
            self.store.check_replacement(id, &next)?;
            updates.push((id, next));
        }
        for (id, next) in updates {
            self.store.replace_shard(id, next)?;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.store.clear_grads();
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let transient: usize = self.handles.iter().map(FlatParamHandle::transient_bytes).sum();
        MemoryStats {
            host_bytes: self.store.bytes_in(Residency::Host),
            accelerator_bytes: self.store.bytes_in(Residency::Accelerator) + transient,
            unsharded_groups: self
                .handles
                .iter()
                .filter(|h| h.state() != HandleState::Sharded)
                .count(),
            peak_unsharded_groups: self.peak_unsharded,
        }
    }

    pub fn reset_peak_memory_stats(&mut self) {
        self.peak_unsharded = 0;
    }

    pub fn state_dict_type(&self) -> StateDictType {
        self.state_dict_type
    }

    /// Switch the representation used by `state_dict`/`load_state_dict`.
    pub fn set_state_dict_type(
        &mut self,
        kind: StateDictType,
        full_config: Option<FullStateDictConfig>,
    ) -> StateDictType {
        if let Some(cfg) = full_config {
            self.full_state_dict = cfg;
        }
        std::mem::replace(&mut self.state_dict_type, kind)
    }

    pub fn full_state_dict_config(&self) -> FullStateDictConfig {
        self.full_state_dict
    }

    /// Full state dict regardless of the active type.
    pub(crate) fn gather_full_state_dict(&mut self) -> Result<StateDict<R>> {
        self.check_all_sharded()?;
        state_dict::full_state_dict(
            &self.handles,
            &self.store,
            &mut self.stream,
            &self.full_state_dict,
        )
    }

    pub(crate) fn load_full_state_dict(&mut self, sd: &StateDict<R>) -> Result<()> {
        self.check_all_sharded()?;
        state_dict::load_full(
            &self.client,
            &self.handles,
            &mut self.store,
            &mut self.stream,
            sd,
            &self.full_state_dict,
        )
    }

    /// State dict in the active representation. Collective for `Full`.
    pub fn state_dict(&mut self) -> Result<StateDict<R>> {
        self.check_all_sharded()?;
        match self.state_dict_type {
            StateDictType::Full => state_dict::full_state_dict(
                &self.handles,
                &self.store,
                &mut self.stream,
                &self.full_state_dict,
            ),
            StateDictType::Local => {
                state_dict::local_state_dict(&self.handles, &self.store, self.stream.device())
            }
            StateDictType::Sharded => state_dict::sharded_state_dict(
                &self.handles,
                &self.store,
                self.stream.device(),
                self.rank,
                self.world_size,
            ),
        }
    }

    /// Load a state dict of the active representation. Nothing is modified
    /// unless every entry validates.
    pub fn load_state_dict(&mut self, sd: &StateDict<R>) -> Result<()> {
        self.check_all_sharded()?;
        match self.state_dict_type {
            StateDictType::Full => state_dict::load_full(
                &self.client,
                &self.handles,
                &mut self.store,
                &mut self.stream,
                sd,
                &self.full_state_dict,
            ),
            StateDictType::Local => {
                state_dict::load_local(&self.client, &self.handles, &mut self.store, sd)
            }
            StateDictType::Sharded => state_dict::load_sharded(
                &self.client,
                &self.handles,
                &mut self.store,
                sd,
                self.rank,
                self.world_size,
            ),
        }?;
        debug!(rank = self.rank, kind = %self.state_dict_type, "state dict loaded");
        Ok(())
    }
}

impl<R: Runtime> std::fmt::Debug for ShardedModule<R>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedModule")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("strategy", &self.config.strategy)
            .field("groups", &self.handles.len())
            .field("state_dict_type", &self.state_dict_type)
            .finish()
    }
}

/// Handle the forward callable uses to enter and leave units.
pub struct ForwardContext<'a, R: Runtime>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    module: &'a mut ShardedModule<R>,
}

impl<R: Runtime> ForwardContext<'_, R>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    pub fn rank(&self) -> usize {
        self.module.rank
    }

    pub fn num_groups(&self) -> usize {
        self.module.handles.len()
    }

    pub fn group_index(&self, unit_path: &str) -> Option<usize> {
        self.module.group_index(unit_path)
    }

    pub fn handle(&self, group: usize) -> Result<&FlatParamHandle<R>> {
        self.module.handle(group)
    }

    pub fn client(&self) -> &R::Client {
        &self.module.client
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.module.memory_stats()
    }

    /// Unshard `group` (waiting on any prefetch) and issue forward prefetch.
    pub fn enter(&mut self, group: usize) -> Result<()> {
        self.module.pre_forward(group)
    }

    /// Full parameters of an entered group.
    pub fn params(&self, group: usize) -> Result<Vec<ParamView<'_, R>>> {
        self.module.handle(group)?.param_views()
    }

    /// Leave `group`, resharding it unless the strategy retains it.
    pub fn exit(&mut self, group: usize) -> Result<()> {
        self.module.post_forward(group)
    }

    /// Enter `group`, run `f` on its parameters, then exit.
    pub fn with_unit<T>(
        &mut self,
        group: usize,
        f: impl FnOnce(&[ParamView<'_, R>]) -> T,
    ) -> Result<T> {
        self.enter(group)?;
        let out = {
            let views = self.params(group)?;
            f(&views)
        };
        self.exit(group)?;
        Ok(out)
    }
}

/// Handle the backward callable uses to enter units and hand back gradients.
pub struct BackwardContext<'a, R: Runtime>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    module: &'a mut ShardedModule<R>,
}

impl<R: Runtime> BackwardContext<'_, R>
where
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    pub fn rank(&self) -> usize {
        self.module.rank
    }

    pub fn num_groups(&self) -> usize {
        self.module.handles.len()
    }

    /// Recorded forward order, reversed: the order backward should visit.
    pub fn order(&self) -> Vec<usize> {
        match self.module.prefetcher.order().recorded() {
            Some(order) => order.iter().rev().copied().collect(),
            None => (0..self.module.handles.len()).rev().collect(),
        }
    }

    pub fn handle(&self, group: usize) -> Result<&FlatParamHandle<R>> {
        self.module.handle(group)
    }

    pub fn client(&self) -> &R::Client {
        &self.module.client
    }

    /// Make `group`'s full parameters available for gradient computation.
    pub fn enter(&mut self, group: usize) -> Result<()> {
        self.module.pre_backward(group)
    }

    pub fn params(&self, group: usize) -> Result<Vec<ParamView<'_, R>>> {
        self.module.handle(group)?.param_views()
    }

    /// Reduce `grads` (one per parameter, layout order) into the gradient
    /// shard and reshard the group.
    pub fn reduce(&mut self, group: usize, grads: &[Tensor<R>]) -> Result<()> {
        self.module.post_backward(group, grads)
    }

    /// Enter `group`, compute its gradients with `f`, then reduce them.
    pub fn with_unit(
        &mut self,
        group: usize,
        f: impl FnOnce(&[ParamView<'_, R>]) -> Result<Vec<Tensor<R>>>,
    ) -> Result<()> {
        self.enter(group)?;
        let grads = {
            let views = self.params(group)?;
            f(&views)?
        };
        self.reduce(group, &grads)
    }
}
