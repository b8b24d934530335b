//! In-process process group: N ranks as threads sharing one rendezvous.
//!
//! Used to simulate multi-worker runs inside a single process. Each call
//! deposits this rank's contribution, the last rank to arrive computes every
//! rank's result on the shared device through the numr client, and each rank
//! picks up its own copy. Calls whose signatures
//! disagree, or a rank that times out, poison the group: every rank then
//! fails with a communication error instead of hanging.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use numr::ops::{BinaryOps, ShapeOps};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::warn;

use crate::comm::{
    CollectiveCall, CollectiveKind, ProcessGroup, barrier_call, call_of, check_divisible,
};
use crate::error::{Error, Result};
use crate::tensor;

/// Default time a rank waits for its peers before failing the collective.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Rendezvous<R: Runtime> {
    generation: u64,
    call: Option<CollectiveCall>,
    inputs: Vec<Option<Tensor<R>>>,
    arrived: usize,
    outputs: Vec<Option<Tensor<R>>>,
    pending_pickups: usize,
    poisoned: Option<String>,
}

struct Shared<R: Runtime> {
    world_size: usize,
    device: R::Device,
    client: R::Client,
    state: Mutex<Rendezvous<R>>,
    cv: Condvar,
}

/// One rank's handle onto an in-process group.
///
/// Every rank shares one device and client; outputs are copied per rank so
/// no two ranks alias the same memory.
pub struct LocalProcessGroup<R: Runtime> {
    rank: usize,
    shared: Arc<Shared<R>>,
    timeout: Duration,
}

impl<R: Runtime> Clone for LocalProcessGroup<R> {
    fn clone(&self) -> Self {
        Self {
            rank: self.rank,
            shared: Arc::clone(&self.shared),
            timeout: self.timeout,
        }
    }
}

impl<R: Runtime> fmt::Debug for LocalProcessGroup<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.shared.world_size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn empty_slots<R: Runtime>(n: usize) -> Vec<Option<Tensor<R>>> {
    (0..n).map(|_| None).collect()
}

impl<R: Runtime> LocalProcessGroup<R> {
    /// Create handles for ranks `0..world_size` sharing one rendezvous on
    /// the runtime's default device.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        Self::with_timeout(world_size, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(world_size: usize, timeout: Duration) -> Vec<Self> {
        let device = R::default_device();
        let client = R::default_client(&device);
        let shared = Arc::new(Shared {
            world_size,
            device,
            client,
            state: Mutex::new(Rendezvous {
                generation: 0,
                call: None,
                inputs: empty_slots(world_size),
                arrived: 0,
                outputs: empty_slots(world_size),
                pending_pickups: 0,
                poisoned: None,
            }),
            cv: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
                timeout,
            })
            .collect()
    }

    fn lock(&self, op: &'static str) -> Result<MutexGuard<'_, Rendezvous<R>>> {
        self.shared
            .state
            .lock()
            .map_err(|_| Error::comm(op, "rendezvous lock poisoned by a panicking rank"))
    }

    /// Block on the condvar until `done` holds, the group is poisoned, or
    /// the deadline passes (which poisons the group).
    fn wait_until<'a>(
        &self,
        op: &'static str,
        mut st: MutexGuard<'a, Rendezvous<R>>,
        deadline: Instant,
        done: impl Fn(&Rendezvous<R>) -> bool,
    ) -> Result<MutexGuard<'a, Rendezvous<R>>> {
        loop {
            if let Some(reason) = &st.poisoned {
                return Err(Error::comm(op, reason));
            }
            if done(&*st) {
                return Ok(st);
            }
            let now = Instant::now();
            if now >= deadline {
                let reason = format!("rank {} timed out after {:?}", self.rank, self.timeout);
                warn!(rank = self.rank, op, "collective timed out, poisoning group");
                st.poisoned = Some(reason.clone());
                self.shared.cv.notify_all();
                return Err(Error::comm(op, reason));
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(st, deadline - now)
                .map_err(|_| Error::comm(op, "rendezvous lock poisoned by a panicking rank"))?;
            st = guard;
        }
    }

    /// Run one collective round. `combine` maps all inputs (in rank order)
    /// to all outputs and is executed once, by the last rank to arrive.
    fn exchange(
        &self,
        call: CollectiveCall,
        input: Tensor<R>,
        combine: impl FnOnce(&R::Client, Vec<Tensor<R>>, usize) -> Result<Vec<Tensor<R>>>,
    ) -> Result<Tensor<R>> {
        let op = call.kind.name();
        let world = self.shared.world_size;
        let deadline = Instant::now() + self.timeout;

        let st = self.lock(op)?;
        // The previous round must be fully drained before a new one forms
        let mut st = self.wait_until(op, st, deadline, |s| s.pending_pickups == 0)?;

        match st.call {
            Some(current) if current != call => {
                let reason = format!(
                    "rank {} issued {call:?} while peers issued {current:?}",
                    self.rank
                );
                st.poisoned = Some(reason.clone());
                self.shared.cv.notify_all();
                return Err(Error::comm(op, reason));
            }
            Some(_) => {}
            None => st.call = Some(call),
        }
        if st.inputs[self.rank].is_some() {
            return Err(Error::comm(op, format!("rank {} joined a round twice", self.rank)));
        }
        st.inputs[self.rank] = Some(input);
        st.arrived += 1;

        if st.arrived == world {
            let inputs: Vec<Tensor<R>> = st.inputs.iter_mut().filter_map(Option::take).collect();
            match combine(&self.shared.client, inputs, world) {
                Ok(outputs) => st.outputs = outputs.into_iter().map(Some).collect(),
                Err(e) => {
                    st.poisoned = Some(e.to_string());
                    self.shared.cv.notify_all();
                    return Err(e);
                }
            }
            st.arrived = 0;
            st.call = None;
            st.pending_pickups = world;
            st.generation += 1;
            self.shared.cv.notify_all();
        } else {
            let generation = st.generation;
            st = self.wait_until(op, st, deadline, |s| s.generation != generation)?;
        }

        let out = st.outputs[self.rank]
            .take()
            .ok_or_else(|| Error::comm(op, "missing output for rank"))?;
        st.pending_pickups -= 1;
        if st.pending_pickups == 0 {
            self.shared.cv.notify_all();
        }
        Ok(out)
    }
}

fn sum_all<R: Runtime, C: BinaryOps<R>>(client: &C, inputs: &[Tensor<R>]) -> Result<Tensor<R>> {
    let (first, rest) = inputs
        .split_first()
        .ok_or_else(|| Error::comm("reduce", "no inputs"))?;
    if first.numel() == 0 {
        return Ok(first.clone());
    }
    let mut acc = first.clone();
    for t in rest {
        acc = client.add(&acc, t)?;
    }
    Ok(acc)
}

/// One owned copy of `t` per rank.
fn replicate<R: Runtime>(t: &Tensor<R>, world: usize) -> Result<Vec<Tensor<R>>> {
    (0..world).map(|_| tensor::duplicate(t)).collect()
}

impl<R> ProcessGroup<R> for LocalProcessGroup<R>
where
    R: Runtime,
    R::Client: BinaryOps<R> + ShapeOps<R>,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn device(&self) -> &R::Device {
        &self.shared.device
    }

    fn all_gather(&self, local: &Tensor<R>) -> Result<Tensor<R>> {
        let call = call_of(CollectiveKind::AllGather, local);
        self.exchange(call, local.clone(), |client, inputs, world| {
            let parts: Vec<&Tensor<R>> = inputs.iter().filter(|t| t.numel() > 0).collect();
            let full = if parts.is_empty() {
                tensor::zeros(call.dtype, 0, &self.shared.device)?
            } else {
                client.cat(&parts, 0)?
            };
            replicate(&full, world)
        })
    }

    fn reduce_scatter(&self, full: &Tensor<R>) -> Result<Tensor<R>> {
        check_divisible(full, self.shared.world_size)?;
        let call = call_of(CollectiveKind::ReduceScatter, full);
        self.exchange(call, full.clone(), |client, inputs, world| {
            let sum = sum_all(client, &inputs)?;
            let n = sum.numel() / world;
            (0..world).map(|r| tensor::copy_range(&sum, r * n, n)).collect()
        })
    }

    fn all_reduce(&self, t: &Tensor<R>) -> Result<Tensor<R>> {
        let call = call_of(CollectiveKind::AllReduce, t);
        self.exchange(call, t.clone(), |client, inputs, world| {
            replicate(&sum_all(client, &inputs)?, world)
        })
    }

    fn broadcast(&self, t: &Tensor<R>, root: usize) -> Result<Tensor<R>> {
        if root >= self.shared.world_size {
            return Err(Error::comm("broadcast", format!("root {root} out of range")));
        }
        let call = call_of(CollectiveKind::Broadcast { root }, t);
        self.exchange(call, t.clone(), |_, inputs, world| replicate(&inputs[root], world))
    }

    fn barrier(&self) -> Result<()> {
        let token = tensor::zeros(barrier_call().dtype, 0, &self.shared.device)?;
        self.exchange(barrier_call(), token, |_, inputs, _| Ok(inputs))?;
        Ok(())
    }
}
