//! Ordered asynchronous collectives.
//!
//! A [`CommStream`] owns one background thread per worker. Collectives are
//! queued and executed strictly in issue order, so issuing a prefetch early
//! never reorders it relative to collectives issued after it. Callers block
//! only when they [`wait`](PendingCollective::wait) on the result.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::{debug, trace};

use crate::comm::ProcessGroup;
use crate::error::{Error, Result};

type Job<R> = Box<dyn FnOnce(&dyn ProcessGroup<R>) + Send>;

/// A collective that has been issued but not yet waited on.
#[must_use = "a pending collective must be waited on"]
#[derive(Debug)]
pub struct PendingCollective<T> {
    op: &'static str,
    seq: u64,
    rx: Receiver<Result<T>>,
    timeout: Option<Duration>,
}

impl<T> PendingCollective<T> {
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Position of this collective in the stream's issue order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Block until the collective completes or the stream's timeout elapses.
    pub fn wait(self) -> Result<T> {
        let Some(timeout) = self.timeout else {
            return self.rx.recv().map_err(|_| {
                Error::comm(self.op, "communication stream shut down before completion")
            })?;
        };
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::comm(
                self.op,
                format!("collective #{} timed out after {timeout:?}", self.seq),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(Error::comm(
                self.op,
                "communication stream shut down before completion",
            )),
        }
    }
}

/// Issue-ordered executor for collectives on one rank.
pub struct CommStream<R: Runtime> {
    group: Arc<dyn ProcessGroup<R>>,
    tx: Option<Sender<Job<R>>>,
    worker: Option<JoinHandle<()>>,
    issued: u64,
    timeout: Option<Duration>,
}

impl<R: Runtime> CommStream<R> {
    /// Spawn the stream's worker thread. Waits block indefinitely.
    pub fn new(group: Arc<dyn ProcessGroup<R>>) -> Result<Self> {
        Self::with_timeout(group, None)
    }

    /// Spawn the stream's worker thread; waits give up after `timeout`.
    pub fn with_timeout(group: Arc<dyn ProcessGroup<R>>, timeout: Option<Duration>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job<R>>();
        let worker_group = group.clone();
        let worker = std::thread::Builder::new()
            .name(format!("shardr-comm-{}", group.rank()))
            .spawn(move || {
                for job in rx {
                    job(worker_group.as_ref());
                }
            })
            .map_err(|e| Error::comm("stream", format!("failed to spawn comm thread: {e}")))?;
        Ok(Self {
            group,
            tx: Some(tx),
            worker: Some(worker),
            issued: 0,
            timeout,
        })
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup<R>> {
        &self.group
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn device(&self) -> &R::Device {
        self.group.device()
    }

    /// Number of collectives issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Queue `f` behind every previously issued collective.
    pub fn submit<T, F>(&mut self, op: &'static str, f: F) -> Result<PendingCollective<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProcessGroup<R>) -> Result<T> + Send + 'static,
    {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::comm(op, "communication stream is closed"))?;
        let (done_tx, done_rx) = mpsc::channel();
        let seq = self.issued;
        let job: Job<R> = Box::new(move |group: &dyn ProcessGroup<R>| {
            // Receiver may have been dropped; the collective still had to run
            let _ = done_tx.send(f(group));
        });
        tx.send(job)
            .map_err(|_| Error::comm(op, "communication thread exited"))?;
        self.issued += 1;
        trace!(rank = self.group.rank(), op, seq, "collective issued");
        Ok(PendingCollective {
            op,
            seq,
            rx: done_rx,
            timeout: self.timeout,
        })
    }

    pub fn all_gather_async(&mut self, local: Tensor<R>) -> Result<PendingCollective<Tensor<R>>> {
        debug!(rank = self.group.rank(), numel = local.numel(), "issue all_gather");
        self.submit("all_gather", move |g| g.all_gather(&local))
    }

    pub fn reduce_scatter_async(&mut self, full: Tensor<R>) -> Result<PendingCollective<Tensor<R>>> {
        debug!(rank = self.group.rank(), numel = full.numel(), "issue reduce_scatter");
        self.submit("reduce_scatter", move |g| g.reduce_scatter(&full))
    }

    pub fn all_reduce_async(&mut self, t: Tensor<R>) -> Result<PendingCollective<Tensor<R>>> {
        debug!(rank = self.group.rank(), numel = t.numel(), "issue all_reduce");
        self.submit("all_reduce", move |g| g.all_reduce(&t))
    }

    pub fn all_gather(&mut self, local: Tensor<R>) -> Result<Tensor<R>> {
        self.all_gather_async(local)?.wait()
    }

    pub fn reduce_scatter(&mut self, full: Tensor<R>) -> Result<Tensor<R>> {
        self.reduce_scatter_async(full)?.wait()
    }

    pub fn all_reduce(&mut self, t: Tensor<R>) -> Result<Tensor<R>> {
        self.all_reduce_async(t)?.wait()
    }

    pub fn broadcast(&mut self, t: Tensor<R>, root: usize) -> Result<Tensor<R>> {
        self.submit("broadcast", move |g| g.broadcast(&t, root))?
            .wait()
    }

    pub fn barrier(&mut self) -> Result<()> {
        self.submit("barrier", |g| g.barrier())?.wait()
    }
}

impl<R: Runtime> Drop for CommStream<R> {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain queued collectives and exit
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<R: Runtime> std::fmt::Debug for CommStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommStream")
            .field("rank", &self.group.rank())
            .field("world_size", &self.group.world_size())
            .field("issued", &self.issued)
            .finish()
    }
}
