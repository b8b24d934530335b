//! Per-worker arena of locally resident shards.
//!
//! Every shard group owns exactly one entry, addressed by a [`ShardId`].
//! Handles and state-dict code never hold references into the store across
//! calls; they go through the id, so ownership of the shard memory stays here.
//! Offloaded entries live in host tensors and are copied to the accelerator
//! whenever compute or a collective needs them.

use numr::dtype::DType;
use numr::ops::BinaryOps;
use numr::runtime::Runtime;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::tensor;

/// Where a tensor lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Host (CPU) memory
    Host,
    /// Accelerator memory
    Accelerator,
}

/// Index of a shard entry in a [`ShardStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(usize);

impl ShardId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A 1-D shard-sized tensor in accelerator or host memory.
#[derive(Clone, Debug)]
pub enum ShardData<R: Runtime> {
    Accelerator(Tensor<R>),
    Host(Tensor<CpuRuntime>),
}

impl<R: Runtime> ShardData<R> {
    /// Place `t` in `residency`, copying it to host memory for [`Residency::Host`].
    pub fn place(t: Tensor<R>, residency: Residency) -> Result<Self> {
        Ok(match residency {
            Residency::Accelerator => ShardData::Accelerator(t),
            Residency::Host => ShardData::Host(tensor::to_host(&t)?),
        })
    }

    pub fn residency(&self) -> Residency {
        match self {
            ShardData::Accelerator(_) => Residency::Accelerator,
            ShardData::Host(_) => Residency::Host,
        }
    }

    pub fn numel(&self) -> usize {
        match self {
            ShardData::Accelerator(t) => t.numel(),
            ShardData::Host(t) => t.numel(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            ShardData::Accelerator(t) => t.dtype(),
            ShardData::Host(t) => t.dtype(),
        }
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Tensor on `device`. Host data is copied; accelerator data is shared.
    pub fn to_device(&self, device: &R::Device) -> Result<Tensor<R>> {
        match self {
            ShardData::Accelerator(t) => Ok(t.clone()),
            ShardData::Host(t) => tensor::to_device(t, device),
        }
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self {
            ShardData::Accelerator(t) => tensor::to_f64_vec(t),
            ShardData::Host(t) => tensor::to_f64_vec(t),
        }
    }

    /// Raw bytes, whichever memory the data lives in.
    pub fn to_le_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ShardData::Accelerator(t) => tensor::to_le_bytes(t),
            ShardData::Host(t) => tensor::to_le_bytes(t),
        }
    }
}

#[derive(Debug)]
struct ShardEntry<R: Runtime> {
    shard: ShardData<R>,
    grad: Option<ShardData<R>>,
}

/// Owner of every local shard and its shard-sized gradient.
///
/// Gradients live wherever their shard lives.
#[derive(Debug)]
pub struct ShardStore<R: Runtime> {
    entries: Vec<ShardEntry<R>>,
}

impl<R: Runtime> Default for ShardStore<R> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<R: Runtime> ShardStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a new shard, moving it to host memory if requested.
    pub fn insert(&mut self, shard: Tensor<R>, residency: Residency) -> Result<ShardId> {
        let shard = ShardData::place(shard, residency)?;
        self.entries.push(ShardEntry { shard, grad: None });
        Ok(ShardId(self.entries.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of every entry, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = ShardId> + use<R> {
        (0..self.entries.len()).map(ShardId)
    }

    fn entry(&self, id: ShardId) -> Result<&ShardEntry<R>> {
        self.entries.get(id.0).ok_or_else(|| Error::InvalidArgument {
            arg: "id",
            reason: format!("no shard with id {}", id.0),
        })
    }

    fn entry_mut(&mut self, id: ShardId) -> Result<&mut ShardEntry<R>> {
        self.entries.get_mut(id.0).ok_or_else(|| Error::InvalidArgument {
            arg: "id",
            reason: format!("no shard with id {}", id.0),
        })
    }

    pub fn shard(&self, id: ShardId) -> Result<&ShardData<R>> {
        Ok(&self.entry(id)?.shard)
    }

    pub fn residency(&self, id: ShardId) -> Result<Residency> {
        Ok(self.entry(id)?.shard.residency())
    }

    /// Check that `shard` could replace the entry without changing its
    /// length or dtype. Does not mutate.
    pub fn check_replacement(&self, id: ShardId, shard: &Tensor<R>) -> Result<()> {
        let current = &self.entry(id)?.shard;
        if current.dtype() != shard.dtype() {
            return Err(Error::DTypeMismatch {
                expected: current.dtype(),
                got: shard.dtype(),
            });
        }
        if current.numel() != shard.numel() {
            return Err(Error::InvalidArgument {
                arg: "shard",
                reason: format!(
                    "replacement shard has {} elements, expected {}",
                    shard.numel(),
                    current.numel()
                ),
            });
        }
        Ok(())
    }

    /// Swap in new shard contents of identical length and dtype. The entry
    /// keeps its residency.
    pub fn replace_shard(&mut self, id: ShardId, shard: Tensor<R>) -> Result<()> {
        self.check_replacement(id, &shard)?;
        let residency = self.residency(id)?;
        let placed = ShardData::place(shard.contiguous().flatten()?, residency)?;
        self.entry_mut(id)?.shard = placed;
        Ok(())
    }

    pub fn grad(&self, id: ShardId) -> Result<Option<&ShardData<R>>> {
        Ok(self.entry(id)?.grad.as_ref())
    }

    fn check_grad(&self, id: ShardId, grad: &Tensor<R>) -> Result<()> {
        let shard = &self.entry(id)?.shard;
        if grad.numel() != shard.numel() {
            return Err(Error::InvalidArgument {
                arg: "grad",
                reason: format!(
                    "gradient shard has {} elements, shard has {}",
                    grad.numel(),
                    shard.numel()
                ),
            });
        }
        if grad.dtype() != shard.dtype() {
            return Err(Error::DTypeMismatch {
                expected: shard.dtype(),
                got: grad.dtype(),
            });
        }
        Ok(())
    }

    /// Add a shard-sized gradient into the accumulated one.
    pub fn accumulate_grad<C: BinaryOps<R>>(
        &mut self,
        client: &C,
        id: ShardId,
        grad: Tensor<R>,
    ) -> Result<()> {
        self.check_grad(id, &grad)?;
        let total = match &self.entry(id)?.grad {
            Some(acc) => client.add(&acc.to_device(grad.device())?, &grad)?,
            None => grad,
        };
        self.set_grad(id, total)
    }

    /// Overwrite the accumulated gradient, e.g. after clipping.
    pub fn set_grad(&mut self, id: ShardId, grad: Tensor<R>) -> Result<()> {
        self.check_grad(id, &grad)?;
        let residency = self.residency(id)?;
        let placed = ShardData::place(grad.contiguous().flatten()?, residency)?;
        self.entry_mut(id)?.grad = Some(placed);
        Ok(())
    }

    pub fn clear_grads(&mut self) {
        for entry in &mut self.entries {
            entry.grad = None;
        }
    }

    /// Bytes held by shards and gradients resident in `residency`.
    pub fn bytes_in(&self, residency: Residency) -> usize {
        self.entries
            .iter()
            .filter(|e| e.shard.residency() == residency)
            .map(|e| e.shard.nbytes() + e.grad.as_ref().map_or(0, ShardData::nbytes))
            .sum()
    }
}
