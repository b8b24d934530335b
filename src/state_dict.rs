//! State-dict assembly and loading.
//!
//! Three representations, selected by [`StateDictType`]:
//!
//! - **Full**: every rank gathers every group and returns the original
//!   per-parameter tensors, padding dropped. Collective.
//! - **Local**: each group's raw shard under `<unit>.flat_param` plus the
//!   [`ShardMetadata`] needed to reassemble it. No communication.
//! - **Sharded**: per-parameter, padding-free pieces of this rank's shard
//!   with their global shape and offset. No communication.
//!
//! Loading validates every entry against the current layout first and only
//! then swaps shards in, so a rejected state dict leaves nothing modified.

use std::collections::{BTreeMap, HashSet};

use numr::dtype::DType;
use numr::ops::{ShapeOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comm::CommStream;
use crate::error::{Error, Result};
use crate::flat_param::{flatten, pad_to, shard, split};
use crate::handle::FlatParamHandle;
use crate::store::{ShardId, ShardStore};
use crate::tensor::{self, dtype_serde};

/// Which representation `state_dict` returns and `load_state_dict` expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateDictType {
    #[default]
    Full,
    Local,
    Sharded,
}

impl std::fmt::Display for StateDictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateDictType::Full => write!(f, "full"),
            StateDictType::Local => write!(f, "local"),
            StateDictType::Sharded => write!(f, "sharded"),
        }
    }
}

/// Options for full state dicts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullStateDictConfig {
    /// Non-zero ranks drop the gathered tensors after the collective, and on
    /// load only rank 0 needs to supply them (they are broadcast).
    pub rank0_only: bool,
}

/// Placement of one parameter inside a local flat shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamMeta {
    pub name: String,
    pub shape: Vec<usize>,
    /// Offset into the unpadded flat buffer
    pub offset: usize,
}

/// Everything needed to put a local shard back where it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub world_size: usize,
    pub rank: usize,
    pub numel: usize,
    pub padded_numel: usize,
    pub shard_start: usize,
    pub shard_end: usize,
    #[serde(with = "dtype_serde")]
    pub dtype: DType,
    pub params: Vec<ParamMeta>,
}

/// A group's raw flat shard.
#[derive(Clone, Debug)]
pub struct LocalShard<R: Runtime> {
    pub data: Tensor<R>,
    pub meta: ShardMetadata,
}

impl<R: Runtime> PartialEq for LocalShard<R> {
    fn eq(&self, other: &Self) -> bool {
        self.meta == other.meta && tensor::bit_eq(&self.data, &other.data)
    }
}

/// One rank's piece of a parameter.
#[derive(Clone, Debug)]
pub struct ShardedTensor<R: Runtime> {
    pub global_shape: Vec<usize>,
    /// Offset of the piece inside the flattened parameter
    pub offset: usize,
    pub data: Tensor<R>,
}

impl<R: Runtime> PartialEq for ShardedTensor<R> {
    fn eq(&self, other: &Self) -> bool {
        self.global_shape == other.global_shape
            && self.offset == other.offset
            && tensor::bit_eq(&self.data, &other.data)
    }
}

/// Padding-free per-parameter pieces held by one rank.
#[derive(Clone, Debug)]
pub struct ShardedStateDict<R: Runtime> {
    pub world_size: usize,
    pub rank: usize,
    pub tensors: BTreeMap<String, ShardedTensor<R>>,
}

impl<R: Runtime> PartialEq for ShardedStateDict<R> {
    fn eq(&self, other: &Self) -> bool {
        self.world_size == other.world_size
            && self.rank == other.rank
            && self.tensors == other.tensors
    }
}

/// A state dict tagged with the representation it uses.
///
/// Equality compares dtypes, shapes and bits.
#[derive(Clone, Debug)]
pub enum StateDict<R: Runtime> {
    Full(BTreeMap<String, Tensor<R>>),
    Local(BTreeMap<String, LocalShard<R>>),
    Sharded(ShardedStateDict<R>),
}

fn same_tensors<R: Runtime>(a: &BTreeMap<String, Tensor<R>>, b: &BTreeMap<String, Tensor<R>>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|((ka, ta), (kb, tb))| ka == kb && tensor::bit_eq(ta, tb))
}

impl<R: Runtime> PartialEq for StateDict<R> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateDict::Full(a), StateDict::Full(b)) => same_tensors(a, b),
            (StateDict::Local(a), StateDict::Local(b)) => a == b,
            (StateDict::Sharded(a), StateDict::Sharded(b)) => a == b,
            _ => false,
        }
    }
}

impl<R: Runtime> StateDict<R> {
    pub fn kind(&self) -> StateDictType {
        match self {
            StateDict::Full(_) => StateDictType::Full,
            StateDict::Local(_) => StateDictType::Local,
            StateDict::Sharded(_) => StateDictType::Sharded,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StateDict::Full(t) => t.len(),
            StateDict::Local(t) => t.len(),
            StateDict::Sharded(s) => s.tensors.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<&str> {
        match self {
            StateDict::Full(t) => t.keys().map(String::as_str).collect(),
            StateDict::Local(t) => t.keys().map(String::as_str).collect(),
            StateDict::Sharded(s) => s.tensors.keys().map(String::as_str).collect(),
        }
    }
}

/// Key a group's flat shard is stored under in a local state dict.
pub fn flat_param_key(unit_path: &str) -> String {
    if unit_path.is_empty() {
        "flat_param".to_string()
    } else {
        format!("{unit_path}.flat_param")
    }
}

fn mismatch(reason: impl Into<String>) -> Error {
    Error::StateDict {
        reason: reason.into(),
    }
}

fn expect_kind<R: Runtime>(sd: &StateDict<R>, kind: StateDictType) -> Result<()> {
    if sd.kind() != kind {
        return Err(mismatch(format!(
            "expected a {kind} state dict, got a {} one",
            sd.kind()
        )));
    }
    Ok(())
}

/// Gather every group and split it into named tensors.
pub(crate) fn full_state_dict<R: Runtime>(
    handles: &[FlatParamHandle<R>],
    store: &ShardStore<R>,
    stream: &mut CommStream<R>,
    config: &FullStateDictConfig,
) -> Result<StateDict<R>> {
    let keep = !config.rank0_only || stream.rank() == 0;
    let mut tensors = BTreeMap::new();
    for h in handles {
        let local = store.shard(h.shard_id())?.to_device(stream.device())?;
        let full = if h.policy().replicate {
            local
        } else {
            stream.all_gather(local)?
        };
        if !keep {
            continue;
        }
        for (info, data) in h.layout().params().iter().zip(split(h.layout(), &full)?) {
            tensors.insert(info.name.clone(), data);
        }
    }
    debug!(rank = stream.rank(), tensors = tensors.len(), "full state dict assembled");
    Ok(StateDict::Full(tensors))
}

pub(crate) fn local_state_dict<R: Runtime>(
    handles: &[FlatParamHandle<R>],
    store: &ShardStore<R>,
    device: &R::Device,
) -> Result<StateDict<R>> {
    let mut shards = BTreeMap::new();
    for h in handles {
        let layout = h.layout();
        let range = layout.shard_range(h.shard_rank());
        let meta = ShardMetadata {
            world_size: h.world_size(),
            rank: h.rank(),
            numel: layout.numel(),
            padded_numel: layout.padded_numel(),
            shard_start: range.start,
            shard_end: range.end,
            dtype: layout.dtype(),
            params: layout
                .params()
                .iter()
                .map(|p| ParamMeta {
                    name: p.name.clone(),
                    shape: p.shape.clone(),
                    offset: p.offset,
                })
                .collect(),
        };
        shards.insert(
            flat_param_key(h.unit_path()),
            LocalShard {
                data: tensor::duplicate(&store.shard(h.shard_id())?.to_device(device)?)?,
                meta,
            },
        );
    }
    Ok(StateDict::Local(shards))
}

pub(crate) fn sharded_state_dict<R: Runtime>(
    handles: &[FlatParamHandle<R>],
    store: &ShardStore<R>,
    device: &R::Device,
    rank: usize,
    world_size: usize,
) -> Result<StateDict<R>> {
    let mut tensors = BTreeMap::new();
    for h in handles {
        let local = store.shard(h.shard_id())?.to_device(device)?;
        let params = h.layout().params();
        for piece in h.layout().shard_param_infos(h.shard_rank()) {
            let info = &params[piece.param_index];
            tensors.insert(
                info.name.clone(),
                ShardedTensor {
                    global_shape: info.shape.clone(),
                    offset: piece.param_offset,
                    data: tensor::copy_range(&local, piece.shard_offset, piece.len)?,
                },
            );
        }
    }
    Ok(StateDict::Sharded(ShardedStateDict {
        world_size,
        rank,
        tensors,
    }))
}

/// Check every candidate shard against the store, then swap them all in.
fn commit<R: Runtime>(store: &mut ShardStore<R>, updates: Vec<(ShardId, Tensor<R>)>) -> Result<()> {
    for (id, shard) in &updates {
        store
            .check_replacement(*id, shard)
            .map_err(|e| mismatch(format!("shard does not fit: {e}")))?;
    }
    for (id, shard) in updates {
        store.replace_shard(id, shard)?;
    }
    Ok(())
}

/// Rebuild a group's padded flat buffer from named full tensors.
fn flat_from_full<R, C>(
    client: &C,
    h: &FlatParamHandle<R>,
    tensors: &BTreeMap<String, Tensor<R>>,
) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R> + TypeConversionOps<R>,
{
    let layout = h.layout();
    let mut parts = Vec::with_capacity(layout.params().len());
    for info in layout.params() {
        let t = tensors
            .get(&info.name)
            .ok_or_else(|| mismatch(format!("missing parameter '{}'", info.name)))?;
        if t.shape() != info.shape.as_slice() {
            return Err(mismatch(format!(
                "parameter '{}' has shape {:?}, expected {:?}",
                info.name,
                t.shape(),
                info.shape
            )));
        }
        if !tensor::is_supported(t.dtype()) {
            return Err(mismatch(format!(
                "parameter '{}' has dtype {}, which cannot be loaded",
                info.name,
                t.dtype()
            )));
        }
        parts.push(client.cast(t, layout.dtype())?);
    }
    flatten(client, layout, &parts)
}

fn check_unexpected<'a>(
    keys: impl Iterator<Item = &'a String>,
    known: &HashSet<&str>,
) -> Result<()> {
    let unexpected: Vec<&str> = keys.map(String::as_str).filter(|k| !known.contains(k)).collect();
    if !unexpected.is_empty() {
        return Err(mismatch(format!("unexpected keys: {unexpected:?}")));
    }
    Ok(())
}

fn param_names<R: Runtime>(handles: &[FlatParamHandle<R>]) -> HashSet<&str> {
    handles
        .iter()
        .flat_map(|h| h.layout().params().iter().map(|p| p.name.as_str()))
        .collect()
}

pub(crate) fn load_full<R, C>(
    client: &C,
    handles: &[FlatParamHandle<R>],
    store: &mut ShardStore<R>,
    stream: &mut CommStream<R>,
    sd: &StateDict<R>,
    config: &FullStateDictConfig,
) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R> + TypeConversionOps<R>,
{
    expect_kind(sd, StateDictType::Full)?;
    let StateDict::Full(tensors) = sd else {
        return Ok(());
    };
    if config.rank0_only {
        return load_full_from_rank0(client, handles, store, stream, tensors);
    }

    check_unexpected(tensors.keys(), &param_names(handles))?;
    let mut updates = Vec::with_capacity(handles.len());
    for h in handles {
        let flat = flat_from_full(client, h, tensors)?;
        updates.push((h.shard_id(), shard(client, h.layout(), &flat, h.shard_rank())?));
    }
    commit(store, updates)
}

/// Rank 0 validates and broadcasts; other ranks ignore their own input.
///
/// The validation verdict is broadcast first so every rank either takes part
/// in all group broadcasts or in none.
fn load_full_from_rank0<R, C>(
    client: &C,
    handles: &[FlatParamHandle<R>],
    store: &mut ShardStore<R>,
    stream: &mut CommStream<R>,
    tensors: &BTreeMap<String, Tensor<R>>,
) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R> + TypeConversionOps<R>,
{
    let is_root = stream.rank() == 0;
    let mut flats = Vec::new();
    let mut verdict = Ok(());
    if is_root {
        verdict = check_unexpected(tensors.keys(), &param_names(handles)).and_then(|_| {
            flats = handles
                .iter()
                .map(|h| flat_from_full(client, h, tensors))
                .collect::<Result<Vec<_>>>()?;
            Ok(())
        });
    }

    let flag = if verdict.is_ok() { 1.0f32 } else { 0.0 };
    let flag = Tensor::<R>::try_from_slice(&[flag], &[1], stream.device())?;
    let flag = stream.broadcast(flag, 0)?;
    if tensor::to_f64_vec(&flag)?.first() != Some(&1.0) {
        verdict?;
        return Err(mismatch("rank 0 rejected the full state dict"));
    }

    let mut updates = Vec::with_capacity(handles.len());
    for (i, h) in handles.iter().enumerate() {
        let layout = h.layout();
        let flat = match flats.get(i) {
            Some(flat) if is_root => flat.clone(),
            _ => tensor::zeros(layout.dtype(), layout.padded_numel(), client.device())?,
        };
        let flat = stream.broadcast(flat, 0)?;
        updates.push((h.shard_id(), shard(client, layout, &flat, h.shard_rank())?));
    }
    commit(store, updates)
}

pub(crate) fn load_local<R, C>(
    client: &C,
    handles: &[FlatParamHandle<R>],
    store: &mut ShardStore<R>,
    sd: &StateDict<R>,
) -> Result<()>
where
    R: Runtime,
    C: TypeConversionOps<R>,
{
    expect_kind(sd, StateDictType::Local)?;
    let StateDict::Local(shards) = sd else {
        return Ok(());
    };

    let keys: Vec<String> = handles.iter().map(|h| flat_param_key(h.unit_path())).collect();
    let known: HashSet<&str> = keys.iter().map(String::as_str).collect();
    check_unexpected(shards.keys(), &known)?;

    let mut updates = Vec::with_capacity(handles.len());
    for (h, key) in handles.iter().zip(&keys) {
        let entry = shards
            .get(key)
            .ok_or_else(|| mismatch(format!("missing key '{key}'")))?;
        let meta = &entry.meta;
        let layout = h.layout();
        if meta.world_size != h.world_size() {
            return Err(mismatch(format!(
                "'{key}' was saved with world size {}, current world size is {}",
                meta.world_size,
                h.world_size()
            )));
        }
        if meta.rank != h.rank() {
            return Err(mismatch(format!(
                "'{key}' belongs to rank {}, this is rank {}",
                meta.rank,
                h.rank()
            )));
        }
        let range = layout.shard_range(h.shard_rank());
        if meta.numel != layout.numel()
            || meta.padded_numel != layout.padded_numel()
            || (meta.shard_start, meta.shard_end) != (range.start, range.end)
        {
            return Err(mismatch(format!(
                "'{key}' covers {}..{} of {} elements, expected {}..{} of {}",
                meta.shard_start,
                meta.shard_end,
                meta.padded_numel,
                range.start,
                range.end,
                layout.padded_numel()
            )));
        }
        let same_params = meta.params.len() == layout.params().len()
            && meta
                .params
                .iter()
                .zip(layout.params())
                .all(|(m, p)| m.name == p.name && m.shape == p.shape && m.offset == p.offset);
        if !same_params {
            return Err(mismatch(format!("'{key}' holds a different parameter layout")));
        }
        if entry.data.numel() != range.len() {
            return Err(mismatch(format!(
                "'{key}' holds {} elements, expected {}",
                entry.data.numel(),
                range.len()
            )));
        }
        if !tensor::is_supported(entry.data.dtype()) {
            return Err(mismatch(format!(
                "'{key}' has dtype {}, which cannot be loaded",
                entry.data.dtype()
            )));
        }
        updates.push((h.shard_id(), client.cast(&entry.data, layout.dtype())?));
    }
    commit(store, updates)
}

pub(crate) fn load_sharded<R, C>(
    client: &C,
    handles: &[FlatParamHandle<R>],
    store: &mut ShardStore<R>,
    sd: &StateDict<R>,
    rank: usize,
    world_size: usize,
) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R> + TypeConversionOps<R>,
{
    expect_kind(sd, StateDictType::Sharded)?;
    let StateDict::Sharded(sharded) = sd else {
        return Ok(());
    };
    if sharded.world_size != world_size {
        return Err(mismatch(format!(
            "saved with world size {}, current world size is {world_size}",
            sharded.world_size
        )));
    }
    if sharded.rank != rank {
        return Err(mismatch(format!(
            "saved by rank {}, this is rank {rank}",
            sharded.rank
        )));
    }

    let mut known = HashSet::new();
    let mut updates = Vec::with_capacity(handles.len());
    for h in handles {
        let layout = h.layout();
        // Pieces tile the shard back to back; only the tail is padding
        let mut parts = Vec::new();
        let mut filled = 0usize;
        for piece in layout.shard_param_infos(h.shard_rank()) {
            let info = &layout.params()[piece.param_index];
            known.insert(info.name.as_str());
            let t = sharded
                .tensors
                .get(&info.name)
                .ok_or_else(|| mismatch(format!("missing parameter '{}'", info.name)))?;
            if t.global_shape != info.shape
                || t.offset != piece.param_offset
                || t.data.numel() != piece.len
                || piece.shard_offset != filled
            {
                return Err(mismatch(format!(
                    "piece of '{}' is {} elements at offset {} of {:?}, expected {} at {} of {:?}",
                    info.name,
                    t.data.numel(),
                    t.offset,
                    t.global_shape,
                    piece.len,
                    piece.param_offset,
                    info.shape
                )));
            }
            if !tensor::is_supported(t.data.dtype()) {
                return Err(mismatch(format!(
                    "piece of '{}' has dtype {}, which cannot be loaded",
                    info.name,
                    t.data.dtype()
                )));
            }
            let piece_data = client.cast(&t.data, layout.dtype())?;
            parts.push(piece_data.contiguous().reshape(&[piece.len])?);
            filled += piece.len;
        }
        let body = if parts.is_empty() {
            tensor::zeros(layout.dtype(), 0, client.device())?
        } else {
            let refs: Vec<&Tensor<R>> = parts.iter().collect();
            client.cat(&refs, 0)?
        };
        updates.push((h.shard_id(), pad_to(client, &body, layout.shard_numel())?));
    }
    check_unexpected(sharded.tensors.keys(), &known)?;
    commit(store, updates)
}

#[cfg(test)]
mod tests {
    use numr::runtime::cpu::CpuRuntime;

    use super::*;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_flat_param_key() {
        assert_eq!(flat_param_key(""), "flat_param");
        assert_eq!(flat_param_key("layers.0"), "layers.0.flat_param");
    }

    #[test]
    fn test_kind_and_keys() {
        let (_, device) = cpu_setup();
        let mut tensors = BTreeMap::new();
        tensors.insert(
            "w".to_string(),
            Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device),
        );
        let sd = StateDict::Full(tensors);
        assert_eq!(sd.kind(), StateDictType::Full);
        assert_eq!(sd.keys(), vec!["w"]);
        assert!(expect_kind(&sd, StateDictType::Local).is_err());
    }

    #[test]
    fn test_equality_compares_bits() {
        let (_, device) = cpu_setup();
        let full = |values: &[f32]| {
            let mut tensors = BTreeMap::new();
            tensors.insert(
                "w".to_string(),
                Tensor::<CpuRuntime>::from_slice(values, &[values.len()], &device),
            );
            StateDict::Full(tensors)
        };
        assert_eq!(full(&[1.0, 2.0]), full(&[1.0, 2.0]));
        assert_ne!(full(&[1.0, 2.0]), full(&[1.0, 3.0]));
        assert_ne!(full(&[0.0]), full(&[-0.0]));
    }

    #[test]
    fn test_full_config_serde() {
        let cfg: FullStateDictConfig = serde_json::from_str(r#"{"rank0_only":true}"#).unwrap();
        assert!(cfg.rank0_only);
        assert_eq!(serde_json::to_string(&cfg).unwrap(), r#"{"rank0_only":true}"#);
    }

    #[test]
    fn test_metadata_serde() {
        let meta = ShardMetadata {
            world_size: 2,
            rank: 1,
            numel: 3,
            padded_numel: 4,
            shard_start: 2,
            shard_end: 4,
            dtype: DType::BF16,
            params: vec![ParamMeta {
                name: "w".into(),
                shape: vec![3],
                offset: 0,
            }],
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: ShardMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_state_dict_type_serde() {
        let json = serde_json::to_string(&StateDictType::Sharded).unwrap();
        assert_eq!(json, "\"sharded\"");
        assert_eq!(StateDictType::default(), StateDictType::Full);
    }
}
