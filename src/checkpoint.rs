//! Checkpointing of sharded modules.
//!
//! Layout of a sharded checkpoint:
//! - `{dir}/rank_{rank}/shards.safetensors`: this rank's local or sharded
//!   state dict, per-entry placement in the file metadata
//! - `{dir}/sharding_meta.json`: written by rank 0
//!
//! A full checkpoint is a single `{dir}/model.safetensors` written by rank 0.
//!
//! Saving is collective and ends in a barrier, so once any rank returns the
//! whole checkpoint is on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::Runtime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::format::safetensors::{SafeTensors, save_safetensors};
use crate::fsdp::ShardedModule;
use crate::state_dict::{
    LocalShard, ShardMetadata, ShardedStateDict, ShardedTensor, StateDict, StateDictType,
};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const SHARDS_FILE: &str = "shards.safetensors";
const META_FILE: &str = "sharding_meta.json";
const FULL_FILE: &str = "model.safetensors";

/// Metadata written by rank 0 describing the whole sharded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingMeta {
    pub version: u32,
    pub world_size: usize,
    pub state_dict_type: StateDictType,
}

#[derive(Serialize, Deserialize)]
struct PieceMeta {
    global_shape: Vec<usize>,
    offset: usize,
}

/// File-metadata key holding an entry's placement.
fn entry_meta_key(name: &str) -> String {
    format!("placement.{name}")
}

fn ckpt_err(reason: impl Into<String>) -> Error {
    Error::Checkpoint {
        reason: reason.into(),
    }
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ckpt_err(format!("failed to serialize {what}: {e}")))
}

fn from_json<'a, T: Deserialize<'a>>(json: &'a str, what: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| ckpt_err(format!("failed to parse {what}: {e}")))
}

/// Read the rank-0 metadata of a sharded checkpoint.
pub fn read_sharding_meta<P: AsRef<Path>>(dir: P) -> Result<ShardingMeta> {
    let dir = dir.as_ref();
    let meta_path = dir.join(META_FILE);
    if !meta_path.exists() {
        return Err(ckpt_err(format!(
            "{META_FILE} not found in {}: not a sharded checkpoint",
            dir.display()
        )));
    }
    let json = std::fs::read_to_string(&meta_path)
        .map_err(|e| ckpt_err(format!("failed to read sharding meta: {e}")))?;
    let meta: ShardingMeta = from_json(&json, "sharding meta")?;
    if meta.version > CHECKPOINT_VERSION {
        return Err(ckpt_err(format!(
            "checkpoint version {} is newer than supported version {CHECKPOINT_VERSION}",
            meta.version
        )));
    }
    Ok(meta)
}

/// Save this rank's shards using the module's active state dict type, which
/// must be `Local` or `Sharded`. Collective.
pub fn save_sharded_checkpoint<R, P>(dir: P, module: &mut ShardedModule<R>) -> Result<()>
where
    R: Runtime,
    R::Client: TensorOps<R> + ScalarOps<R>,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let rank = module.rank();
    let world_size = module.world_size();
    let kind = module.state_dict_type();

    let mut metadata = HashMap::from([
        ("format".to_string(), "shardr".to_string()),
        ("state_dict_type".to_string(), kind.to_string()),
        ("world_size".to_string(), world_size.to_string()),
        ("rank".to_string(), rank.to_string()),
    ]);
    let mut tensors = BTreeMap::new();
    match module.state_dict()? {
        StateDict::Local(shards) => {
            for (key, shard) in shards {
                let placement = to_json(&shard.meta, "shard metadata")?;
                metadata.insert(entry_meta_key(&key), placement);
                tensors.insert(key, shard.data);
            }
        }
        StateDict::Sharded(sharded) => {
            for (name, piece) in sharded.tensors {
                let meta = PieceMeta {
                    global_shape: piece.global_shape,
                    offset: piece.offset,
                };
                metadata.insert(entry_meta_key(&name), to_json(&meta, "piece metadata")?);
                tensors.insert(name, piece.data);
            }
        }
        StateDict::Full(_) => {
            return Err(ckpt_err(
                "sharded checkpoints need a local or sharded state dict type; \
                 use save_full_checkpoint for full state dicts",
            ));
        }
    }

    let rank_dir = dir.join(format!("rank_{rank}"));
    std::fs::create_dir_all(&rank_dir)
        .map_err(|e| ckpt_err(format!("failed to create checkpoint dir: {e}")))?;
    save_safetensors(rank_dir.join(SHARDS_FILE), &tensors, Some(&metadata))?;

    if rank == 0 {
        let meta = ShardingMeta {
            version: CHECKPOINT_VERSION,
            world_size,
            state_dict_type: kind,
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| ckpt_err(format!("failed to serialize sharding meta: {e}")))?;
        std::fs::write(dir.join(META_FILE), json)
            .map_err(|e| ckpt_err(format!("failed to write sharding meta: {e}")))?;
    }

    module.barrier()?;
    info!(rank, world_size, kind = %kind, dir = %dir.display(), "sharded checkpoint saved");
    Ok(())
}

/// Load this rank's shards from a checkpoint saved with the same world size
/// and state dict type. No communication.
pub fn load_sharded_checkpoint<R, P>(dir: P, module: &mut ShardedModule<R>) -> Result<()>
where
    R: Runtime,
    R::Client: TensorOps<R> + ScalarOps<R>,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let rank = module.rank();
    let world_size = module.world_size();
    let meta = read_sharding_meta(dir)?;
    if meta.world_size != world_size {
        return Err(ckpt_err(format!(
            "checkpoint was saved with world size {}, current world size is {world_size}",
            meta.world_size
        )));
    }
    if meta.state_dict_type != module.state_dict_type() {
        return Err(ckpt_err(format!(
            "checkpoint holds a {} state dict, module is set to {}",
            meta.state_dict_type,
            module.state_dict_type()
        )));
    }

    let path = dir.join(format!("rank_{rank}")).join(SHARDS_FILE);
    let mut st = SafeTensors::open(&path)?;
    let saved_rank = st.require_metadata("rank")?;
    if saved_rank != rank.to_string() {
        return Err(ckpt_err(format!(
            "{} was written by rank {saved_rank}, this is rank {rank}",
            path.display()
        )));
    }

    let names: Vec<String> = st.tensor_names().map(str::to_string).collect();
    let device = module.device().clone();
    let sd = match meta.state_dict_type {
        StateDictType::Local => {
            let mut shards = BTreeMap::new();
            for key in names {
                let meta: ShardMetadata =
                    from_json(st.require_metadata(&entry_meta_key(&key))?, "shard metadata")?;
                let data = st.read_tensor::<R>(&key, &device)?;
                shards.insert(key, LocalShard { data, meta });
            }
            StateDict::Local(shards)
        }
        StateDictType::Sharded => {
            let mut tensors = BTreeMap::new();
            for name in names {
                let piece: PieceMeta =
                    from_json(st.require_metadata(&entry_meta_key(&name))?, "piece metadata")?;
                let data = st.read_tensor::<R>(&name, &device)?;
                tensors.insert(
                    name,
                    ShardedTensor {
                        global_shape: piece.global_shape,
                        offset: piece.offset,
                        data,
                    },
                );
            }
            StateDict::Sharded(ShardedStateDict {
                world_size,
                rank,
                tensors,
            })
        }
        StateDictType::Full => {
            return Err(ckpt_err("sharding meta names a full state dict"));
        }
    };

    module.load_state_dict(&sd)?;
    info!(rank, dir = %dir.display(), "sharded checkpoint loaded");
    Ok(())
}

/// Gather every parameter and have rank 0 write `model.safetensors`.
/// Collective.
pub fn save_full_checkpoint<R, P>(dir: P, module: &mut ShardedModule<R>) -> Result<()>
where
    R: Runtime,
    R::Client: TensorOps<R> + ScalarOps<R>,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let StateDict::Full(params) = module.gather_full_state_dict()? else {
        return Err(ckpt_err("gather produced a non-full state dict"));
    };
    if module.rank() == 0 {
        std::fs::create_dir_all(dir)
            .map_err(|e| ckpt_err(format!("failed to create checkpoint dir: {e}")))?;
        let metadata = HashMap::from([
            ("format".to_string(), "shardr".to_string()),
            ("state_dict_type".to_string(), StateDictType::Full.to_string()),
        ]);
        save_safetensors(dir.join(FULL_FILE), &params, Some(&metadata))?;
        info!(dir = %dir.display(), tensors = params.len(), "full checkpoint saved");
    }
    module.barrier()
}

/// Load `model.safetensors` into every rank's shards. Collective.
///
/// With `rank0_only` set only rank 0 reads the file; the others receive
/// their parameters by broadcast.
pub fn load_full_checkpoint<R, P>(dir: P, module: &mut ShardedModule<R>) -> Result<()>
where
    R: Runtime,
    R::Client: TensorOps<R> + ScalarOps<R>,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let reads = !module.full_state_dict_config().rank0_only || module.rank() == 0;
    let mut params = BTreeMap::new();
    if reads {
        let mut st = SafeTensors::open(dir.join(FULL_FILE))?;
        let names: Vec<String> = st.tensor_names().map(str::to_string).collect();
        for name in names {
            let data = st.read_tensor::<R>(&name, module.device())?;
            params.insert(name, data);
        }
    }
    module.load_full_state_dict(&StateDict::Full(params))
}
