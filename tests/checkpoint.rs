//! Sharded and full checkpoints across simulated ranks.

mod common;

use std::path::PathBuf;

use common::*;
use numr::ops::ScalarOps;
use shardr::checkpoint::{CHECKPOINT_VERSION, read_sharding_meta};
use shardr::{
    Error, FullStateDictConfig, StateDict, StateDictType, load_full_checkpoint,
    load_sharded_checkpoint, save_full_checkpoint, save_sharded_checkpoint, tensor,
};

fn perturb(m: &mut Module) {
    let (client, _) = cpu();
    m.update_shards(|_, shard, _| Ok(client.add_scalar(&client.mul_scalar(shard, 2.0)?, 1.0)?))
        .unwrap();
}

#[test]
fn test_sharded_checkpoint_roundtrip_two_ranks() {
    for kind in [StateDictType::Local, StateDictType::Sharded] {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().to_path_buf();
        run_ranks(2, move |pg| {
            let mut m = build(pg, always().with_state_dict_type(kind));
            perturb(&mut m);
            let saved = m.state_dict().unwrap();
            save_sharded_checkpoint(&path, &mut m).unwrap();

            perturb(&mut m);
            assert_ne!(m.state_dict().unwrap(), saved);
            load_sharded_checkpoint(&path, &mut m).unwrap();
            assert_eq!(m.state_dict().unwrap(), saved);
        });

        let meta = read_sharding_meta(dir.path()).unwrap();
        assert_eq!(meta.version, CHECKPOINT_VERSION);
        assert_eq!(meta.world_size, 2);
        assert_eq!(meta.state_dict_type, kind);
        assert!(dir.path().join("rank_0/shards.safetensors").exists());
        assert!(dir.path().join("rank_1/shards.safetensors").exists());
    }
}

#[test]
fn test_sharded_checkpoint_rejects_other_world_size() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().to_path_buf();
    let save_path = path.clone();
    run_ranks(2, move |pg| {
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Local));
        save_sharded_checkpoint(&save_path, &mut m).unwrap();
    });

    run_ranks(3, move |pg| {
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Local));
        let before = m.state_dict().unwrap();
        let err = load_sharded_checkpoint(&path, &mut m).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { .. }), "{err}");
        assert!(err.to_string().contains("world size 2"));
        assert_eq!(m.state_dict().unwrap(), before);
    });
}

#[test]
fn test_missing_checkpoint_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("nothing-here");
    run_ranks(1, move |pg| {
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Sharded));
        assert!(matches!(
            load_sharded_checkpoint(&path, &mut m),
            Err(Error::Checkpoint { .. })
        ));
        assert!(matches!(
            load_full_checkpoint(&path, &mut m),
            Err(Error::Checkpoint { .. })
        ));
    });
}

#[test]
fn test_full_checkpoint_reshards_to_new_world_size() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().to_path_buf();
    let save_path = path.clone();
    let saved = run_ranks(2, move |pg| {
        let mut m = build(pg, always());
        perturb(&mut m);
        save_full_checkpoint(&save_path, &mut m).unwrap();
        m.state_dict().unwrap()
    });
    assert!(dir.path().join("model.safetensors").exists());
    let expected = std::sync::Arc::new(saved.into_iter().next().unwrap());

    run_ranks(3, move |pg| {
        let mut m = build(pg, always());
        load_full_checkpoint(&path, &mut m).unwrap();
        assert_eq!(&m.state_dict().unwrap(), &*expected);
    });
}

#[test]
fn test_full_checkpoint_rank0_only_load() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().to_path_buf();
    let save_path = path.clone();
    run_ranks(1, move |pg| {
        let mut m = build(pg, always());
        perturb(&mut m);
        save_full_checkpoint(&save_path, &mut m).unwrap();
    });

    let cfg = FullStateDictConfig { rank0_only: true };
    let results = run_ranks(2, move |pg| {
        let mut m = build(pg, always().with_full_state_dict_config(cfg));
        load_full_checkpoint(&path, &mut m).unwrap();
        m.summon_full_params(|p| tensor::to_f64_vec(&p["embed"]).unwrap())
            .unwrap()
    });
    let expected: Vec<f64> = toy_params()
        .into_iter()
        .find(|(n, _)| n == "embed")
        .map(|(_, v)| v.iter().map(|x| x * 2.0 + 1.0).collect())
        .unwrap();
    for embed in results {
        assert_close(&embed, &expected, 1e-6);
    }
}

#[test]
fn test_full_type_needs_full_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().to_path_buf();
    run_ranks(1, move |pg| {
        let mut m = build(pg, always());
        assert!(matches!(m.state_dict().unwrap(), StateDict::Full(_)));
        assert!(save_sharded_checkpoint(&path, &mut m).is_err());
    });
}
