//! State-dict round trips across representations and world sizes.

mod common;

use std::sync::Arc;

use common::*;
use numr::ops::ScalarOps;
use shardr::{Error, FullStateDictConfig, ProcessGroup, StateDict, StateDictType, tensor};

fn perturb(m: &mut Module) {
    let (client, _) = cpu();
    m.update_shards(|_, shard, _| Ok(client.add_scalar(shard, 1.0)?))
        .unwrap();
}

#[test]
fn test_state_dict_idempotent_in_every_mode() {
    for kind in [StateDictType::Full, StateDictType::Local, StateDictType::Sharded] {
        for world_size in [1, 2, 3] {
            run_ranks(world_size, move |pg| {
                let mut m = build(pg, always().with_state_dict_type(kind));
                let sd = m.state_dict().unwrap();
                assert_eq!(sd.kind(), kind);

                m.load_state_dict(&sd).unwrap();
                assert_eq!(m.state_dict().unwrap(), sd);

                perturb(&mut m);
                assert_ne!(m.state_dict().unwrap(), sd);
                m.load_state_dict(&sd).unwrap();
                assert_eq!(m.state_dict().unwrap(), sd);
            });
        }
    }
}

#[test]
fn test_full_state_dict_matches_original_params() {
    let results = run_ranks(3, |pg| {
        let mut m = build(pg, always());
        m.state_dict().unwrap()
    });
    for sd in results {
        let StateDict::Full(tensors) = sd else {
            panic!("expected a full state dict");
        };
        let expected = toy_params();
        assert_eq!(tensors.len(), expected.len());
        for (name, values) in expected {
            assert_eq!(tensor::to_f64_vec(&tensors[&name]).unwrap(), values, "{name}");
        }
        assert_eq!(tensors["layers.0.weight"].shape(), &[4, 4]);
    }
}

#[test]
fn test_full_state_dict_loads_across_world_sizes() {
    // Full state dicts hold no sharding information
    let saved = run_ranks(2, |pg| {
        let mut m = build(pg, always());
        perturb(&mut m);
        m.state_dict().unwrap()
    });
    let saved = Arc::new(saved.into_iter().next().unwrap());

    run_ranks(3, move |pg| {
        let mut m = build(pg, always());
        m.load_state_dict(&saved).unwrap();
        assert_eq!(&m.state_dict().unwrap(), &*saved);
    });
}

#[test]
fn test_sharded_state_dict_pieces_cover_params() {
    let results = run_ranks(2, |pg| {
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Sharded));
        m.state_dict().unwrap()
    });
    let mut covered: std::collections::BTreeMap<String, usize> = Default::default();
    for sd in &results {
        let StateDict::Sharded(sharded) = sd else {
            panic!("expected a sharded state dict");
        };
        assert_eq!(sharded.world_size, 2);
        for (name, piece) in &sharded.tensors {
            *covered.entry(name.clone()).or_default() += piece.data.numel();
        }
    }
    for (name, values) in toy_params() {
        assert_eq!(covered[&name], values.len(), "{name}");
    }
}

#[test]
fn test_sharded_state_dict_rejected_at_other_world_size() {
    let saved = run_ranks(2, |pg| {
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Sharded));
        m.state_dict().unwrap()
    });
    let saved = Arc::new(saved);
    run_ranks(3, move |pg| {
        let rank = pg.rank();
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Sharded));
        let err = m.load_state_dict(&saved[rank % 2]).unwrap_err();
        assert!(matches!(err, Error::StateDict { .. }));
    });
}

#[test]
fn test_wrong_kind_and_unexpected_keys_rejected() {
    run_ranks(1, |pg| {
        let mut m = build(pg, always().with_state_dict_type(StateDictType::Local));
        let local = m.state_dict().unwrap();

        m.set_state_dict_type(StateDictType::Sharded, None);
        assert!(matches!(
            m.load_state_dict(&local),
            Err(Error::StateDict { .. })
        ));

        m.set_state_dict_type(StateDictType::Local, None);
        let StateDict::Local(mut shards) = local.clone() else {
            panic!("expected a local state dict");
        };
        let extra = shards["flat_param"].clone();
        shards.insert("bogus.flat_param".to_string(), extra);
        let before = m.state_dict().unwrap();
        assert!(m.load_state_dict(&StateDict::Local(shards)).is_err());
        assert_eq!(m.state_dict().unwrap(), before);
    });
}

#[test]
fn test_full_state_dict_bad_shape_leaves_module_untouched() {
    run_ranks(2, |pg| {
        let mut m = build(pg, always());
        let before = m.state_dict().unwrap();
        let StateDict::Full(mut tensors) = before.clone() else {
            panic!("expected a full state dict");
        };
        let cube = tensors["head.weight"].reshape(&[2, 2, 2]).unwrap();
        tensors.insert("head.weight".to_string(), cube);
        let err = m.load_state_dict(&StateDict::Full(tensors)).unwrap_err();
        assert!(matches!(err, Error::StateDict { .. }));
        assert_eq!(m.state_dict().unwrap(), before);
    });
}

#[test]
fn test_rank0_only_full_state_dict() {
    let cfg = FullStateDictConfig { rank0_only: true };
    let results = run_ranks(2, move |pg| {
        let rank = pg.rank();
        let mut m = build(pg, always().with_full_state_dict_config(cfg));
        let sd = m.state_dict().unwrap();
        if rank == 0 {
            assert_eq!(sd.len(), toy_params().len());
        } else {
            assert!(sd.is_empty());
        }

        // Only rank 0's input matters on load; others pass an empty dict
        let mut edited = sd.clone();
        if let StateDict::Full(tensors) = &mut edited {
            if let Some(t) = tensors.get_mut("embed") {
                *t = f32s(&[9.0; 4]);
            }
        }
        m.load_state_dict(&edited).unwrap();

        m.set_state_dict_type(StateDictType::Full, Some(FullStateDictConfig::default()));
        let StateDict::Full(after) = m.state_dict().unwrap() else {
            panic!("expected a full state dict");
        };
        tensor::to_f64_vec(&after["embed"]).unwrap()
    });
    for embed in results {
        assert_eq!(embed, vec![9.0; 4]);
    }
}
