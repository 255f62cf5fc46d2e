mod common;

use std::collections::HashMap;

use candle_core::Tensor;
use chessformer::{trainer::save::read_export, InMemory, Trainer};

fn optimiser_state(trainer: &Trainer) -> HashMap<String, Vec<f32>> {
    let state = trainer.pipeline().optimiser().state_tensors().unwrap();
    state.into_iter().map(|(k, v)| (k, v.flatten_all().unwrap().to_vec1::<f32>().unwrap())).collect()
}

#[test]
fn restore_returns_the_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), |c| {
        c.training.nadam_optimizer = true;
        c.training.swa = true;
        c.training.swa_max_n = 10;
    });

    let mut source = InMemory::new(common::synthetic(8, 0)).unwrap();
    let mut trainer = Trainer::with_paths(config.clone(), common::paths(dir.path())).unwrap();
    trainer.train_step(&mut source, 0.01).unwrap();
    trainer.train_step(&mut source, 0.01).unwrap();
    trainer.save(0.01).unwrap();

    let saved = common::weights(trainer.network());
    let saved_optimiser = optimiser_state(&trainer);

    for param in trainer.network().params().iter() {
        let noise = Tensor::ones_like(param.var.as_tensor()).unwrap();
        param.var.set(&noise).unwrap();
    }
    trainer.train_step(&mut source, 0.01).unwrap();
    assert_ne!(common::weights(trainer.network()), saved);
    assert_eq!(trainer.global_step(), 3);

    assert!(trainer.restore().unwrap());
    assert_eq!(trainer.global_step(), 2);
    assert_eq!(common::weights(trainer.network()), saved);
    assert_eq!(optimiser_state(&trainer), saved_optimiser);

    let mut fresh = Trainer::with_paths(config, common::paths(dir.path())).unwrap();
    assert!(fresh.restore().unwrap());
    assert_eq!(common::weights(fresh.network()), saved);
    assert_eq!(fresh.swa().unwrap().count(), 0);
}

#[test]
fn nothing_to_restore_in_a_fresh_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), |_| {});
    let mut trainer = Trainer::with_paths(config, common::paths(dir.path())).unwrap();
    assert!(!trainer.restore().unwrap());
    assert_eq!(trainer.global_step(), 0);
}

#[test]
fn exports_live_and_averaged_weights() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), |c| c.training.swa = true);
    let root = config.root_dir();

    let mut source = InMemory::new(common::synthetic(4, 2)).unwrap();
    let mut trainer = Trainer::with_paths(config, common::paths(dir.path())).unwrap();
    trainer.train_step(&mut source, 0.01).unwrap();
    trainer.save(0.01).unwrap();

    let (header, records) = read_export(&root.join("net-1")).unwrap();
    assert_eq!(header.step, 1);
    assert!(header.value_softmax);
    assert_eq!(records.len(), trainer.network().params().len());

    // no averaging has happened yet, so the averaged export holds the initial weights
    let (_, swa_records) = read_export(&root.join("net-swa-1")).unwrap();
    assert_eq!(swa_records.len(), records.len());
    assert_ne!(swa_records, records);

    assert!(root.join("checkpoints").join("net-1").join("swa.safetensors").exists());
    assert_eq!(common::weights(trainer.network())[0].len(), records[0].1.len());
}

#[test]
fn weights_survive_an_export_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), |_| {});
    let root = config.root_dir();

    let mut source = InMemory::new(common::synthetic(4, 2)).unwrap();
    let mut trainer = Trainer::with_paths(config, common::paths(dir.path())).unwrap();
    trainer.train_step(&mut source, 0.05).unwrap();
    trainer.save(0.05).unwrap();

    let other = tempfile::tempdir().unwrap();
    let mut fresh = Trainer::with_paths(common::config(other.path(), |c| c.seed = 99), common::paths(other.path())).unwrap();
    assert_ne!(common::weights(fresh.network()), common::weights(trainer.network()));

    // classic inputs, the trainer's own export at step 1
    fresh.replace_weights(&root.join("net-1"), false).unwrap();
    assert_eq!(common::weights(fresh.network()), common::weights(trainer.network()));
}
