mod common;

use chessformer::{InMemory, Trainer};

#[test]
fn policy_loss_falls_on_a_repeated_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), |c| {
        c.model.encoder_layers = 2;
        c.model.embedding_size = 64;
        c.model.encoder_heads = 4;
        c.model.value_buckets = 32;
        c.training.mask_legal_moves = true;
        // policy only, so the trunk follows the policy gradient alone
        c.training.value_loss_weight = 0.0;
        c.training.moves_left_loss_weight = Some(0.0);
        c.training.value_cat_loss_weight = 0.0;
    });

    let batch = common::synthetic(4, 3);
    let mut source = InMemory::new(batch.clone()).unwrap();
    let mut trainer = Trainer::with_paths(config, common::paths(dir.path())).unwrap();
    let policy_loss = |t: &Trainer| t.pipeline().evaluate(&batch).unwrap()[0];

    let initial = policy_loss(&trainer);
    assert!(initial.is_finite() && initial > 0.0);

    trainer.train_step(&mut source, 0.02).unwrap();
    let once = policy_loss(&trainer);
    trainer.train_step(&mut source, 0.02).unwrap();
    let twice = policy_loss(&trainer);

    assert!(once < initial, "{once} !< {initial}");
    assert!(twice < once, "{twice} !< {once}");
    assert_eq!(trainer.global_step(), 2);
}

#[test]
fn every_head_trains_without_nans() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), |c| {
        c.model.use_smolgen = true;
        c.model.smolgen_hidden_channels = Some(4);
        c.model.smolgen_hidden_sz = Some(16);
        c.model.smolgen_gen_sz = Some(8);
        c.training.q_ratio = 0.5;
        c.training.sparse = true;
    });

    let mut source = InMemory::new(common::synthetic(8, 1)).unwrap();
    let mut trainer = Trainer::with_paths(config, common::paths(dir.path())).unwrap();

    for _ in 0..3 {
        let norm = trainer.train_step(&mut source, 0.01).unwrap();
        assert!(norm.is_finite() && norm > 0.0);
    }

    let values = trainer.pipeline().evaluate(&common::synthetic(4, 9)).unwrap();
    assert!(values.iter().all(|v| v.is_finite()));

    // 2:4 masks leave at least half of every encoder kernel at zero
    for name in trainer.network().sparsity_targets() {
        let weights = trainer.network().params().get(&name).unwrap().values().unwrap();
        let zeros = weights.iter().filter(|w| **w == 0.0).count();
        assert!(2 * zeros >= weights.len(), "{name}");
    }
}
