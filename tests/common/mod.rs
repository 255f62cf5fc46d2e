#![allow(dead_code)]

use std::path::Path;

use chessformer::{
    data::PLANE_VALUES,
    nn::{policy_map::POLICY_OUTPUTS, Network},
    Batch, Config, TrainerPaths,
};

/// Positions with eight legal moves each and a one-hot best move.
pub fn synthetic(size: usize, seed: usize) -> Batch {
    let mut planes = vec![0.0; size * PLANE_VALUES];
    let mut policy = vec![-1.0; size * POLICY_OUTPUTS];
    let mut outcome = vec![0.0; size * 3];
    let mut q = vec![0.0; size * 3];
    let mut moves_left = vec![0.0; size];

    for i in 0..size {
        let s = seed + i;
        // a king each and a few other pieces, one per square
        for (plane, square) in [(5, 4 + s % 3), (11, 60 - s % 3), (1, 20 + s % 7), (9, 44 - s % 5), (0, 8 + s % 8)] {
            planes[i * PLANE_VALUES + plane * 64 + square] = 1.0;
        }
        planes[i * PLANE_VALUES + 111 * 64..(i + 1) * PLANE_VALUES].fill(1.0);

        for m in 0..8 {
            policy[i * POLICY_OUTPUTS + (s * 31 + m * 97) % POLICY_OUTPUTS] = 0.0;
        }
        policy[i * POLICY_OUTPUTS + (s * 31) % POLICY_OUTPUTS] = 1.0;

        outcome[i * 3 + s % 3] = 1.0;
        q[i * 3..i * 3 + 3].copy_from_slice(&[0.4, 0.35, 0.25]);
        moves_left[i] = (20 + 3 * s % 40) as f32;
    }

    Batch::new(planes, policy, outcome, q, moves_left).unwrap()
}

/// A small run rooted in `dir`, adjusted by `edit` and validated again.
pub fn config(dir: &Path, edit: impl FnOnce(&mut Config)) -> Config {
    let yaml = format!(
        "
name: net
seed: 11
training:
    path: {}
    batch_size: 4
    policy_loss_weight: 1.0
    value_loss_weight: 1.0
    moves_left_loss_weight: 0.1
    lr_values: [0.01]
    lr_boundaries: []
    total_steps: 4
    test_steps: 2
    train_avg_report_steps: 2
model:
    embedding_size: 16
    encoder_layers: 1
    encoder_heads: 2
    value_buckets: 8
",
        dir.join("networks").display(),
    );

    let mut config = Config::from_yaml_str(&yaml).unwrap();
    edit(&mut config);
    config.validated().unwrap()
}

pub fn paths(dir: &Path) -> TrainerPaths {
    TrainerPaths { logs: dir.join("leelalogs"), stop_file: dir.join("stop") }
}

pub fn weights(network: &Network) -> Vec<Vec<f32>> {
    network.params().iter().map(|p| p.values().unwrap()).collect()
}

pub fn max_abs_diff(a: &[Vec<f32>], b: &[Vec<f32>]) -> f32 {
    a.iter().flatten().zip(b.iter().flatten()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
