use anyhow::Context;
use candle_core::Device;
use chessformer::{logger::ansi, trainer::save::CheckpointManager};
use structopt::StructOpt;

use std::path::PathBuf;

#[derive(StructOpt)]
pub struct InspectOptions {
    #[structopt(required = true)]
    checkpoint: PathBuf,
}

impl InspectOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        let loaded = CheckpointManager::load(&self.checkpoint, &Device::Cpu)
            .with_context(|| format!("Failed to load checkpoint {}", self.checkpoint.display()))?;

        println!("{}", serde_json::to_string_pretty(&loaded.meta)?);

        let mut names = loaded.model.keys().collect::<Vec<_>>();
        names.sort();

        let mut total = 0;
        for name in names {
            let tensor = &loaded.model[name];
            let values = tensor.flatten_all()?.to_vec1::<f32>()?;
            let n = values.len().max(1) as f32;
            let mean = values.iter().sum::<f32>() / n;
            let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
            let max = values.iter().fold(0f32, |m, v| m.max(v.abs()));
            total += values.len();

            println!("{:<48} {:>16} mean {mean:>10.5} std {std:>10.5} max|w| {max:>10.5}", name, format!("{:?}", tensor.dims()));
        }

        println!("Weights                : {}", ansi(total, 31));
        println!("Optimiser Slots        : {}", ansi(loaded.optimiser.len(), 31));
        println!("SWA                    : {}", ansi(loaded.swa.is_some(), 31));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::tests::checkpoint;

    #[test]
    fn inspects_a_saved_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (_, checkpoint) = checkpoint(dir.path());
        assert!(InspectOptions { checkpoint }.run().is_ok());
    }

    #[test]
    fn missing_meta_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InspectOptions { checkpoint: dir.path().to_path_buf() }.run().is_err());
    }
}
