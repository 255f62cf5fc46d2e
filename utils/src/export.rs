use anyhow::Context;
use candle_core::Device;
use chessformer::{trainer::save, Config, Network};
use structopt::StructOpt;

use std::path::PathBuf;

#[derive(StructOpt)]
pub struct ExportOptions {
    #[structopt(required = true)]
    config: PathBuf,
    #[structopt(required = true)]
    checkpoint: PathBuf,
    #[structopt(required = true)]
    output: PathBuf,
    /// Export the averaged weights instead of the live ones.
    #[structopt(long)]
    swa: bool,
}

impl ExportOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        let config = Config::load(&self.config).with_context(|| format!("Failed to load {}", self.config.display()))?;
        let network = Network::build(&config, &Device::Cpu)?;
        let loaded = save::CheckpointManager::load(&self.checkpoint, &Device::Cpu)
            .with_context(|| format!("Failed to load checkpoint {}", self.checkpoint.display()))?;

        let weights = if self.swa {
            loaded.swa.as_ref().with_context(|| "Checkpoint has no SWA weights.")?
        } else {
            &loaded.model
        };
        network.params().load_named_tensors(weights).with_context(|| "Checkpoint doesn't match the config.")?;

        save::export_network(&self.output, &config.model, network.params(), loaded.meta.global_step)?;
        println!("Written to [{}]", self.output.display());
        Ok(())
    }
}
