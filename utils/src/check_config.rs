use anyhow::Context;
use chessformer::{logger::ansi, Config};
use structopt::StructOpt;

use std::path::PathBuf;

#[derive(StructOpt)]
pub struct CheckConfigOptions {
    #[structopt(required = true)]
    config: PathBuf,
}

impl CheckConfigOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        let config = Config::load(&self.config).with_context(|| format!("Failed to load {}", self.config.display()))?;
        config.display();
        println!("{}", ansi("Config OK", "32;1"));
        Ok(())
    }
}
