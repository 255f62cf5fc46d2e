pub mod config;
pub mod data;
pub mod error;
pub mod logger;
pub mod nn;
pub mod rng;
pub mod trainer;

pub use config::Config;
pub use data::{Batch, BatchSource, InMemory, ValidationSet};
pub use error::{Error, Result};
pub use nn::Network;
pub use trainer::{Trainer, TrainerPaths};
