pub mod activation;
pub mod encoder;
pub mod layers;
pub mod model;
pub mod params;
pub mod policy_map;

pub use model::{ModelOutputs, Network, INPUT_PLANES};
pub use params::{Param, ParamKind, ParamStore};
