use std::{fmt, path::Path};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    logger::ansi,
    nn::activation::Activation,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyHead {
    #[default]
    Attention,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueHead {
    /// Single tanh output.
    Classical,
    #[default]
    Wdl,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovesLeftHead {
    None,
    #[default]
    V1,
}

/// Input plane encodings, ordered oldest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    Classic,
    FrcCastling,
    Canonical,
    #[serde(rename = "canonical_100")]
    Canonical100,
    CanonicalArmageddon,
    CanonicalV2,
    CanonicalV2Armageddon,
}

impl InputMode {
    /// Older encodings feed the rule50 plane unnormalised.
    pub fn has_normalised_rule50(self) -> bool {
        self >= Self::Canonical100
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Single,
    Half,
}

/// Which devices to replicate the model across.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpuSpec {
    Ordinal(usize),
    List(String),
}

impl Default for GpuSpec {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl GpuSpec {
    pub fn ordinals(&self) -> Result<Vec<usize>> {
        match self {
            Self::Ordinal(x) => Ok(vec![*x]),
            Self::List(s) if s.trim() == "all" => Ok(vec![0]),
            Self::List(s) => s
                .split(',')
                .map(|x| x.trim().parse::<usize>().map_err(|_| Error::Config(format!("invalid gpu entry '{x}'"))))
                .collect(),
        }
    }

    /// One device per replica. Falls back to the CPU when built without CUDA.
    pub fn devices(&self) -> Result<Vec<Device>> {
        self.ordinals()?.into_iter().map(|i| Device::cuda_if_available(i).map_err(Error::from)).collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub embedding_size: usize,
    pub encoder_layers: usize,
    pub encoder_heads: usize,
    #[serde(default)]
    pub encoder_d_model: Option<usize>,
    #[serde(default)]
    pub encoder_dff: Option<usize>,
    #[serde(default)]
    pub policy_embedding_size: Option<usize>,
    #[serde(default)]
    pub policy_d_model: Option<usize>,
    #[serde(default = "defaults::value_embedding_size")]
    pub value_embedding_size: usize,
    #[serde(default = "defaults::moves_left_embedding_size")]
    pub moves_left_embedding_size: usize,
    #[serde(default)]
    pub dropout_rate: f32,
    #[serde(default)]
    pub arc_encoding: bool,
    #[serde(default)]
    pub use_smolgen: bool,
    #[serde(default)]
    pub smolgen_hidden_channels: Option<usize>,
    #[serde(default)]
    pub smolgen_hidden_sz: Option<usize>,
    #[serde(default)]
    pub smolgen_gen_sz: Option<usize>,
    /// Activation of the smolgen dense layers; linear when unset.
    #[serde(default)]
    pub smolgen_activation: Option<Activation>,
    #[serde(default = "defaults::value_buckets")]
    pub value_buckets: usize,
    #[serde(default)]
    pub policy: PolicyHead,
    #[serde(default)]
    pub value: ValueHead,
    #[serde(default)]
    pub moves_left: MovesLeftHead,
    #[serde(default)]
    pub input_type: InputMode,
    #[serde(default)]
    pub default_activation: Activation,
    #[serde(default)]
    pub ffn_activation: Option<Activation>,
    #[serde(default = "defaults::yes")]
    pub major_ffn: bool,
    #[serde(default)]
    pub virtual_batch_size: Option<usize>,
}

impl ModelConfig {
    pub fn encoder_d_model(&self) -> usize {
        self.encoder_d_model.unwrap_or(self.embedding_size)
    }

    pub fn encoder_dff(&self) -> usize {
        self.encoder_dff.unwrap_or(self.embedding_size * 3 / 2)
    }

    pub fn policy_embedding_size(&self) -> usize {
        self.policy_embedding_size.unwrap_or(self.embedding_size)
    }

    pub fn policy_d_model(&self) -> usize {
        self.policy_d_model.unwrap_or(self.embedding_size)
    }

    pub fn ffn_activation(&self) -> Activation {
        self.ffn_activation.unwrap_or(self.default_activation)
    }

    pub fn wdl(&self) -> bool {
        self.value == ValueHead::Wdl
    }

    pub fn has_moves_left(&self) -> bool {
        self.moves_left == MovesLeftHead::V1
    }

    /// `(hidden_channels, hidden_sz, gen_sz)` when smolgen is enabled.
    pub fn smolgen(&self) -> Option<(usize, usize, usize)> {
        if !self.use_smolgen {
            return None;
        }

        Some((self.smolgen_hidden_channels?, self.smolgen_hidden_sz?, self.smolgen_gen_sz?))
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.embedding_size == 0 || self.encoder_heads == 0 {
            return fail("embedding_size and encoder_heads must be positive".into());
        }

        if self.encoder_layers == 0 {
            return fail("the attention value head requires encoder_layers > 0".into());
        }

        if self.encoder_d_model() % self.encoder_heads != 0 {
            return fail(format!(
                "encoder_d_model ({}) must be divisible by encoder_heads ({})",
                self.encoder_d_model(),
                self.encoder_heads
            ));
        }

        if !matches!(self.default_activation, Activation::Relu | Activation::Mish | Activation::Gelu) {
            return fail(format!("Unknown default activation type: {}", self.default_activation));
        }

        if self.use_smolgen && self.smolgen().is_none() {
            return fail("use_smolgen requires smolgen_hidden_channels, smolgen_hidden_sz and smolgen_gen_sz".into());
        }

        if self.arc_encoding {
            return fail("arc_encoding is not supported".into());
        }

        if self.value_buckets == 0 {
            return fail("value_buckets must be positive".into());
        }

        if !(0.0..1.0).contains(&self.dropout_rate) {
            return fail(format!("dropout_rate must lie in [0, 1), got {}", self.dropout_rate));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub path: String,
    pub batch_size: usize,
    #[serde(default)]
    pub num_test_positions: Option<usize>,
    #[serde(default = "defaults::one")]
    pub num_batch_splits: usize,

    pub policy_loss_weight: f32,
    pub value_loss_weight: f32,
    #[serde(default)]
    pub moves_left_loss_weight: Option<f32>,
    #[serde(default = "defaults::value_cat_loss_weight")]
    pub value_cat_loss_weight: f32,
    #[serde(default = "defaults::reg_term_weight")]
    pub reg_term_weight: f32,
    #[serde(default)]
    pub q_ratio: f32,
    #[serde(default)]
    pub mask_legal_moves: bool,
    #[serde(default = "defaults::accuracy_thresholds")]
    pub accuracy_thresholds: Vec<f32>,

    pub lr_values: Vec<f32>,
    pub lr_boundaries: Vec<usize>,
    #[serde(default)]
    pub warmup_steps: usize,

    pub total_steps: usize,
    pub test_steps: usize,
    pub train_avg_report_steps: usize,
    #[serde(default)]
    pub validation_steps: Option<usize>,
    #[serde(default)]
    pub checkpoint_steps: Option<usize>,

    #[serde(default = "defaults::max_grad_norm")]
    pub max_grad_norm: f32,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "defaults::loss_scale")]
    pub loss_scale: f32,

    #[serde(default)]
    pub swa: bool,
    #[serde(default = "defaults::one")]
    pub swa_steps: usize,
    #[serde(default)]
    pub swa_max_n: usize,

    #[serde(default)]
    pub sparse: bool,

    #[serde(default)]
    pub rmsprop_optimizer: bool,
    #[serde(default, alias = "Nadam_optimizer", alias = "nadam", alias = "Nadam")]
    pub nadam_optimizer: bool,
    #[serde(default)]
    pub lookahead_optimizer: bool,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "defaults::beta_1")]
    pub beta_1: f32,
    #[serde(default = "defaults::beta_2")]
    pub beta_2: f32,
    #[serde(default = "defaults::epsilon")]
    pub epsilon: f32,

    #[serde(default = "defaults::keep_checkpoints")]
    pub keep_checkpoints: usize,
    #[serde(default = "defaults::keep_checkpoint_every_n_hours")]
    pub keep_checkpoint_every_n_hours: f64,
}

impl TrainingConfig {
    pub fn validation_steps(&self) -> usize {
        self.validation_steps.unwrap_or(self.total_steps)
    }

    /// Loss multiplier guarding reduced-precision gradients.
    pub fn active_loss_scale(&self) -> f32 {
        match self.precision {
            Precision::Single => 1.0,
            Precision::Half => self.loss_scale,
        }
    }

    pub fn test_batches(&self) -> usize {
        self.num_test_positions.map_or(1, |n| (n / self.batch_size).max(1))
    }

    fn validate(&mut self, model: &ModelConfig) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        self.lr_boundaries.sort_unstable();

        if self.lr_values.len() != self.lr_boundaries.len() + 1 {
            return fail(format!(
                "expected {} lr_values for {} lr_boundaries, got {}",
                self.lr_boundaries.len() + 1,
                self.lr_boundaries.len(),
                self.lr_values.len()
            ));
        }

        for (name, value) in [
            ("total_steps", self.total_steps),
            ("test_steps", self.test_steps),
            ("train_avg_report_steps", self.train_avg_report_steps),
            ("validation_steps", self.validation_steps()),
            ("swa_steps", self.swa_steps),
            ("num_batch_splits", self.num_batch_splits),
            ("batch_size", self.batch_size),
            ("checkpoint_steps", self.checkpoint_steps.unwrap_or(1)),
        ] {
            if value == 0 {
                return fail(format!("{name} must be positive"));
            }
        }

        if self.batch_size % self.num_batch_splits != 0 {
            return fail(format!(
                "batch_size ({}) must be a multiple of num_batch_splits ({})",
                self.batch_size, self.num_batch_splits
            ));
        }

        if !(0.0..=1.0).contains(&self.q_ratio) {
            return fail(format!("q_ratio must lie in [0, 1], got {}", self.q_ratio));
        }

        if model.has_moves_left() && self.moves_left_loss_weight.is_none() {
            return fail("moves_left_loss_weight is required with a moves left head".into());
        }

        if self.rmsprop_optimizer && self.nadam_optimizer {
            return fail("rmsprop_optimizer and nadam_optimizer are mutually exclusive".into());
        }

        if self.weight_decay > 0.0 && !self.nadam_optimizer {
            return fail("decoupled weight_decay is only supported with the nadam optimizer".into());
        }

        if self.precision == Precision::Half && self.loss_scale <= 0.0 {
            return fail("loss_scale must be positive".into());
        }

        if self.keep_checkpoints == 0 {
            return fail("keep_checkpoints must be positive".into());
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub gpu: GpuSpec,
    #[serde(default)]
    pub seed: u64,
    pub training: TrainingConfig,
    pub model: ModelConfig,
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validated()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Checks every cross-field constraint, returning the normalised config.
    pub fn validated(mut self) -> Result<Self> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Config(format!("invalid net name '{}'", self.name)));
        }

        self.gpu.ordinals()?;
        self.model.validate()?;
        self.training.validate(&self.model)?;
        Ok(self)
    }

    pub fn root_dir(&self) -> std::path::PathBuf {
        Path::new(&self.training.path).join(&self.name)
    }

    pub fn display(&self) {
        let m = &self.model;
        let t = &self.training;
        println!("Net Name               : {}", ansi(&self.name, "32;1"));
        println!("Arch                   : {}", ansi(self, 31));
        println!("Value Head             : {}", ansi(format!("{:?}", m.value), 31));
        println!("Moves Left Head        : {}", ansi(format!("{:?}", m.moves_left), 31));
        println!("Input Type             : {}", ansi(format!("{:?}", m.input_type), 31));
        println!("Batch Size             : {}", ansi(t.batch_size, 31));
        println!("Batch Splits           : {}", ansi(t.num_batch_splits, 31));
        println!("Total Steps            : {}", ansi(t.total_steps, 31));
        println!("LR Values              : {}", ansi(format!("{:?}", t.lr_values), 31));
        println!("LR Boundaries          : {}", ansi(format!("{:?}", t.lr_boundaries), 31));
        println!("Warmup Steps           : {}", ansi(t.warmup_steps, 31));
        println!("Optimiser              : {}", ansi(self.optimiser_name(), 31));
        println!("SWA                    : {}", ansi(t.swa, 31));
        println!("Output Path            : {}", ansi(self.root_dir().display(), "32;1"));
    }

    fn optimiser_name(&self) -> String {
        let t = &self.training;
        let base = if t.rmsprop_optimizer {
            "rmsprop"
        } else if t.nadam_optimizer && t.weight_decay > 0.0 {
            "nadamw"
        } else if t.nadam_optimizer {
            "nadam"
        } else {
            "sgd-nesterov"
        };

        if t.lookahead_optimizer {
            format!("lookahead({base})")
        } else {
            base.to_string()
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.model;
        write!(
            f,
            "112 -> {} x{} (heads {}, dff {}{}) -> policy 1858 / value {}",
            m.embedding_size,
            m.encoder_layers,
            m.encoder_heads,
            m.encoder_dff(),
            if m.use_smolgen { ", smolgen" } else { "" },
            if m.wdl() { "wdl" } else { "scalar" },
        )
    }
}

mod defaults {
    use crate::nn::activation::Activation;

    pub fn one() -> usize {
        1
    }

    pub fn yes() -> bool {
        true
    }

    pub fn value_embedding_size() -> usize {
        32
    }

    pub fn moves_left_embedding_size() -> usize {
        8
    }

    pub fn value_buckets() -> usize {
        100
    }

    pub fn value_cat_loss_weight() -> f32 {
        0.01
    }

    pub fn reg_term_weight() -> f32 {
        1.0
    }

    pub fn accuracy_thresholds() -> Vec<f32> {
        vec![1.0, 2.0, 5.0, 10.0]
    }

    pub fn max_grad_norm() -> f32 {
        10000.0
    }

    pub fn loss_scale() -> f32 {
        128.0
    }

    pub fn beta_1() -> f32 {
        0.9
    }

    pub fn beta_2() -> f32 {
        0.999
    }

    pub fn epsilon() -> f32 {
        1e-7
    }

    pub fn keep_checkpoints() -> usize {
        50
    }

    pub fn keep_checkpoint_every_n_hours() -> f64 {
        24.0
    }
}
