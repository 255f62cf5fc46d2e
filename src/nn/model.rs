use candle_core::{DType, Device, Module, Result as CandleResult, Tensor};

use super::{
    encoder::{EncoderBlock, EncoderShape, Smolgen, SmolgenShape},
    layers::{Dense, DenseSpec, Gating},
    params::ParamStore,
    policy_map::AttentionPolicyMap,
};
use crate::{
    config::{Config, ModelConfig, Precision},
    error::Result,
    nn::activation::Activation,
    rng::{Init, WeightRng},
};

pub const INPUT_PLANES: usize = 112;

/// Raw head outputs, always returned as f32.
pub struct ModelOutputs {
    /// `[B, 1858]` logits.
    pub policy: Tensor,
    /// `[B, 3]` WDL logits or `[B, 1]` tanh value.
    pub value: Tensor,
    /// `[B, 1]`, absent without a moves left head.
    pub moves_left: Option<Tensor>,
    /// `[B, value_buckets]` logits.
    pub value_cat: Tensor,
}

struct PolicyHead {
    embedding: Dense,
    wq: Dense,
    wk: Dense,
    ppo: Dense,
    d_model: usize,
}

impl PolicyHead {
    fn new(store: &mut ParamStore, rng: &mut WeightRng, cfg: &ModelConfig) -> Result<Self> {
        let (emb, pol_emb, d) = (cfg.embedding_size, cfg.policy_embedding_size(), cfg.policy_d_model());
        let act = cfg.default_activation;
        Ok(Self {
            embedding: Dense::new(store, rng, "policy/embedding", emb, pol_emb, DenseSpec::glorot().activation(act).regularised())?,
            wq: Dense::new(store, rng, "policy/attention/wq", pol_emb, d, DenseSpec::glorot())?,
            wk: Dense::new(store, rng, "policy/attention/wk", pol_emb, d, DenseSpec::glorot())?,
            ppo: Dense::new(store, rng, "policy/attention/ppo", d, 4, DenseSpec::glorot().no_bias())?,
            d_model: d,
        })
    }

    /// `([B, 64, 64], [B, 8, 24])` square and promotion logits.
    fn forward(&self, flow: &Tensor) -> CandleResult<(Tensor, Tensor)> {
        let batch = flow.dim(0)?;
        let dk = (self.d_model as f64).sqrt();

        let tokens = self.embedding.forward(flow)?;
        let queries = self.wq.forward(&tokens)?;
        let keys = self.wk.forward(&tokens)?;
        let qk = queries.matmul(&keys.t()?.contiguous()?)?;

        // keys of the promotion rank give one knight offset plus three deltas per file
        let promotion_keys = keys.narrow(1, 56, 8)?;
        let ppo = (self.ppo.forward(&promotion_keys)?.transpose(1, 2)?.contiguous()? * dk)?;
        let offsets = ppo.narrow(1, 0, 3)?.broadcast_add(&ppo.narrow(1, 3, 1)?)?;

        let knight = qk.narrow(1, 48, 8)?.narrow(2, 56, 8)?;
        let promos = (0..3)
            .map(|piece| knight.broadcast_add(&offsets.narrow(1, piece, 1)?)?.unsqueeze(3))
            .collect::<CandleResult<Vec<_>>>()?;
        let promos = (Tensor::cat(&promos, 3)?.reshape((batch, 8, 24))? / dk)?;

        Ok(((qk / dk)?, promos))
    }
}

struct ValueHead {
    embedding: Dense,
    dense1: Dense,
    dense2: Dense,
    categorical: Dense,
}

impl ValueHead {
    fn new(store: &mut ParamStore, rng: &mut WeightRng, cfg: &ModelConfig) -> Result<Self> {
        let act = cfg.default_activation;
        let emb = cfg.value_embedding_size;
        let reg = DenseSpec::glorot().regularised();

        let dense2 = if cfg.wdl() {
            Dense::new(store, rng, "value/dense2", 128, 3, reg.regularised_bias())?
        } else {
            Dense::new(store, rng, "value/dense2", 128, 1, reg.activation(Activation::Tanh))?
        };

        Ok(Self {
            embedding: Dense::new(store, rng, "value/embedding", cfg.embedding_size, emb, reg.activation(act))?,
            dense1: Dense::new(store, rng, "value/dense1", 64 * emb, 128, reg.activation(act))?,
            dense2,
            categorical: Dense::new(store, rng, "value_categorical", 128, cfg.value_buckets, DenseSpec::glorot())?,
        })
    }

    fn forward(&self, flow: &Tensor) -> CandleResult<(Tensor, Tensor)> {
        let batch = flow.dim(0)?;
        let embedded = self.embedding.forward(flow)?.reshape((batch, ()))?;
        let hidden = self.dense1.forward(&embedded)?;
        Ok((self.dense2.forward(&hidden)?, self.categorical.forward(&hidden)?))
    }
}

struct MovesLeftHead {
    embedding: Dense,
    dense1: Dense,
    dense2: Dense,
}

impl MovesLeftHead {
    fn new(store: &mut ParamStore, rng: &mut WeightRng, cfg: &ModelConfig) -> Result<Self> {
        let act = cfg.default_activation;
        let emb = cfg.moves_left_embedding_size;
        let reg = DenseSpec::glorot().regularised();
        Ok(Self {
            embedding: Dense::new(store, rng, "moves_left/embedding", cfg.embedding_size, emb, reg.activation(act))?,
            dense1: Dense::new(store, rng, "moves_left/dense1", 64 * emb, 128, reg.activation(act))?,
            dense2: Dense::new(store, rng, "moves_left/dense2", 128, 1, reg.activation(Activation::Relu))?,
        })
    }
}

impl Module for MovesLeftHead {
    fn forward(&self, flow: &Tensor) -> CandleResult<Tensor> {
        let batch = flow.dim(0)?;
        let embedded = self.embedding.forward(flow)?.reshape((batch, ()))?;
        self.dense2.forward(&self.dense1.forward(&embedded)?)
    }
}

/// The attention body network with policy, value, categorical value and moves left heads.
pub struct Network {
    store: ParamStore,
    embedding: Dense,
    gating: Gating,
    encoders: Vec<EncoderBlock>,
    weight_gen: Option<Dense>,
    policy: PolicyHead,
    value: ValueHead,
    moves_left: Option<MovesLeftHead>,
    policy_map: AttentionPolicyMap,
    major_pieces: Tensor,
    compute_dtype: DType,
}

impl Network {
    /// Builds a freshly initialised network on `device`, seeded from the config.
    pub fn build(config: &Config, device: &Device) -> Result<Self> {
        let cfg = &config.model;
        let mut store = ParamStore::new(device);
        let mut rng = WeightRng::seeded(config.seed);
        let emb = cfg.embedding_size;

        let embedding = Dense::new(
            &mut store,
            &mut rng,
            "embedding",
            INPUT_PLANES,
            emb,
            DenseSpec::glorot().activation(cfg.default_activation).regularised(),
        )?;
        let gating = Gating::new(&mut store, "embedding", 64, emb)?;

        let smolgen = cfg.smolgen().map(|(hidden_channels, hidden_sz, gen_sz)| SmolgenShape {
            hidden_channels,
            hidden_sz,
            gen_sz,
            activation: cfg.smolgen_activation,
        });
        let weight_gen = match smolgen {
            Some(s) => Some(Smolgen::weight_gen(&mut store, &mut rng, s.gen_sz)?),
            None => None,
        };

        let shape = EncoderShape {
            embedding: emb,
            d_model: cfg.encoder_d_model(),
            heads: cfg.encoder_heads,
            dff: cfg.encoder_dff(),
            layers: cfg.encoder_layers,
        };
        let encoders = (0..cfg.encoder_layers)
            .map(|i| {
                EncoderBlock::new(
                    &mut store,
                    &mut rng,
                    &format!("encoder_{}", i + 1),
                    shape,
                    smolgen,
                    cfg.ffn_activation(),
                    cfg.major_ffn,
                    cfg.dropout_rate,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let policy = PolicyHead::new(&mut store, &mut rng, cfg)?;
        let value = ValueHead::new(&mut store, &mut rng, cfg)?;
        let moves_left =
            if cfg.has_moves_left() { Some(MovesLeftHead::new(&mut store, &mut rng, cfg)?) } else { None };

        // white then black piece planes: pawn, knight, bishop, rook, queen, king
        let major = [0f32, 1., 1., 1., 1., 1., 0., 1., 1., 1., 1., 1.];
        let major_pieces = Tensor::from_slice(&major, (12, 1), device)?;

        let compute_dtype = match config.training.precision {
            Precision::Single => DType::F32,
            Precision::Half => DType::F16,
        };

        Ok(Self {
            store,
            embedding,
            gating,
            encoders,
            weight_gen,
            policy,
            value,
            moves_left,
            policy_map: AttentionPolicyMap::new(device)?,
            major_pieces,
            compute_dtype,
        })
    }

    pub fn params(&self) -> &ParamStore {
        &self.store
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    /// Sum of the L2 penalties declared by the regularised layers.
    pub fn regularisation(&self) -> Result<Tensor> {
        self.store.l2_penalty()
    }

    /// `planes` is `[B, 112, 8, 8]`. Dropout is only active when `train` is set.
    pub fn forward(&self, planes: &Tensor, train: bool) -> Result<ModelOutputs> {
        let batch = planes.dim(0)?;
        let squares = planes.permute((0, 2, 3, 1))?.reshape((batch, 64, INPUT_PLANES))?;

        let pieces = squares.narrow(2, 0, 12)?.reshape((batch * 64, 12))?;
        let major_mask = pieces.matmul(&self.major_pieces)?.reshape((batch, 64, 1))?.to_dtype(self.compute_dtype)?;

        let squares = squares.to_dtype(self.compute_dtype)?;
        let mut flow = self.gating.forward(&self.embedding.forward(&squares)?)?;

        for encoder in &self.encoders {
            flow = encoder.forward(&flow, &major_mask, self.weight_gen.as_ref(), train)?;
        }

        let (square_logits, promotion_logits) = self.policy.forward(&flow)?;
        let policy = self.policy_map.apply(&square_logits, &promotion_logits)?;
        let (value, value_cat) = self.value.forward(&flow)?;
        let moves_left = match &self.moves_left {
            Some(head) => Some(head.forward(&flow)?.to_dtype(DType::F32)?),
            None => None,
        };

        Ok(ModelOutputs {
            policy: policy.to_dtype(DType::F32)?,
            value: value.to_dtype(DType::F32)?,
            moves_left,
            value_cat: value_cat.to_dtype(DType::F32)?,
        })
    }

    /// Names of the encoder dense kernels subject to structured sparsity.
    pub fn sparsity_targets(&self) -> Vec<String> {
        self.store
            .iter()
            .filter(|p| p.name.starts_with("encoder_") && p.name.ends_with("/kernel") && !p.name.contains("smolgen"))
            .map(|p| p.name.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{config::tests::SMALL, nn::policy_map::POLICY_OUTPUTS};

    pub fn small_network(extra: &str) -> Network {
        let yaml = SMALL.replace("value_buckets: 8", &format!("value_buckets: 8\n{extra}"));
        let config = Config::from_yaml_str(&yaml).unwrap();
        Network::build(&config, &Device::Cpu).unwrap()
    }

    fn planes(batch: usize) -> Tensor {
        Tensor::rand(0f32, 1.0, (batch, INPUT_PLANES, 8, 8), &Device::Cpu).unwrap().round().unwrap()
    }

    #[test]
    fn output_shapes() {
        let net = small_network("");
        let out = net.forward(&planes(3), false).unwrap();
        assert_eq!(out.policy.dims(), &[3, POLICY_OUTPUTS]);
        assert_eq!(out.value.dims(), &[3, 3]);
        assert_eq!(out.value_cat.dims(), &[3, 8]);
        assert_eq!(out.moves_left.unwrap().dims(), &[3, 1]);
    }

    #[test]
    fn scalar_value_without_moves_left() {
        let net = small_network("    value: classical\n    moves_left: none");
        let out = net.forward(&planes(2), false).unwrap();
        assert_eq!(out.value.dims(), &[2, 1]);
        assert!(out.moves_left.is_none());
        assert!(net.params().get("moves_left/dense1/kernel").is_none());

        let values = out.value.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn smolgen_and_sparsity_targets() {
        let net = small_network(
            "    use_smolgen: true\n    smolgen_hidden_channels: 4\n    smolgen_hidden_sz: 16\n    smolgen_gen_sz: 8",
        );
        assert!(net.params().get("smol_weight_gen/kernel").is_some());
        let targets = net.sparsity_targets();
        assert!(targets.contains(&"encoder_1/mha/wq/kernel".to_string()));
        assert!(targets.contains(&"encoder_1/major_ffn/dense2/kernel".to_string()));
        assert!(targets.iter().all(|t| !t.contains("smolgen")));
        assert_eq!(net.forward(&planes(1), true).unwrap().policy.dims(), &[1, POLICY_OUTPUTS]);
    }

    #[test]
    fn same_seed_same_weights() {
        let a = small_network("");
        let b = small_network("");
        for (x, y) in a.params().iter().zip(b.params().iter()) {
            assert_eq!(x.name, y.name);
            assert_eq!(x.values().unwrap(), y.values().unwrap());
        }
    }

    #[test]
    fn half_precision_forward() {
        let yaml = SMALL.replace("lr_values", "precision: half\n    lr_values");
        let config = Config::from_yaml_str(&yaml).unwrap();
        let net = Network::build(&config, &Device::Cpu).unwrap();
        let out = net.forward(&planes(2), false).unwrap();
        assert_eq!(out.policy.dtype(), DType::F32);
        assert_eq!(net.params().iter().next().unwrap().var.dtype(), DType::F32);
    }
}
