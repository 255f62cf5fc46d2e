use candle_core::{Module, Result as CandleResult, Tensor, D};

use super::{
    activation::Activation,
    layers::{Dense, DenseSpec, LayerNorm},
    params::ParamStore,
};
use crate::{
    error::Result,
    rng::{Init, WeightRng},
};

/// Sizes shared by every block of one encoder stack.
#[derive(Clone, Copy, Debug)]
pub struct EncoderShape {
    pub embedding: usize,
    pub d_model: usize,
    pub heads: usize,
    pub dff: usize,
    pub layers: usize,
}

impl EncoderShape {
    /// Residual branch scale, `(2L)^-1/4`.
    pub fn alpha(&self) -> f64 {
        (2.0 * self.layers as f64).powf(-0.25)
    }

    /// Initialiser gain for value and feed-forward kernels, `(8L)^-1/4`.
    pub fn beta(&self) -> f64 {
        (8.0 * self.layers as f64).powf(-0.25)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SmolgenShape {
    pub hidden_channels: usize,
    pub hidden_sz: usize,
    pub gen_sz: usize,
    pub activation: Option<Activation>,
}

/// Generates per-head additive attention logits from the whole position.
pub struct Smolgen {
    compress: Dense,
    hidden: Dense,
    hidden_ln: LayerNorm,
    gen_from: Dense,
    gen_ln: LayerNorm,
    heads: usize,
    gen_sz: usize,
}

impl Smolgen {
    /// The `gen_sz -> 64x64` projection shared by every block.
    pub fn weight_gen(store: &mut ParamStore, rng: &mut WeightRng, gen_sz: usize) -> Result<Dense> {
        Dense::new(store, rng, "smol_weight_gen", gen_sz, 64 * 64, DenseSpec::new(Init::GLOROT_UNIFORM).no_bias())
    }

    fn new(store: &mut ParamStore, rng: &mut WeightRng, name: &str, emb: usize, heads: usize, s: SmolgenShape) -> Result<Self> {
        let uniform = DenseSpec::new(Init::GLOROT_UNIFORM);
        let activated = DenseSpec { activation: s.activation, ..uniform };
        let hc = s.hidden_channels;
        Ok(Self {
            compress: Dense::new(store, rng, &format!("{name}/compress"), emb, hc, uniform.no_bias())?,
            hidden: Dense::new(store, rng, &format!("{name}/hidden1_dense"), 64 * hc, s.hidden_sz, activated)?,
            hidden_ln: LayerNorm::new(store, &format!("{name}/hidden1_ln"), s.hidden_sz)?,
            gen_from: Dense::new(store, rng, &format!("{name}/gen_from"), s.hidden_sz, heads * s.gen_sz, activated)?,
            gen_ln: LayerNorm::new(store, &format!("{name}/gen_from_ln"), heads * s.gen_sz)?,
            heads,
            gen_sz: s.gen_sz,
        })
    }

    /// `[B, 64, emb] -> [B, heads, 64, 64]`
    fn forward(&self, xs: &Tensor, weight_gen: &Dense) -> CandleResult<Tensor> {
        let batch = xs.dim(0)?;
        let compressed = self.compress.forward(xs)?.reshape((batch, ()))?;
        let hidden = self.hidden_ln.forward(&self.hidden.forward(&compressed)?)?;
        let gen_from = self.gen_ln.forward(&self.gen_from.forward(&hidden)?)?;
        let gen_from = gen_from.reshape((batch, self.heads, self.gen_sz))?;
        weight_gen.forward(&gen_from)?.reshape((batch, self.heads, 64, 64))
    }
}

struct MultiHeadAttention {
    wq: Dense,
    wk: Dense,
    wv: Dense,
    dense_fin: Dense,
    smolgen: Option<Smolgen>,
    heads: usize,
    depth: usize,
}

impl MultiHeadAttention {
    fn new(
        store: &mut ParamStore,
        rng: &mut WeightRng,
        name: &str,
        shape: EncoderShape,
        smolgen: Option<SmolgenShape>,
    ) -> Result<Self> {
        let xavier = DenseSpec::new(Init::Normal(shape.beta() as f32));
        let (emb, d) = (shape.embedding, shape.d_model);
        let smolgen = match smolgen {
            Some(s) => Some(Smolgen::new(store, rng, &format!("{name}/smolgen"), emb, shape.heads, s)?),
            None => None,
        };

        Ok(Self {
            wq: Dense::new(store, rng, &format!("{name}/wq"), emb, d, DenseSpec::glorot())?,
            wk: Dense::new(store, rng, &format!("{name}/wk"), emb, d, DenseSpec::glorot())?,
            wv: Dense::new(store, rng, &format!("{name}/wv"), emb, d, xavier)?,
            dense_fin: Dense::new(store, rng, &format!("{name}/dense_fin"), d, emb, xavier)?,
            smolgen,
            heads: shape.heads,
            depth: d / shape.heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let batch = xs.dim(0)?;
        xs.reshape((batch, 64, self.heads, self.depth))?.transpose(1, 2)?.contiguous()
    }

    fn forward(&self, xs: &Tensor, weight_gen: Option<&Dense>) -> CandleResult<Tensor> {
        let batch = xs.dim(0)?;
        let q = self.split_heads(&self.wq.forward(xs)?)?;
        let k = self.split_heads(&self.wk.forward(xs)?)?;
        let v = self.split_heads(&self.wv.forward(xs)?)?;

        let mut logits = (q.matmul(&k.t()?.contiguous()?)? / (self.depth as f64).sqrt())?;

        if let (Some(smolgen), Some(weight_gen)) = (&self.smolgen, weight_gen) {
            logits = (logits + smolgen.forward(xs, weight_gen)?)?;
        }

        let weights = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let out = weights.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((batch, 64, ()))?;
        self.dense_fin.forward(&out)
    }
}

struct FeedForward {
    dense1: Dense,
    dense2: Dense,
}

impl FeedForward {
    fn new(
        store: &mut ParamStore,
        rng: &mut WeightRng,
        name: &str,
        emb: usize,
        dff: usize,
        init: Init,
        activation: Activation,
    ) -> Result<Self> {
        let spec = DenseSpec::new(init);
        Ok(Self {
            dense1: Dense::new(store, rng, &format!("{name}/dense1"), emb, dff, spec.activation(activation))?,
            dense2: Dense::new(store, rng, &format!("{name}/dense2"), dff, emb, spec)?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        self.dense2.forward(&self.dense1.forward(xs)?)
    }
}

/// One post-norm transformer block with DeepNorm residual scaling.
pub struct EncoderBlock {
    mha: MultiHeadAttention,
    norm1: LayerNorm,
    ffn: FeedForward,
    norm2: LayerNorm,
    major: Option<(FeedForward, LayerNorm)>,
    alpha: f64,
    dropout: f32,
}

impl EncoderBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &mut ParamStore,
        rng: &mut WeightRng,
        name: &str,
        shape: EncoderShape,
        smolgen: Option<SmolgenShape>,
        ffn_activation: Activation,
        major_ffn: bool,
        dropout: f32,
    ) -> Result<Self> {
        let init = Init::Normal(shape.beta() as f32);
        let emb = shape.embedding;

        let mha = MultiHeadAttention::new(store, rng, &format!("{name}/mha"), shape, smolgen)?;
        let norm1 = LayerNorm::new(store, &format!("{name}/norm1"), emb)?;
        let ffn = FeedForward::new(store, rng, &format!("{name}/ffn"), emb, shape.dff, init, ffn_activation)?;
        let norm2 = LayerNorm::new(store, &format!("{name}/norm2"), emb)?;

        let major = if major_ffn {
            let ffn = FeedForward::new(store, rng, &format!("{name}/major_ffn"), emb, 4 * shape.dff, init, ffn_activation)?;
            Some((ffn, LayerNorm::new(store, &format!("{name}/norm3"), emb)?))
        } else {
            None
        };

        Ok(Self { mha, norm1, ffn, norm2, major, alpha: shape.alpha(), dropout })
    }

    fn dropout(&self, xs: Tensor, train: bool) -> CandleResult<Tensor> {
        if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&xs, self.dropout)
        } else {
            Ok(xs)
        }
    }

    /// `xs` is `[B, 64, emb]`, `major_mask` is `[B, 64, 1]`.
    pub fn forward(&self, xs: &Tensor, major_mask: &Tensor, weight_gen: Option<&Dense>, train: bool) -> CandleResult<Tensor> {
        let attn = self.dropout(self.mha.forward(xs, weight_gen)?, train)?;
        let out1 = self.norm1.forward(&(xs + (attn * self.alpha)?)?)?;

        let ffn = self.dropout(self.ffn.forward(&out1)?, train)?;
        let out2 = self.norm2.forward(&(&out1 + (ffn * self.alpha)?)?)?;

        match &self.major {
            Some((major_ffn, norm3)) => {
                let gated = major_ffn.forward(&out1)?.broadcast_mul(major_mask)?;
                norm3.forward(&(out2 + (gated * self.alpha)?)?)
            }
            None => Ok(out2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn shape() -> EncoderShape {
        EncoderShape { embedding: 16, d_model: 16, heads: 4, dff: 24, layers: 2 }
    }

    #[test]
    fn deepnorm_factors() {
        let s = shape();
        assert!((s.alpha() - 4f64.powf(-0.25)).abs() < 1e-12);
        assert!((s.beta() - 16f64.powf(-0.25)).abs() < 1e-12);
    }

    #[test]
    fn block_preserves_shape_and_names() {
        let dev = Device::Cpu;
        let mut store = ParamStore::new(&dev);
        let mut rng = WeightRng::seeded(1);
        let smolgen = SmolgenShape { hidden_channels: 4, hidden_sz: 32, gen_sz: 8, activation: Some(Activation::Swish) };
        let gen = Smolgen::weight_gen(&mut store, &mut rng, 8).unwrap();
        let block =
            EncoderBlock::new(&mut store, &mut rng, "encoder_1", shape(), Some(smolgen), Activation::Relu, true, 0.0).unwrap();

        for name in ["encoder_1/mha/wq/kernel", "encoder_1/mha/smolgen/compress/kernel", "encoder_1/norm3/gamma"] {
            assert!(store.get(name).is_some(), "{name}");
        }
        assert!(store.get("encoder_1/mha/smolgen/compress/bias").is_none());

        let xs = Tensor::randn(0f32, 1.0, (2, 64, 16), &dev).unwrap();
        let mask = Tensor::ones((2, 64, 1), DType::F32, &dev).unwrap();
        let ys = block.forward(&xs, &mask, Some(&gen), true).unwrap();
        assert_eq!(ys.dims(), &[2, 64, 16]);
    }

    #[test]
    fn gradients_reach_smolgen() {
        let dev = Device::Cpu;
        let mut store = ParamStore::new(&dev);
        let mut rng = WeightRng::seeded(2);
        let smolgen = SmolgenShape { hidden_channels: 2, hidden_sz: 8, gen_sz: 4, activation: Some(Activation::Swish) };
        let gen = Smolgen::weight_gen(&mut store, &mut rng, 4).unwrap();
        let block =
            EncoderBlock::new(&mut store, &mut rng, "encoder_1", shape(), Some(smolgen), Activation::Mish, false, 0.0).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (1, 64, 16), &dev).unwrap();
        let mask = Tensor::ones((1, 64, 1), DType::F32, &dev).unwrap();
        let ys = block.forward(&xs, &mask, Some(&gen), false).unwrap();
        let weights = Tensor::randn(0f32, 1.0, (1, 64, 16), &dev).unwrap();
        let grads = (ys * weights).unwrap().sum_all().unwrap().backward().unwrap();

        let gen_kernel = store.get("smol_weight_gen/kernel").unwrap();
        let grad = grads.get(gen_kernel.var.as_tensor()).expect("smolgen gradient");
        assert!(grad.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() > 0.0);
    }
}
