//! Loss and diagnostic terms for one micro-batch.
//!
//! Every function is pure: configuration arrives as explicit arguments and
//! the result is a scalar tensor (or a tuple of tensors for `correct_policy`).

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

use crate::{config::Config, data::TensorBatch, nn::ModelOutputs};

/// Logit given to illegal moves when masking.
pub const ILLEGAL_LOGIT: f32 = -1.0e10;
pub const MOVES_LEFT_SCALE: f64 = 20.0;
pub const MOVES_LEFT_HUBER_DELTA: f64 = 10.0 / MOVES_LEFT_SCALE;
pub const SEARCH_EPSILON: f64 = 0.003;

/// Masks illegal output logits (optionally) and clips negative target entries to zero.
pub fn correct_policy(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<(Tensor, Tensor)> {
    let output = if mask_legal_moves {
        let legal = target.ge(0f32)?;
        let illegal = Tensor::full(ILLEGAL_LOGIT, output.shape(), output.device())?;
        legal.where_cond(output, &illegal)?
    } else {
        output.clone()
    };

    Ok((target.relu()?, output))
}

fn cross_entropy_rows(target: &Tensor, logits: &Tensor) -> Result<Tensor> {
    (target * log_softmax(logits, D::Minus1)?)?.sum(D::Minus1)?.neg()
}

/// `x * log(x)` with `0 * log(0) = 0`.
fn xlogx(x: &Tensor) -> Result<Tensor> {
    x * x.maximum(f32::MIN_POSITIVE)?.log()?
}

fn argmax_match(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    a.argmax(D::Minus1)?.eq(&b.argmax(D::Minus1)?)?.to_dtype(DType::F32)?.mean_all()
}

fn best_move_probability(target: &Tensor, output: &Tensor) -> Result<Tensor> {
    let best = target.argmax_keepdim(D::Minus1)?;
    softmax(output, D::Minus1)?.gather(&best, D::Minus1)?.squeeze(D::Minus1)
}

/// Blended value target `z * (1 - q_ratio) + q * q_ratio`.
pub fn q_mix(outcome: &Tensor, q: &Tensor, q_ratio: f32) -> Result<Tensor> {
    let q_ratio = f64::from(q_ratio);
    (outcome * (1.0 - q_ratio))? + (q * q_ratio)?
}

pub fn policy_loss(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<Tensor> {
    let (target, output) = correct_policy(target, output, mask_legal_moves)?;
    cross_entropy_rows(&target, &output)?.mean_all()
}

/// Cross entropy minus the target's own entropy. Reported only.
pub fn reducible_policy_loss(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<Tensor> {
    let (target, output) = correct_policy(target, output, mask_legal_moves)?;
    let entropy = xlogx(&target)?.sum(D::Minus1)?.neg()?;
    (cross_entropy_rows(&target, &output)? - entropy)?.mean_all()
}

pub fn policy_accuracy(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<Tensor> {
    let (target, output) = correct_policy(target, output, mask_legal_moves)?;
    argmax_match(&target, &output)
}

pub fn policy_entropy(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<Tensor> {
    let (_, output) = correct_policy(target, output, mask_legal_moves)?;
    let probs = softmax(&output, D::Minus1)?;
    xlogx(&probs)?.sum(D::Minus1)?.mean_all()?.neg()
}

/// Cross entropy against a uniform distribution over the legal moves.
pub fn policy_uniform_loss(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<Tensor> {
    let legal = target.ge(0f32)?.to_dtype(DType::F32)?;
    let uniform = legal.broadcast_div(&legal.sum_keepdim(D::Minus1)?)?;
    let (_, output) = correct_policy(target, output, mask_legal_moves)?;
    cross_entropy_rows(&uniform, &output)?.mean_all()
}

/// Expected search cost, `mean(1 / (p_best + eps))`.
pub fn policy_search_loss(target: &Tensor, output: &Tensor, mask_legal_moves: bool) -> Result<Tensor> {
    let (target, output) = correct_policy(target, output, mask_legal_moves)?;
    (best_move_probability(&target, &output)? + SEARCH_EPSILON)?.recip()?.mean_all()
}

/// Fraction of positions whose best move gets more than `t`% of the policy, per threshold.
pub fn policy_thresholded_accuracy(
    target: &Tensor,
    output: &Tensor,
    mask_legal_moves: bool,
    thresholds: &[f32],
) -> Result<Vec<Tensor>> {
    let (target, output) = correct_policy(target, output, mask_legal_moves)?;
    let best = best_move_probability(&target, &output)?;
    thresholds.iter().map(|&t| best.gt(t / 100.0)?.to_dtype(DType::F32)?.mean_all()).collect()
}

/// WDL cross entropy against the blended target.
pub fn value_loss(target: &Tensor, output: &Tensor) -> Result<Tensor> {
    cross_entropy_rows(target, output)?.mean_all()
}

/// Win minus loss.
fn scalar_projection(wdl: &Tensor) -> Result<Tensor> {
    wdl.narrow(1, 0, 1)? - wdl.narrow(1, 2, 1)?
}

/// Squared error between the scalar target and the scalar prediction, which
/// is projected from the softmax in WDL mode.
pub fn value_mse(target: &Tensor, output: &Tensor, wdl: bool) -> Result<Tensor> {
    let prediction = if wdl { scalar_projection(&softmax(output, D::Minus1)?)? } else { output.clone() };
    (scalar_projection(target)? - prediction)?.sqr()?.mean_all()
}

pub fn value_accuracy(target: &Tensor, output: &Tensor) -> Result<Tensor> {
    argmax_match(target, output)
}

/// Bucket of `win + draw / 2` among `buckets` equal bins on [0, 1].
pub fn value_buckets(target: &Tensor, buckets: usize) -> Result<Tensor> {
    let score = (target.narrow(1, 0, 1)? + (target.narrow(1, 1, 1)? * 0.5)?)?;
    (score * buckets as f64)?.floor()?.clamp(0f32, (buckets - 1) as f32)?.to_dtype(DType::U32)
}

pub fn value_categorical_loss(buckets: &Tensor, output: &Tensor) -> Result<Tensor> {
    log_softmax(output, D::Minus1)?.gather(buckets, D::Minus1)?.mean_all()?.neg()
}

pub fn value_categorical_accuracy(buckets: &Tensor, output: &Tensor) -> Result<Tensor> {
    output.argmax_keepdim(D::Minus1)?.eq(buckets)?.to_dtype(DType::F32)?.mean_all()
}

/// Huber loss on targets and outputs scaled down by `MOVES_LEFT_SCALE`.
pub fn moves_left_loss(target: &Tensor, output: &Tensor) -> Result<Tensor> {
    let error = ((output - target)? / MOVES_LEFT_SCALE)?.abs()?;
    let quadratic = error.minimum(MOVES_LEFT_HUBER_DELTA as f32)?;
    let linear = (error - &quadratic)?;
    ((quadratic.sqr()? * 0.5)? + (linear * MOVES_LEFT_HUBER_DELTA)?)?.mean_all()
}

pub fn moves_left_mean_error(target: &Tensor, output: &Tensor) -> Result<Tensor> {
    (target - output)?.abs()?.mean_all()
}

/// Loss weights and options, fixed for the run.
#[derive(Clone, Debug)]
pub struct LossConfig {
    pub policy_weight: f32,
    pub value_weight: f32,
    pub moves_left_weight: f32,
    pub reg_weight: f32,
    pub value_cat_weight: f32,
    pub q_ratio: f32,
    pub mask_legal_moves: bool,
    pub wdl: bool,
    pub value_buckets: usize,
    pub accuracy_thresholds: Vec<f32>,
}

impl LossConfig {
    pub fn new(config: &Config) -> Self {
        let t = &config.training;
        Self {
            policy_weight: t.policy_loss_weight,
            value_weight: t.value_loss_weight,
            moves_left_weight: t.moves_left_loss_weight.unwrap_or(0.0),
            reg_weight: t.reg_term_weight,
            value_cat_weight: t.value_cat_loss_weight,
            q_ratio: t.q_ratio,
            mask_legal_moves: t.mask_legal_moves,
            wdl: config.model.wdl(),
            value_buckets: config.model.value_buckets,
            accuracy_thresholds: t.accuracy_thresholds.clone(),
        }
    }
}

/// Every term for one micro-batch. Only `total` carries gradients that are used.
pub struct LossTerms {
    pub policy: Tensor,
    pub value: Tensor,
    pub moves_left: Tensor,
    pub reg: Tensor,
    pub total: Tensor,
    pub mse: Tensor,
    pub policy_accuracy: Tensor,
    pub value_accuracy: Tensor,
    pub moves_left_mean: Tensor,
    pub policy_entropy: Tensor,
    pub policy_uniform: Tensor,
    pub policy_search: Tensor,
    pub policy_reducible: Tensor,
    pub value_cat: Tensor,
    pub value_cat_accuracy: Tensor,
    pub thresholded: Vec<Tensor>,
}

impl LossTerms {
    pub fn compute(cfg: &LossConfig, batch: &TensorBatch, out: &ModelOutputs, reg: &Tensor) -> Result<Self> {
        let device = out.policy.device();
        let zero = Tensor::zeros((), DType::F32, device)?;
        let mask = cfg.mask_legal_moves;
        let policy_target = &batch.policy;
        let value_target = q_mix(&batch.outcome, &batch.q, cfg.q_ratio)?;

        let policy = policy_loss(policy_target, &out.policy, mask)?;
        let mse = value_mse(&value_target, &out.value, cfg.wdl)?;
        let (value, value_grad_term, value_accuracy) = if cfg.wdl {
            let value = value_loss(&value_target, &out.value)?;
            (value.clone(), value, self::value_accuracy(&value_target, &out.value)?)
        } else {
            (zero.clone(), mse.clone(), zero.clone())
        };

        let (moves_left, moves_left_mean) = match &out.moves_left {
            Some(ml) => (moves_left_loss(&batch.moves_left, ml)?, moves_left_mean_error(&batch.moves_left, ml)?),
            None => (zero.clone(), zero.clone()),
        };

        let buckets = value_buckets(&value_target, cfg.value_buckets)?;
        let value_cat = value_categorical_loss(&buckets, &out.value_cat)?;

        let total = ((&policy * f64::from(cfg.policy_weight))?
            + (&value_grad_term * f64::from(cfg.value_weight))?
            + (&moves_left * f64::from(cfg.moves_left_weight))?
            + (reg * f64::from(cfg.reg_weight))?
            + (&value_cat * f64::from(cfg.value_cat_weight))?)?;

        let policy_out = out.policy.detach();
        Ok(Self {
            policy,
            value,
            moves_left,
            reg: reg.clone(),
            total,
            mse,
            policy_accuracy: self::policy_accuracy(policy_target, &policy_out, mask)?,
            value_accuracy,
            moves_left_mean,
            policy_entropy: self::policy_entropy(policy_target, &policy_out, mask)?,
            policy_uniform: policy_uniform_loss(policy_target, &policy_out, mask)?,
            policy_search: policy_search_loss(policy_target, &policy_out, mask)?,
            policy_reducible: reducible_policy_loss(policy_target, &policy_out, mask)?,
            value_cat_accuracy: value_categorical_accuracy(&buckets, &out.value_cat)?,
            value_cat,
            thresholded: policy_thresholded_accuracy(policy_target, &policy_out, mask, &cfg.accuracy_thresholds)?,
        })
    }

    /// Values in train metric order, MSE quartered and accuracies in percent.
    pub fn train_values(&self) -> Result<Vec<f32>> {
        let mut terms = vec![
            (&self.policy, 1.0),
            (&self.value, 1.0),
            (&self.moves_left, 1.0),
            (&self.reg, 1.0),
            (&self.total, 1.0),
            (&self.mse, 0.25),
            (&self.policy_accuracy, 100.0),
            (&self.value_accuracy, 100.0),
            (&self.policy_entropy, 1.0),
            (&self.policy_uniform, 1.0),
            (&self.policy_search, 1.0),
            (&self.policy_reducible, 1.0),
            (&self.value_cat, 1.0),
            (&self.value_cat_accuracy, 100.0),
        ];
        terms.extend(self.thresholded.iter().map(|t| (t, 100.0)));
        scalars(&terms)
    }

    /// Values in test metric order.
    pub fn test_values(&self) -> Result<Vec<f32>> {
        let mut terms = vec![
            (&self.policy, 1.0),
            (&self.value, 1.0),
            (&self.moves_left, 1.0),
            (&self.mse, 0.25),
            (&self.policy_accuracy, 100.0),
            (&self.value_accuracy, 100.0),
            (&self.moves_left_mean, 1.0),
            (&self.policy_entropy, 1.0),
            (&self.policy_uniform, 1.0),
            (&self.policy_search, 1.0),
            (&self.policy_reducible, 1.0),
            (&self.value_cat, 1.0),
            (&self.value_cat_accuracy, 100.0),
        ];
        terms.extend(self.thresholded.iter().map(|t| (t, 100.0)));
        scalars(&terms)
    }
}

fn scalars(terms: &[(&Tensor, f32)]) -> Result<Vec<f32>> {
    terms.iter().map(|(t, scale)| Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()? * scale)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t2(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        let flat = rows.iter().flat_map(|r| r.iter().copied()).collect::<Vec<_>>();
        Tensor::from_vec(flat, (rows.len(), cols), &Device::Cpu).unwrap()
    }

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn masking_ignores_illegal_logits() {
        let target = t2(&[&[0.7, -1.0, 0.3, -1.0]]);
        let a = t2(&[&[1.0, 5.0, 0.5, -3.0]]);
        let b = t2(&[&[1.0, -40.0, 0.5, 80.0]]);

        let la = scalar(policy_loss(&target, &a, true).unwrap());
        let lb = scalar(policy_loss(&target, &b, true).unwrap());
        assert!((la - lb).abs() < 1e-6);

        let ua = scalar(policy_loss(&target, &a, false).unwrap());
        let ub = scalar(policy_loss(&target, &b, false).unwrap());
        assert!((ua - ub).abs() > 1e-3);
    }

    #[test]
    fn masked_logits_get_no_gradient() {
        let target = t2(&[&[1.0, -1.0]]);
        let var = candle_core::Var::from_tensor(&t2(&[&[0.2, 0.4]])).unwrap();
        let grads = policy_loss(&target, var.as_tensor(), true).unwrap().backward().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(grad[0][1], 0.0);
        assert!(grad[0][0].abs() < 1e-6);
    }

    #[test]
    fn reducible_loss_is_kl() {
        let target = t2(&[&[0.5, 0.5]]);
        let output = t2(&[&[0.0, 0.0]]);
        assert!(scalar(reducible_policy_loss(&target, &output, false).unwrap()).abs() < 1e-6);
        assert!((scalar(policy_loss(&target, &output, false).unwrap()) - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn policy_diagnostics() {
        let target = t2(&[&[0.0, 1.0, -1.0], &[1.0, 0.0, -1.0]]);
        let output = t2(&[&[0.0, 2.0, 9.0], &[0.0, 2.0, 9.0]]);

        assert_eq!(scalar(policy_accuracy(&target, &output, true).unwrap()), 0.5);
        assert_eq!(scalar(policy_accuracy(&target, &output, false).unwrap()), 0.0);

        let p = 1.0 / (1.0 + (-2f32).exp());
        let sl = scalar(policy_search_loss(&target, &output, true).unwrap());
        let expected = 0.5 * (1.0 / (p + 0.003) + 1.0 / (1.0 - p + 0.003));
        assert!((sl - expected).abs() < 1e-4);

        let acc = policy_thresholded_accuracy(&target, &output, true, &[10.0, 50.0, 95.0]).unwrap();
        let acc = acc.into_iter().map(scalar).collect::<Vec<_>>();
        assert_eq!(acc, vec![1.0, 0.5, 0.0]);

        let ul = scalar(policy_uniform_loss(&target, &t2(&[&[0.0, 0.0, 9.0], &[0.0, 0.0, 9.0]]), true).unwrap());
        assert!((ul - 2f32.ln()).abs() < 1e-5);

        let entropy = scalar(policy_entropy(&target, &t2(&[&[0.0, 0.0, 9.0], &[0.0, 0.0, 9.0]]), true).unwrap());
        assert!((entropy - 2f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn blended_value_target() {
        let z = t2(&[&[1.0, 0.0, 0.0]]);
        let q = t2(&[&[0.0, 0.0, 1.0]]);
        let mix = q_mix(&z, &q, 0.25).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(mix, vec![vec![0.75, 0.0, 0.25]]);
    }

    #[test]
    fn mse_matches_scalar_projection() {
        let target = t2(&[&[0.6, 0.3, 0.1], &[0.0, 0.2, 0.8]]);
        let logits = t2(&[&[1.0, 0.2, -0.5], &[-1.0, 0.0, 0.7]]);

        let probs = softmax(&logits, D::Minus1).unwrap();
        let projected = scalar_projection(&probs).unwrap();

        let from_wdl = scalar(value_mse(&target, &logits, true).unwrap());
        let from_scalar = scalar(value_mse(&target, &projected, false).unwrap());
        assert!((from_wdl - from_scalar).abs() < 1e-6);
    }

    #[test]
    fn buckets_stay_in_range() {
        let target = t2(&[&[0.0, 0.0, 1.0], &[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0], &[0.25, 0.5, 0.25]]);
        let buckets = value_buckets(&target, 32).unwrap().flatten_all().unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(buckets, vec![0, 31, 16, 16]);

        let logits = Tensor::zeros((4, 32), DType::F32, &Device::Cpu).unwrap();
        let loss = scalar(value_categorical_loss(&value_buckets(&target, 32).unwrap(), &logits).unwrap());
        assert!((loss - 32f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn huber_regions() {
        let target = t2(&[&[20.0], &[100.0]]);
        let output = t2(&[&[30.0], &[400.0]]);
        // 0.5 * 0.5^2 and 0.5 * (15 - 0.25)
        let expected = 0.5 * (0.125 + 0.5 * 14.75);
        assert!((scalar(moves_left_loss(&target, &output).unwrap()) - expected).abs() < 1e-5);
        assert_eq!(scalar(moves_left_mean_error(&target, &output).unwrap()), 155.0);
    }
}
