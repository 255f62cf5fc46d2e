use std::thread;

use candle_core::{DType, Device, Tensor};

use super::{
    loss::{LossConfig, LossTerms},
    optimiser::{self, Optimiser},
};
use crate::{
    config::Config,
    data::Batch,
    error::{Error, Result},
    nn::Network,
};

/// Gradients of one replica for one shard, plus its train metric values.
struct ShardOutcome {
    grads: Vec<Tensor>,
    metrics: Vec<f32>,
}

fn forward_backward(network: &Network, loss: &LossConfig, shard: &Batch, loss_scale: f32) -> Result<ShardOutcome> {
    let batch = shard.to_device(network.device())?;
    let outputs = network.forward(&batch.planes, true)?;
    let reg = network.regularisation()?;
    let terms = LossTerms::compute(loss, &batch, &outputs, &reg)?;

    let scaled = (&terms.total * f64::from(loss_scale))?;
    let store = scaled.backward()?;

    let grads = network
        .params()
        .iter()
        .map(|p| match store.get(p.var.as_tensor()) {
            Some(g) => Ok(g.to_dtype(DType::F32)?),
            None => Ok(p.var.as_detached_tensor().zeros_like()?),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ShardOutcome { grads, metrics: terms.train_values()? })
}

fn add_all(acc: Vec<Tensor>, other: &[Tensor], device: &Device) -> Result<Vec<Tensor>> {
    acc.into_iter().zip(other).map(|(a, b)| Ok((a + b.to_device(device)?)?)).collect()
}

/// Runs forward and backward passes across batch splits and replicas, then
/// clips and applies one optimiser step.
///
/// Split gradients are summed and replica gradients are all-reduced by sum.
/// The learning rate is divided by `splits * replicas`, which makes the
/// applied update the mean gradient over every position in the step.
pub struct GradientPipeline {
    replicas: Vec<Network>,
    optimiser: Box<dyn Optimiser>,
    loss: LossConfig,
    loss_scale: f32,
    max_grad_norm: f32,
    pending: Option<Vec<Tensor>>,
    pending_splits: usize,
}

impl GradientPipeline {
    pub fn new(config: &Config, replicas: Vec<Network>) -> Result<Self> {
        let primary = replicas.first().ok_or_else(|| Error::Config("at least one replica is required".into()))?;

        if config.training.batch_size % (replicas.len() * config.training.num_batch_splits) != 0 {
            return Err(Error::Config(format!(
                "batch_size ({}) must divide evenly across {} splits and {} replicas",
                config.training.batch_size,
                config.training.num_batch_splits,
                replicas.len()
            )));
        }

        for replica in &replicas[1..] {
            replica.params().copy_from(primary.params())?;
        }

        let optimiser = optimiser::from_config(&config.training, primary.params())?;

        Ok(Self {
            optimiser,
            loss: LossConfig::new(config),
            loss_scale: config.training.active_loss_scale(),
            max_grad_norm: config.training.max_grad_norm,
            replicas,
            pending: None,
            pending_splits: 0,
        })
    }

    /// The replica that owns the authoritative weights.
    pub fn network(&self) -> &Network {
        &self.replicas[0]
    }

    pub fn replicas(&self) -> &[Network] {
        &self.replicas
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn optimiser(&self) -> &dyn Optimiser {
        self.optimiser.as_ref()
    }

    pub fn optimiser_mut(&mut self) -> &mut dyn Optimiser {
        self.optimiser.as_mut()
    }

    pub fn loss_config(&self) -> &LossConfig {
        &self.loss
    }

    /// Splits times replicas, the divisor of the learning rate.
    pub fn effective_splits(&self, splits: usize) -> usize {
        splits * self.replicas.len()
    }

    /// Forward and backward for one split, adding its gradients to the pending sum.
    /// Returns the split's train metrics, averaged over replicas.
    pub fn accumulate(&mut self, batch: &Batch) -> Result<Vec<f32>> {
        let shards = batch.shard(self.replicas.len())?;
        let (loss, scale) = (&self.loss, self.loss_scale);

        let outcomes = if self.replicas.len() == 1 {
            vec![forward_backward(&self.replicas[0], loss, &shards[0], scale)?]
        } else {
            thread::scope(|s| {
                let handles = self
                    .replicas
                    .iter()
                    .zip(&shards)
                    .map(|(network, shard)| s.spawn(move || forward_backward(network, loss, shard, scale)))
                    .collect::<Vec<_>>();

                handles
                    .into_iter()
                    .enumerate()
                    .map(|(i, h)| h.join().map_err(|_| Error::Replica(i))?)
                    .collect::<Result<Vec<_>>>()
            })?
        };

        let device = self.replicas[0].device().clone();
        let mut metrics = vec![0.0; outcomes[0].metrics.len()];
        let mut grads = self.pending.take();

        for outcome in &outcomes {
            for (m, v) in metrics.iter_mut().zip(&outcome.metrics) {
                *m += v / outcomes.len() as f32;
            }

            grads = Some(match grads {
                Some(acc) => add_all(acc, &outcome.grads, &device)?,
                None => outcome.grads.iter().map(|g| g.to_device(&device)).collect::<candle_core::Result<Vec<_>>>()?,
            });
        }

        self.pending = grads;
        self.pending_splits += 1;
        Ok(metrics)
    }

    /// Unscales and clips the pending gradients, applies the optimiser and
    /// broadcasts the new weights. Returns the global norm before clipping.
    pub fn apply(&mut self, learning_rate: f32) -> Result<f32> {
        let grads = self.pending.take().ok_or_else(|| Error::Config("no gradients accumulated".into()))?;
        let effective = self.effective_splits(self.pending_splits);
        self.pending_splits = 0;

        let grads = if self.loss_scale != 1.0 {
            grads.into_iter().map(|g| g / f64::from(self.loss_scale)).collect::<candle_core::Result<Vec<_>>>()?
        } else {
            grads
        };

        let (grads, norm) = clip_by_global_norm(grads, self.max_grad_norm * effective as f32)?;

        let primary = self.replicas[0].params();
        self.optimiser.update(primary, &grads, learning_rate / effective as f32)?;
        primary.apply_constraints()?;

        for replica in &self.replicas[1..] {
            replica.params().copy_from(primary)?;
        }

        Ok(norm)
    }

    /// Copies the primary replica's weights to the others after an external change.
    pub fn broadcast(&self) -> Result<()> {
        for replica in &self.replicas[1..] {
            replica.params().copy_from(self.replicas[0].params())?;
        }

        Ok(())
    }

    /// Test metric values for one batch, in inference mode on the primary replica.
    pub fn evaluate(&self, batch: &Batch) -> Result<Vec<f32>> {
        let network = self.network();
        let batch = batch.to_device(network.device())?;
        let outputs = network.forward(&batch.planes, false)?;
        let reg = network.regularisation()?.detach();
        Ok(LossTerms::compute(&self.loss, &batch, &outputs, &reg)?.test_values()?)
    }
}

/// Rescales `grads` so their joint L2 norm is at most `max_norm`.
pub fn clip_by_global_norm(grads: Vec<Tensor>, max_norm: f32) -> Result<(Vec<Tensor>, f32)> {
    let mut sum_sq = 0f32;
    for g in &grads {
        sum_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
    }

    let norm = sum_sq.sqrt();
    if norm <= max_norm || !norm.is_finite() {
        return Ok((grads, norm));
    }

    let scale = f64::from(max_norm / norm);
    let clipped = grads.into_iter().map(|g| g * scale).collect::<candle_core::Result<Vec<_>>>()?;
    Ok((clipped, norm))
}
