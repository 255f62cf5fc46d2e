pub mod gradient;
pub mod loss;
pub mod metric;
pub mod optimiser;
pub mod save;
pub mod schedule;
pub mod sparsity;
pub mod summary;
pub mod swa;
pub mod weights;

use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use candle_core::Tensor;

use crate::{
    config::Config,
    data::{BatchSource, ValidationSet},
    error::{Error, Result},
    logger::{self, ansi, num_cs},
    nn::{Network, ParamStore},
};
use gradient::GradientPipeline;
use metric::Metric;
use save::{CheckpointManager, CheckpointState};
use schedule::{lr_schedule, Cadence, LrScheduler, PiecewiseLR, Warmup};
use sparsity::Sparsity;
use summary::SummaryWriter;
use swa::SwaManager;

const UPDATE_RATIO_BINS: usize = 1000;
const WEIGHT_BINS: usize = 100;

/// Stand-in for ratios that have no logarithm.
const LOG_RATIO_SENTINEL: f32 = 200.0;

/// Where the trainer writes summaries and looks for the pause marker.
#[derive(Clone, Debug)]
pub struct TrainerPaths {
    pub logs: PathBuf,
    pub stop_file: PathBuf,
}

impl Default for TrainerPaths {
    fn default() -> Self {
        Self { logs: PathBuf::from("leelalogs"), stop_file: PathBuf::from("stop") }
    }
}

struct Writers {
    train: SummaryWriter,
    test: SummaryWriter,
    validation: SummaryWriter,
    swa_test: Option<SummaryWriter>,
    swa_validation: Option<SummaryWriter>,
}

impl Writers {
    fn new(logs: &Path, name: &str, swa: bool) -> Result<Self> {
        let swa_writer = |suffix: &str| if swa { SummaryWriter::for_run(logs, name, suffix).map(Some) } else { Ok(None) };
        Ok(Self {
            train: SummaryWriter::for_run(logs, name, "train")?,
            test: SummaryWriter::for_run(logs, name, "test")?,
            validation: SummaryWriter::for_run(logs, name, "validation")?,
            swa_test: swa_writer("swa-test")?,
            swa_validation: swa_writer("swa-validation")?,
        })
    }
}

/// Owns the global step and drives training, evaluation and persistence on their cadences.
pub struct Trainer {
    config: Config,
    pipeline: GradientPipeline,
    lr: Warmup<PiecewiseLR>,
    cadence: Cadence,
    swa: Option<SwaManager>,
    sparsity: Option<Sparsity>,
    checkpoints: CheckpointManager,
    train_metrics: Vec<Metric>,
    writers: Writers,
    paths: TrainerPaths,
    global_step: usize,
    prev_lr: f32,
    report_timer: Instant,
    steps_since_report: usize,
}

impl Trainer {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_paths(config, TrainerPaths::default())
    }

    pub fn with_paths(config: Config, paths: TrainerPaths) -> Result<Self> {
        let devices = config.gpu.devices()?;
        let replicas = devices.iter().map(|device| Network::build(&config, device)).collect::<Result<Vec<_>>>()?;
        Self::from_replicas(config, replicas, paths)
    }

    /// Wraps prebuilt replicas, the first of which holds the authoritative weights.
    pub fn from_replicas(config: Config, replicas: Vec<Network>, paths: TrainerPaths) -> Result<Self> {
        let t = &config.training;
        let pipeline = GradientPipeline::new(&config, replicas)?;
        let primary = pipeline.network();

        let swa = if t.swa { Some(SwaManager::new(primary.params(), t.swa_max_n)?) } else { None };
        let sparsity = t.sparse.then(|| Sparsity::new(primary.sparsity_targets()));
        let checkpoints = CheckpointManager::new(
            config.root_dir().join("checkpoints"),
            &config.name,
            t.keep_checkpoints,
            t.keep_checkpoint_every_n_hours,
        )?;
        let writers = Writers::new(&paths.logs, &config.name, t.swa)?;
        let lr = lr_schedule(t);

        Ok(Self {
            cadence: Cadence::new(t),
            train_metrics: metric::train_metrics(&t.accuracy_thresholds),
            prev_lr: lr.lr(0),
            lr,
            pipeline,
            swa,
            sparsity,
            checkpoints,
            writers,
            paths,
            global_step: 0,
            report_timer: Instant::now(),
            steps_since_report: 0,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn network(&self) -> &Network {
        self.pipeline.network()
    }

    pub fn pipeline(&self) -> &GradientPipeline {
        &self.pipeline
    }

    pub fn swa(&self) -> Option<&SwaManager> {
        self.swa.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn params(&self) -> &ParamStore {
        self.pipeline.network().params()
    }

    /// Loads the most recent checkpoint, if there is one. Returns whether anything was restored.
    pub fn restore(&mut self) -> Result<bool> {
        let Some(dir) = self.checkpoints.latest() else {
            return Ok(false);
        };

        let loaded = CheckpointManager::load(&dir, self.params().device())?;
        self.params().load_named_tensors(&loaded.model)?;
        self.pipeline.optimiser_mut().load_state_tensors(&loaded.optimiser)?;

        match (&mut self.swa, &loaded.swa) {
            (Some(swa), Some(map)) => swa.load_named_tensors(map, loaded.meta.swa_count)?,
            (Some(swa), None) => {
                tracing::warn!(path = %dir.display(), "checkpoint has no swa weights, restarting the average");
                swa.reset();
            }
            _ => {}
        }

        self.pipeline.broadcast()?;
        self.global_step = loaded.meta.global_step;
        self.prev_lr = self.lr.lr(self.global_step);

        tracing::info!(path = %dir.display(), step = self.global_step, "restored checkpoint");
        Ok(true)
    }

    /// Replaces the live weights with an inference export, restarting the weight average.
    pub fn replace_weights(&mut self, dir: &Path, ignore_errors: bool) -> Result<()> {
        weights::replace_weights(dir, &self.config.model, self.pipeline.network().params(), ignore_errors)?;

        if let Some(swa) = &mut self.swa {
            swa.reset();
            swa.update(self.pipeline.network().params())?;
        }

        self.pipeline.broadcast()
    }

    fn test_batches(&self) -> usize {
        let batches = self.config.training.test_batches();
        if self.swa.is_some() {
            (batches / 2).max(1)
        } else {
            batches
        }
    }

    fn split_batch_size(&self) -> usize {
        self.config.training.batch_size / self.config.training.num_batch_splits
    }

    fn display(&self) {
        if self.network().device().is_cpu() {
            println!("{}", ansi("========== WARNING ==========", 31));
            println!("This backend is not currently");
            println!("   intended to be used for   ");
            println!("  serious training, you may  ");
            println!("  have meant to enable the   ");
            println!("      `cuda` feature.        ");
            println!("{}", ansi("=============================", 31));
        }

        print!("{}", logger::esc());
        println!("{}", ansi("Beginning Training", "34;1"));
        self.config.display();
        println!("LR Scheduler           : {}", self.lr.colourful());
        self.cadence.display();
        println!("Replicas               : {}", ansi(self.pipeline.num_replicas(), 31));
        println!("Weights                : {}", ansi(self.params().num_weights(), 31));
        println!("Start Step             : {}", ansi(self.global_step, 31));
    }

    /// Trains until the end of the current run of `total_steps`.
    pub fn process_loop(
        &mut self,
        train: &mut dyn BatchSource,
        test: &mut dyn BatchSource,
        mut validation: Option<&mut dyn ValidationSet>,
    ) -> Result<()> {
        let (batch_size, total_steps) = (self.config.training.batch_size, self.config.training.total_steps);
        if let Some(virtual_batch_size) = self.config.model.virtual_batch_size {
            if batch_size % virtual_batch_size != 0 {
                return Err(Error::Config(format!(
                    "batch_size ({batch_size}) must be a multiple of virtual_batch_size ({virtual_batch_size})"
                )));
            }
        }

        self.display();

        // one past the current step so a resumed run does not collide with the last run's final entry
        if self.cadence.is_run_start(self.global_step) {
            let step = self.global_step + 1;
            self.calculate_test_summaries(test, step)?;
            self.calculate_swa_summaries(test, step)?;
        }

        let steps = total_steps - self.global_step % total_steps;
        self.report_timer = Instant::now();
        self.steps_since_report = 0;

        for _ in 0..steps {
            self.wait_while_stopped();
            self.process(train, test, validation.as_mut().map(|v| &mut **v as &mut dyn ValidationSet))?;
        }

        Ok(())
    }

    fn wait_while_stopped(&self) {
        if !self.paths.stop_file.exists() {
            return;
        }

        tracing::info!(path = %self.paths.stop_file.display(), "stop file found, pausing");
        while self.paths.stop_file.exists() {
            thread::sleep(Duration::from_secs(1));
        }
        tracing::info!("stop file removed, resuming");
    }

    /// One optimiser step followed by whatever the cadence asks for at the new step.
    pub fn process(
        &mut self,
        train: &mut dyn BatchSource,
        test: &mut dyn BatchSource,
        validation: Option<&mut dyn ValidationSet>,
    ) -> Result<()> {
        let lr = self.lr.lr(self.global_step);
        if lr != self.prev_lr {
            println!("LR Dropped to {}", ansi(logger::fmt_g(lr), num_cs()));
        }
        self.prev_lr = lr;

        let reporting = self.cadence.should_report(self.global_step + 1);
        let before = if reporting { Some(self.params().snapshot()?) } else { None };

        let grad_norm = self.train_step(train, lr)?;
        let step = self.global_step;

        if reporting {
            self.report(step, lr, grad_norm, before.as_deref())?;
        }

        if self.cadence.should_update_swa(step) {
            if let Some(swa) = &mut self.swa {
                swa.update(self.pipeline.network().params())?;
            }
        }

        if self.cadence.should_test(step) {
            self.calculate_test_summaries(test, step)?;
            self.calculate_swa_summaries(test, step)?;
        }

        if let Some(validation) = validation {
            if self.cadence.should_validate(step) {
                self.calculate_validation(validation)?;
            }
        }

        if self.cadence.should_checkpoint(step) {
            self.save(lr)?;
        }

        Ok(())
    }

    /// Accumulates every batch split, applies the step and advances the global step.
    /// Returns the gradient norm before clipping.
    pub fn train_step(&mut self, train: &mut dyn BatchSource, lr: f32) -> Result<f32> {
        let splits = self.config.training.num_batch_splits;
        let split_size = self.split_batch_size();

        for split in 0..splits {
            let batch = train.next_batch(split_size)?;
            let values = self.pipeline.accumulate(&batch)?;
            metric::accumulate_all(&mut self.train_metrics, &values);
            logger::report_progress(self.global_step, self.config.training.total_steps, split + 1, splits);
        }

        let norm = self.pipeline.apply(lr)?;

        if let Some(sparsity) = &mut self.sparsity {
            sparsity.apply(self.pipeline.network().params())?;
            self.pipeline.broadcast()?;
        }

        self.global_step += 1;
        self.steps_since_report += 1;
        Ok(norm)
    }

    fn report(&mut self, step: usize, lr: f32, grad_norm: f32, before: Option<&[Tensor]>) -> Result<()> {
        let elapsed = self.report_timer.elapsed().as_secs_f32().max(f32::EPSILON);
        let positions = self.steps_since_report * self.config.training.batch_size;
        let effective = self.pipeline.effective_splits(self.config.training.num_batch_splits);

        println!();
        logger::report_train_step(step, lr, &self.train_metrics, positions as f32 / elapsed);

        let writer = &mut self.writers.train;
        writer.scalar(step, "LR", lr)?;
        writer.scalar(step, "Gradient norm", grad_norm / effective as f32)?;
        writer.metrics(step, &self.train_metrics)?;

        if let Some(before) = before {
            let ratios = update_ratios(before, self.pipeline.network().params())?;
            for (name, ratio) in &ratios {
                writer.scalar(step, &format!("update_ratios/{name}"), *ratio)?;
            }
            let logs = ratios.iter().map(|(_, r)| log_ratio(*r)).collect::<Vec<_>>();
            writer.histogram(step, "update_ratios_log10", &logs, UPDATE_RATIO_BINS)?;
        }
        writer.flush()?;

        metric::reset_all(&mut self.train_metrics);
        self.report_timer = Instant::now();
        self.steps_since_report = 0;
        Ok(())
    }

    fn test_pass(&self, test: &mut dyn BatchSource) -> Result<Vec<Metric>> {
        let mut metrics = metric::test_metrics(&self.config.training.accuracy_thresholds);
        for _ in 0..self.test_batches() {
            let batch = test.next_batch(self.split_batch_size())?;
            metric::accumulate_all(&mut metrics, &self.pipeline.evaluate(&batch)?);
        }
        Ok(metrics)
    }

    fn validation_pass(&self, validation: &mut dyn ValidationSet) -> Result<Vec<Metric>> {
        let mut metrics = metric::test_metrics(&self.config.training.accuracy_thresholds);
        validation.map_batches(self.split_batch_size(), &mut |batch| {
            metric::accumulate_all(&mut metrics, &self.pipeline.evaluate(&batch)?);
            Ok(())
        })?;
        Ok(metrics)
    }

    /// Test metrics over `test_batches` batches, with a histogram of every weight, logged at `step`.
    pub fn calculate_test_summaries(&mut self, test: &mut dyn BatchSource, step: usize) -> Result<Vec<Metric>> {
        let metrics = self.test_pass(test)?;

        let params = self.pipeline.network().params();
        let writer = &mut self.writers.test;
        writer.metrics(step, &metrics)?;
        for param in params.iter() {
            writer.histogram(step, &param.name, &param.values()?, WEIGHT_BINS)?;
        }
        writer.flush()?;

        logger::report_test("", step, ",", &metrics);
        Ok(metrics)
    }

    /// The same test pass with the averaged weights swapped in. Nothing without SWA.
    pub fn calculate_swa_summaries(&mut self, test: &mut dyn BatchSource, step: usize) -> Result<Option<Vec<Metric>>> {
        let Some(swa) = &self.swa else { return Ok(None) };

        let metrics = swa.with_swapped(self.params(), || self.test_pass(test))?;

        if let Some(writer) = &mut self.writers.swa_test {
            writer.metrics(step, &metrics)?;
            writer.flush()?;
        }

        logger::report_test("swa ", step, ",", &metrics);
        Ok(Some(metrics))
    }

    /// A full pass over the validation set, then again with the averaged weights if enabled.
    pub fn calculate_validation(&mut self, validation: &mut dyn ValidationSet) -> Result<Vec<Metric>> {
        let step = self.global_step;

        let metrics = self.validation_pass(validation)?;
        self.writers.validation.metrics(step, &metrics)?;
        self.writers.validation.flush()?;
        logger::report_test("", step, ", validation:", &metrics);

        if let Some(swa) = &self.swa {
            let swa_metrics = swa.with_swapped(self.params(), || self.validation_pass(validation))?;
            if let Some(writer) = &mut self.writers.swa_validation {
                writer.metrics(step, &swa_metrics)?;
                writer.flush()?;
            }
            logger::report_test("swa ", step, ", validation:", &swa_metrics);
        }

        Ok(metrics)
    }

    /// Writes a checkpoint plus inference exports of the live and averaged weights.
    pub fn save(&mut self, lr: f32) -> Result<()> {
        let step = self.global_step;
        let params = self.pipeline.network().params();

        let state = CheckpointState { step, lr, params, optimiser: self.pipeline.optimiser(), swa: self.swa.as_ref() };
        self.checkpoints.save(&state)?;

        let root = self.config.root_dir();
        let name = &self.config.name;
        save::export_network(&root.join(format!("{name}-{step}")), &self.config.model, params, step)?;

        if let Some(swa) = &self.swa {
            let dir = root.join(format!("{name}-swa-{step}"));
            swa.with_swapped(params, || save::export_network(&dir, &self.config.model, params, step))?;
        }

        Ok(())
    }
}

/// `|w_after - w_before| / |w_before|` per weight, or -1 for a zero weight.
/// Moving statistics are not trained and are skipped.
pub fn update_ratios(before: &[Tensor], params: &ParamStore) -> Result<Vec<(String, f32)>> {
    let norm = |t: &Tensor| -> Result<f32> { Ok(t.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt()) };

    let mut ratios = Vec::new();
    for (param, old) in params.iter().zip(before) {
        if param.name.contains("moving") {
            continue;
        }

        let weight_norm = norm(old)?;
        let ratio = if weight_norm == 0.0 {
            -1.0
        } else {
            let delta = (param.var.as_tensor() - old)?;
            norm(&delta)? / weight_norm
        };
        ratios.push((param.name.clone(), ratio));
    }

    Ok(ratios)
}

/// `log10(ratio)`, with the sentinel for ratios that have no logarithm.
pub fn log_ratio(ratio: f32) -> f32 {
    if ratio > 0.0 {
        ratio.log10()
    } else {
        LOG_RATIO_SENTINEL
    }
}
