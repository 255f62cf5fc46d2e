use std::fmt::Debug;

use crate::{config::TrainingConfig, logger::ansi};

/// Learning rate scheduling, indexed by global step.
pub trait LrScheduler: Clone + Debug + Send + Sync {
    fn lr(&self, step: usize) -> f32;
    /// A colourful display representation of the learning rate scheduler.
    fn colourful(&self) -> String;
}

/// `values[k]` where `k` is the number of boundaries at or below `step % total_steps`.
#[derive(Clone, Debug)]
pub struct PiecewiseLR {
    pub values: Vec<f32>,
    pub boundaries: Vec<usize>,
    pub total_steps: usize,
}

impl PiecewiseLR {
    pub fn new(values: Vec<f32>, mut boundaries: Vec<usize>, total_steps: usize) -> Self {
        boundaries.sort_unstable();
        Self { values, boundaries, total_steps }
    }
}

impl LrScheduler for PiecewiseLR {
    fn lr(&self, step: usize) -> f32 {
        let within_run = step % self.total_steps;
        let k = self.boundaries.partition_point(|&b| b <= within_run);
        self.values[k.min(self.values.len() - 1)]
    }

    fn colourful(&self) -> String {
        let mut out = format!("piecewise from {}", ansi(self.values[0], 31));
        for (b, v) in self.boundaries.iter().zip(&self.values[1..]) {
            out += &format!(", {} at step {}", ansi(v, 31), ansi(b, 31));
        }
        out
    }
}

/// Linear ramp over the first `warmup_steps` global steps.
#[derive(Clone, Debug)]
pub struct Warmup<LR> {
    pub inner: LR,
    pub warmup_steps: usize,
}

impl<LR: LrScheduler> LrScheduler for Warmup<LR> {
    fn lr(&self, step: usize) -> f32 {
        let lr = self.inner.lr(step);
        if step < self.warmup_steps {
            lr * (step + 1) as f32 / self.warmup_steps as f32
        } else {
            lr
        }
    }

    fn colourful(&self) -> String {
        if self.warmup_steps == 0 {
            self.inner.colourful()
        } else {
            format!("{}, warmup {} steps", self.inner.colourful(), ansi(self.warmup_steps, 31))
        }
    }
}

pub fn lr_schedule(training: &TrainingConfig) -> Warmup<PiecewiseLR> {
    Warmup {
        inner: PiecewiseLR::new(training.lr_values.clone(), training.lr_boundaries.clone(), training.total_steps),
        warmup_steps: training.warmup_steps,
    }
}

/// When each periodic action happens, by global step after the update.
#[derive(Clone, Copy, Debug)]
pub struct Cadence {
    pub total_steps: usize,
    pub test_steps: usize,
    pub report_steps: usize,
    pub validation_steps: usize,
    pub checkpoint_steps: Option<usize>,
    pub swa_steps: Option<usize>,
}

impl Cadence {
    pub fn new(training: &TrainingConfig) -> Self {
        Self {
            total_steps: training.total_steps,
            test_steps: training.test_steps,
            report_steps: training.train_avg_report_steps,
            validation_steps: training.validation_steps(),
            checkpoint_steps: training.checkpoint_steps,
            swa_steps: training.swa.then_some(training.swa_steps),
        }
    }

    fn every(step: usize, period: usize) -> bool {
        step % period == 0
    }

    fn at_end(&self, step: usize) -> bool {
        Self::every(step, self.total_steps)
    }

    /// Run start, measured against the end of the previous run.
    pub fn is_run_start(&self, step: usize) -> bool {
        self.at_end(step)
    }

    pub fn should_report(&self, step: usize) -> bool {
        Self::every(step, self.report_steps) || self.at_end(step)
    }

    pub fn should_update_swa(&self, step: usize) -> bool {
        self.swa_steps.is_some_and(|p| Self::every(step, p))
    }

    pub fn should_test(&self, step: usize) -> bool {
        Self::every(step, self.test_steps) || self.at_end(step)
    }

    pub fn should_validate(&self, step: usize) -> bool {
        Self::every(step, self.validation_steps) || self.at_end(step)
    }

    pub fn should_checkpoint(&self, step: usize) -> bool {
        self.at_end(step) || self.checkpoint_steps.is_some_and(|p| Self::every(step, p))
    }

    pub fn display(&self) {
        println!("Test Every             : {}", ansi(self.test_steps, 31));
        println!("Report Every           : {}", ansi(self.report_steps, 31));
        println!("Validate Every         : {}", ansi(self.validation_steps, 31));
        match self.checkpoint_steps {
            Some(x) => println!("Checkpoint Every       : {}", ansi(x, 31)),
            None => println!("Checkpoint Every       : {}", ansi("end of run", 31)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(warmup_steps: usize) -> Warmup<PiecewiseLR> {
        Warmup { inner: PiecewiseLR::new(vec![0.1, 0.01, 0.001], vec![200, 100], 300), warmup_steps }
    }

    #[test]
    fn piecewise_boundaries() {
        let lr = schedule(0);
        assert_eq!(lr.lr(0), 0.1);
        assert_eq!(lr.lr(99), 0.1);
        assert_eq!(lr.lr(100), 0.01);
        assert_eq!(lr.lr(199), 0.01);
        assert_eq!(lr.lr(200), 0.001);
        assert_eq!(lr.lr(299), 0.001);
        // the schedule restarts with every run of total_steps
        assert_eq!(lr.lr(300), 0.1);
        assert_eq!(lr.lr(450), 0.01);
    }

    #[test]
    fn warmup_uses_absolute_step() {
        let lr = schedule(10);
        assert!((lr.lr(0) - 0.01).abs() < 1e-7);
        assert!((lr.lr(4) - 0.05).abs() < 1e-7);
        assert_eq!(lr.lr(10), 0.1);
        assert_eq!(lr.lr(304), 0.1);
    }

    #[test]
    fn cadence() {
        let c = Cadence {
            total_steps: 100,
            test_steps: 30,
            report_steps: 10,
            validation_steps: 100,
            checkpoint_steps: Some(50),
            swa_steps: Some(5),
        };
        assert!(c.should_test(30) && c.should_test(100) && !c.should_test(40));
        assert!(c.should_report(10) && !c.should_report(15));
        assert!(c.should_checkpoint(50) && c.should_checkpoint(100) && !c.should_checkpoint(60));
        assert!(c.should_validate(200) && !c.should_validate(50));
        assert!(c.should_update_swa(15) && !c.should_update_swa(16));
        assert!(c.is_run_start(0) && c.is_run_start(200) && !c.is_run_start(1));
    }
}
