/// Running mean of one scalar statistic over a reporting window.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub short_name: String,
    pub long_name: String,
    pub suffix: String,
    value: f32,
    count: usize,
}

impl Metric {
    pub fn new(short_name: &str, long_name: &str) -> Self {
        Self::with_suffix(short_name, long_name, "")
    }

    pub fn with_suffix(short_name: &str, long_name: &str, suffix: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            long_name: long_name.to_string(),
            suffix: suffix.to_string(),
            value: 0.0,
            count: 0,
        }
    }

    pub fn assign(&mut self, value: f32) {
        self.value = value;
        self.count = 1;
    }

    pub fn accumulate(&mut self, value: f32) {
        if self.count > 0 {
            self.value += value;
            self.count += 1;
        } else {
            self.assign(value);
        }
    }

    /// Folds another window of the same statistic into this one.
    pub fn merge(&mut self, other: &Self) {
        assert_eq!(self.short_name, other.short_name, "Cannot merge different metrics!");
        self.value += other.value;
        self.count += other.count;
    }

    pub fn get(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            self.value / self.count as f32
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.count = 0;
    }
}

fn thresholded(thresholds: &[f32]) -> impl Iterator<Item = Metric> + '_ {
    thresholds.iter().map(|t| {
        let t = crate::logger::fmt_g(*t);
        Metric::new(&format!("P@{t}%"), &format!("Thresholded Policy Accuracy @ {t}"))
    })
}

/// Statistics reported during training, in the order produced by a training micro-step.
pub fn train_metrics(thresholds: &[f32]) -> Vec<Metric> {
    let mut metrics = vec![
        Metric::new("P", "Policy Loss"),
        Metric::new("V", "Value Loss"),
        Metric::new("ML", "Moves Left Loss"),
        Metric::new("Reg", "Reg term"),
        Metric::new("Total", "Total Loss"),
        Metric::new("V MSE", "MSE Loss"),
        Metric::with_suffix("P Acc", "Policy Accuracy", "%"),
        Metric::with_suffix("V Acc", "Value Accuracy", "%"),
        Metric::new("P Entropy", "Policy Entropy"),
        Metric::new("P UL", "Policy UL"),
        Metric::new("P SL", "Policy SL"),
        Metric::new("P RL", "Policy RL"),
        Metric::new("V CL", "Value CL"),
        Metric::with_suffix("V C Acc", "Value C Acc", "%"),
    ];
    metrics.extend(thresholded(thresholds));
    metrics
}

/// Statistics reported by test and validation passes.
pub fn test_metrics(thresholds: &[f32]) -> Vec<Metric> {
    let mut metrics = vec![
        Metric::new("P", "Policy Loss"),
        Metric::new("V", "Value Loss"),
        Metric::new("ML", "Moves Left Loss"),
        Metric::new("V MSE", "MSE Loss"),
        Metric::with_suffix("P Acc", "Policy Accuracy", "%"),
        Metric::with_suffix("V Acc", "Value Accuracy", "%"),
        Metric::new("ML Mean", "Moves Left Mean Error"),
        Metric::new("P Entropy", "Policy Entropy"),
        Metric::new("P UL", "Policy UL"),
        Metric::new("P SL", "Policy SL"),
        Metric::new("P RL", "Policy RL"),
        Metric::new("V CL", "Value CL"),
        Metric::with_suffix("V C Acc", "Value C Acc", "%"),
    ];
    metrics.extend(thresholded(thresholds));
    metrics
}

/// Accumulates one value per metric, pairing them in order.
pub fn accumulate_all(metrics: &mut [Metric], values: &[f32]) {
    assert_eq!(metrics.len(), values.len(), "Metric count mismatch!");
    for (metric, &value) in metrics.iter_mut().zip(values) {
        metric.accumulate(value);
    }
}

pub fn reset_all(metrics: &mut [Metric]) {
    metrics.iter_mut().for_each(Metric::reset);
}
