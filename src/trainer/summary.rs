use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{error::Result, trainer::metric::Metric};

const EVENTS_FILE: &str = "events.csv";

/// Appends scalar and histogram rows to `{dir}/events.csv`.
pub struct SummaryWriter {
    dir: PathBuf,
    out: BufWriter<File>,
}

impl SummaryWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new().create(true).append(true).open(dir.join(EVENTS_FILE))?;
        Ok(Self { dir, out: BufWriter::new(file) })
    }

    /// Writers for `{root}/{name}-{suffix}`, the layout of the run's log directory.
    pub fn for_run(root: &Path, name: &str, suffix: &str) -> Result<Self> {
        Self::new(root.join(format!("{name}-{suffix}")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scalar(&mut self, step: usize, tag: &str, value: f32) -> Result<()> {
        writeln!(self.out, "{step},{tag},{value}")?;
        Ok(())
    }

    pub fn metrics(&mut self, step: usize, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            self.scalar(step, &metric.long_name, metric.get())?;
        }
        Ok(())
    }

    /// `bins` equal-width buckets between the minimum and maximum value.
    pub fn histogram(&mut self, step: usize, tag: &str, values: &[f32], bins: usize) -> Result<()> {
        let hist = Histogram::new(values, bins);
        write!(self.out, "{step},{tag},{},{},{},{}", hist.min, hist.max, hist.mean, values.len())?;
        for count in hist.counts {
            write!(self.out, ",{count}")?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct Histogram {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn new(values: &[f32], bins: usize) -> Self {
        if values.is_empty() || bins == 0 {
            return Self { min: 0.0, max: 0.0, mean: 0.0, counts: vec![0; bins] };
        }

        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = values.iter().sum::<f32>() / values.len() as f32;

        let mut counts = vec![0; bins];
        let width = (max - min) / bins as f32;
        for &v in values {
            let bucket = if width > 0.0 { ((v - min) / width) as usize } else { 0 };
            counts[bucket.min(bins - 1)] += 1;
        }

        Self { min, max, mean, counts }
    }
}
