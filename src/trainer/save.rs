use std::{
    collections::HashMap,
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{optimiser::Optimiser, swa::SwaManager};
use crate::{
    config::ModelConfig,
    error::{Error, Result},
    nn::ParamStore,
};

pub const WEIGHTS_FILE: &str = "weights.bin";
pub const NETWORK_FILE: &str = "network.json";

const MODEL_FILE: &str = "model.safetensors";
const OPTIMISER_FILE: &str = "optimiser.safetensors";
const SWA_FILE: &str = "swa.safetensors";
const META_FILE: &str = "meta.json";
const INDEX_FILE: &str = "checkpoint.json";

/// `id` + newline, the value count as a little-endian u64, then the values as little-endian f32.
pub fn write_to_byte_buffer(values: &[f32], id: &str) -> io::Result<Vec<u8>> {
    if !id.is_ascii() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "IDs may not contain non-ASCII characters!"));
    }

    if id.contains('\n') {
        return Err(io::Error::new(ErrorKind::InvalidInput, "IDs may not contain newlines!"));
    }

    let mut buf = Vec::with_capacity(id.len() + 9 + 4 * values.len());
    buf.write_all(id.as_bytes())?;
    buf.write_all(b"\n")?;
    buf.write_all(&(values.len() as u64).to_le_bytes())?;

    for &val in values {
        buf.write_all(&val.to_le_bytes())?;
    }

    Ok(buf)
}

/// Reads one record, returning it with the number of bytes consumed.
pub fn read_from_byte_buffer(bytes: &[u8]) -> io::Result<(String, Vec<f32>, usize)> {
    let truncated = || io::Error::new(ErrorKind::UnexpectedEof, "truncated weight record");

    let newline = bytes.iter().position(|&b| b == b'\n').ok_or_else(truncated)?;
    let id = String::from_utf8(bytes[..newline].to_vec()).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let mut offset = newline + 1;

    let count: [u8; 8] = bytes.get(offset..offset + 8).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
    offset += 8;

    let end = usize::try_from(u64::from_le_bytes(count))
        .ok()
        .and_then(|count| count.checked_mul(4))
        .and_then(|len| len.checked_add(offset))
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "weight record length overflows"))?;
    let values = bytes
        .get(offset..end)
        .ok_or_else(truncated)?
        .chunks_exact(4)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    Ok((id, values, end))
}

/// Reorders a row-major `[rows, cols]` buffer into `[cols, rows]`.
pub fn transpose_impl(rows: usize, cols: usize, weights: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; weights.len()];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = weights[i * cols + j];
        }
    }
    out
}

/// Header of an inference export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkHeader {
    pub step: usize,
    pub value_softmax: bool,
    pub model: ModelConfig,
}

/// `[h, w, in, out]` to `[out, in, h, w]`.
pub fn conv_kernel_to_export(dims: [usize; 4], weights: &[f32]) -> Vec<f32> {
    let [h, w, inputs, outputs] = dims;
    let mut out = vec![0.0; weights.len()];
    for y in 0..h {
        for x in 0..w {
            for i in 0..inputs {
                for o in 0..outputs {
                    let src = ((y * w + x) * inputs + i) * outputs + o;
                    let dst = ((o * inputs + i) * h + y) * w + x;
                    out[dst] = weights[src];
                }
            }
        }
    }
    out
}

/// Writes `weights.bin` and `network.json` into `dir`.
///
/// Dense kernels go out in `[out, in]` order and convolution kernels in `[out, in, h, w]`.
pub fn export_network(dir: &Path, model: &ModelConfig, params: &ParamStore, step: usize) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let mut buf = Vec::new();
    for param in params.iter() {
        let values = param.values()?;
        let values = match param.shape() {
            [inputs, outputs] => transpose_impl(*inputs, *outputs, &values),
            [h, w, inputs, outputs] => conv_kernel_to_export([*h, *w, *inputs, *outputs], &values),
            _ => values,
        };
        buf.extend_from_slice(&write_to_byte_buffer(&values, &param.name)?);
    }
    fs::write(dir.join(WEIGHTS_FILE), buf)?;

    let header = NetworkHeader { step, value_softmax: model.wdl(), model: model.clone() };
    fs::write(dir.join(NETWORK_FILE), serde_json::to_string_pretty(&header)?)?;

    tracing::info!(path = %dir.display(), step, "exported network");
    Ok(dir.to_path_buf())
}

/// Reads an export back as its header and labelled records, in file order.
pub fn read_export(dir: &Path) -> Result<(NetworkHeader, Vec<(String, Vec<f32>)>)> {
    let header: NetworkHeader = serde_json::from_str(&fs::read_to_string(dir.join(NETWORK_FILE))?)?;
    let bytes = fs::read(dir.join(WEIGHTS_FILE))?;

    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (id, values, read) = read_from_byte_buffer(&bytes[offset..])?;
        records.push((id, values));
        offset += read;
    }

    Ok((header, records))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub global_step: usize,
    pub swa_count: usize,
    pub lr: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntry {
    step: usize,
    dir: String,
    saved_at: DateTime<Utc>,
    preserved: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CheckpointIndex {
    entries: Vec<IndexEntry>,
    last_preserved: DateTime<Utc>,
}

/// Everything a checkpoint captures.
pub struct CheckpointState<'a> {
    pub step: usize,
    pub lr: f32,
    pub params: &'a ParamStore,
    pub optimiser: &'a dyn Optimiser,
    pub swa: Option<&'a SwaManager>,
}

pub struct LoadedCheckpoint {
    pub meta: CheckpointMeta,
    pub model: HashMap<String, Tensor>,
    pub optimiser: HashMap<String, Tensor>,
    pub swa: Option<HashMap<String, Tensor>>,
}

/// Versioned checkpoints under `{root}/{name}-{step}` with bounded retention.
pub struct CheckpointManager {
    root: PathBuf,
    name: String,
    keep: usize,
    keep_every: Duration,
    index: CheckpointIndex,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, name: &str, keep: usize, keep_every_n_hours: f64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            serde_json::from_str(&fs::read_to_string(&index_path)?)?
        } else {
            CheckpointIndex { entries: Vec::new(), last_preserved: Utc::now() }
        };

        let keep_every = Duration::milliseconds((keep_every_n_hours * 3_600_000.0) as i64);
        Ok(Self { root, name: name.to_string(), keep, keep_every, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checkpoint directories still on disk, oldest first.
    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.index.entries.iter().map(|e| self.root.join(&e.dir)).collect()
    }

    pub fn latest(&self) -> Option<PathBuf> {
        self.index.entries.last().map(|e| self.root.join(&e.dir))
    }

    pub fn save(&mut self, state: &CheckpointState<'_>) -> Result<PathBuf> {
        let dir_name = format!("{}-{}", self.name, state.step);
        let dir = self.root.join(&dir_name);
        fs::create_dir_all(&dir)?;

        candle_core::safetensors::save(&state.params.named_tensors()?, dir.join(MODEL_FILE))?;
        candle_core::safetensors::save(&state.optimiser.state_tensors()?, dir.join(OPTIMISER_FILE))?;
        if let Some(swa) = state.swa {
            candle_core::safetensors::save(&swa.named_tensors()?, dir.join(SWA_FILE))?;
        }

        let now = Utc::now();
        let meta = CheckpointMeta {
            global_step: state.step,
            swa_count: state.swa.map_or(0, SwaManager::count),
            lr: state.lr,
            timestamp: now,
        };
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;

        self.index.entries.retain(|e| e.dir != dir_name);
        self.index.entries.push(IndexEntry { step: state.step, dir: dir_name, saved_at: now, preserved: false });
        self.sweep()?;
        self.write_index()?;

        tracing::info!(path = %dir.display(), step = state.step, "saved checkpoint");
        Ok(dir)
    }

    /// Drops the oldest checkpoints beyond `keep`, preserving one per `keep_every` interval.
    fn sweep(&mut self) -> Result<()> {
        loop {
            let recent = self.index.entries.iter().filter(|e| !e.preserved).count();
            if recent <= self.keep {
                return Ok(());
            }

            let Some(pos) = self.index.entries.iter().position(|e| !e.preserved) else {
                return Ok(());
            };

            let entry = &mut self.index.entries[pos];
            if entry.saved_at - self.index.last_preserved >= self.keep_every {
                entry.preserved = true;
                self.index.last_preserved = entry.saved_at;
            } else {
                let entry = self.index.entries.remove(pos);
                let dir = self.root.join(&entry.dir);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                tracing::debug!(path = %dir.display(), "removed old checkpoint");
            }
        }
    }

    fn write_index(&self) -> Result<()> {
        fs::write(self.root.join(INDEX_FILE), serde_json::to_string_pretty(&self.index)?)?;
        Ok(())
    }

    pub fn load(dir: &Path, device: &Device) -> Result<LoadedCheckpoint> {
        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            return Err(Error::checkpoint("missing meta.json", dir));
        }

        let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
        let model = candle_core::safetensors::load(dir.join(MODEL_FILE), device)?;
        let optimiser = candle_core::safetensors::load(dir.join(OPTIMISER_FILE), device)?;
        let swa_path = dir.join(SWA_FILE);
        let swa = if swa_path.exists() { Some(candle_core::safetensors::load(swa_path, device)?) } else { None };

        Ok(LoadedCheckpoint { meta, model, optimiser, swa })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nn::ParamKind,
        trainer::optimiser::{Sgd, SgdParams, WrapOptimiser},
    };

    fn store() -> ParamStore {
        let mut store = ParamStore::new(&Device::Cpu);
        store.add("d/kernel", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], ParamKind::Kernel, true).unwrap();
        store.add("d/bias", vec![0.5, 0.25, 0.125], &[3], ParamKind::Bias, false).unwrap();
        store
    }

    #[test]
    fn byte_buffer_records() {
        let buf = write_to_byte_buffer(&[1.0, -2.5], "a/kernel").unwrap();
        assert_eq!(&buf[..9], b"a/kernel\n");
        assert_eq!(u64::from_le_bytes(buf[9..17].try_into().unwrap()), 2);

        let (id, values, read) = read_from_byte_buffer(&buf).unwrap();
        assert_eq!((id.as_str(), values, read), ("a/kernel", vec![1.0, -2.5], buf.len()));
        assert!(read_from_byte_buffer(&buf[..buf.len() - 1]).is_err());
        assert!(write_to_byte_buffer(&[], "bad\nid").is_err());
    }

    #[test]
    fn oversized_record_count_is_an_error() {
        let mut buf = b"a/kernel\n".to_vec();
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        buf.extend_from_slice(&1.0f32.to_le_bytes());

        let err = read_from_byte_buffer(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let mut buf = b"a/kernel\n".to_vec();
        buf.extend_from_slice(&(u64::MAX / 4 + 1).to_le_bytes());
        assert!(read_from_byte_buffer(&buf).is_err());
    }

    #[test]
    fn transpose_layout() {
        assert_eq!(transpose_impl(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn export_writes_engine_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::Config::from_yaml_str(crate::config::tests::SMALL).unwrap();
        export_network(dir.path(), &cfg.model, &store(), 42).unwrap();

        let (header, records) = read_export(dir.path()).unwrap();
        assert_eq!(header.step, 42);
        assert!(header.value_softmax);
        assert_eq!(records[0], ("d/kernel".to_string(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));
        assert_eq!(records[1].1, vec![0.5, 0.25, 0.125]);
    }

    #[test]
    fn retention_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        let params = store();
        let opt = WrapOptimiser::<Sgd>::new("sgd", &params, &SgdParams::default()).unwrap();
        let mut manager = CheckpointManager::new(dir.path(), "net", 2, 10_000.0).unwrap();

        for step in [10, 20, 30] {
            let state = CheckpointState { step, lr: 0.1, params: &params, optimiser: &opt, swa: None };
            manager.save(&state).unwrap();
        }

        assert_eq!(manager.checkpoints(), vec![dir.path().join("net-20"), dir.path().join("net-30")]);
        assert!(!dir.path().join("net-10").exists());

        let reopened = CheckpointManager::new(dir.path(), "net", 2, 10_000.0).unwrap();
        let loaded = CheckpointManager::load(&reopened.latest().unwrap(), &Device::Cpu).unwrap();
        assert_eq!(loaded.meta.global_step, 30);
        assert!(loaded.swa.is_none());
        assert_eq!(loaded.model["d/bias"].to_vec1::<f32>().unwrap(), vec![0.5, 0.25, 0.125]);
        assert!(loaded.optimiser.contains_key("d/kernel/momentum"));
    }

    #[test]
    fn retention_preserves_periodic() {
        let dir = tempfile::tempdir().unwrap();
        let params = store();
        let opt = WrapOptimiser::<Sgd>::new("sgd", &params, &SgdParams::default()).unwrap();
        let mut manager = CheckpointManager::new(dir.path(), "net", 1, 0.0).unwrap();

        for step in [1, 2, 3] {
            let state = CheckpointState { step, lr: 0.1, params: &params, optimiser: &opt, swa: None };
            manager.save(&state).unwrap();
        }

        assert_eq!(manager.checkpoints().len(), 3);
    }
}
