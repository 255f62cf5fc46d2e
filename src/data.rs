use candle_core::{Device, Tensor};

use crate::{
    error::{Error, Result},
    nn::{policy_map::POLICY_OUTPUTS, INPUT_PLANES},
};

pub const PLANE_VALUES: usize = INPUT_PLANES * 64;

/// Host-side training tuples, row-major per position.
///
/// Illegal moves carry a negative value in `policy`. `outcome` and `q` are
/// win/draw/loss triples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub size: usize,
    pub planes: Vec<f32>,
    pub policy: Vec<f32>,
    pub outcome: Vec<f32>,
    pub q: Vec<f32>,
    pub moves_left: Vec<f32>,
}

impl Batch {
    pub fn new(planes: Vec<f32>, policy: Vec<f32>, outcome: Vec<f32>, q: Vec<f32>, moves_left: Vec<f32>) -> Result<Self> {
        let size = moves_left.len();
        let batch = Self { size, planes, policy, outcome, q, moves_left };

        for (name, len, width) in [
            ("planes", batch.planes.len(), PLANE_VALUES),
            ("policy", batch.policy.len(), POLICY_OUTPUTS),
            ("outcome", batch.outcome.len(), 3),
            ("q", batch.q.len(), 3),
        ] {
            if len != size * width {
                return Err(Error::Data(format!("{name} holds {len} values, expected {}", size * width)));
            }
        }

        Ok(batch)
    }

    fn columns() -> [usize; 5] {
        [PLANE_VALUES, POLICY_OUTPUTS, 3, 3, 1]
    }

    fn fields(&self) -> [&Vec<f32>; 5] {
        [&self.planes, &self.policy, &self.outcome, &self.q, &self.moves_left]
    }

    fn fields_mut(&mut self) -> [&mut Vec<f32>; 5] {
        [&mut self.planes, &mut self.policy, &mut self.outcome, &mut self.q, &mut self.moves_left]
    }

    /// Positions `start..start + len`, wrapping around the end.
    pub fn rows(&self, start: usize, len: usize) -> Batch {
        let mut out = Batch { size: len, ..Default::default() };

        for i in 0..len {
            let row = (start + i) % self.size;
            for ((dst, src), width) in out.fields_mut().into_iter().zip(self.fields()).zip(Self::columns()) {
                dst.extend_from_slice(&src[row * width..(row + 1) * width]);
            }
        }

        out
    }

    /// Splits into `n` disjoint, equally sized, contiguous parts.
    pub fn shard(&self, n: usize) -> Result<Vec<Batch>> {
        if n == 0 || self.size % n != 0 {
            return Err(Error::Data(format!("cannot split {} positions into {n} equal shards", self.size)));
        }

        let per = self.size / n;
        Ok((0..n).map(|i| self.rows(i * per, per)).collect())
    }

    pub fn to_device(&self, device: &Device) -> Result<TensorBatch> {
        let n = self.size;
        Ok(TensorBatch {
            planes: Tensor::from_slice(&self.planes, (n, INPUT_PLANES, 8, 8), device)?,
            policy: Tensor::from_slice(&self.policy, (n, POLICY_OUTPUTS), device)?,
            outcome: Tensor::from_slice(&self.outcome, (n, 3), device)?,
            q: Tensor::from_slice(&self.q, (n, 3), device)?,
            moves_left: Tensor::from_slice(&self.moves_left, (n, 1), device)?,
        })
    }
}

/// A batch resident on one device.
pub struct TensorBatch {
    pub planes: Tensor,
    pub policy: Tensor,
    pub outcome: Tensor,
    pub q: Tensor,
    pub moves_left: Tensor,
}

/// An endless, restartable stream of training or test positions.
pub trait BatchSource: Send {
    fn next_batch(&mut self, batch_size: usize) -> Result<Batch>;
}

/// A finite held-out set, visited in full on every pass.
pub trait ValidationSet {
    fn map_batches(&mut self, batch_size: usize, f: &mut dyn FnMut(Batch) -> Result<()>) -> Result<()>;
}

/// Positions held in memory, cycled forever as a stream and visited once as a validation set.
pub struct InMemory {
    data: Batch,
    cursor: usize,
}

impl InMemory {
    pub fn new(data: Batch) -> Result<Self> {
        if data.size == 0 {
            return Err(Error::Data("in-memory source holds no positions".into()));
        }

        Ok(Self { data, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.data.size
    }

    pub fn is_empty(&self) -> bool {
        self.data.size == 0
    }
}

impl BatchSource for InMemory {
    fn next_batch(&mut self, batch_size: usize) -> Result<Batch> {
        let batch = self.data.rows(self.cursor, batch_size);
        self.cursor = (self.cursor + batch_size) % self.data.size;
        Ok(batch)
    }
}

impl ValidationSet for InMemory {
    fn map_batches(&mut self, batch_size: usize, f: &mut dyn FnMut(Batch) -> Result<()>) -> Result<()> {
        let mut start = 0;
        while start < self.data.size {
            let len = batch_size.min(self.data.size - start);
            f(self.data.rows(start, len))?;
            start += len;
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Positions with a handful of legal moves and a one-hot best move.
    pub fn synthetic(size: usize, seed: usize) -> Batch {
        let mut planes = vec![0.0; size * PLANE_VALUES];
        let mut policy = vec![-1.0; size * POLICY_OUTPUTS];
        let mut outcome = vec![0.0; size * 3];
        let mut q = vec![0.0; size * 3];
        let mut moves_left = vec![0.0; size];

        for i in 0..size {
            let s = seed + i;
            for p in 0..16 {
                planes[i * PLANE_VALUES + (s * 7 + p * 13) % PLANE_VALUES] = 1.0;
            }
            for m in 0..8 {
                policy[i * POLICY_OUTPUTS + (s * 31 + m * 97) % POLICY_OUTPUTS] = 0.0;
            }
            policy[i * POLICY_OUTPUTS + (s * 31) % POLICY_OUTPUTS] = 1.0;
            outcome[i * 3 + s % 3] = 1.0;
            q[i * 3..i * 3 + 3].copy_from_slice(&[0.5, 0.3, 0.2]);
            moves_left[i] = (10 + s % 50) as f32;
        }

        Batch::new(planes, policy, outcome, q, moves_left).unwrap()
    }

    #[test]
    fn lengths_are_checked() {
        let b = synthetic(2, 0);
        assert!(Batch::new(b.planes, b.policy, b.outcome, vec![0.0; 3], b.moves_left).is_err());
    }

    #[test]
    fn shards_are_disjoint_and_ordered() {
        let b = synthetic(4, 3);
        let shards = b.shard(2).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].moves_left, b.moves_left[..2]);
        assert_eq!(shards[1].moves_left, b.moves_left[2..]);
        assert_eq!(shards[1].policy, b.policy[2 * POLICY_OUTPUTS..]);
        assert!(b.shard(3).is_err());
    }

    #[test]
    fn in_memory_cycles_and_validates_once() {
        let b = synthetic(3, 0);
        let mut src = InMemory::new(b.clone()).unwrap();
        let first = src.next_batch(2).unwrap();
        let second = src.next_batch(2).unwrap();
        assert_eq!(first.moves_left, b.moves_left[..2]);
        assert_eq!(second.moves_left, vec![b.moves_left[2], b.moves_left[0]]);

        let mut seen = Vec::new();
        src.map_batches(2, &mut |batch| {
            seen.push(batch.size);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![2, 1]);
    }

    #[test]
    fn device_shapes() {
        let t = synthetic(2, 0).to_device(&Device::Cpu).unwrap();
        assert_eq!(t.planes.dims(), &[2, INPUT_PLANES, 8, 8]);
        assert_eq!(t.policy.dims(), &[2, POLICY_OUTPUTS]);
        assert_eq!(t.moves_left.dims(), &[2, 1]);
    }
}
