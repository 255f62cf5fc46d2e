use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

/// Truncated normal stddev correction for a cut at two standard deviations.
const TRUNCATION_CORRECTION: f32 = 0.879_625_7;

enum Dist {
    TruncatedNormal(Normal<f32>, f32),
    Uniform(Uniform<f32>),
}

impl Dist {
    fn sample(&self, rng: &mut StdRng) -> f32 {
        match self {
            Dist::TruncatedNormal(x, cut) => loop {
                let v = x.sample(rng);
                if v.abs() <= *cut {
                    break v;
                }
            },
            Dist::Uniform(x) => x.sample(rng),
        }
    }
}

/// Fan-averaged variance scaling, as used for every dense kernel in the network.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Init {
    /// Truncated normal with the given scale; scale 1 is glorot normal.
    Normal(f32),
    /// Uniform with the given scale; scale 1 is glorot uniform.
    Uniform(f32),
}

impl Init {
    pub const GLOROT_NORMAL: Self = Self::Normal(1.0);
    pub const GLOROT_UNIFORM: Self = Self::Uniform(1.0);
}

/// Seeded source of initial weights.
pub struct WeightRng(StdRng);

impl WeightRng {
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn kernel(&mut self, init: Init, fan_in: usize, fan_out: usize) -> Vec<f32> {
        let fan_avg = (fan_in + fan_out) as f32 / 2.0;
        let dist = match init {
            Init::Normal(scale) => {
                let stdev = (scale / fan_avg).sqrt() / TRUNCATION_CORRECTION;
                match Normal::new(0.0, stdev) {
                    Ok(normal) => Dist::TruncatedNormal(normal, 2.0 * stdev),
                    Err(_) => return vec![0.0; fan_in * fan_out],
                }
            }
            Init::Uniform(scale) => {
                let limit = (3.0 * scale / fan_avg).sqrt();
                Dist::Uniform(Uniform::new_inclusive(-limit, limit))
            }
        };

        (0..fan_in * fan_out).map(|_| dist.sample(&mut self.0)).collect()
    }
}
