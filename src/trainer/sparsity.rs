use candle_core::Tensor;

use crate::{
    error::{Error, Result},
    nn::ParamStore,
};

/// 2:4 structured sparsity: in every group of four consecutive weights, the
/// two largest magnitudes survive.
pub struct Sparsity {
    targets: Vec<String>,
    masks: Option<Vec<(usize, Tensor)>>,
}

/// Keeps entries whose magnitude reaches the second largest of their group of four.
pub fn two_four_mask(values: &[f32]) -> Vec<f32> {
    let mut mask = Vec::with_capacity(values.len());

    for group in values.chunks(4) {
        let mut mags = group.iter().map(|v| v.abs()).collect::<Vec<_>>();
        mags.sort_unstable_by(|a, b| b.total_cmp(a));
        let threshold = mags.get(1).copied().unwrap_or(0.0);
        mask.extend(group.iter().map(|v| if v.abs() >= threshold { 1.0 } else { 0.0 }));
    }

    mask
}

impl Sparsity {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets, masks: None }
    }

    pub fn is_initialised(&self) -> bool {
        self.masks.is_some()
    }

    /// Computes the masks on first use, then multiplies them into the weights.
    pub fn apply(&mut self, params: &ParamStore) -> Result<()> {
        if self.masks.is_none() {
            let mut masks = Vec::with_capacity(self.targets.len());
            for name in &self.targets {
                let (idx, param) = params
                    .iter()
                    .enumerate()
                    .find(|(_, p)| &p.name == name)
                    .ok_or_else(|| Error::MissingWeight(name.clone()))?;
                let mask = Tensor::from_vec(two_four_mask(&param.values()?), param.shape(), params.device())?;
                masks.push((idx, mask));
            }

            tracing::info!(tensors = masks.len(), "computed 2:4 sparsity masks");
            self.masks = Some(masks);
        }

        let Some(masks) = &self.masks else { return Ok(()) };
        let weights = params.iter().collect::<Vec<_>>();
        for (idx, mask) in masks {
            let var = &weights[*idx].var;
            var.set(&(var.as_tensor() * mask)?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ParamKind;
    use candle_core::Device;

    #[test]
    fn keeps_two_of_four() {
        let mask = two_four_mask(&[0.1, -0.9, 0.5, 0.2, 3.0, 0.0, 0.0, -1.0]);
        assert_eq!(mask, vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn masks_are_fixed_after_first_step() {
        let mut store = ParamStore::new(&Device::Cpu);
        let var = store.add("w", vec![4.0, 3.0, 2.0, 1.0], &[4], ParamKind::Kernel, false).unwrap();
        let mut sparsity = Sparsity::new(vec!["w".into()]);

        sparsity.apply(&store).unwrap();
        assert!(sparsity.is_initialised());
        assert_eq!(store.get("w").unwrap().values().unwrap(), vec![4.0, 3.0, 0.0, 0.0]);

        var.set(&Tensor::new(&[1.0f32, 1.0, 9.0, 9.0], &Device::Cpu).unwrap()).unwrap();
        sparsity.apply(&store).unwrap();
        assert_eq!(store.get("w").unwrap().values().unwrap(), vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn unknown_target_is_an_error() {
        let store = ParamStore::new(&Device::Cpu);
        assert!(Sparsity::new(vec!["missing".into()]).apply(&store).is_err());
    }
}
