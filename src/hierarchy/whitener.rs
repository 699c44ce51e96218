//! Local contrast whitening of the raw input.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::compute::kernels;
use crate::compute::ComputeContext;
use crate::core::{NeoError, NeoResult};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WhiteningDesc {
    /// Radius of the window the mean and variance are taken over
    pub radius: i32,
    /// Output gain
    pub intensity: f32,
}

impl Default for WhiteningDesc {
    fn default() -> Self {
        Self {
            radius: 2,
            intensity: 1.0,
        }
    }
}

impl WhiteningDesc {
    pub fn validate(&self) -> NeoResult<()> {
        if self.radius < 1 {
            return Err(NeoError::InvalidConfig(format!(
                "whitening radius must be at least 1, got {}",
                self.radius
            )));
        }
        if !self.intensity.is_finite() || self.intensity <= 0.0 {
            return Err(NeoError::InvalidConfig(format!(
                "whitening intensity must be positive, got {}",
                self.intensity
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputWhitener {
    desc: WhiteningDesc,
}

impl InputWhitener {
    pub fn new(desc: WhiteningDesc) -> NeoResult<Self> {
        desc.validate()?;
        Ok(Self { desc })
    }

    pub fn desc(&self) -> &WhiteningDesc {
        &self.desc
    }

    /// Write the whitened copy of `input` into `out`.
    pub fn filter(&self, ctx: &mut ComputeContext, input: &Array2<f32>, out: &mut Array2<f32>) -> NeoResult<()> {
        if input.dim() != out.dim() {
            return Err(NeoError::ShapeMismatch {
                what: "whitening output".to_string(),
                expected: input.dim(),
                got: out.dim(),
            });
        }
        let radius = self.desc.radius;
        let intensity = self.desc.intensity;
        ctx.launch_2d("whiten", out, |p| kernels::whiten_at(p, input, radius, intensity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_whitened_patch_is_zero_mean() {
        let whitener = InputWhitener::new(WhiteningDesc::default()).unwrap();
        let mut ctx = ComputeContext::new();
        let input = Array2::from_shape_fn((5, 5), |(x, y)| ((x + 2 * y) % 3) as f32);
        let mut out = Array2::zeros((5, 5));
        whitener.filter(&mut ctx, &input, &mut out).unwrap();
        // The center window covers the whole image.
        let mean = input.mean().unwrap();
        assert_eq!(out[[2, 2]] > 0.0, input[[2, 2]] > mean);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_constant_input_whitens_to_zero() {
        let whitener = InputWhitener::new(WhiteningDesc {
            radius: 1,
            intensity: 2.0,
        })
        .unwrap();
        let mut ctx = ComputeContext::new();
        let input = Array2::from_elem((4, 4), 0.7);
        let mut out = Array2::ones((4, 4));
        whitener.filter(&mut ctx, &input, &mut out).unwrap();
        for &v in out.iter() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_zero_radius_rejected() {
        assert!(InputWhitener::new(WhiteningDesc {
            radius: 0,
            intensity: 1.0
        })
        .is_err());
    }
}
