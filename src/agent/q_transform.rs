//! Encoding of a scalar value into a surface and back.

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::compute::kernels::at;
use crate::compute::ComputeContext;
use crate::core::{check_shape, check_size, random_surface, Int2, NeoError, NeoResult};

/// Fixed random projection, uniform in `[-1, 1]`, created once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QTransform {
    transform: Array2<f32>,
    /// `sum(t^2)`, the normaliser of the retrieval
    energy: f32,
}

impl QTransform {
    pub fn new<R: Rng + ?Sized>(size: Int2, rng: &mut R) -> NeoResult<Self> {
        check_size("q size", size)?;
        let transform = random_surface(size, (-1.0, 1.0), rng)?;
        let energy: f32 = transform.iter().map(|t| t * t).sum();
        Ok(Self { transform, energy })
    }

    pub fn size(&self) -> Int2 {
        Int2::from_dim(self.transform.dim())
    }

    pub fn transform(&self) -> &Array2<f32> {
        &self.transform
    }

    /// Check a restored transform: the stored energy must be the one of the
    /// stored projection.
    pub fn validate_state(&self) -> NeoResult<()> {
        check_size("q size", self.size())?;
        let energy: f32 = self.transform.iter().map(|t| t * t).sum();
        if !self.energy.is_finite() || (energy - self.energy).abs() > 1e-3 * energy.max(1.0) {
            return Err(NeoError::Checkpoint(format!(
                "q transform energy {} does not match its projection ({energy})",
                self.energy
            )));
        }
        Ok(())
    }

    /// Write `t * q` into `out`.
    pub fn set_q(&self, ctx: &mut ComputeContext, q: f32, out: &mut Array2<f32>) -> NeoResult<()> {
        check_shape("q surface", out, self.size())?;
        let transform = &self.transform;
        ctx.launch_2d("set_q", out, |p| at(transform, p) * q)
    }

    /// Least-squares inverse of [`set_q`](Self::set_q): `mean(p * t) /
    /// mean(t^2)`. Reads the prediction back to the host.
    pub fn get_q(&self, ctx: &mut ComputeContext, prediction: &Array2<f32>) -> NeoResult<f32> {
        check_shape("q prediction", prediction, self.size())?;
        let host = ctx.read_surface(prediction);
        if self.energy <= f32::EPSILON {
            return Ok(0.0);
        }
        let projected: f32 = host.iter().zip(self.transform.iter()).map(|(p, t)| p * t).sum();
        Ok(projected / self.energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut ctx = ComputeContext::new();
        let qt = QTransform::new(Int2::new(4, 4), &mut rng).unwrap();
        let mut surface = Array2::zeros((4, 4));
        for i in 0..=20 {
            let q = -1.0 + i as f32 * 0.1;
            qt.set_q(&mut ctx, q, &mut surface).unwrap();
            let back = qt.get_q(&mut ctx, &surface).unwrap();
            assert_abs_diff_eq!(back, q, epsilon = 0.05);
        }
    }

    #[test]
    fn test_transform_in_unit_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let qt = QTransform::new(Int2::new(8, 8), &mut rng).unwrap();
        assert!(qt.transform().iter().all(|t| (-1.0..=1.0).contains(t)));
    }

    #[test]
    fn test_retrieval_counts_a_sync() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = ComputeContext::new();
        let qt = QTransform::new(Int2::new(2, 2), &mut rng).unwrap();
        let before = ctx.stats().syncs;
        qt.get_q(&mut ctx, &Array2::zeros((2, 2))).unwrap();
        assert_eq!(ctx.stats().syncs, before + 1);
    }

    #[test]
    fn test_wrong_surface_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = ComputeContext::new();
        let qt = QTransform::new(Int2::new(2, 2), &mut rng).unwrap();
        assert!(qt.get_q(&mut ctx, &Array2::zeros((3, 2))).is_err());
    }
}
