//! Core primitives shared by every layer type.
//!
//! - [`NeoError`] / [`NeoResult`]: the crate-wide error taxonomy
//! - [`buffer::DoubleBuffer`]: front/back state arena
//! - [`Int2`] / [`Float2`]: grid sizes, radii and resolution ratios
//! - receptive-field projection helpers and seeded random initialisation
//!
//! ## Surface layout
//!
//! Every 2D surface is an `Array2<f32>` of shape `(width, height)` indexed as
//! `[[x, y]]`. Weight tensors are `Array3<f32>` of shape
//! `(hidden_width, hidden_height, (2r + 1)^2)`; the receptive-field offset
//! `(dx, dy)` maps to the last index `(dx + r) * (2r + 1) + (dy + r)`.

pub mod buffer;

use ndarray::{Array2, Array3};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use buffer::DoubleBuffer;

/// Error type for every fallible engine operation.
#[derive(Error, Debug)]
pub enum NeoError {
    /// Rejected at construction, before any kernel launch.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A surface handed to a step does not match the declared size.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// The compute backend refused or failed a launch.
    #[error("Compute error in kernel `{kernel}`: {reason}")]
    Compute { kernel: &'static str, reason: String },

    /// A launch range exceeds what the backend can dispatch.
    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type NeoResult<T> = Result<T, NeoError>;

/// Integer 2D vector used for grid sizes, positions and radii.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int2 {
    pub x: i32,
    pub y: i32,
}

impl Int2 {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Number of cells of a grid of this size.
    pub fn area(&self) -> usize {
        (self.x.max(0) * self.y.max(0)) as usize
    }

    /// Shape tuple for allocating an `Array2` of this size.
    pub fn dim(&self) -> (usize, usize) {
        (self.x.max(0) as usize, self.y.max(0) as usize)
    }

    pub fn from_dim(dim: (usize, usize)) -> Self {
        Self::new(dim.0 as i32, dim.1 as i32)
    }

    /// [`dim`](Self::dim) as a slice-comparable shape.
    pub fn shape(&self) -> [usize; 2] {
        let (w, h) = self.dim();
        [w, h]
    }
}

/// Float 2D vector, used for resolution ratios between layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

impl Float2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Ratio `to / from` per axis.
    pub fn ratio(to: Int2, from: Int2) -> Self {
        Self::new(to.x as f32 / from.x as f32, to.y as f32 / from.y as f32)
    }
}

/// Project a cell center from one grid into another.
pub fn project(pos: Int2, to_scalars: Float2) -> Int2 {
    Int2::new(
        ((pos.x as f32 + 0.5) * to_scalars.x) as i32,
        ((pos.y as f32 + 0.5) * to_scalars.y) as i32,
    )
}

pub fn in_bounds(pos: Int2, size: Int2) -> bool {
    pos.x >= 0 && pos.x < size.x && pos.y >= 0 && pos.y < size.y
}

/// Side length of a square receptive field.
pub fn diameter(radius: i32) -> i32 {
    radius * 2 + 1
}

/// Number of weights in a square receptive field.
pub fn field_area(radius: i32) -> usize {
    let d = diameter(radius);
    (d * d) as usize
}

/// Index of field offset `(dx, dy)` in the last axis of a weight tensor.
#[inline]
pub fn field_index(dx: i32, dy: i32, radius: i32) -> usize {
    ((dx + radius) * diameter(radius) + (dy + radius)) as usize
}

/// Clipped inclusive bounds of the square window `center ± radius`.
#[inline]
pub fn field_bounds(center: Int2, radius: i32, size: Int2) -> (Int2, Int2) {
    let lower = Int2::new((center.x - radius).max(0), (center.y - radius).max(0));
    let upper = Int2::new(
        (center.x + radius).min(size.x - 1),
        (center.y + radius).min(size.y - 1),
    );
    (lower, upper)
}

/// Uniform random surface over `range`.
///
/// # Errors
/// `InvalidConfig` if the range is empty or not finite.
pub fn random_surface<R: Rng + ?Sized>(
    size: Int2,
    range: (f32, f32),
    rng: &mut R,
) -> NeoResult<Array2<f32>> {
    check_range(range)?;
    Ok(Array2::random_using(size.dim(), Uniform::new(range.0, range.1), rng))
}

/// Shape of the weight tensor of a hidden grid with fields of `radius`.
pub fn weight_shape(hidden_size: Int2, radius: i32) -> [usize; 3] {
    let (w, h) = hidden_size.dim();
    [w, h, field_area(radius)]
}

/// Uniform random weight tensor for a hidden grid and receptive-field radius.
pub fn random_weights<R: Rng + ?Sized>(
    hidden_size: Int2,
    radius: i32,
    range: (f32, f32),
    rng: &mut R,
) -> NeoResult<Array3<f32>> {
    check_range(range)?;
    let (w, h) = hidden_size.dim();
    Ok(Array3::random_using(
        (w, h, field_area(radius)),
        Uniform::new(range.0, range.1),
        rng,
    ))
}

fn check_range(range: (f32, f32)) -> NeoResult<()> {
    if !(range.0.is_finite() && range.1.is_finite()) || range.0 >= range.1 {
        return Err(NeoError::InvalidConfig(format!(
            "initialisation range must be finite and non-empty, got [{}, {})",
            range.0, range.1
        )));
    }
    Ok(())
}

/// Shape check for surfaces handed in by the caller.
pub fn check_shape(what: &str, surface: &Array2<f32>, expected: Int2) -> NeoResult<()> {
    if surface.dim() != expected.dim() {
        return Err(NeoError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.dim(),
            got: surface.dim(),
        });
    }
    Ok(())
}

/// Shape check for state restored from a checkpoint.
pub fn check_stored(what: &str, shape: &[usize], expected: &[usize]) -> NeoResult<()> {
    if shape != expected {
        return Err(NeoError::Checkpoint(format!(
            "{what} has shape {shape:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Validate a grid size used at construction.
pub fn check_size(what: &str, size: Int2) -> NeoResult<()> {
    if size.x <= 0 || size.y <= 0 {
        return Err(NeoError::InvalidConfig(format!(
            "{what} must be positive in both axes, got {}x{}",
            size.x, size.y
        )));
    }
    Ok(())
}

/// Validate a rate that must lie in `[0, 1]`.
pub fn check_unit(what: &str, value: f32) -> NeoResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(NeoError::InvalidConfig(format!(
            "{what} must lie in [0, 1], got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_project_scales_centers() {
        let to = Float2::ratio(Int2::new(16, 16), Int2::new(8, 8));
        assert_eq!(project(Int2::new(0, 0), to), Int2::new(1, 1));
        assert_eq!(project(Int2::new(7, 3), to), Int2::new(15, 7));
    }

    #[test]
    fn test_field_index_covers_area() {
        let r = 2;
        let mut seen = vec![false; field_area(r)];
        for dx in -r..=r {
            for dy in -r..=r {
                seen[field_index(dx, dy, r)] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_field_bounds_clip() {
        let (lo, hi) = field_bounds(Int2::new(0, 4), 2, Int2::new(5, 5));
        assert_eq!(lo, Int2::new(0, 2));
        assert_eq!(hi, Int2::new(2, 4));
    }

    #[test]
    fn test_random_surface_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let s = random_surface(Int2::new(4, 3), (-0.5, 0.5), &mut rng).unwrap();
        assert_eq!(s.dim(), (4, 3));
        assert!(s.iter().all(|&v| (-0.5..0.5).contains(&v)));
    }

    #[test]
    fn test_weight_shape_matches_random_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let w = random_weights(Int2::new(4, 3), 2, (0.0, 1.0), &mut rng).unwrap();
        assert_eq!(w.shape(), &weight_shape(Int2::new(4, 3), 2));
        assert!(check_stored("weights", w.shape(), &weight_shape(Int2::new(4, 3), 1)).is_err());
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(random_surface(Int2::new(2, 2), (1.0, 1.0), &mut rng).is_err());
    }

    #[test]
    fn test_check_shape_reports_mismatch() {
        let s = Array2::<f32>::zeros((3, 2));
        let err = check_shape("input", &s, Int2::new(2, 2)).unwrap_err();
        assert!(matches!(err, NeoError::ShapeMismatch { .. }));
    }
}
