//! Per-item arithmetic of every launch.
//!
//! Each function computes the value (or the lane update) for one position of
//! a launch range from read-only views. They hold no state and never see the
//! output slot, which is what lets [`ComputeContext`](super::ComputeContext)
//! run them in parallel.

use ndarray::{Array2, Array3, ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};

use crate::core::{field_bounds, field_index, in_bounds, project, Float2, Int2};

/// Mapping between a hidden grid and one of its visible grids.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldGeometry {
    pub visible_size: Int2,
    pub hidden_size: Int2,
    pub radius: i32,
    pub hidden_to_visible: Float2,
    pub visible_to_hidden: Float2,
    /// Search radius, in hidden units, for inverting the mapping.
    pub reverse_radii: Int2,
}

impl FieldGeometry {
    pub fn new(visible_size: Int2, hidden_size: Int2, radius: i32) -> Self {
        let hidden_to_visible = Float2::ratio(visible_size, hidden_size);
        let visible_to_hidden = Float2::ratio(hidden_size, visible_size);
        let reverse_radii = Int2::new(
            (visible_to_hidden.x * (radius as f32 + 0.5)).ceil() as i32,
            (visible_to_hidden.y * (radius as f32 + 0.5)).ceil() as i32,
        );
        Self {
            visible_size,
            hidden_size,
            radius,
            hidden_to_visible,
            visible_to_hidden,
            reverse_radii,
        }
    }

    /// Whether this mapping was built for these sizes. Ratios are compared
    /// with a tolerance since they pass through decimal text in checkpoints.
    pub fn matches(&self, visible_size: Int2, hidden_size: Int2, radius: i32) -> bool {
        let expected = Self::new(visible_size, hidden_size, radius);
        let close = |a: Float2, b: Float2| (a.x - b.x).abs() <= 1e-6 && (a.y - b.y).abs() <= 1e-6;
        self.visible_size == expected.visible_size
            && self.hidden_size == expected.hidden_size
            && self.radius == expected.radius
            && self.reverse_radii == expected.reverse_radii
            && close(self.hidden_to_visible, expected.hidden_to_visible)
            && close(self.visible_to_hidden, expected.visible_to_hidden)
    }

    /// Visible cell a hidden unit's receptive field is centered on.
    #[inline]
    pub fn center(&self, hidden_pos: Int2) -> Int2 {
        project(hidden_pos, self.hidden_to_visible)
    }
}

#[inline]
pub fn at(surface: &Array2<f32>, pos: Int2) -> f32 {
    surface[[pos.x as usize, pos.y as usize]]
}

/// Lane of weights owned by one hidden unit.
#[inline]
pub fn lane(weights: &Array3<f32>, pos: Int2) -> ArrayView1<'_, f32> {
    weights.slice(ndarray::s![pos.x as usize, pos.y as usize, ..])
}

/// Visit every in-bounds visible cell of a hidden unit's receptive field as
/// `(visible_pos, weight_index)`.
#[inline]
pub fn for_each_field<F>(hidden_pos: Int2, geom: &FieldGeometry, ignore_middle: bool, mut f: F)
where
    F: FnMut(Int2, usize),
{
    let center = geom.center(hidden_pos);
    let (lower, upper) = field_bounds(center, geom.radius, geom.visible_size);
    for vx in lower.x..=upper.x {
        for vy in lower.y..=upper.y {
            if ignore_middle && vx == center.x && vy == center.y {
                continue;
            }
            let wi = field_index(vx - center.x, vy - center.y, geom.radius);
            f(Int2::new(vx, vy), wi);
        }
    }
}

/// Weighted sum of a visible surface over a hidden unit's receptive field.
pub fn field_sum(
    hidden_pos: Int2,
    geom: &FieldGeometry,
    visible: &Array2<f32>,
    weights: &Array3<f32>,
    ignore_middle: bool,
) -> f32 {
    let w = lane(weights, hidden_pos);
    let mut sum = 0.0;
    for_each_field(hidden_pos, geom, ignore_middle, |v, wi| {
        sum += w[wi] * at(visible, v);
    });
    sum
}

/// Visit every other hidden unit within `radius`, as `(pos, weight_index)`.
#[inline]
pub fn for_each_neighbor<F>(pos: Int2, size: Int2, radius: i32, mut f: F)
where
    F: FnMut(Int2, usize),
{
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            if dx == 0 && dy == 0 {
                continue;
            }
            let other = Int2::new(pos.x + dx, pos.y + dy);
            if in_bounds(other, size) {
                f(other, field_index(dx, dy, radius));
            }
        }
    }
}

/// One settle iteration of the spiking sparse solver.
///
/// Returns `(spike, activation, rate)`: the activation integrates the
/// feed-forward sum minus the lateral inhibition with leak and resets on a
/// spike; the rate is the running spike rate, updated with weight `scale`.
/// Lateral weights are non-negative inhibition strengths.
#[allow(clippy::too_many_arguments)]
pub fn solve_spiking(
    pos: Int2,
    size: Int2,
    lateral_radius: i32,
    summation: &Array2<f32>,
    spikes: &Array2<f32>,
    activations: &Array2<f32>,
    rates: &Array2<f32>,
    thresholds: &Array2<f32>,
    lateral_weights: &Array3<f32>,
    leak: f32,
    scale: f32,
) -> (f32, f32, f32) {
    let lw = lane(lateral_weights, pos);
    let mut inhibition = 0.0;
    for_each_neighbor(pos, size, lateral_radius, |other, wi| {
        inhibition += lw[wi] * at(spikes, other);
    });

    let activation = (1.0 - leak) * at(activations, pos) + at(summation, pos) - inhibition;
    let spike = if activation > at(thresholds, pos) { 1.0 } else { 0.0 };
    let activation = if spike > 0.0 { 0.0 } else { activation };
    let prev = at(rates, pos);
    let rate = prev + scale * (spike - prev);
    (spike, activation, rate)
}

/// Spike rate above which a settled unit counts as active.
pub const ACTIVE_RATE_CUTOFF: f32 = 0.5;

/// Local k-winners-take-all over the lateral window.
///
/// A unit is active when fewer than `ceil((neighbors + 1) * active_ratio)`
/// neighbors have a strictly greater total input.
pub fn local_wta(
    pos: Int2,
    size: Int2,
    lateral_radius: i32,
    activation_sums: &Array2<f32>,
    prediction_sums: &Array2<f32>,
    active_ratio: f32,
) -> f32 {
    let total = at(activation_sums, pos) + at(prediction_sums, pos);
    let mut num_higher = 0usize;
    let mut count = 1usize;
    for_each_neighbor(pos, size, lateral_radius, |other, _| {
        if at(activation_sums, other) + at(prediction_sums, other) > total {
            num_higher += 1;
        }
        count += 1;
    });
    let max_active = (count as f32 * active_ratio).ceil() as usize;
    if num_higher < max_active {
        1.0
    } else {
        0.0
    }
}

/// Instar update toward the centered visible pattern: each weight of an
/// active unit moves by `alpha * h * ((v - baseline) - w)`.
///
/// Weights of cells that are on while the unit fires rise toward
/// `1 - baseline`; weights of cells that are off fall toward `-baseline`.
/// Silent units keep their field.
pub fn learn_instar(
    pos: Int2,
    geom: &FieldGeometry,
    visible: &Array2<f32>,
    hidden: f32,
    baseline: f32,
    back: ArrayView1<f32>,
    mut front: ArrayViewMut1<f32>,
    alpha: f32,
) {
    front.assign(&back);
    if hidden == 0.0 {
        return;
    }
    for_each_field(pos, geom, false, |v, wi| {
        front[wi] = back[wi] + alpha * hidden * (at(visible, v) - baseline - back[wi]);
    });
}

/// Reward-modulated [`learn_instar`] through an eligibility trace.
#[allow(clippy::too_many_arguments)]
pub fn learn_instar_traces(
    pos: Int2,
    geom: &FieldGeometry,
    visible: &Array2<f32>,
    hidden: f32,
    baseline: f32,
    reward: f32,
    weights_back: ArrayView1<f32>,
    traces_back: ArrayView1<f32>,
    mut weights_front: ArrayViewMut1<f32>,
    mut traces_front: ArrayViewMut1<f32>,
    alpha: f32,
    lambda: f32,
) {
    // Cells outside the clipped field keep decaying like the rest.
    for wi in 0..traces_back.len() {
        traces_front[wi] = lambda * traces_back[wi];
    }
    for_each_field(pos, geom, false, |v, wi| {
        traces_front[wi] += hidden * (at(visible, v) - baseline - weights_back[wi]);
    });
    for wi in 0..weights_back.len() {
        weights_front[wi] = weights_back[wi] + alpha * reward * traces_front[wi];
    }
}

/// LMS update of a prediction-path field toward the unit's state.
#[allow(clippy::too_many_arguments)]
pub fn learn_delta(
    pos: Int2,
    geom: &FieldGeometry,
    visible: &Array2<f32>,
    error: f32,
    back: ArrayView1<f32>,
    mut front: ArrayViewMut1<f32>,
    alpha: f32,
    ignore_middle: bool,
) {
    front.assign(&back);
    if error == 0.0 {
        return;
    }
    for_each_field(pos, geom, ignore_middle, |v, wi| {
        front[wi] = back[wi] + alpha * error * at(visible, v);
    });
}

/// Trace variant of [`learn_delta`].
#[allow(clippy::too_many_arguments)]
pub fn learn_delta_traces(
    pos: Int2,
    geom: &FieldGeometry,
    visible: &Array2<f32>,
    error: f32,
    reward: f32,
    weights_back: ArrayView1<f32>,
    traces_back: ArrayView1<f32>,
    mut weights_front: ArrayViewMut1<f32>,
    mut traces_front: ArrayViewMut1<f32>,
    alpha: f32,
    lambda: f32,
    ignore_middle: bool,
) {
    for wi in 0..traces_back.len() {
        traces_front[wi] = lambda * traces_back[wi];
    }
    for_each_field(pos, geom, ignore_middle, |v, wi| {
        traces_front[wi] += error * at(visible, v);
    });
    for wi in 0..weights_back.len() {
        weights_front[wi] = weights_back[wi] + alpha * reward * traces_front[wi];
    }
}

/// Anti-Hebbian lateral update of the inhibition strengths.
///
/// Co-activity above the `baseline` weakens the inhibition between two
/// units and co-activity below it strengthens it. Strengths never go below
/// zero.
#[allow(clippy::too_many_arguments)]
pub fn learn_lateral(
    pos: Int2,
    size: Int2,
    radius: i32,
    states: &Array2<f32>,
    back: ArrayView1<f32>,
    mut front: ArrayViewMut1<f32>,
    alpha: f32,
    baseline: f32,
) {
    front.assign(&back);
    let own = at(states, pos);
    for_each_neighbor(pos, size, radius, |other, wi| {
        front[wi] = (back[wi] - alpha * (own * at(states, other) - baseline)).max(0.0);
    });
}

/// Linear inverse mapping of a hidden code into visible resolution.
pub fn reconstruct_at(
    visible_pos: Int2,
    geom: &FieldGeometry,
    hidden: &Array2<f32>,
    weights: &Array3<f32>,
) -> f32 {
    let hidden_center = project(visible_pos, geom.visible_to_hidden);
    let mut sum = 0.0;
    for hx in (hidden_center.x - geom.reverse_radii.x)..=(hidden_center.x + geom.reverse_radii.x) {
        for hy in (hidden_center.y - geom.reverse_radii.y)..=(hidden_center.y + geom.reverse_radii.y) {
            let h = Int2::new(hx, hy);
            if !in_bounds(h, geom.hidden_size) {
                continue;
            }
            let center = geom.center(h);
            let dx = visible_pos.x - center.x;
            let dy = visible_pos.y - center.y;
            if dx.abs() <= geom.radius && dy.abs() <= geom.radius {
                sum += weights[[hx as usize, hy as usize, field_index(dx, dy, geom.radius)]]
                    * at(hidden, h);
            }
        }
    }
    sum
}

/// Local contrast normalisation of one pixel.
pub fn whiten_at(pos: Int2, input: &Array2<f32>, radius: i32, intensity: f32) -> f32 {
    let size = Int2::from_dim(input.dim());
    let (lower, upper) = field_bounds(pos, radius, size);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0.0;
    for x in lower.x..=upper.x {
        for y in lower.y..=upper.y {
            let v = at(input, Int2::new(x, y));
            sum += v;
            sum_sq += v * v;
            count += 1.0;
        }
    }
    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(0.0);
    intensity * (at(input, pos) - mean) / (variance + WHITEN_EPSILON).sqrt()
}

pub const WHITEN_EPSILON: f32 = 1e-4;
