//! Sparse coders: the encoders that turn visible surfaces into a sparse
//! hidden code.
//!
//! Two variants share the visible-layer machinery defined here:
//!
//! - [`SparseCoder`]: spiking lateral-inhibition solver with threshold
//!   homeostasis
//! - [`ComparisonCoder`]: two accumulation paths (activation and prediction)
//!   combined in a single local k-winners-take-all solve
//!
//! Layers hold them through the closed [`Coder`] enum.

use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::compute::kernels::{self, FieldGeometry};
use crate::compute::ComputeContext;
use crate::core::{
    check_shape, check_size, check_stored, check_unit, random_weights, weight_shape, DoubleBuffer,
    Int2, NeoError, NeoResult,
};

pub use crate::comparison::ComparisonCoder;
pub use crate::sparse_coder::SparseCoder;

/// Which encoder a layer uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoderKind {
    Sparse,
    #[default]
    Comparison,
}

/// One visible input of a coder.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisibleLayerDesc {
    pub size: Int2,
    pub radius: i32,
    pub weight_alpha: f32,
    /// Trace decay, only used with `use_traces`
    pub weight_lambda: f32,
    /// Skip the field cell under the hidden unit (recurrent inputs)
    pub ignore_middle: bool,
    pub use_traces: bool,
    /// Accumulate on the prediction path (comparison coder only)
    pub is_predictive_coding: bool,
}

impl Default for VisibleLayerDesc {
    fn default() -> Self {
        Self {
            size: Int2::new(8, 8),
            radius: 2,
            weight_alpha: 0.01,
            weight_lambda: 0.95,
            ignore_middle: false,
            use_traces: false,
            is_predictive_coding: false,
        }
    }
}

impl VisibleLayerDesc {
    pub fn validate(&self) -> NeoResult<()> {
        check_size("visible layer size", self.size)?;
        if self.radius < 0 {
            return Err(NeoError::InvalidConfig(format!(
                "receptive field radius must be non-negative, got {}",
                self.radius
            )));
        }
        check_unit("weight_lambda", self.weight_lambda)?;
        if !self.weight_alpha.is_finite() || self.weight_alpha < 0.0 {
            return Err(NeoError::InvalidConfig(format!(
                "weight_alpha must be a non-negative number, got {}",
                self.weight_alpha
            )));
        }
        Ok(())
    }
}

/// Hidden-side parameters shared by both coder variants.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoderDesc {
    pub hidden_size: Int2,
    pub lateral_radius: i32,
    /// Settle iterations of the spiking solver
    pub iterations: usize,
    pub leak: f32,
    /// Threshold (sparse) or bias (comparison) adaptation rate
    pub threshold_alpha: f32,
    pub lateral_alpha: f32,
    pub active_ratio: f32,
    pub init_threshold: f32,
}

impl Default for CoderDesc {
    fn default() -> Self {
        Self {
            hidden_size: Int2::new(16, 16),
            lateral_radius: 2,
            iterations: 8,
            leak: 0.1,
            threshold_alpha: 0.01,
            lateral_alpha: 0.05,
            active_ratio: 0.1,
            init_threshold: 0.1,
        }
    }
}

impl CoderDesc {
    pub fn validate(&self) -> NeoResult<()> {
        check_size("hidden size", self.hidden_size)?;
        if self.lateral_radius < 0 {
            return Err(NeoError::InvalidConfig(format!(
                "lateral radius must be non-negative, got {}",
                self.lateral_radius
            )));
        }
        if self.iterations == 0 {
            return Err(NeoError::InvalidConfig(
                "at least one settle iteration is required".to_string(),
            ));
        }
        check_unit("leak", self.leak)?;
        check_unit("active_ratio", self.active_ratio)?;
        if self.active_ratio == 0.0 {
            return Err(NeoError::InvalidConfig(
                "active_ratio must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A visible input with its weights and optional eligibility traces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisibleLayer {
    pub(crate) desc: VisibleLayerDesc,
    pub(crate) geometry: FieldGeometry,
    pub(crate) weights: DoubleBuffer<Array3<f32>>,
    pub(crate) traces: Option<DoubleBuffer<Array3<f32>>>,
}

impl VisibleLayer {
    pub(crate) fn new<R: Rng + ?Sized>(
        desc: VisibleLayerDesc,
        hidden_size: Int2,
        init_weight_range: (f32, f32),
        rng: &mut R,
    ) -> NeoResult<Self> {
        desc.validate()?;
        let weights = random_weights(hidden_size, desc.radius, init_weight_range, rng)?;
        let traces = desc
            .use_traces
            .then(|| DoubleBuffer::<Array3<f32>>::zeros(weights.dim()));
        Ok(Self {
            desc,
            geometry: FieldGeometry::new(desc.size, hidden_size, desc.radius),
            weights: DoubleBuffer::new(weights),
            traces,
        })
    }

    pub fn desc(&self) -> &VisibleLayerDesc {
        &self.desc
    }

    pub fn geometry(&self) -> &FieldGeometry {
        &self.geometry
    }

    pub fn weights(&self) -> &Array3<f32> {
        self.weights.read()
    }

    pub fn traces(&self) -> Option<&Array3<f32>> {
        self.traces.as_ref().map(DoubleBuffer::read)
    }

    /// Accumulate this layer's weighted field sums onto `summation`.
    pub(crate) fn accumulate(
        &self,
        ctx: &mut ComputeContext,
        input: &Array2<f32>,
        summation: &mut DoubleBuffer<Array2<f32>>,
    ) -> NeoResult<()> {
        let geom = &self.geometry;
        let weights = self.weights.read();
        let ignore_middle = self.desc.ignore_middle;
        let kernel = if ignore_middle {
            "activate_ignore_middle"
        } else {
            "activate"
        };
        let (back, front) = summation.split();
        ctx.launch_2d(kernel, front, |h| {
            kernels::at(back, h) + kernels::field_sum(h, geom, input, weights, ignore_middle)
        })?;
        summation.swap();
        Ok(())
    }

    /// Check restored weights and traces against the descriptor.
    pub(crate) fn validate_state(&self, hidden_size: Int2) -> NeoResult<()> {
        self.desc.validate()?;
        if !self.geometry.matches(self.desc.size, hidden_size, self.desc.radius) {
            return Err(NeoError::Checkpoint(
                "visible layer geometry does not match its sizes".to_string(),
            ));
        }
        let shape = weight_shape(hidden_size, self.desc.radius);
        self.weights.check_layout("visible weights", &shape)?;
        match (&self.traces, self.desc.use_traces) {
            (Some(traces), true) => traces.check_layout("visible traces", &shape)?,
            (None, false) => {}
            _ => {
                return Err(NeoError::Checkpoint(
                    "visible traces do not match use_traces".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Linear inverse of the encoding through this layer's weights.
    pub(crate) fn reconstruct(
        &self,
        ctx: &mut ComputeContext,
        hidden: &Array2<f32>,
    ) -> NeoResult<Array2<f32>> {
        check_shape("reconstruction hidden state", hidden, self.geometry.hidden_size)?;
        let mut out = Array2::zeros(self.desc.size.dim());
        let geom = &self.geometry;
        let weights = self.weights.read();
        ctx.launch_2d("reconstruct", &mut out, |v| {
            kernels::reconstruct_at(v, geom, hidden, weights)
        })?;
        Ok(out)
    }
}

/// Check a set of step inputs against the layers they feed.
pub(crate) fn check_inputs(layers: &[VisibleLayer], inputs: &[&Array2<f32>]) -> NeoResult<()> {
    if inputs.len() != layers.len() {
        return Err(NeoError::InvalidConfig(format!(
            "coder has {} visible layers but {} inputs were supplied",
            layers.len(),
            inputs.len()
        )));
    }
    for (i, (vl, input)) in layers.iter().zip(inputs).enumerate() {
        check_shape(&format!("visible input {i}"), input, vl.desc.size)?;
    }
    Ok(())
}

/// Check a per-unit reward surface against the hidden grid.
pub(crate) fn check_rewards(rewards: Option<&Array2<f32>>, hidden_size: Int2) -> NeoResult<()> {
    match rewards {
        Some(r) => check_shape("rewards", r, hidden_size),
        None => Ok(()),
    }
}

/// Check a restored plain surface.
pub(crate) fn check_surface(what: &str, surface: &Array2<f32>, size: Int2) -> NeoResult<()> {
    check_stored(what, surface.shape(), &size.shape())
}

/// Closed set of encoder variants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Coder {
    Sparse(SparseCoder),
    Comparison(ComparisonCoder),
}

impl Coder {
    pub fn new<R: Rng + ?Sized>(
        kind: CoderKind,
        visible_descs: &[VisibleLayerDesc],
        desc: CoderDesc,
        init_weight_range: (f32, f32),
        init_lateral_weight_range: (f32, f32),
        rng: &mut R,
    ) -> NeoResult<Self> {
        Ok(match kind {
            CoderKind::Sparse => Coder::Sparse(SparseCoder::new(
                visible_descs,
                desc,
                init_weight_range,
                init_lateral_weight_range,
                rng,
            )?),
            CoderKind::Comparison => Coder::Comparison(ComparisonCoder::new(
                visible_descs,
                desc,
                init_weight_range,
                rng,
            )?),
        })
    }

    pub fn kind(&self) -> CoderKind {
        match self {
            Coder::Sparse(_) => CoderKind::Sparse,
            Coder::Comparison(_) => CoderKind::Comparison,
        }
    }

    pub fn activate(&mut self, ctx: &mut ComputeContext, inputs: &[&Array2<f32>]) -> NeoResult<()> {
        match self {
            Coder::Sparse(c) => c.activate(ctx, inputs),
            Coder::Comparison(c) => c.activate(ctx, inputs),
        }
    }

    /// Learn from the inputs of the last activation. `rewards` modulates the
    /// trace-based updates per hidden unit; `None` means a uniform 1.
    pub fn learn(
        &mut self,
        ctx: &mut ComputeContext,
        inputs: &[&Array2<f32>],
        rewards: Option<&Array2<f32>>,
    ) -> NeoResult<()> {
        match self {
            Coder::Sparse(c) => c.learn(ctx, inputs, rewards),
            Coder::Comparison(c) => c.learn(ctx, inputs, rewards),
        }
    }

    /// Zero the transient hidden state, keeping every learned parameter.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        match self {
            Coder::Sparse(c) => c.clear_memory(ctx),
            Coder::Comparison(c) => c.clear_memory(ctx),
        }
    }

    pub fn validate_state(&self) -> NeoResult<()> {
        match self {
            Coder::Sparse(c) => c.validate_state(),
            Coder::Comparison(c) => c.validate_state(),
        }
    }

    pub fn reconstruct(
        &self,
        ctx: &mut ComputeContext,
        hidden: &Array2<f32>,
        visible_index: usize,
    ) -> NeoResult<Array2<f32>> {
        self.visible_layer(visible_index)?.reconstruct(ctx, hidden)
    }

    pub fn hidden_states(&self) -> &Array2<f32> {
        match self {
            Coder::Sparse(c) => c.hidden_states(),
            Coder::Comparison(c) => c.hidden_states(),
        }
    }

    pub fn hidden_size(&self) -> Int2 {
        self.desc().hidden_size
    }

    pub fn desc(&self) -> &CoderDesc {
        match self {
            Coder::Sparse(c) => c.desc(),
            Coder::Comparison(c) => c.desc(),
        }
    }

    pub fn visible_layers(&self) -> &[VisibleLayer] {
        match self {
            Coder::Sparse(c) => c.visible_layers(),
            Coder::Comparison(c) => c.visible_layers(),
        }
    }

    pub fn visible_layer(&self, index: usize) -> NeoResult<&VisibleLayer> {
        self.visible_layers().get(index).ok_or_else(|| {
            NeoError::InvalidConfig(format!("no visible layer with index {index}"))
        })
    }
}

/// Reward of hidden unit `h`, uniform 1 when no surface is given.
#[inline]
pub(crate) fn reward_at(rewards: Option<&Array2<f32>>, h: Int2) -> f32 {
    rewards.map_or(1.0, |r| kernels::at(r, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn descs() -> Vec<VisibleLayerDesc> {
        vec![VisibleLayerDesc {
            size: Int2::new(6, 6),
            radius: 1,
            ..Default::default()
        }]
    }

    #[test]
    fn test_negative_radius_is_invalid_config() {
        let desc = VisibleLayerDesc {
            radius: -1,
            ..Default::default()
        };
        assert!(matches!(desc.validate(), Err(NeoError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_active_ratio_rejected() {
        let desc = CoderDesc {
            active_ratio: 0.0,
            ..Default::default()
        };
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_both_variants_share_interface() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ctx = ComputeContext::new();
        let desc = CoderDesc {
            hidden_size: Int2::new(4, 4),
            ..Default::default()
        };
        let input = Array2::from_elem((6, 6), 0.5);
        for kind in [CoderKind::Sparse, CoderKind::Comparison] {
            let mut coder =
                Coder::new(kind, &descs(), desc, (-0.01, 0.01), (0.01, 0.05), &mut rng).unwrap();
            assert_eq!(coder.kind(), kind);
            coder.activate(&mut ctx, &[&input]).unwrap();
            coder.learn(&mut ctx, &[&input], None).unwrap();
            assert_eq!(coder.hidden_states().dim(), (4, 4));
            let recon = coder.reconstruct(&mut ctx, &coder.hidden_states().clone(), 0).unwrap();
            assert_eq!(recon.dim(), (6, 6));
            coder.validate_state().unwrap();
        }
    }

    #[test]
    fn test_clear_memory_zeroes_code_of_both_variants() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut ctx = ComputeContext::new();
        let desc = CoderDesc {
            hidden_size: Int2::new(4, 4),
            ..Default::default()
        };
        let input = Array2::from_elem((6, 6), 1.0);
        for kind in [CoderKind::Sparse, CoderKind::Comparison] {
            let mut coder =
                Coder::new(kind, &descs(), desc, (0.2, 0.3), (0.01, 0.05), &mut rng).unwrap();
            coder.activate(&mut ctx, &[&input]).unwrap();
            assert!(coder.hidden_states().sum() > 0.0, "{kind:?} produced an empty code");
            let weights = coder.visible_layer(0).unwrap().weights().clone();
            coder.clear_memory(&mut ctx).unwrap();
            assert!(coder.hidden_states().iter().all(|&s| s == 0.0));
            assert_eq!(coder.visible_layer(0).unwrap().weights(), &weights);
        }
    }

    #[test]
    fn test_rewards_must_match_hidden_size() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut ctx = ComputeContext::new();
        let desc = CoderDesc {
            hidden_size: Int2::new(4, 4),
            ..Default::default()
        };
        let traced = [VisibleLayerDesc {
            use_traces: true,
            ..descs()[0]
        }];
        let input = Array2::zeros((6, 6));
        for kind in [CoderKind::Sparse, CoderKind::Comparison] {
            let mut coder =
                Coder::new(kind, &traced, desc, (-0.01, 0.01), (0.01, 0.05), &mut rng).unwrap();
            let err = coder
                .learn(&mut ctx, &[&input], Some(&Array2::ones((1, 1))))
                .unwrap_err();
            assert!(matches!(err, NeoError::ShapeMismatch { .. }));
            coder
                .learn(&mut ctx, &[&input], Some(&Array2::ones((4, 4))))
                .unwrap();
        }
    }

    #[test]
    fn test_wrong_input_count_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ctx = ComputeContext::new();
        let mut coder = Coder::new(
            CoderKind::Sparse,
            &descs(),
            CoderDesc::default(),
            (-0.01, 0.01),
            (0.01, 0.05),
            &mut rng,
        )
        .unwrap();
        assert!(coder.activate(&mut ctx, &[]).is_err());
    }

    #[test]
    fn test_traces_allocated_only_when_requested() {
        let mut rng = StdRng::seed_from_u64(5);
        let plain = VisibleLayer::new(descs()[0], Int2::new(4, 4), (0.0, 0.1), &mut rng).unwrap();
        assert!(plain.traces().is_none());
        let traced = VisibleLayer::new(
            VisibleLayerDesc {
                use_traces: true,
                ..descs()[0]
            },
            Int2::new(4, 4),
            (0.0, 0.1),
            &mut rng,
        )
        .unwrap();
        assert_eq!(traced.traces().map(|t| t.dim()), Some((4, 4, 9)));
    }
}
