//! Multi-layer predictive hierarchy.
//!
//! Layer `l` encodes layer `l - 1`'s hidden state (the input for `l = 0`)
//! together with its own previous hidden state. Its predictor decodes the
//! new hidden state and the top-down prediction of layer `l + 1` into a
//! prediction of its input on the next step. The topmost layer gets a 1x1
//! zero surface in place of feedback.
//!
//! A step is split into [`forward`](PredictiveHierarchy::forward) (optional
//! whitening, bottom-up encoding and the top-down prediction pass) and
//! [`learn`](PredictiveHierarchy::learn), so the agent can fold its value
//! estimate in between.

pub mod whitener;

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::coder::{check_surface, Coder, CoderDesc, CoderKind, VisibleLayerDesc};
use crate::compute::ComputeContext;
use crate::core::{check_shape, check_size, check_unit, Int2, NeoError, NeoResult};
use crate::predictor::{Predictor, PredictorChannelDesc, PredictorInputDesc};

pub use whitener::{InputWhitener, WhiteningDesc};

/// Size of the zero surface standing in for the topmost layer's feedback.
pub const ZERO_SENTINEL_SIZE: Int2 = Int2::new(1, 1);

/// Configuration of one hierarchy layer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerDesc {
    pub size: Int2,
    pub coder: CoderKind,

    pub feed_forward_radius: i32,
    pub recurrent_radius: i32,
    pub lateral_radius: i32,
    pub feedback_radius: i32,
    pub predictive_radius: i32,

    /// Settle iterations (sparse coder)
    pub iterations: usize,
    pub leak: f32,

    /// Encoder weight learning rate
    pub weight_alpha: f32,
    /// Predictor weight learning rate
    pub prediction_alpha: f32,
    /// Threshold or bias homeostasis rate
    pub threshold_alpha: f32,
    pub lateral_alpha: f32,
    pub trace_lambda: f32,
    pub use_traces: bool,
    pub active_ratio: f32,
}

impl Default for LayerDesc {
    fn default() -> Self {
        Self {
            size: Int2::new(8, 8),
            coder: CoderKind::Comparison,
            feed_forward_radius: 2,
            recurrent_radius: 2,
            lateral_radius: 2,
            feedback_radius: 2,
            predictive_radius: 2,
            iterations: 8,
            leak: 0.1,
            weight_alpha: 0.01,
            prediction_alpha: 0.01,
            threshold_alpha: 0.01,
            lateral_alpha: 0.05,
            trace_lambda: 0.95,
            use_traces: false,
            active_ratio: 0.1,
        }
    }
}

impl LayerDesc {
    pub fn validate(&self) -> NeoResult<()> {
        check_size("layer size", self.size)?;
        for (name, r) in [
            ("feed_forward_radius", self.feed_forward_radius),
            ("recurrent_radius", self.recurrent_radius),
            ("lateral_radius", self.lateral_radius),
            ("feedback_radius", self.feedback_radius),
            ("predictive_radius", self.predictive_radius),
        ] {
            if r < 0 {
                return Err(NeoError::InvalidConfig(format!(
                    "{name} must be non-negative, got {r}"
                )));
            }
        }
        for (name, rate) in [
            ("weight_alpha", self.weight_alpha),
            ("prediction_alpha", self.prediction_alpha),
            ("threshold_alpha", self.threshold_alpha),
            ("lateral_alpha", self.lateral_alpha),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(NeoError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {rate}"
                )));
            }
        }
        check_unit("trace_lambda", self.trace_lambda)?;
        Ok(())
    }

    fn coder_desc(&self, init_threshold: f32) -> CoderDesc {
        CoderDesc {
            hidden_size: self.size,
            lateral_radius: self.lateral_radius,
            iterations: self.iterations,
            leak: self.leak,
            threshold_alpha: self.threshold_alpha,
            lateral_alpha: self.lateral_alpha,
            active_ratio: self.active_ratio,
            init_threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyDesc {
    pub input_size: Int2,
    pub layers: Vec<LayerDesc>,
    pub whitening: Option<WhiteningDesc>,
    pub init_weight_range: (f32, f32),
    /// Initial lateral inhibition strengths (sparse coder), non-negative
    pub init_lateral_weight_range: (f32, f32),
    pub init_threshold: f32,
}

impl Default for HierarchyDesc {
    fn default() -> Self {
        Self {
            input_size: Int2::new(8, 8),
            layers: vec![LayerDesc::default(); 2],
            whitening: None,
            init_weight_range: (-0.01, 0.01),
            init_lateral_weight_range: (0.01, 0.05),
            init_threshold: 0.1,
        }
    }
}

impl HierarchyDesc {
    pub fn validate(&self) -> NeoResult<()> {
        check_size("input size", self.input_size)?;
        if self.layers.is_empty() {
            return Err(NeoError::InvalidConfig(
                "hierarchy needs at least one layer".to_string(),
            ));
        }
        for layer in &self.layers {
            layer.validate()?;
        }
        if let Some(w) = &self.whitening {
            w.validate()?;
        }
        if self.init_lateral_weight_range.0 < 0.0 {
            return Err(NeoError::InvalidConfig(format!(
                "lateral weights are inhibition strengths and must start non-negative, got {:?}",
                self.init_lateral_weight_range
            )));
        }
        Ok(())
    }
}

/// Extra inputs and predicted channels wired into the first layer, used by
/// the agent for its action and value surfaces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HierarchyExtension {
    /// Extra encoder inputs of layer 0
    pub inputs: Vec<VisibleLayerDesc>,
    /// Extra predicted channels of layer 0, after the input prediction
    pub channels: Vec<PredictorChannelDesc>,
}

/// Learning signals of a step beyond the prediction targets.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Reinforcement {
    /// Gates reward-modulated predictor channels
    pub td_error: f32,
    /// Uniform reward for trace-based encoder updates; `None` means 1
    pub encoder_reward: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Layer {
    desc: LayerDesc,
    coder: Coder,
    predictor: Predictor,
    additional_errors: Array2<f32>,
    hidden_prev: Array2<f32>,
    feedback_prev: Array2<f32>,
    rewards: Array2<f32>,
}

impl Layer {
    pub fn desc(&self) -> &LayerDesc {
        &self.desc
    }

    pub fn coder(&self) -> &Coder {
        &self.coder
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn hidden_states(&self) -> &Array2<f32> {
        self.coder.hidden_states()
    }

    /// Top-down prediction of this layer's input.
    pub fn prediction(&self) -> &Array2<f32> {
        self.predictor.prediction(0)
    }

    pub fn feedback_size(&self) -> Int2 {
        Int2::from_dim(self.feedback_prev.dim())
    }

    /// Error surface added to the input-prediction error on every learn
    /// pass. Shaped like the layer's input.
    pub fn additional_errors(&self) -> &Array2<f32> {
        &self.additional_errors
    }

    pub fn additional_errors_mut(&mut self) -> &mut Array2<f32> {
        &mut self.additional_errors
    }

    /// Zero the coder's hidden code, the predictions and the step
    /// snapshots. Learned parameters are kept.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        self.coder.clear_memory(ctx)?;
        self.predictor.clear_memory(ctx)?;
        ctx.fill("clear_hidden_prev", &mut self.hidden_prev, 0.0)?;
        ctx.fill("clear_feedback_prev", &mut self.feedback_prev, 0.0)?;
        Ok(())
    }

    /// Check a restored layer against the sizes it is wired between.
    fn validate_state(&self, desc: &LayerDesc, input_size: Int2, feedback_size: Int2) -> NeoResult<()> {
        if self.desc != *desc {
            return Err(NeoError::Checkpoint(
                "layer descriptor differs from the hierarchy descriptor".to_string(),
            ));
        }
        self.coder.validate_state()?;
        self.predictor.validate_state()?;
        if self.coder.kind() != desc.coder || self.coder.hidden_size() != desc.size {
            return Err(NeoError::Checkpoint(format!(
                "layer coder is a {:?} of {:?}, expected a {:?} of {:?}",
                self.coder.kind(),
                self.coder.hidden_size(),
                desc.coder,
                desc.size
            )));
        }
        let visible = self.coder.visible_layers();
        let feed_forward = visible.first().map(|vl| vl.desc().size);
        if feed_forward != Some(input_size) || visible.get(1).map(|vl| vl.desc().size) != Some(desc.size) {
            return Err(NeoError::Checkpoint(
                "layer inputs do not chain with the layer below".to_string(),
            ));
        }
        let predictor_inputs: Vec<Int2> = self.predictor.input_descs().iter().map(|i| i.size).collect();
        let channel_0 = self.predictor.channel_desc(0).map(|c| c.size);
        if predictor_inputs != [desc.size, feedback_size] || channel_0 != Some(input_size) {
            return Err(NeoError::Checkpoint(
                "layer predictor does not match the layer sizes".to_string(),
            ));
        }
        check_surface("additional errors", &self.additional_errors, input_size)?;
        check_surface("previous hidden state", &self.hidden_prev, desc.size)?;
        check_surface("previous feedback", &self.feedback_prev, feedback_size)?;
        check_surface("rewards", &self.rewards, desc.size)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn new<R: Rng + ?Sized>(
        desc: LayerDesc,
        input_size: Int2,
        feedback_size: Int2,
        extension: Option<&HierarchyExtension>,
        hierarchy: &HierarchyDesc,
        is_first: bool,
        rng: &mut R,
    ) -> NeoResult<Self> {
        let mut visible = vec![
            VisibleLayerDesc {
                size: input_size,
                radius: desc.feed_forward_radius,
                weight_alpha: desc.weight_alpha,
                weight_lambda: desc.trace_lambda,
                ignore_middle: false,
                use_traces: desc.use_traces,
                is_predictive_coding: false,
            },
            VisibleLayerDesc {
                size: desc.size,
                radius: desc.recurrent_radius,
                weight_alpha: desc.weight_alpha,
                weight_lambda: desc.trace_lambda,
                ignore_middle: true,
                use_traces: desc.use_traces,
                is_predictive_coding: false,
            },
        ];
        if desc.coder == CoderKind::Comparison {
            visible.push(VisibleLayerDesc {
                size: feedback_size,
                radius: desc.feedback_radius,
                weight_alpha: desc.weight_alpha,
                weight_lambda: desc.trace_lambda,
                ignore_middle: false,
                use_traces: desc.use_traces,
                is_predictive_coding: true,
            });
        }
        let mut channels = vec![PredictorChannelDesc {
            size: input_size,
            alpha: desc.prediction_alpha,
            thresholded: !is_first,
            reward_modulated: false,
        }];
        if let Some(ext) = extension {
            visible.extend(ext.inputs.iter().copied());
            channels.extend(ext.channels.iter().copied());
        }

        let coder = Coder::new(
            desc.coder,
            &visible,
            desc.coder_desc(hierarchy.init_threshold),
            hierarchy.init_weight_range,
            hierarchy.init_lateral_weight_range,
            rng,
        )?;
        let predictor = Predictor::new(
            &[
                PredictorInputDesc {
                    size: desc.size,
                    radius: desc.predictive_radius,
                },
                PredictorInputDesc {
                    size: feedback_size,
                    radius: desc.feedback_radius,
                },
            ],
            &channels,
            hierarchy.init_weight_range,
            rng,
        )?;
        Ok(Self {
            desc,
            coder,
            predictor,
            additional_errors: Array2::zeros(input_size.dim()),
            hidden_prev: Array2::zeros(desc.size.dim()),
            feedback_prev: Array2::zeros(feedback_size.dim()),
            rewards: Array2::zeros(desc.size.dim()),
        })
    }
}

/// Split `layers` around index `l`.
fn split_layer(layers: &mut [Layer], l: usize) -> (&[Layer], &mut Layer, &[Layer]) {
    let (below, rest) = layers.split_at_mut(l);
    let (layer, above) = rest.split_at_mut(1);
    (below, &mut layer[0], above)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredictiveHierarchy {
    desc: HierarchyDesc,
    extension: HierarchyExtension,
    layers: Vec<Layer>,
    whitener: Option<InputWhitener>,
    /// Layer 0 input of the current step, whitened when enabled
    visible_input: Array2<f32>,
    extension_inputs: Vec<Array2<f32>>,
    zero_sentinel: Array2<f32>,
    steps: u64,
}

impl PredictiveHierarchy {
    pub fn new<R: Rng + ?Sized>(desc: HierarchyDesc, rng: &mut R) -> NeoResult<Self> {
        Self::with_extension(desc, HierarchyExtension::default(), rng)
    }

    pub fn with_extension<R: Rng + ?Sized>(
        desc: HierarchyDesc,
        extension: HierarchyExtension,
        rng: &mut R,
    ) -> NeoResult<Self> {
        desc.validate()?;
        let mut layers = Vec::with_capacity(desc.layers.len());
        let mut input_size = desc.input_size;
        for (l, layer_desc) in desc.layers.iter().enumerate() {
            let feedback_size = desc
                .layers
                .get(l + 1)
                .map_or(ZERO_SENTINEL_SIZE, |_| layer_desc.size);
            let ext = (l == 0).then_some(&extension);
            layers.push(Layer::new(
                *layer_desc,
                input_size,
                feedback_size,
                ext,
                &desc,
                l == 0,
                rng,
            )?);
            input_size = layer_desc.size;
        }
        let whitener = desc.whitening.map(InputWhitener::new).transpose()?;
        log::info!(
            "Created hierarchy: input {}x{}, {} layers, whitening {}",
            desc.input_size.x,
            desc.input_size.y,
            layers.len(),
            if whitener.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            visible_input: Array2::zeros(desc.input_size.dim()),
            extension_inputs: extension
                .inputs
                .iter()
                .map(|i| Array2::zeros(i.size.dim()))
                .collect(),
            zero_sentinel: Array2::zeros(ZERO_SENTINEL_SIZE.dim()),
            desc,
            extension,
            layers,
            whitener,
            steps: 0,
        })
    }

    /// Full step: forward pass, then the learn pass when `learn` is set.
    pub fn sim_step(&mut self, ctx: &mut ComputeContext, input: &Array2<f32>, learn: bool) -> NeoResult<()> {
        self.forward(ctx, input, &[])?;
        if learn {
            self.learn(ctx, &[], Reinforcement::default())?;
        }
        Ok(())
    }

    /// Whitening, bottom-up encoding and top-down prediction.
    pub fn forward(
        &mut self,
        ctx: &mut ComputeContext,
        input: &Array2<f32>,
        extension_inputs: &[&Array2<f32>],
    ) -> NeoResult<()> {
        check_shape("input", input, self.desc.input_size)?;
        if extension_inputs.len() != self.extension.inputs.len() {
            return Err(NeoError::InvalidConfig(format!(
                "hierarchy expects {} extension inputs, got {}",
                self.extension.inputs.len(),
                extension_inputs.len()
            )));
        }
        for ((src, dst), desc) in extension_inputs
            .iter()
            .zip(self.extension_inputs.iter_mut())
            .zip(&self.extension.inputs)
        {
            check_shape("extension input", src, desc.size)?;
            ctx.copy("copy_extension_input", src, dst)?;
        }

        match &self.whitener {
            Some(w) => w.filter(ctx, input, &mut self.visible_input)?,
            None => ctx.copy("copy_input", input, &mut self.visible_input)?,
        }

        let n = self.layers.len();
        for l in 0..n {
            let (below, layer, above) = split_layer(&mut self.layers, l);
            let ff = below.last().map_or(&self.visible_input, |b| b.coder.hidden_states());
            let prior = above.first().map_or(&self.zero_sentinel, |a| a.predictor.prediction(0));
            ctx.copy("snapshot_hidden", layer.coder.hidden_states(), &mut layer.hidden_prev)?;
            ctx.copy("snapshot_feedback", prior, &mut layer.feedback_prev)?;

            let extension: &[Array2<f32>] = if l == 0 { &self.extension_inputs } else { &[] };
            let Layer {
                coder,
                hidden_prev,
                feedback_prev,
                ..
            } = layer;
            let mut inputs = vec![ff, &*hidden_prev];
            if coder.kind() == CoderKind::Comparison {
                inputs.push(&*feedback_prev);
            }
            inputs.extend(extension.iter());
            coder.activate(ctx, &inputs)?;
        }

        for l in (0..n).rev() {
            let (_, layer, above) = split_layer(&mut self.layers, l);
            let feedback = above.first().map_or(&self.zero_sentinel, |a| a.predictor.prediction(0));
            layer.predictor.predict(ctx, &[layer.coder.hidden_states(), feedback])?;
        }

        self.steps += 1;
        log::debug!("hierarchy step {} forward done", self.steps);
        Ok(())
    }

    /// Learn pass for the most recent [`forward`](Self::forward).
    ///
    /// `extension_targets` are the current values of the extension channels,
    /// in channel order.
    pub fn learn(
        &mut self,
        ctx: &mut ComputeContext,
        extension_targets: &[&Array2<f32>],
        reinforcement: Reinforcement,
    ) -> NeoResult<()> {
        if extension_targets.len() != self.extension.channels.len() {
            return Err(NeoError::InvalidConfig(format!(
                "hierarchy expects {} extension targets, got {}",
                self.extension.channels.len(),
                extension_targets.len()
            )));
        }
        for l in 0..self.layers.len() {
            let (below, layer, _) = split_layer(&mut self.layers, l);
            let ff = below.last().map_or(&self.visible_input, |b| b.coder.hidden_states());

            let extension: &[Array2<f32>] = if l == 0 { &self.extension_inputs } else { &[] };
            let Layer {
                coder,
                predictor,
                hidden_prev,
                feedback_prev,
                additional_errors,
                rewards,
                ..
            } = layer;
            let rewards = match reinforcement.encoder_reward {
                Some(r) => {
                    ctx.fill("fill_rewards", rewards, r)?;
                    Some(&*rewards)
                }
                None => None,
            };
            let mut inputs = vec![ff, &*hidden_prev];
            if coder.kind() == CoderKind::Comparison {
                inputs.push(&*feedback_prev);
            }
            inputs.extend(extension.iter());
            coder.learn(ctx, &inputs, rewards)?;

            let mut targets = vec![ff];
            if l == 0 {
                targets.extend_from_slice(extension_targets);
            }
            predictor.learn(ctx, &targets, Some(&*additional_errors), reinforcement.td_error)?;
        }
        log::debug!("hierarchy step {} learn done", self.steps);
        Ok(())
    }

    /// Forget the temporal context at an episode boundary: every layer's
    /// hidden code, predictions and snapshots go to zero. Weights,
    /// thresholds and biases are kept.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        for layer in &mut self.layers {
            layer.clear_memory(ctx)?;
        }
        ctx.fill("clear_visible_input", &mut self.visible_input, 0.0)?;
        for input in &mut self.extension_inputs {
            ctx.fill("clear_extension_input", input, 0.0)?;
        }
        log::debug!("hierarchy memory cleared at step {}", self.steps);
        Ok(())
    }

    /// Check a deserialized hierarchy: every layer, buffer and snapshot must
    /// match the sizes its descriptor implies.
    pub fn validate_state(&self) -> NeoResult<()> {
        self.desc.validate()?;
        if self.layers.len() != self.desc.layers.len() {
            return Err(NeoError::Checkpoint(format!(
                "descriptor lists {} layers but {} are stored",
                self.desc.layers.len(),
                self.layers.len()
            )));
        }
        let mut input_size = self.desc.input_size;
        for (l, (layer, desc)) in self.layers.iter().zip(&self.desc.layers).enumerate() {
            let feedback_size = self
                .desc
                .layers
                .get(l + 1)
                .map_or(ZERO_SENTINEL_SIZE, |_| desc.size);
            layer.validate_state(desc, input_size, feedback_size)?;
            input_size = desc.size;
        }

        let first = &self.layers[0];
        let base_inputs = if first.desc.coder == CoderKind::Comparison { 3 } else { 2 };
        if first.coder.visible_layers().len() != base_inputs + self.extension.inputs.len()
            || first.predictor.num_channels() != 1 + self.extension.channels.len()
            || self.extension_inputs.len() != self.extension.inputs.len()
        {
            return Err(NeoError::Checkpoint(
                "first layer does not match the hierarchy extension".to_string(),
            ));
        }
        for (input, desc) in self.extension_inputs.iter().zip(&self.extension.inputs) {
            check_surface("extension input", input, desc.size)?;
        }
        check_surface("visible input", &self.visible_input, self.desc.input_size)?;
        check_surface("zero sentinel", &self.zero_sentinel, ZERO_SENTINEL_SIZE)?;
        if self.whitener.as_ref().map(|w| *w.desc()) != self.desc.whitening {
            return Err(NeoError::Checkpoint(
                "whitener does not match the whitening descriptor".to_string(),
            ));
        }
        Ok(())
    }

    pub fn desc(&self) -> &HierarchyDesc {
        &self.desc
    }

    pub fn input_size(&self) -> Int2 {
        self.desc.input_size
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// # Panics
    /// If `index` is out of range.
    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Prediction of the next input.
    pub fn prediction(&self) -> &Array2<f32> {
        self.layers[0].prediction()
    }

    /// Prediction of extension channel `index` (after the input channel).
    pub fn extension_prediction(&self, index: usize) -> NeoResult<&Array2<f32>> {
        let channel = index + 1;
        if channel >= self.layers[0].predictor.num_channels() {
            return Err(NeoError::InvalidConfig(format!(
                "no extension channel with index {index}"
            )));
        }
        Ok(self.layers[0].predictor.prediction(channel))
    }

    /// Input seen by layer 0 on the last step.
    pub fn visible_input(&self) -> &Array2<f32> {
        &self.visible_input
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::random_surface;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn three_layer_desc(kind: CoderKind) -> HierarchyDesc {
        HierarchyDesc {
            input_size: Int2::new(16, 16),
            layers: vec![
                LayerDesc {
                    size: Int2::new(12, 12),
                    coder: kind,
                    ..Default::default()
                },
                LayerDesc {
                    size: Int2::new(8, 8),
                    coder: kind,
                    ..Default::default()
                },
                LayerDesc {
                    size: Int2::new(4, 4),
                    coder: kind,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_layer_shapes_chain() {
        let mut rng = StdRng::seed_from_u64(1);
        let h = PredictiveHierarchy::new(three_layer_desc(CoderKind::Comparison), &mut rng).unwrap();
        assert_eq!(h.layer(0).coder().visible_layers()[0].desc().size, Int2::new(16, 16));
        assert_eq!(h.layer(1).coder().visible_layers()[0].desc().size, Int2::new(12, 12));
        assert_eq!(h.layer(0).feedback_size(), Int2::new(12, 12));
        assert_eq!(h.layer(1).feedback_size(), Int2::new(8, 8));
        assert_eq!(h.layer(2).feedback_size(), ZERO_SENTINEL_SIZE);
        assert_eq!(h.layer(1).prediction().dim(), (12, 12));
    }

    #[test]
    fn test_step_runs_for_both_coders() {
        for kind in [CoderKind::Sparse, CoderKind::Comparison] {
            let mut rng = StdRng::seed_from_u64(2);
            let mut ctx = ComputeContext::new();
            let mut h = PredictiveHierarchy::new(three_layer_desc(kind), &mut rng).unwrap();
            for _ in 0..5 {
                let input = random_surface(Int2::new(16, 16), (0.0, 1.0), &mut rng).unwrap();
                h.sim_step(&mut ctx, &input, true).unwrap();
            }
            assert_eq!(h.steps(), 5);
            assert_eq!(h.prediction().dim(), (16, 16));
            assert!(h.prediction().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_intermediate_predictions_are_binary() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ctx = ComputeContext::new();
        let mut h = PredictiveHierarchy::new(three_layer_desc(CoderKind::Comparison), &mut rng).unwrap();
        let input = random_surface(Int2::new(16, 16), (0.0, 1.0), &mut rng).unwrap();
        h.sim_step(&mut ctx, &input, true).unwrap();
        assert!(h.layer(1).prediction().iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_wrong_input_shape_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut ctx = ComputeContext::new();
        let mut h = PredictiveHierarchy::new(three_layer_desc(CoderKind::Sparse), &mut rng).unwrap();
        let err = h.sim_step(&mut ctx, &Array2::zeros((8, 8)), false).unwrap_err();
        assert!(matches!(err, NeoError::ShapeMismatch { .. }));
        assert_eq!(h.steps(), 0);
    }

    #[test]
    fn test_empty_hierarchy_rejected_before_any_launch() {
        let mut rng = StdRng::seed_from_u64(5);
        let desc = HierarchyDesc {
            layers: vec![],
            ..Default::default()
        };
        assert!(matches!(
            PredictiveHierarchy::new(desc, &mut rng),
            Err(NeoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_input_prediction_improves_on_repeating_sequence() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut ctx = ComputeContext::new();
        let desc = HierarchyDesc {
            input_size: Int2::new(8, 8),
            layers: vec![LayerDesc {
                prediction_alpha: 0.02,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut h = PredictiveHierarchy::new(desc, &mut rng).unwrap();
        let frames: Vec<Array2<f32>> = (0..2)
            .map(|i| Array2::from_shape_fn((8, 8), |(x, _)| if x % 2 == i { 1.0 } else { 0.0 }))
            .collect();
        let error_at = |h: &PredictiveHierarchy, next: &Array2<f32>| {
            (h.prediction() - next).mapv(|v| v * v).mean().unwrap_or(0.0)
        };
        let mut early = 0.0;
        let mut late = 0.0;
        for t in 0..400 {
            h.sim_step(&mut ctx, &frames[t % 2], true).unwrap();
            let e = error_at(&h, &frames[(t + 1) % 2]);
            if t < 20 {
                early += e;
            } else if t >= 380 {
                late += e;
            }
        }
        assert!(late < early, "late {late} early {early}");
    }

    #[test]
    fn test_clear_memory_forgets_context_keeps_weights() {
        for kind in [CoderKind::Sparse, CoderKind::Comparison] {
            let mut rng = StdRng::seed_from_u64(8);
            let mut ctx = ComputeContext::new();
            let mut h = PredictiveHierarchy::new(three_layer_desc(kind), &mut rng).unwrap();
            for _ in 0..5 {
                let input = random_surface(Int2::new(16, 16), (0.0, 1.0), &mut rng).unwrap();
                h.sim_step(&mut ctx, &input, true).unwrap();
            }
            let weights: Vec<_> = h
                .layers()
                .iter()
                .map(|l| l.coder().visible_layer(0).unwrap().weights().clone())
                .collect();

            h.clear_memory(&mut ctx).unwrap();
            for (layer, w) in h.layers().iter().zip(&weights) {
                assert!(layer.hidden_states().iter().all(|&s| s == 0.0));
                assert!(layer.prediction().iter().all(|&v| v == 0.0));
                assert!(layer.hidden_prev.iter().all(|&v| v == 0.0));
                assert!(layer.feedback_prev.iter().all(|&v| v == 0.0));
                assert_eq!(layer.coder().visible_layer(0).unwrap().weights(), w);
            }
            assert_eq!(h.steps(), 5);
            h.validate_state().unwrap();

            // Stepping continues normally after the boundary.
            let input = random_surface(Int2::new(16, 16), (0.0, 1.0), &mut rng).unwrap();
            h.sim_step(&mut ctx, &input, true).unwrap();
            assert!(h.prediction().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_validate_state_rejects_foreign_layer() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut h = PredictiveHierarchy::new(three_layer_desc(CoderKind::Comparison), &mut rng).unwrap();
        h.validate_state().unwrap();
        let other = PredictiveHierarchy::new(HierarchyDesc::default(), &mut rng).unwrap();
        h.layers[1] = other.layers[0].clone();
        assert!(matches!(h.validate_state(), Err(NeoError::Checkpoint(_))));
    }

    #[test]
    fn test_negative_lateral_init_rejected() {
        let mut rng = StdRng::seed_from_u64(10);
        let desc = HierarchyDesc {
            init_lateral_weight_range: (-0.05, -0.01),
            ..Default::default()
        };
        assert!(matches!(
            PredictiveHierarchy::new(desc, &mut rng),
            Err(NeoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_whitening_feeds_first_layer() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ctx = ComputeContext::new();
        let desc = HierarchyDesc {
            whitening: Some(WhiteningDesc::default()),
            ..Default::default()
        };
        let mut h = PredictiveHierarchy::new(desc, &mut rng).unwrap();
        let input = Array2::from_elem((8, 8), 0.4);
        h.sim_step(&mut ctx, &input, false).unwrap();
        assert!(h.visible_input().iter().all(|v| v.abs() < 1e-2));
    }
}
