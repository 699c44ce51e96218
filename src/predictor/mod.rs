//! Decoder from a layer's hidden code to next-step predictions.
//!
//! A predictor reads a fixed list of inputs (the layer's own hidden state and
//! its feedback) and writes one prediction surface per output channel. Each
//! (channel, input) pair owns a weight tensor over the output grid. Learning
//! trains the prediction made on the previous step, from the inputs that
//! produced it, against the channel's value on the current step.

use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::compute::kernels::{self, at, lane, FieldGeometry};
use crate::compute::ComputeContext;
use crate::core::{
    check_shape, check_size, check_stored, random_weights, weight_shape, DoubleBuffer, Int2, NeoError,
    NeoResult,
};

/// One input surface of a predictor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictorInputDesc {
    pub size: Int2,
    pub radius: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictorChannelDesc {
    pub size: Int2,
    pub alpha: f32,
    /// Emit `1` where the prediction exceeds 0.5, else `0`
    pub thresholded: bool,
    /// Only learn from steps with a positive TD error
    pub reward_modulated: bool,
}

impl PredictorChannelDesc {
    pub fn new(size: Int2, alpha: f32) -> Self {
        Self {
            size,
            alpha,
            thresholded: false,
            reward_modulated: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Channel {
    desc: PredictorChannelDesc,
    geometries: Vec<FieldGeometry>,
    weights: Vec<DoubleBuffer<Array3<f32>>>,
    predictions: DoubleBuffer<Array2<f32>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Predictor {
    inputs: Vec<PredictorInputDesc>,
    channels: Vec<Channel>,
    inputs_current: Vec<Array2<f32>>,
    inputs_prev: Vec<Array2<f32>>,
}

impl Predictor {
    pub fn new<R: Rng + ?Sized>(
        inputs: &[PredictorInputDesc],
        channels: &[PredictorChannelDesc],
        init_weight_range: (f32, f32),
        rng: &mut R,
    ) -> NeoResult<Self> {
        if inputs.is_empty() || channels.is_empty() {
            return Err(NeoError::InvalidConfig(
                "predictor needs at least one input and one channel".to_string(),
            ));
        }
        for input in inputs {
            check_size("predictor input size", input.size)?;
            if input.radius < 0 {
                return Err(NeoError::InvalidConfig(format!(
                    "predictor radius must be non-negative, got {}",
                    input.radius
                )));
            }
        }
        let channels = channels
            .iter()
            .map(|desc| -> NeoResult<Channel> {
                check_size("predictor channel size", desc.size)?;
                let geometries = inputs
                    .iter()
                    .map(|i| FieldGeometry::new(i.size, desc.size, i.radius))
                    .collect();
                let weights = inputs
                    .iter()
                    .map(|i| {
                        random_weights(desc.size, i.radius, init_weight_range, rng).map(DoubleBuffer::new)
                    })
                    .collect::<NeoResult<Vec<_>>>()?;
                Ok(Channel {
                    desc: *desc,
                    geometries,
                    weights,
                    predictions: DoubleBuffer::zeros(desc.size.dim()),
                })
            })
            .collect::<NeoResult<Vec<_>>>()?;
        let snapshots: Vec<Array2<f32>> = inputs.iter().map(|i| Array2::zeros(i.size.dim())).collect();
        Ok(Self {
            inputs: inputs.to_vec(),
            channels,
            inputs_current: snapshots.clone(),
            inputs_prev: snapshots,
        })
    }

    /// Predict every channel from `inputs`.
    pub fn predict(&mut self, ctx: &mut ComputeContext, inputs: &[&Array2<f32>]) -> NeoResult<()> {
        if inputs.len() != self.inputs.len() {
            return Err(NeoError::InvalidConfig(format!(
                "predictor has {} inputs but {} were supplied",
                self.inputs.len(),
                inputs.len()
            )));
        }
        for (i, (desc, input)) in self.inputs.iter().zip(inputs).enumerate() {
            check_shape(&format!("predictor input {i}"), input, desc.size)?;
        }

        std::mem::swap(&mut self.inputs_prev, &mut self.inputs_current);
        for (input, snapshot) in inputs.iter().zip(self.inputs_current.iter_mut()) {
            ctx.copy("snapshot_inputs", input, snapshot)?;
        }

        for channel in &mut self.channels {
            let geometries = &channel.geometries;
            let weights: Vec<&Array3<f32>> = channel.weights.iter().map(DoubleBuffer::read).collect();
            let thresholded = channel.desc.thresholded;
            ctx.launch_2d("predict", channel.predictions.write_target(), |v| {
                let mut sum = 0.0;
                for ((geom, w), input) in geometries.iter().zip(&weights).zip(inputs) {
                    sum += kernels::field_sum(v, geom, input, w, false);
                }
                if thresholded {
                    if sum > 0.5 {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    sum
                }
            })?;
            channel.predictions.swap();
        }
        Ok(())
    }

    /// Train the previous step's predictions toward `targets`, one per
    /// channel. `additional_error` is added to channel 0's error;
    /// reward-modulated channels skip the update unless `td_error > 0`.
    pub fn learn(
        &mut self,
        ctx: &mut ComputeContext,
        targets: &[&Array2<f32>],
        additional_error: Option<&Array2<f32>>,
        td_error: f32,
    ) -> NeoResult<()> {
        if targets.len() != self.channels.len() {
            return Err(NeoError::InvalidConfig(format!(
                "predictor has {} channels but {} targets were supplied",
                self.channels.len(),
                targets.len()
            )));
        }
        for (c, (channel, target)) in self.channels.iter_mut().zip(targets).enumerate() {
            check_shape(&format!("prediction target {c}"), target, channel.desc.size)?;
            if channel.desc.reward_modulated && td_error <= 0.0 {
                continue;
            }
            let extra = if c == 0 { additional_error } else { None };
            if let Some(extra) = extra {
                check_shape("additional error", extra, channel.desc.size)?;
            }

            let previous = channel.predictions.previous();
            let mut error = Array2::zeros(channel.desc.size.dim());
            ctx.launch_2d("predictor_error", &mut error, |v| {
                at(target, v) - at(previous, v) + extra.map_or(0.0, |e| at(e, v))
            })?;

            let alpha = channel.desc.alpha;
            for ((geom, weights), input) in channel
                .geometries
                .iter()
                .zip(channel.weights.iter_mut())
                .zip(&self.inputs_prev)
            {
                let (back, front) = weights.split();
                ctx.launch_fields("learn_predictor", front, |v, out| {
                    kernels::learn_delta(v, geom, input, at(&error, v), lane(back, v), out, alpha, false)
                })?;
                weights.swap();
            }
        }
        Ok(())
    }

    /// Zero every prediction and both input snapshots. Weights are kept.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        for channel in &mut self.channels {
            ctx.fill("clear_predictions", channel.predictions.read_mut(), 0.0)?;
            ctx.fill("clear_predictions", channel.predictions.write_target(), 0.0)?;
        }
        for snapshot in self.inputs_current.iter_mut().chain(self.inputs_prev.iter_mut()) {
            ctx.fill("clear_snapshots", snapshot, 0.0)?;
        }
        Ok(())
    }

    /// Check a deserialized predictor: every channel has one weight tensor
    /// per input, and every surface matches its descriptor.
    pub fn validate_state(&self) -> NeoResult<()> {
        if self.inputs.is_empty() || self.channels.is_empty() {
            return Err(NeoError::Checkpoint(
                "predictor needs at least one input and one channel".to_string(),
            ));
        }
        let n = self.inputs.len();
        if self.inputs_current.len() != n || self.inputs_prev.len() != n {
            return Err(NeoError::Checkpoint(format!(
                "predictor has {n} inputs but snapshots for {} and {}",
                self.inputs_current.len(),
                self.inputs_prev.len()
            )));
        }
        for (desc, (current, prev)) in self
            .inputs
            .iter()
            .zip(self.inputs_current.iter().zip(&self.inputs_prev))
        {
            check_size("predictor input size", desc.size)?;
            check_stored("predictor input snapshot", current.shape(), &desc.size.shape())?;
            check_stored("predictor input snapshot", prev.shape(), &desc.size.shape())?;
        }
        for channel in &self.channels {
            check_size("predictor channel size", channel.desc.size)?;
            if channel.weights.len() != n || channel.geometries.len() != n {
                return Err(NeoError::Checkpoint(format!(
                    "predictor channel holds {} weight tensors for {n} inputs",
                    channel.weights.len()
                )));
            }
            channel
                .predictions
                .check_layout("predictions", &channel.desc.size.shape())?;
            for ((input, geom), weights) in self
                .inputs
                .iter()
                .zip(&channel.geometries)
                .zip(&channel.weights)
            {
                if !geom.matches(input.size, channel.desc.size, input.radius) {
                    return Err(NeoError::Checkpoint(
                        "predictor geometry does not match its sizes".to_string(),
                    ));
                }
                weights.check_layout("predictor weights", &weight_shape(channel.desc.size, input.radius))?;
            }
        }
        Ok(())
    }

    /// Latest prediction of `channel`.
    ///
    /// # Panics
    /// If `channel` is not a channel of this predictor.
    pub fn prediction(&self, channel: usize) -> &Array2<f32> {
        self.channels[channel].predictions.read()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_desc(&self, channel: usize) -> Option<&PredictorChannelDesc> {
        self.channels.get(channel).map(|c| &c.desc)
    }

    pub fn input_descs(&self) -> &[PredictorInputDesc] {
        &self.inputs
    }

    pub fn weights(&self, channel: usize, input: usize) -> Option<&Array3<f32>> {
        self.channels
            .get(channel)
            .and_then(|c| c.weights.get(input))
            .map(DoubleBuffer::read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn single(channel: PredictorChannelDesc) -> Predictor {
        let mut rng = StdRng::seed_from_u64(21);
        let inputs = [PredictorInputDesc {
            size: Int2::new(2, 2),
            radius: 1,
        }];
        Predictor::new(&inputs, &[channel], (-0.01, 0.01), &mut rng).unwrap()
    }

    #[test]
    fn test_learns_constant_target() {
        let mut p = single(PredictorChannelDesc::new(Int2::new(2, 2), 0.05));
        let mut ctx = ComputeContext::new();
        let input = Array2::ones((2, 2));
        let target = Array2::from_elem((2, 2), 0.5);
        for _ in 0..100 {
            p.predict(&mut ctx, &[&input]).unwrap();
            p.learn(&mut ctx, &[&target], None, 0.0).unwrap();
        }
        p.predict(&mut ctx, &[&input]).unwrap();
        for &v in p.prediction(0).iter() {
            assert_abs_diff_eq!(v, 0.5, epsilon = 0.02);
        }
    }

    #[test]
    fn test_additional_error_shifts_fixed_point() {
        let mut p = single(PredictorChannelDesc::new(Int2::new(2, 2), 0.05));
        let mut ctx = ComputeContext::new();
        let input = Array2::ones((2, 2));
        let target = Array2::from_elem((2, 2), 0.5);
        let extra = Array2::from_elem((2, 2), 0.25);
        for _ in 0..150 {
            p.predict(&mut ctx, &[&input]).unwrap();
            p.learn(&mut ctx, &[&target], Some(&extra), 0.0).unwrap();
        }
        p.predict(&mut ctx, &[&input]).unwrap();
        assert_abs_diff_eq!(p.prediction(0)[[1, 1]], 0.75, epsilon = 0.02);
    }

    #[test]
    fn test_reward_modulated_waits_for_positive_td() {
        let mut desc = PredictorChannelDesc::new(Int2::new(2, 2), 0.1);
        desc.reward_modulated = true;
        let mut p = single(desc);
        let mut ctx = ComputeContext::new();
        let input = Array2::ones((2, 2));
        let target = Array2::ones((2, 2));
        p.predict(&mut ctx, &[&input]).unwrap();
        p.predict(&mut ctx, &[&input]).unwrap();
        let before = p.weights(0, 0).unwrap().clone();

        p.learn(&mut ctx, &[&target], None, -0.5).unwrap();
        assert_eq!(p.weights(0, 0).unwrap(), &before);

        p.learn(&mut ctx, &[&target], None, 0.5).unwrap();
        assert!(p.weights(0, 0).unwrap().sum() > before.sum());
    }

    #[test]
    fn test_thresholded_output_is_binary() {
        let mut desc = PredictorChannelDesc::new(Int2::new(2, 2), 0.1);
        desc.thresholded = true;
        let mut p = single(desc);
        let mut ctx = ComputeContext::new();
        let input = Array2::ones((2, 2));
        p.predict(&mut ctx, &[&input]).unwrap();
        assert!(p.prediction(0).iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_clear_memory_zeroes_predictions() {
        let mut p = single(PredictorChannelDesc::new(Int2::new(2, 2), 0.1));
        let mut ctx = ComputeContext::new();
        let input = Array2::ones((2, 2));
        p.predict(&mut ctx, &[&input]).unwrap();
        p.predict(&mut ctx, &[&input]).unwrap();
        let weights = p.weights(0, 0).unwrap().clone();
        assert!(p.prediction(0).iter().any(|&v| v != 0.0));

        p.clear_memory(&mut ctx).unwrap();
        assert!(p.prediction(0).iter().all(|&v| v == 0.0));
        assert_eq!(p.weights(0, 0).unwrap(), &weights);
        // Learning right after a clear trains from the zeroed snapshot.
        p.learn(&mut ctx, &[&input], None, 0.0).unwrap();
        assert_eq!(p.weights(0, 0).unwrap(), &weights);
        p.validate_state().unwrap();
    }

    #[test]
    fn test_target_shape_checked() {
        let mut p = single(PredictorChannelDesc::new(Int2::new(2, 2), 0.1));
        let mut ctx = ComputeContext::new();
        let bad = Array2::zeros((3, 3));
        let err = p.learn(&mut ctx, &[&bad], None, 0.0).unwrap_err();
        assert!(matches!(err, NeoError::ShapeMismatch { .. }));
    }
}
