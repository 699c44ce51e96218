//! Comparison sparse coder.
//!
//! Visible layers feed one of two paths. Ordinary inputs accumulate on the
//! activation path, starting from the per-unit biases; inputs flagged
//! `is_predictive_coding` (top-down priors) accumulate on the prediction
//! path, starting from zero. The hidden state is a binary local
//! k-winners-take-all over the sum of both paths.

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::coder::{check_inputs, check_rewards, reward_at, CoderDesc, VisibleLayer, VisibleLayerDesc};
use crate::compute::kernels::{self, at, lane};
use crate::compute::ComputeContext;
use crate::core::{DoubleBuffer, Int2, NeoError, NeoResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComparisonCoder {
    desc: CoderDesc,
    visible_layers: Vec<VisibleLayer>,
    activation_sums: DoubleBuffer<Array2<f32>>,
    prediction_sums: DoubleBuffer<Array2<f32>>,
    states: DoubleBuffer<Array2<f32>>,
    biases: DoubleBuffer<Array2<f32>>,
}

impl ComparisonCoder {
    pub fn new<R: Rng + ?Sized>(
        visible_descs: &[VisibleLayerDesc],
        desc: CoderDesc,
        init_weight_range: (f32, f32),
        rng: &mut R,
    ) -> NeoResult<Self> {
        desc.validate()?;
        let visible_layers = visible_descs
            .iter()
            .map(|vld| VisibleLayer::new(*vld, desc.hidden_size, init_weight_range, rng))
            .collect::<NeoResult<Vec<_>>>()?;
        let dim = desc.hidden_size.dim();
        Ok(Self {
            desc,
            visible_layers,
            activation_sums: DoubleBuffer::zeros(dim),
            prediction_sums: DoubleBuffer::zeros(dim),
            states: DoubleBuffer::zeros(dim),
            biases: DoubleBuffer::zeros(dim),
        })
    }

    pub fn activate(&mut self, ctx: &mut ComputeContext, inputs: &[&Array2<f32>]) -> NeoResult<()> {
        check_inputs(&self.visible_layers, inputs)?;

        ctx.copy(
            "init_activation_sums",
            self.biases.read(),
            self.activation_sums.read_mut(),
        )?;
        ctx.fill("clear_prediction_sums", self.prediction_sums.read_mut(), 0.0)?;

        for (vl, input) in self.visible_layers.iter().zip(inputs) {
            let path = if vl.desc.is_predictive_coding {
                &mut self.prediction_sums
            } else {
                &mut self.activation_sums
            };
            vl.accumulate(ctx, input, path)?;
        }

        let size = self.desc.hidden_size;
        let radius = self.desc.lateral_radius;
        let rho = self.desc.active_ratio;
        let activation = self.activation_sums.read();
        let prediction = self.prediction_sums.read();
        ctx.launch_2d("solve_hidden", self.states.write_target(), |h| {
            kernels::local_wta(h, size, radius, activation, prediction, rho)
        })?;
        self.states.swap();
        Ok(())
    }

    pub fn learn(
        &mut self,
        ctx: &mut ComputeContext,
        inputs: &[&Array2<f32>],
        rewards: Option<&Array2<f32>>,
    ) -> NeoResult<()> {
        check_inputs(&self.visible_layers, inputs)?;
        check_rewards(rewards, self.desc.hidden_size)?;
        let states = self.states.read();
        let prediction = self.prediction_sums.read();
        let rho = self.desc.active_ratio;

        let bias_alpha = self.desc.threshold_alpha;
        let (b_back, b_front) = self.biases.split();
        ctx.launch_2d("learn_biases", b_front, |h| {
            at(b_back, h) + bias_alpha * (rho - at(states, h))
        })?;
        self.biases.swap();

        for (vl, input) in self.visible_layers.iter_mut().zip(inputs) {
            let geom = vl.geometry;
            let alpha = vl.desc.weight_alpha;
            let lambda = vl.desc.weight_lambda;
            let ignore_middle = vl.desc.ignore_middle;
            let predictive = vl.desc.is_predictive_coding;
            let error = |h: Int2| at(states, h) - at(prediction, h);
            match (vl.traces.as_mut(), predictive) {
                (None, false) => {
                    let (back, front) = vl.weights.split();
                    ctx.launch_fields("learn_weights_activation", front, |h, out| {
                        kernels::learn_instar(h, &geom, input, at(states, h), rho, lane(back, h), out, alpha)
                    })?;
                }
                (None, true) => {
                    let (back, front) = vl.weights.split();
                    ctx.launch_fields("learn_weights_prediction", front, |h, out| {
                        kernels::learn_delta(
                            h,
                            &geom,
                            input,
                            error(h),
                            lane(back, h),
                            out,
                            alpha,
                            ignore_middle,
                        )
                    })?;
                }
                (Some(traces), false) => {
                    let (w_back, w_front) = vl.weights.split();
                    let (t_back, t_front) = traces.split();
                    ctx.launch_fields2(
                        "learn_weights_traces_activation",
                        w_front,
                        t_front,
                        |h, w_out, t_out| {
                            kernels::learn_instar_traces(
                                h,
                                &geom,
                                input,
                                at(states, h),
                                rho,
                                reward_at(rewards, h),
                                lane(w_back, h),
                                lane(t_back, h),
                                w_out,
                                t_out,
                                alpha,
                                lambda,
                            )
                        },
                    )?;
                    traces.swap();
                }
                (Some(traces), true) => {
                    let (w_back, w_front) = vl.weights.split();
                    let (t_back, t_front) = traces.split();
                    ctx.launch_fields2(
                        "learn_weights_traces_prediction",
                        w_front,
                        t_front,
                        |h, w_out, t_out| {
                            kernels::learn_delta_traces(
                                h,
                                &geom,
                                input,
                                error(h),
                                reward_at(rewards, h),
                                lane(w_back, h),
                                lane(t_back, h),
                                w_out,
                                t_out,
                                alpha,
                                lambda,
                                ignore_middle,
                            )
                        },
                    )?;
                    traces.swap();
                }
            }
            vl.weights.swap();
        }
        Ok(())
    }

    /// Binary hidden code of the last activation.
    pub fn hidden_states(&self) -> &Array2<f32> {
        self.states.read()
    }

    pub fn biases(&self) -> &Array2<f32> {
        self.biases.read()
    }

    /// Prediction-path sums of the last activation.
    pub fn prediction_sums(&self) -> &Array2<f32> {
        self.prediction_sums.read()
    }

    /// Zero the hidden code and both accumulation paths. Biases and weights
    /// are kept.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        for (kernel, buffer) in [
            ("clear_activation_sums", &mut self.activation_sums),
            ("clear_prediction_sums", &mut self.prediction_sums),
            ("clear_states", &mut self.states),
        ] {
            ctx.fill(kernel, buffer.read_mut(), 0.0)?;
            ctx.fill(kernel, buffer.write_target(), 0.0)?;
        }
        Ok(())
    }

    pub fn validate_state(&self) -> NeoResult<()> {
        self.desc.validate()?;
        let hidden = self.desc.hidden_size.shape();
        for (what, buffer) in [
            ("activation sums", &self.activation_sums),
            ("prediction sums", &self.prediction_sums),
            ("hidden states", &self.states),
            ("biases", &self.biases),
        ] {
            buffer.check_layout(what, &hidden)?;
        }
        if self.visible_layers.is_empty() {
            return Err(NeoError::Checkpoint("coder has no visible layers".to_string()));
        }
        for vl in &self.visible_layers {
            vl.validate_state(self.desc.hidden_size)?;
        }
        Ok(())
    }

    pub fn desc(&self) -> &CoderDesc {
        &self.desc
    }

    pub fn visible_layers(&self) -> &[VisibleLayer] {
        &self.visible_layers
    }
}
