//! Spiking sparse coder with lateral inhibition.
//!
//! Activation accumulates the windowed field sums of every visible layer,
//! then settles the hidden layer for a fixed number of iterations. Each
//! iteration integrates the feed-forward sum and the lateral term with leak,
//! emits a spike where the activation crosses the unit's threshold and folds
//! the spike into the running rate with weight `1 / (1 + i)`. A unit whose
//! settled rate exceeds [`ACTIVE_RATE_CUTOFF`] is active: the hidden state
//! is the binary code of active units.
//!
//! Learning moves each threshold until the unit is active on an
//! `active_ratio` share of steps, pulls the fields of active units toward
//! the input pattern centered on the active ratio and relaxes the
//! inhibition between co-active units.

use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::coder::{check_inputs, check_rewards, reward_at, CoderDesc, VisibleLayer, VisibleLayerDesc};
use crate::compute::kernels::{self, at, lane, ACTIVE_RATE_CUTOFF};
use crate::compute::ComputeContext;
use crate::core::{random_weights, weight_shape, DoubleBuffer, NeoResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SparseCoder {
    desc: CoderDesc,
    visible_layers: Vec<VisibleLayer>,
    summation: DoubleBuffer<Array2<f32>>,
    spikes: DoubleBuffer<Array2<f32>>,
    activations: DoubleBuffer<Array2<f32>>,
    rates: DoubleBuffer<Array2<f32>>,
    states: DoubleBuffer<Array2<f32>>,
    thresholds: DoubleBuffer<Array2<f32>>,
    lateral_weights: DoubleBuffer<Array3<f32>>,
}

impl SparseCoder {
    pub fn new<R: Rng + ?Sized>(
        visible_descs: &[VisibleLayerDesc],
        desc: CoderDesc,
        init_weight_range: (f32, f32),
        init_lateral_weight_range: (f32, f32),
        rng: &mut R,
    ) -> NeoResult<Self> {
        desc.validate()?;
        let visible_layers = visible_descs
            .iter()
            .map(|vld| VisibleLayer::new(*vld, desc.hidden_size, init_weight_range, rng))
            .collect::<NeoResult<Vec<_>>>()?;
        let dim = desc.hidden_size.dim();
        let lateral = random_weights(
            desc.hidden_size,
            desc.lateral_radius,
            init_lateral_weight_range,
            rng,
        )?;
        Ok(Self {
            desc,
            visible_layers,
            summation: DoubleBuffer::zeros(dim),
            spikes: DoubleBuffer::zeros(dim),
            activations: DoubleBuffer::zeros(dim),
            rates: DoubleBuffer::zeros(dim),
            states: DoubleBuffer::zeros(dim),
            thresholds: DoubleBuffer::new(Array2::from_elem(dim, desc.init_threshold)),
            lateral_weights: DoubleBuffer::new(lateral),
        })
    }

    pub fn activate(&mut self, ctx: &mut ComputeContext, inputs: &[&Array2<f32>]) -> NeoResult<()> {
        check_inputs(&self.visible_layers, inputs)?;

        ctx.fill("clear_summation", self.summation.read_mut(), 0.0)?;
        for (vl, input) in self.visible_layers.iter().zip(inputs) {
            vl.accumulate(ctx, input, &mut self.summation)?;
        }

        ctx.fill("clear_spikes", self.spikes.read_mut(), 0.0)?;
        ctx.fill("clear_activations", self.activations.read_mut(), 0.0)?;
        ctx.fill("clear_rates", self.rates.read_mut(), 0.0)?;

        let size = self.desc.hidden_size;
        let lateral_radius = self.desc.lateral_radius;
        let leak = self.desc.leak;
        for iter in 0..self.desc.iterations {
            let scale = 1.0 / (1.0 + iter as f32);
            let summation = self.summation.read();
            let thresholds = self.thresholds.read();
            let lateral = self.lateral_weights.read();
            let (spikes_back, spikes_front) = self.spikes.split();
            let (act_back, act_front) = self.activations.split();
            let (rates_back, rates_front) = self.rates.split();
            ctx.launch_2d3("solve_hidden", spikes_front, act_front, rates_front, |h| {
                kernels::solve_spiking(
                    h,
                    size,
                    lateral_radius,
                    summation,
                    spikes_back,
                    act_back,
                    rates_back,
                    thresholds,
                    lateral,
                    leak,
                    scale,
                )
            })?;
            self.spikes.swap();
            self.activations.swap();
            self.rates.swap();
        }

        let rates = self.rates.read();
        ctx.launch_2d("binarize_hidden", self.states.write_target(), |h| {
            if at(rates, h) > ACTIVE_RATE_CUTOFF {
                1.0
            } else {
                0.0
            }
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
        let rho = self.desc.active_ratio;

        let alpha = self.desc.threshold_alpha;
        let (th_back, th_front) = self.thresholds.split();
        ctx.launch_2d("learn_thresholds", th_front, |h| {
            at(th_back, h) + alpha * (at(states, h) - rho)
        })?;
        self.thresholds.swap();

        for (vl, input) in self.visible_layers.iter_mut().zip(inputs) {
            let geom = vl.geometry;
            let alpha = vl.desc.weight_alpha;
            let lambda = vl.desc.weight_lambda;
            match vl.traces.as_mut() {
                None => {
                    let (back, front) = vl.weights.split();
                    ctx.launch_fields("learn_weights", front, |h, out| {
                        kernels::learn_instar(h, &geom, input, at(states, h), rho, lane(back, h), out, alpha)
                    })?;
                }
                Some(traces) => {
                    let (w_back, w_front) = vl.weights.split();
                    let (t_back, t_front) = traces.split();
                    ctx.launch_fields2("learn_weights_traces", w_front, t_front, |h, w_out, t_out| {
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
                    })?;
                    traces.swap();
                }
            }
            vl.weights.swap();
        }

        let size = self.desc.hidden_size;
        let radius = self.desc.lateral_radius;
        let lateral_alpha = self.desc.lateral_alpha;
        let (lw_back, lw_front) = self.lateral_weights.split();
        ctx.launch_fields("learn_lateral", lw_front, |h, out| {
            kernels::learn_lateral(h, size, radius, states, lane(lw_back, h), out, lateral_alpha, rho * rho)
        })?;
        self.lateral_weights.swap();
        Ok(())
    }

    /// Binary code of the last activation.
    pub fn hidden_states(&self) -> &Array2<f32> {
        self.states.read()
    }

    /// Settled spike rates of the last activation.
    pub fn spike_rates(&self) -> &Array2<f32> {
        self.rates.read()
    }

    /// Zero the hidden code and the solver state. Thresholds and weights are
    /// kept.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        for (kernel, buffer) in [
            ("clear_summation", &mut self.summation),
            ("clear_spikes", &mut self.spikes),
            ("clear_activations", &mut self.activations),
            ("clear_rates", &mut self.rates),
            ("clear_states", &mut self.states),
        ] {
            ctx.fill(kernel, buffer.read_mut(), 0.0)?;
            ctx.fill(kernel, buffer.write_target(), 0.0)?;
        }
        Ok(())
    }

    /// Check a deserialized coder against its own description.
    pub fn validate_state(&self) -> NeoResult<()> {
        self.desc.validate()?;
        let hidden = self.desc.hidden_size.shape();
        for (what, buffer) in [
            ("summation", &self.summation),
            ("spikes", &self.spikes),
            ("activations", &self.activations),
            ("spike rates", &self.rates),
            ("hidden states", &self.states),
            ("thresholds", &self.thresholds),
        ] {
            buffer.check_layout(what, &hidden)?;
        }
        self.lateral_weights.check_layout(
            "lateral weights",
            &weight_shape(self.desc.hidden_size, self.desc.lateral_radius),
        )?;
        for vl in &self.visible_layers {
            vl.validate_state(self.desc.hidden_size)?;
        }
        Ok(())
    }

    pub fn thresholds(&self) -> &Array2<f32> {
        self.thresholds.read()
    }

    pub fn lateral_weights(&self) -> &Array3<f32> {
        self.lateral_weights.read()
    }

    pub fn desc(&self) -> &CoderDesc {
        &self.desc
    }

    pub fn visible_layers(&self) -> &[VisibleLayer] {
        &self.visible_layers
    }
}
