//! Reinforcement-learning agent on top of the predictive hierarchy.
//!
//! The first layer gets two extra predicted channels: the action to take and
//! a Q surface that encodes the value estimate through a fixed random
//! [`QTransform`]. Each step the agent reads the value of the current state
//! out of the Q prediction, forms the TD target and writes it back as the Q
//! channel's learning target. The action channel is trained toward the
//! action that was actually taken, and only on steps with a positive TD
//! error.

pub mod q_transform;

use ndarray::Array2;
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::coder::{check_surface, VisibleLayerDesc};
use crate::compute::ComputeContext;
use crate::core::{check_shape, check_size, check_unit, Int2, NeoError, NeoResult};
use crate::hierarchy::{HierarchyDesc, HierarchyExtension, PredictiveHierarchy, Reinforcement};
use crate::predictor::PredictorChannelDesc;

pub use q_transform::QTransform;

const ACTION_CHANNEL: usize = 0;
const Q_CHANNEL: usize = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDesc {
    pub hierarchy: HierarchyDesc,
    pub action_size: Int2,
    /// Encoder radius of the action input
    pub action_radius: i32,
    pub q_size: Int2,
    /// TD step size
    pub q_alpha: f32,
    /// Discount
    pub q_gamma: f32,
    /// Predictor learning rate of the action channel
    pub action_alpha: f32,
    /// Predictor learning rate of the Q channel
    pub q_prediction_alpha: f32,
    pub exploration_std_dev: f32,
    /// Chance of replacing an action unit with a uniform random value
    pub exploration_break_chance: f32,
    /// Carry the retrieved estimate to the next step instead of the target
    pub carry_retrieved_estimate: bool,
}

impl Default for AgentDesc {
    fn default() -> Self {
        Self {
            hierarchy: HierarchyDesc::default(),
            action_size: Int2::new(2, 2),
            action_radius: 1,
            q_size: Int2::new(4, 4),
            q_alpha: 0.1,
            q_gamma: 0.9,
            action_alpha: 0.1,
            q_prediction_alpha: 0.02,
            exploration_std_dev: 0.3,
            exploration_break_chance: 0.05,
            carry_retrieved_estimate: false,
        }
    }
}

impl AgentDesc {
    pub fn validate(&self) -> NeoResult<()> {
        self.hierarchy.validate()?;
        check_size("action size", self.action_size)?;
        check_size("q size", self.q_size)?;
        if self.action_radius < 0 {
            return Err(NeoError::InvalidConfig(format!(
                "action radius must be non-negative, got {}",
                self.action_radius
            )));
        }
        check_unit("q_alpha", self.q_alpha)?;
        check_unit("q_gamma", self.q_gamma)?;
        check_unit("exploration_break_chance", self.exploration_break_chance)?;
        if !self.exploration_std_dev.is_finite() || self.exploration_std_dev < 0.0 {
            return Err(NeoError::InvalidConfig(format!(
                "exploration_std_dev must be non-negative, got {}",
                self.exploration_std_dev
            )));
        }
        Ok(())
    }

    fn extension(&self) -> HierarchyExtension {
        let first = self.hierarchy.layers.first().copied().unwrap_or_default();
        HierarchyExtension {
            inputs: vec![VisibleLayerDesc {
                size: self.action_size,
                radius: self.action_radius,
                weight_alpha: first.weight_alpha,
                weight_lambda: first.trace_lambda,
                ignore_middle: false,
                use_traces: first.use_traces,
                is_predictive_coding: false,
            }],
            channels: vec![
                PredictorChannelDesc {
                    size: self.action_size,
                    alpha: self.action_alpha,
                    thresholded: false,
                    reward_modulated: true,
                },
                PredictorChannelDesc::new(self.q_size, self.q_prediction_alpha),
            ],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentPredQ {
    desc: AgentDesc,
    hierarchy: PredictiveHierarchy,
    q_transform: QTransform,
    q_input: Array2<f32>,
    prev_value: f32,
    q: f32,
    td_error: f32,
}

impl AgentPredQ {
    pub fn new<R: Rng + ?Sized>(desc: AgentDesc, rng: &mut R) -> NeoResult<Self> {
        desc.validate()?;
        let hierarchy = PredictiveHierarchy::with_extension(desc.hierarchy.clone(), desc.extension(), rng)?;
        let q_transform = QTransform::new(desc.q_size, rng)?;
        log::info!(
            "Created agent: action {}x{}, q {}x{}, gamma {}",
            desc.action_size.x,
            desc.action_size.y,
            desc.q_size.x,
            desc.q_size.y,
            desc.q_gamma
        );
        Ok(Self {
            q_input: Array2::zeros(desc.q_size.dim()),
            desc,
            hierarchy,
            q_transform,
            prev_value: 0.0,
            q: 0.0,
            td_error: 0.0,
        })
    }

    /// One agent step.
    ///
    /// `reward` is the reward received for `action_taken`, the action
    /// executed after the previous step.
    pub fn sim_step(
        &mut self,
        ctx: &mut ComputeContext,
        input: &Array2<f32>,
        reward: f32,
        action_taken: &Array2<f32>,
        learn: bool,
    ) -> NeoResult<()> {
        check_shape("action", action_taken, self.desc.action_size)?;
        if !reward.is_finite() {
            return Err(NeoError::InvalidConfig(format!("reward must be finite, got {reward}")));
        }
        self.hierarchy.forward(ctx, input, &[action_taken])?;

        let q = self
            .q_transform
            .get_q(ctx, self.hierarchy.extension_prediction(Q_CHANNEL)?)?;
        let td_error = reward + self.desc.q_gamma * q - self.prev_value;
        let target = self.prev_value + self.desc.q_alpha * td_error;
        self.prev_value = if self.desc.carry_retrieved_estimate { q } else { target };
        self.q = q;
        self.td_error = td_error;
        self.q_transform.set_q(ctx, target, &mut self.q_input)?;

        if learn {
            let encoder_reward = self
                .hierarchy
                .desc()
                .layers
                .iter()
                .any(|l| l.use_traces)
                .then_some(td_error);
            self.hierarchy.learn(
                ctx,
                &[action_taken, &self.q_input],
                Reinforcement {
                    td_error,
                    encoder_reward,
                },
            )?;
        }
        log::debug!(
            "agent step {}: reward {reward:.3} q {q:.3} td {td_error:.3}",
            self.hierarchy.steps()
        );
        Ok(())
    }

    /// Start a new episode: the hierarchy forgets its temporal context and
    /// the encoded Q target is zeroed. Learned parameters are kept, and so
    /// is the carried value: the reward handed to the next step still
    /// belongs to the last action of the ending episode.
    pub fn clear_memory(&mut self, ctx: &mut ComputeContext) -> NeoResult<()> {
        self.hierarchy.clear_memory(ctx)?;
        ctx.fill("clear_q_input", &mut self.q_input, 0.0)?;
        log::debug!("agent memory cleared, carried value {:.3}", self.prev_value);
        Ok(())
    }

    /// Check a deserialized agent against its descriptor.
    pub fn validate_state(&self) -> NeoResult<()> {
        self.desc.validate()?;
        if self.hierarchy.desc() != &self.desc.hierarchy {
            return Err(NeoError::Checkpoint(
                "hierarchy descriptor differs from the agent descriptor".to_string(),
            ));
        }
        self.hierarchy.validate_state()?;
        let layer = self.hierarchy.layer(0);
        let channel_sizes: Vec<Int2> = (0..layer.predictor().num_channels())
            .filter_map(|c| layer.predictor().channel_desc(c).map(|d| d.size))
            .collect();
        if channel_sizes.get(ACTION_CHANNEL + 1) != Some(&self.desc.action_size)
            || channel_sizes.get(Q_CHANNEL + 1) != Some(&self.desc.q_size)
        {
            return Err(NeoError::Checkpoint(
                "first layer channels do not match the action and q sizes".to_string(),
            ));
        }
        self.q_transform.validate_state()?;
        if self.q_transform.size() != self.desc.q_size {
            return Err(NeoError::Checkpoint(format!(
                "q transform is {:?}, expected {:?}",
                self.q_transform.size(),
                self.desc.q_size
            )));
        }
        check_surface("q input", &self.q_input, self.desc.q_size)?;
        if !(self.prev_value.is_finite() && self.q.is_finite() && self.td_error.is_finite()) {
            return Err(NeoError::Checkpoint("stored value estimates are not finite".to_string()));
        }
        Ok(())
    }

    /// Action proposed by the last step, before exploration.
    pub fn action_prediction(&self) -> NeoResult<&Array2<f32>> {
        self.hierarchy.extension_prediction(ACTION_CHANNEL)
    }

    /// Proposed action with exploration: each unit is replaced by a uniform
    /// random value with the break chance, otherwise perturbed with Gaussian
    /// noise. Values are clamped to `[0, 1]`.
    pub fn explore<R: Rng + ?Sized>(&self, rng: &mut R) -> NeoResult<Array2<f32>> {
        let noise = Normal::new(0.0f32, self.desc.exploration_std_dev)
            .map_err(|e| NeoError::InvalidConfig(format!("exploration noise: {e}")))?;
        let break_chance = self.desc.exploration_break_chance;
        Ok(self.action_prediction()?.mapv(|p| {
            if rng.gen::<f32>() < break_chance {
                rng.gen::<f32>()
            } else {
                (p + noise.sample(rng)).clamp(0.0, 1.0)
            }
        }))
    }

    /// Retrieved value of the current state.
    pub fn q(&self) -> f32 {
        self.q
    }

    pub fn td_error(&self) -> f32 {
        self.td_error
    }

    /// Value carried into the next TD update.
    pub fn prev_value(&self) -> f32 {
        self.prev_value
    }

    /// Encoded TD target of the last step.
    pub fn q_input(&self) -> &Array2<f32> {
        &self.q_input
    }

    pub fn q_transform(&self) -> &QTransform {
        &self.q_transform
    }

    pub fn hierarchy(&self) -> &PredictiveHierarchy {
        &self.hierarchy
    }

    pub fn hierarchy_mut(&mut self) -> &mut PredictiveHierarchy {
        &mut self.hierarchy
    }

    pub fn desc(&self) -> &AgentDesc {
        &self.desc
    }

    pub fn action_size(&self) -> Int2 {
        self.desc.action_size
    }
}

/// Mean of the `size` region of `action` starting at `lower`, clipped to
/// the surface. Zero for an empty region.
pub fn action_value(action: &Array2<f32>, lower: Int2, size: Int2) -> f32 {
    let (w, h) = action.dim();
    let x0 = lower.x.max(0) as usize;
    let y0 = lower.y.max(0) as usize;
    let x1 = ((lower.x + size.x).max(0) as usize).min(w);
    let y1 = ((lower.y + size.y).max(0) as usize).min(h);
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }
    action
        .slice(ndarray::s![x0..x1, y0..y1])
        .mean()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::LayerDesc;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_desc() -> AgentDesc {
        AgentDesc {
            hierarchy: HierarchyDesc {
                input_size: Int2::new(6, 6),
                layers: vec![LayerDesc {
                    size: Int2::new(6, 6),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_td_update_from_zero_value() {
        let mut rng = StdRng::seed_from_u64(30);
        let mut ctx = ComputeContext::new();
        let desc = small_desc();
        let mut agent = AgentPredQ::new(desc.clone(), &mut rng).unwrap();
        let input = Array2::from_elem((6, 6), 1.0);
        let action = Array2::zeros((2, 2));
        agent.sim_step(&mut ctx, &input, 1.0, &action, false).unwrap();

        let expected_td = 1.0 + desc.q_gamma * agent.q();
        assert_abs_diff_eq!(agent.td_error(), expected_td, epsilon = 1e-5);
        assert_abs_diff_eq!(agent.prev_value(), desc.q_alpha * expected_td, epsilon = 1e-5);

        // The encoded target decodes back to the new estimate.
        let decoded = agent.q_transform().get_q(&mut ctx, agent.q_input()).unwrap();
        assert_abs_diff_eq!(decoded, agent.prev_value(), epsilon = 1e-4);
    }

    #[test]
    fn test_carry_retrieved_estimate() {
        let mut rng = StdRng::seed_from_u64(31);
        let mut ctx = ComputeContext::new();
        let desc = AgentDesc {
            carry_retrieved_estimate: true,
            ..small_desc()
        };
        let mut agent = AgentPredQ::new(desc, &mut rng).unwrap();
        let input = Array2::from_elem((6, 6), 0.5);
        let action = Array2::zeros((2, 2));
        for _ in 0..3 {
            agent.sim_step(&mut ctx, &input, 0.5, &action, true).unwrap();
            assert_eq!(agent.prev_value(), agent.q());
        }
    }

    #[test]
    fn test_explore_without_noise_clamps_prediction() {
        let mut rng = StdRng::seed_from_u64(32);
        let mut ctx = ComputeContext::new();
        let desc = AgentDesc {
            exploration_std_dev: 0.0,
            exploration_break_chance: 0.0,
            ..small_desc()
        };
        let mut agent = AgentPredQ::new(desc, &mut rng).unwrap();
        let input = Array2::from_elem((6, 6), 1.0);
        agent
            .sim_step(&mut ctx, &input, 0.0, &Array2::zeros((2, 2)), false)
            .unwrap();
        let expected = agent.action_prediction().unwrap().mapv(|p| p.clamp(0.0, 1.0));
        assert_eq!(agent.explore(&mut rng).unwrap(), expected);
    }

    #[test]
    fn test_explored_actions_in_unit_range() {
        let mut rng = StdRng::seed_from_u64(33);
        let desc = AgentDesc {
            exploration_std_dev: 2.0,
            exploration_break_chance: 0.5,
            ..small_desc()
        };
        let agent = AgentPredQ::new(desc, &mut rng).unwrap();
        for _ in 0..20 {
            let a = agent.explore(&mut rng).unwrap();
            assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_action_shape_checked() {
        let mut rng = StdRng::seed_from_u64(34);
        let mut ctx = ComputeContext::new();
        let mut agent = AgentPredQ::new(small_desc(), &mut rng).unwrap();
        let input = Array2::zeros((6, 6));
        let err = agent
            .sim_step(&mut ctx, &input, 0.0, &Array2::zeros((3, 3)), true)
            .unwrap_err();
        assert!(matches!(err, NeoError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_clear_memory_forgets_context_keeps_value() {
        let mut rng = StdRng::seed_from_u64(35);
        let mut ctx = ComputeContext::new();
        let mut agent = AgentPredQ::new(small_desc(), &mut rng).unwrap();
        let input = Array2::from_elem((6, 6), 1.0);
        let action = Array2::from_elem((2, 2), 0.5);
        for _ in 0..4 {
            agent.sim_step(&mut ctx, &input, 1.0, &action, true).unwrap();
        }
        let carried = agent.prev_value();
        assert!(carried != 0.0);
        let weights = agent.hierarchy().layer(0).predictor().weights(1, 0).unwrap().clone();

        agent.clear_memory(&mut ctx).unwrap();
        assert_eq!(agent.prev_value(), carried);
        assert!(agent.q_input().iter().all(|&v| v == 0.0));
        assert!(agent.action_prediction().unwrap().iter().all(|&v| v == 0.0));
        assert!(agent.hierarchy().layer(0).hidden_states().iter().all(|&s| s == 0.0));
        assert_eq!(agent.hierarchy().layer(0).predictor().weights(1, 0).unwrap(), &weights);
        agent.validate_state().unwrap();
    }

    #[test]
    fn test_action_value_region_mean() {
        let mut a = Array2::zeros((4, 4));
        a[[0, 0]] = 1.0;
        a[[1, 0]] = 0.5;
        assert_abs_diff_eq!(action_value(&a, Int2::new(0, 0), Int2::new(2, 1)), 0.75, epsilon = 1e-6);
        assert_eq!(action_value(&a, Int2::new(5, 5), Int2::new(2, 2)), 0.0);
    }
}
