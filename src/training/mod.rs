//! Agent/environment loop and reward bookkeeping.
//!
//! # Step protocol
//!
//! Each step the agent sees the current observation together with the
//! reward earned by the action it took on the previous step, then proposes
//! (and explores around) the next action, which the environment executes:
//!
//! 1. `obs = env.observe()`
//! 2. `agent.sim_step(obs, reward, action)`
//! 3. `action = agent.explore(rng)`
//! 4. `reward = env.act(action)`
//!
//! When the environment reports the end of an episode after step 4, the
//! agent's memory is cleared before the next observation.

pub mod envs;

use std::collections::VecDeque;

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::agent::AgentPredQ;
use crate::compute::ComputeContext;
use crate::core::{check_unit, Int2, NeoError, NeoResult};

pub use envs::{OnOffTask, Pong};

/// A task the agent interacts with one step at a time.
pub trait Environment {
    /// Current observation, shaped `observation_size()`.
    fn observe(&self) -> Array2<f32>;

    /// Execute `action` and return the reward it earned.
    fn act(&mut self, action: &Array2<f32>) -> f32;

    fn action_size(&self) -> Int2;

    fn observation_size(&self) -> Int2;

    /// Whether the last [`act`](Self::act) ended an episode. The next
    /// observation then belongs to a fresh episode.
    fn episode_ended(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Whether the agent learns during the run
    pub learn: bool,
    /// Decay of the running average reward
    pub reward_decay: f32,
    /// Emit an info log line every N steps (0 disables)
    pub log_interval: u64,
    /// Most recent steps kept in the metrics history; `None` keeps all
    pub history: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learn: true,
            reward_decay: 0.003,
            log_interval: 1000,
            history: Some(10_000),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub reward: f32,
    /// Value estimate retrieved this step
    pub q: f32,
    pub td_error: f32,
}

/// Running average reward plus a history of the most recent steps.
///
/// Window queries take absolute step indices and are clipped to the steps
/// still held.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    history: VecDeque<StepMetrics>,
    limit: Option<usize>,
    recorded: usize,
    pub average_reward: f32,
    pub episodes: u64,
    decay: f32,
}

impl TrainingMetrics {
    pub fn new(reward_decay: f32) -> Self {
        Self::with_history(reward_decay, None)
    }

    pub fn with_history(reward_decay: f32, limit: Option<usize>) -> Self {
        Self {
            history: VecDeque::new(),
            limit,
            recorded: 0,
            average_reward: 0.0,
            episodes: 0,
            decay: reward_decay,
        }
    }

    pub fn record(&mut self, step: StepMetrics) {
        self.average_reward = (1.0 - self.decay) * self.average_reward + self.decay * step.reward;
        self.recorded += 1;
        if self.limit == Some(0) {
            return;
        }
        self.history.push_back(step);
        if let Some(limit) = self.limit {
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }
    }

    /// Number of steps recorded, including those dropped from the history.
    pub fn len(&self) -> usize {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    /// Retained steps, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepMetrics> + '_ {
        self.history.iter()
    }

    /// Absolute index of the oldest retained step.
    pub fn first_retained(&self) -> usize {
        self.recorded - self.history.len()
    }

    fn window(&self, start: usize, end: usize) -> impl Iterator<Item = &StepMetrics> + '_ {
        let first = self.first_retained();
        let start = start.max(first);
        let end = end.min(self.recorded).max(start);
        self.history.range(start - first..end - first)
    }

    fn window_mean(&self, start: usize, end: usize, f: impl Fn(&StepMetrics) -> f32) -> f32 {
        let (total, count) = self
            .window(start, end)
            .fold((0.0, 0usize), |(total, count), s| (total + f(s), count + 1));
        if count == 0 {
            0.0
        } else {
            total / count as f32
        }
    }

    /// Mean reward over steps `start..end`. Zero for an empty window.
    pub fn mean_reward(&self, start: usize, end: usize) -> f32 {
        self.window_mean(start, end, |s| s.reward)
    }

    /// Mean TD-error magnitude over steps `start..end`. Zero for an empty
    /// window.
    pub fn mean_abs_td_error(&self, start: usize, end: usize) -> f32 {
        self.window_mean(start, end, |s| s.td_error.abs())
    }

    /// Reward summed over the retained history.
    pub fn total_reward(&self) -> f32 {
        self.history.iter().map(|s| s.reward).sum()
    }
}

fn check_environment<E: Environment + ?Sized>(agent: &AgentPredQ, env: &E) -> NeoResult<()> {
    let input_size = agent.hierarchy().input_size();
    if env.observation_size() != input_size {
        return Err(NeoError::InvalidConfig(format!(
            "environment observes {:?} but the agent expects {:?}",
            env.observation_size(),
            input_size
        )));
    }
    if env.action_size() != agent.action_size() {
        return Err(NeoError::InvalidConfig(format!(
            "environment takes {:?} actions but the agent produces {:?}",
            env.action_size(),
            agent.action_size()
        )));
    }
    Ok(())
}

/// Run `steps` agent steps against `env`.
pub fn train_agent<E, R>(
    agent: &mut AgentPredQ,
    env: &mut E,
    ctx: &mut ComputeContext,
    rng: &mut R,
    steps: u64,
    config: &TrainingConfig,
) -> NeoResult<TrainingMetrics>
where
    E: Environment + ?Sized,
    R: Rng + ?Sized,
{
    train_agent_with(agent, env, ctx, rng, steps, config, |_, _, _| Ok(()))
}

/// [`train_agent`] with a hook called after every step with the step
/// index, its metrics and the agent.
pub fn train_agent_with<E, R, F>(
    agent: &mut AgentPredQ,
    env: &mut E,
    ctx: &mut ComputeContext,
    rng: &mut R,
    steps: u64,
    config: &TrainingConfig,
    mut on_step: F,
) -> NeoResult<TrainingMetrics>
where
    E: Environment + ?Sized,
    R: Rng + ?Sized,
    F: FnMut(u64, &StepMetrics, &AgentPredQ) -> NeoResult<()>,
{
    check_environment(agent, env)?;
    check_unit("reward_decay", config.reward_decay)?;

    let mut metrics = TrainingMetrics::with_history(config.reward_decay, config.history);
    let mut action = Array2::zeros(agent.action_size().dim());
    let mut reward = 0.0;

    for step in 0..steps {
        let observation = env.observe();
        agent.sim_step(ctx, &observation, reward, &action, config.learn)?;
        action = agent.explore(rng)?;
        reward = env.act(&action);

        let step_metrics = StepMetrics {
            reward,
            q: agent.q(),
            td_error: agent.td_error(),
        };
        metrics.record(step_metrics);
        on_step(step, &step_metrics, agent)?;

        if env.episode_ended() {
            agent.clear_memory(ctx)?;
            metrics.episodes += 1;
            log::debug!("episode {} ended at step {}", metrics.episodes, step + 1);
        }

        if config.log_interval > 0 && (step + 1) % config.log_interval == 0 {
            log::info!(
                "step {}: average reward {:.4}, q {:.4}, td {:.4}",
                step + 1,
                metrics.average_reward,
                step_metrics.q,
                step_metrics.td_error
            );
        }
    }
    Ok(metrics)
}
