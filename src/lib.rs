//! # neorl
//!
//! Hierarchical sparse-coding and predictive-coding engine with locally
//! learned layers and a Q-value reinforcement-learning extension.
//!
//! ## Overview
//!
//! Each layer of a [`PredictiveHierarchy`] encodes its input into a sparse
//! hidden surface and predicts its own next input from that code plus
//! top-down feedback. Every learning rule is local: Hebbian or delta updates
//! restricted to a receptive field, driven by prediction errors between
//! adjacent layers. There is no backpropagation.
//!
//! ## Structure
//!
//! - [`core`]: surfaces, geometry helpers, double buffers, errors
//! - [`compute`]: data-parallel kernel dispatch and the kernels themselves
//! - [`coder`]: visible layers and the [`Coder`] enum over both encoders
//! - [`sparse_coder`]: spiking encoder with lateral inhibition
//! - [`comparison`]: local winner-take-all encoder
//! - [`predictor`]: per-layer next-step predictor
//! - [`hierarchy`]: layer stack, input whitening, bottom-up/top-down step
//! - [`agent`]: TD value learning and exploration on top of the hierarchy
//! - [`checkpoint`]: versioned JSON persistence
//! - [`training`]: agent/environment loop and built-in tasks

pub mod agent;
pub mod checkpoint;
pub mod coder;
pub mod comparison;
pub mod compute;
pub mod core;
pub mod hierarchy;
pub mod predictor;
pub mod sparse_coder;
pub mod training;

pub use agent::{action_value, AgentDesc, AgentPredQ, QTransform};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointInfo, Checkpointable};
pub use coder::{Coder, CoderKind, ComparisonCoder, SparseCoder, VisibleLayerDesc};
pub use compute::{ComputeContext, QueueStats};
pub use core::{DoubleBuffer, Float2, Int2, NeoError, NeoResult};
pub use hierarchy::{HierarchyDesc, InputWhitener, LayerDesc, PredictiveHierarchy, WhiteningDesc};
pub use predictor::{Predictor, PredictorChannelDesc, PredictorInputDesc};
pub use training::{
    train_agent, train_agent_with, Environment, OnOffTask, Pong, StepMetrics, TrainingConfig,
    TrainingMetrics,
};
