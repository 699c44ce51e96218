//! Versioned JSON checkpoints.
//!
//! A checkpoint is a single JSON object:
//!
//! ```json
//! { "magic": "NEORL", "version": 1, "kind": "agent_pred_q", "step": 1200, "payload": { ... } }
//! ```
//!
//! The payload is the full serialised model (every double buffer, weight
//! tensor and descriptor), so a loaded model continues bit-for-bit where the
//! saved one stopped. A payload is checked against its own descriptors
//! before it is handed out, so an edited or truncated file fails with
//! [`NeoError::Checkpoint`] instead of panicking inside a kernel.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agent::AgentPredQ;
use crate::core::{NeoError, NeoResult};
use crate::hierarchy::PredictiveHierarchy;

pub const CHECKPOINT_MAGIC: &str = "NEORL";
pub const CHECKPOINT_VERSION: u32 = 1;

/// A model that can be written to and read from a checkpoint.
pub trait Checkpointable: Serialize + DeserializeOwned {
    /// Tag stored in the checkpoint and checked on load.
    const KIND: &'static str;

    /// Structural check of a freshly deserialized model.
    fn validate_state(&self) -> NeoResult<()>;
}

impl Checkpointable for PredictiveHierarchy {
    const KIND: &'static str = "predictive_hierarchy";

    fn validate_state(&self) -> NeoResult<()> {
        PredictiveHierarchy::validate_state(self)
    }
}

impl Checkpointable for AgentPredQ {
    const KIND: &'static str = "agent_pred_q";

    fn validate_state(&self) -> NeoResult<()> {
        AgentPredQ::validate_state(self)
    }
}

/// Header fields of a loaded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub magic: String,
    pub version: u32,
    pub kind: String,
    /// Training step the checkpoint was taken at
    pub step: u64,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    magic: &'a str,
    version: u32,
    kind: &'a str,
    step: u64,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    payload: T,
}

/// Serialise `model` into a checkpoint string.
pub fn to_json<T: Checkpointable>(model: &T, step: u64) -> NeoResult<String> {
    let envelope = EnvelopeRef {
        magic: CHECKPOINT_MAGIC,
        version: CHECKPOINT_VERSION,
        kind: T::KIND,
        step,
        payload: model,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse a checkpoint string, rejecting a wrong magic, version or kind
/// before the payload is touched and an inconsistent payload after.
pub fn from_json<T: Checkpointable>(json: &str) -> NeoResult<(CheckpointInfo, T)> {
    let info: CheckpointInfo = serde_json::from_str(json)?;
    if info.magic != CHECKPOINT_MAGIC {
        return Err(NeoError::Checkpoint(format!(
            "bad magic {:?}, expected {CHECKPOINT_MAGIC:?}",
            info.magic
        )));
    }
    if info.version != CHECKPOINT_VERSION {
        return Err(NeoError::Checkpoint(format!(
            "unsupported version {}, expected {CHECKPOINT_VERSION}",
            info.version
        )));
    }
    if info.kind != T::KIND {
        return Err(NeoError::Checkpoint(format!(
            "checkpoint holds a {:?}, expected {:?}",
            info.kind,
            T::KIND
        )));
    }
    let envelope: Envelope<T> = serde_json::from_str(json)?;
    envelope.payload.validate_state().map_err(|e| match e {
        NeoError::Checkpoint(reason) => NeoError::Checkpoint(reason),
        other => NeoError::Checkpoint(format!("inconsistent payload: {other}")),
    })?;
    Ok((info, envelope.payload))
}

/// Write `model` to `path`, creating parent directories.
pub fn save_checkpoint<T: Checkpointable>(model: &T, step: u64, path: &Path) -> NeoResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = to_json(model, step)?;
    fs::write(path, json)?;
    log::info!("Saved {} checkpoint at step {step} to {}", T::KIND, path.display());
    Ok(())
}

pub fn load_checkpoint<T: Checkpointable>(path: &Path) -> NeoResult<(CheckpointInfo, T)> {
    let json = fs::read_to_string(path)?;
    let (info, model) = from_json(&json)?;
    log::info!(
        "Loaded {} checkpoint from step {} ({})",
        info.kind,
        info.step,
        path.display()
    );
    Ok((info, model))
}
