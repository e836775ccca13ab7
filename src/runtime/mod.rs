//! Runtime module: turns a model name into a running world-model session.
//!
//! This module provides:
//! - Compute device selection (CUDA → MPS → CPU)
//! - Bundle retrieval from the model registry, or a local directory
//! - Model loading: identity validation, agent build, checkpoint weights
//! - Context window sizing
//! - The world-model environment (spawn pool, rolling context, step/reset)
//! - Optional compilation of the per-step call paths
//! - The session orchestrator the binary drives

pub mod accel;
pub mod context;
pub mod device;
pub mod identity;
pub mod loader;
pub mod registry;
pub mod session;
pub mod spawn;
pub mod world_env;

#[cfg(test)]
pub(crate) mod fixtures;

use std::path::PathBuf;

use thiserror::Error;

use crate::model::checkpoint::CheckpointError;
use crate::settings::SettingsError;

pub use registry::RegistryError;

/// Fatal model-loading errors. All of them stop the session before play.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model name '{expected}' does not match env.train.id '{found}'")]
    IdentityMismatch { expected: String, found: String },
    #[error("invalid model name '{0}'")]
    InvalidName(String),
    #[error("failed to read model name: {0}")]
    Identity(#[source] std::io::Error),
    #[error("missing {kind} at {path}")]
    MissingArtifact { kind: &'static str, path: PathBuf },
    #[error("no spawn entries in {0}")]
    EmptySpawn(PathBuf),
    #[error("spawn entry {path}: {reason}")]
    Spawn { path: PathBuf, reason: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Config(#[from] SettingsError),
    #[error("failed to build agent: {0}")]
    Build(#[source] Box<dyn std::error::Error + Send + Sync>),
}
