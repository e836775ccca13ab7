//! Play module: the interactive session and the loops that drive it.
//!
//! This module provides:
//! - `PlayEnv`, binding the agent and world-model environment with recording
//! - Episode recording to safetensors with JSON metadata
//! - The `PlayLoop` seam and a headless loop with scripted or random actions
//! - Frame-time statistics for the status header

pub mod actions;
pub mod game;
pub mod play_env;
pub mod recorder;
pub mod timing;

pub use game::{GameSettings, HeadlessGame, PlayLoop};
pub use play_env::PlayEnv;
