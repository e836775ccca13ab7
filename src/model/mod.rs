//! World-model components.
//!
//! This module provides:
//! - The predictor traits the runtime drives (denoiser, upsampler, reward/end head)
//! - The agent wrapper bundling them
//! - The checkpoint reader
//! - A reference ndarray backend implementing the traits

pub mod agent;
pub mod checkpoint;
pub mod frame;
pub mod reference;
