//! Typed views over the configuration sections a play session reads.
//!
//! Unknown keys (training-only settings, `_target_` markers) are ignored, so
//! the same bundle documents serve both training and play.

use serde::{Deserialize, Serialize};

/// Frame size as declared by `env.train.size`: one integer for a square
/// frame, or an explicit `[height, width]` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameSize {
    Square(u32),
    Rect(u32, u32),
}

impl FrameSize {
    /// `(height, width)`.
    pub fn hw(&self) -> (u32, u32) {
        match *self {
            FrameSize::Square(s) => (s, s),
            FrameSize::Rect(h, w) => (h, w),
        }
    }

    /// On-screen window size: base size times `multiplier`.
    pub fn window(&self, multiplier: u32) -> WindowSize {
        let (h, w) = self.hw();
        WindowSize {
            height: h.saturating_mul(multiplier),
            width: w.saturating_mul(multiplier),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSize {
    pub height: u32,
    pub width: u32,
}

/// `env` section.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EnvConfig {
    pub train: TrainEnvConfig,
    pub num_actions: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrainEnvConfig {
    /// Training identifier; must equal the model name at load time.
    pub id: String,
    pub size: FrameSize,
}

/// `agent` section.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentConfig {
    pub denoiser: DenoiserConfig,
    #[serde(default)]
    pub upsampler: Option<UpsamplerConfig>,
    #[serde(default)]
    pub rew_end_model: Option<RewEndModelConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InnerModelConfig {
    #[serde(default = "default_img_channels")]
    pub img_channels: usize,
    pub num_steps_conditioning: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DenoiserConfig {
    pub inner_model: InnerModelConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpsamplerConfig {
    pub inner_model: InnerModelConfig,
    #[serde(default = "default_upsampling_factor")]
    pub upsampling_factor: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RewEndModelConfig {
    #[serde(default = "default_img_channels")]
    pub img_channels: usize,
    #[serde(default = "default_end_threshold")]
    pub end_threshold: f32,
}

/// `world_model_env` section.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorldModelEnvConfig {
    pub horizon: usize,
    #[serde(default = "default_batches_to_preload")]
    pub num_batches_to_preload: usize,
    pub diffusion_sampler_next_obs: DiffusionSamplerConfig,
    #[serde(default)]
    pub diffusion_sampler_upsampling: Option<DiffusionSamplerConfig>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DiffusionSamplerConfig {
    pub num_steps_denoising: usize,
    #[serde(default = "default_sigma_min")]
    pub sigma_min: f32,
    #[serde(default = "default_sigma_max")]
    pub sigma_max: f32,
    #[serde(default = "default_rho")]
    pub rho: f32,
}

fn default_img_channels() -> usize {
    3
}

fn default_upsampling_factor() -> usize {
    2
}

fn default_end_threshold() -> f32 {
    0.5
}

fn default_batches_to_preload() -> usize {
    crate::config::PLAY_BATCHES_TO_PRELOAD
}

fn default_sigma_min() -> f32 {
    2e-3
}

fn default_sigma_max() -> f32 {
    5.0
}

fn default_rho() -> f32 {
    7.0
}
