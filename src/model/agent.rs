//! The agent: frame predictor, optional upsampler, optional reward/end head.
//!
//! Loading happens on [`AgentParts`] (owned, mutable: device placement,
//! inference mode, checkpoint weights). [`AgentParts::into_agent`] freezes
//! the parts into an [`Agent`] whose components are shared, read-only
//! handles the world-model environment calls every tick.

use std::path::Path;
use std::sync::Arc;

use ndarray::Array1;
use rand::rngs::StdRng;

use crate::model::checkpoint::{CheckpointError, StateDict};
use crate::model::frame::{Action, Frame};
use crate::runtime::device::Device;
use crate::settings::schema::{AgentConfig, DiffusionSamplerConfig};

/// Checkpoint prefixes, one per component.
pub const DENOISER_PREFIX: &str = "denoiser";
pub const UPSAMPLER_PREFIX: &str = "upsampler";
pub const REW_END_PREFIX: &str = "rew_end_model";

/// A synthesised frame plus the states visited while refining it.
#[derive(Clone, Debug)]
pub struct Denoised {
    pub frame: Frame,
    /// One entry per denoising step, the last equal to `frame`.
    pub trajectory: Vec<Frame>,
}

/// Lifecycle shared by every component.
pub trait Module: Send + Sync {
    fn to_device(&mut self, device: Device);
    fn device(&self) -> Device;
    /// Switch to inference (non-training) mode.
    fn set_inference(&mut self);
    fn is_inference(&self) -> bool;
    /// Load weights, with this component's prefix already stripped.
    fn load_state(&mut self, state: &StateDict) -> Result<(), CheckpointError>;
}

/// Base next-frame predictor.
pub trait Denoiser: Module {
    /// Past frames/actions consumed per prediction.
    fn num_steps_conditioning(&self) -> usize;

    /// Predict the next frame from the last `num_steps_conditioning` frames
    /// and actions, oldest first.
    fn sample_next_obs(
        &self,
        obs: &[Frame],
        act: &[Action],
        sampler: &DiffusionSamplerConfig,
        rng: &mut StdRng,
    ) -> Denoised;

    /// A compiled call path with numerically compatible output, if the
    /// backend has one.
    fn compiled(&self) -> Option<Arc<dyn Denoiser>> {
        None
    }
}

/// Super-resolution stage.
pub trait Upsampler: Module {
    fn num_steps_conditioning(&self) -> usize;
    fn upsampling_factor(&self) -> usize;

    /// Upsample `low_res_next`, conditioned on the last
    /// `num_steps_conditioning` full-resolution frames and actions.
    fn sample_upsampled(
        &self,
        low_res_next: &Frame,
        full_res: &[Frame],
        act: &[Action],
        sampler: &DiffusionSamplerConfig,
        rng: &mut StdRng,
    ) -> Denoised;

    fn compiled(&self) -> Option<Arc<dyn Upsampler>> {
        None
    }
}

/// Recurrent state of the reward/end head, owned by the environment.
#[derive(Clone, Debug, Default)]
pub struct RecurrentState {
    pub hidden: Option<Array1<f32>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RewardEnd {
    /// -1, 0 or +1.
    pub reward: f32,
    pub end: bool,
}

/// Reward and episode-termination predictor.
pub trait RewardEndModel: Module {
    fn predict(
        &self,
        state: &mut RecurrentState,
        obs: &Frame,
        act: Action,
        next_obs: &Frame,
    ) -> RewardEnd;
}

/// Instantiates the agent's networks from the `agent` section.
pub trait AgentBuilder {
    fn build(&self, cfg: &AgentConfig, num_actions: usize) -> anyhow::Result<AgentParts>;
}

/// Freshly built, still-mutable components.
pub struct AgentParts {
    pub denoiser: Box<dyn Denoiser>,
    pub upsampler: Option<Box<dyn Upsampler>>,
    pub rew_end_model: Option<Box<dyn RewardEndModel>>,
    pub num_actions: usize,
}

impl AgentParts {
    pub fn to_device(&mut self, device: Device) {
        self.denoiser.to_device(device);
        if let Some(up) = self.upsampler.as_mut() {
            up.to_device(device);
        }
        if let Some(re) = self.rew_end_model.as_mut() {
            re.to_device(device);
        }
    }

    pub fn set_inference(&mut self) {
        self.denoiser.set_inference();
        if let Some(up) = self.upsampler.as_mut() {
            up.set_inference();
        }
        if let Some(re) = self.rew_end_model.as_mut() {
            re.set_inference();
        }
    }

    /// Load a checkpoint, routing each prefix to its component.
    pub fn load(&mut self, path: &Path) -> Result<(), CheckpointError> {
        let sd = StateDict::load(path)?;
        self.load_state(&sd)
    }

    pub fn load_state(&mut self, sd: &StateDict) -> Result<(), CheckpointError> {
        self.denoiser.load_state(&sd.with_prefix(DENOISER_PREFIX))?;
        if let Some(up) = self.upsampler.as_mut() {
            up.load_state(&sd.with_prefix(UPSAMPLER_PREFIX))?;
        }
        if let Some(re) = self.rew_end_model.as_mut() {
            re.load_state(&sd.with_prefix(REW_END_PREFIX))?;
        }
        Ok(())
    }

    pub fn into_agent(self) -> Agent {
        Agent {
            denoiser: Arc::from(self.denoiser),
            upsampler: self.upsampler.map(Arc::from),
            rew_end_model: self.rew_end_model.map(Arc::from),
            num_actions: self.num_actions,
        }
    }
}

/// Loaded, device-placed, inference-mode agent.
#[derive(Clone)]
pub struct Agent {
    pub denoiser: Arc<dyn Denoiser>,
    pub upsampler: Option<Arc<dyn Upsampler>>,
    pub rew_end_model: Option<Arc<dyn RewardEndModel>>,
    pub num_actions: usize,
}

impl Agent {
    pub fn device(&self) -> Device {
        self.denoiser.device()
    }

    /// Whether every component sits on `device`.
    pub fn is_on(&self, device: Device) -> bool {
        self.denoiser.device() == device
            && self.upsampler.as_ref().map_or(true, |u| u.device() == device)
            && self.rew_end_model.as_ref().map_or(true, |r| r.device() == device)
    }

    pub fn is_inference(&self) -> bool {
        self.denoiser.is_inference()
            && self.upsampler.as_ref().map_or(true, |u| u.is_inference())
            && self.rew_end_model.as_ref().map_or(true, |r| r.is_inference())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("device", &self.device())
            .field("num_actions", &self.num_actions)
            .field("denoiser_conditioning", &self.denoiser.num_steps_conditioning())
            .field(
                "upsampler_conditioning",
                &self.upsampler.as_ref().map(|u| u.num_steps_conditioning()),
            )
            .field("rew_end_model", &self.rew_end_model.is_some())
            .finish()
    }
}
