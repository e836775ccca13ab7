//! Reference ndarray backend.
//!
//! Small, deterministic stand-ins for the trained networks, so a bundle can
//! be played without an external runtime:
//! - `BlendDenoiser`: weighted blend of the conditioning frames plus a
//!   per-action channel offset, reached by Euler sampling on a Karras
//!   noise schedule from seeded Gaussian noise
//! - `ResizeUpsampler`: nearest-neighbour upscale blended with the previous
//!   full-resolution frame, sampled the same way
//! - `RewardEndHead`: linear heads over a decaying frame-difference state
//!
//! The fused variants returned by `compiled()` split the per-channel work
//! across rayon threads; per-element arithmetic is unchanged, so their
//! output matches the sequential path.

use std::sync::Arc;

use anyhow::bail;
use ndarray::{Array1, Array2, ArrayViewMut2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::model::agent::{
    AgentBuilder, AgentParts, Denoised, Denoiser, Module, RecurrentState, RewardEnd,
    RewardEndModel, Upsampler,
};
use crate::model::checkpoint::{CheckpointError, StateDict};
use crate::model::frame::{channel_means, upscale_nearest, Action, Frame};
use crate::runtime::device::Device;
use crate::settings::schema::{
    AgentConfig, DenoiserConfig, DiffusionSamplerConfig, RewEndModelConfig, UpsamplerConfig,
};

/// Karras noise levels, descending, followed by a trailing zero.
///
/// σ_i = (σ_max^(1/ρ) + i/(n-1) · (σ_min^(1/ρ) − σ_max^(1/ρ)))^ρ
pub fn karras_sigmas(cfg: &DiffusionSamplerConfig) -> Vec<f32> {
    let n = cfg.num_steps_denoising.max(1);
    let rho = if cfg.rho > 0.0 { cfg.rho } else { 1.0 };
    let min_inv = cfg.sigma_min.max(f32::EPSILON).powf(1.0 / rho);
    let max_inv = cfg.sigma_max.max(cfg.sigma_min).powf(1.0 / rho);

    let mut sigmas: Vec<f32> = (0..n)
        .map(|i| {
            let t = if n == 1 { 0.0 } else { i as f32 / (n - 1) as f32 };
            (max_inv + t * (min_inv - max_inv)).powf(rho)
        })
        .collect();
    sigmas.push(0.0);
    sigmas
}

/// Euler integration of the probability-flow ODE toward `target`.
///
/// The denoiser estimate at every level is `target`, so each step scales
/// the residual `x - target` by σ_next/σ and the last step lands on it.
fn sample_toward(target: Frame, sampler: &DiffusionSamplerConfig, rng: &mut StdRng) -> Denoised {
    let sigmas = karras_sigmas(sampler);
    let mut x = Frame::from_shape_fn(target.dim(), |_| {
        rng.sample::<f32, _>(StandardNormal) * sigmas[0]
    });

    let mut trajectory = Vec::with_capacity(sigmas.len() - 1);
    for pair in sigmas.windows(2) {
        let (sigma, sigma_next) = (pair[0].max(f32::EPSILON), pair[1]);
        let d = (&x - &target) / sigma;
        x.scaled_add(sigma_next - sigma, &d);
        trajectory.push(x.clone());
    }

    x.mapv_inplace(|v| v.clamp(-1.0, 1.0));
    if let Some(last) = trajectory.last_mut() {
        last.assign(&x);
    }
    Denoised {
        frame: x,
        trajectory,
    }
}

fn for_each_channel<F>(frame: &mut Frame, fused: bool, f: F)
where
    F: Fn(usize, ArrayViewMut2<'_, f32>) + Sync + Send,
{
    if fused {
        frame
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(c, plane)| f(c, plane));
    } else {
        for (c, plane) in frame.axis_iter_mut(Axis(0)).enumerate() {
            f(c, plane);
        }
    }
}

// ──────────────────────────────────────────────────────────────
// Denoiser
// ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct BlendDenoiser {
    channels: usize,
    num_steps_conditioning: usize,
    num_actions: usize,
    /// Weight per conditioning frame, oldest first.
    frame_weights: Array1<f32>,
    /// `[num_actions, channels]` offset applied for the latest action.
    action_bias: Array2<f32>,
    device: Device,
    inference: bool,
    fused: bool,
}

impl BlendDenoiser {
    /// Identity weights: the prediction repeats the latest frame.
    pub fn new(cfg: &DenoiserConfig, num_actions: usize) -> Self {
        let n = cfg.inner_model.num_steps_conditioning;
        let channels = cfg.inner_model.img_channels;
        let mut frame_weights = Array1::zeros(n);
        if n > 0 {
            frame_weights[n - 1] = 1.0;
        }
        Self {
            channels,
            num_steps_conditioning: n,
            num_actions,
            frame_weights,
            action_bias: Array2::zeros((num_actions, channels)),
            device: Device::Cpu,
            inference: false,
            fused: false,
        }
    }

    fn target(&self, obs: &[Frame], act: &[Action]) -> Frame {
        let n = self.num_steps_conditioning;
        let window = &obs[obs.len().saturating_sub(n)..];
        let offset = n - window.len();
        let Some(latest) = window.last() else {
            return Frame::zeros((self.channels, 1, 1));
        };

        let a = act
            .last()
            .map(|&a| (a as usize).min(self.num_actions.saturating_sub(1)))
            .unwrap_or(0);
        let mut out = Frame::zeros(latest.dim());
        for_each_channel(&mut out, self.fused, |c, mut plane| {
            for (k, frame) in window.iter().enumerate() {
                plane.scaled_add(self.frame_weights[offset + k], &frame.index_axis(Axis(0), c));
            }
            let bias = if c < self.channels && self.num_actions > 0 {
                self.action_bias[[a, c]]
            } else {
                0.0
            };
            plane.mapv_inplace(|v| (v + bias).clamp(-1.0, 1.0));
        });
        out
    }
}

impl Module for BlendDenoiser {
    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn device(&self) -> Device {
        self.device
    }

    fn set_inference(&mut self) {
        self.inference = true;
    }

    fn is_inference(&self) -> bool {
        self.inference
    }

    fn load_state(&mut self, state: &StateDict) -> Result<(), CheckpointError> {
        if state.is_empty() {
            return Ok(());
        }
        self.frame_weights = state.require_array1("frame_weights", self.num_steps_conditioning)?;
        self.action_bias = state.require_array2("action_bias", self.num_actions, self.channels)?;
        Ok(())
    }
}

impl Denoiser for BlendDenoiser {
    fn num_steps_conditioning(&self) -> usize {
        self.num_steps_conditioning
    }

    fn sample_next_obs(
        &self,
        obs: &[Frame],
        act: &[Action],
        sampler: &DiffusionSamplerConfig,
        rng: &mut StdRng,
    ) -> Denoised {
        sample_toward(self.target(obs, act), sampler, rng)
    }

    fn compiled(&self) -> Option<Arc<dyn Denoiser>> {
        Some(Arc::new(Self {
            fused: true,
            ..self.clone()
        }))
    }
}

// ──────────────────────────────────────────────────────────────
// Upsampler
// ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ResizeUpsampler {
    channels: usize,
    factor: usize,
    num_steps_conditioning: usize,
    /// Weight of the previous full-resolution frame in the target.
    history_blend: f32,
    device: Device,
    inference: bool,
    fused: bool,
}

impl ResizeUpsampler {
    pub fn new(cfg: &UpsamplerConfig) -> Self {
        Self {
            channels: cfg.inner_model.img_channels,
            factor: cfg.upsampling_factor.max(1),
            num_steps_conditioning: cfg.inner_model.num_steps_conditioning,
            history_blend: 0.0,
            device: Device::Cpu,
            inference: false,
            fused: false,
        }
    }

    fn target(&self, low_res_next: &Frame, full_res: &[Frame]) -> Frame {
        let mut up = upscale_nearest(low_res_next, self.factor);
        let prev = full_res
            .last()
            .filter(|p| p.dim() == up.dim() && self.history_blend > 0.0);
        let b = self.history_blend;
        for_each_channel(&mut up, self.fused, |c, mut plane| {
            if let Some(prev) = prev {
                plane.zip_mut_with(&prev.index_axis(Axis(0), c), |v, &p| {
                    *v = (1.0 - b) * *v + b * p;
                });
            }
            plane.mapv_inplace(|v| v.clamp(-1.0, 1.0));
        });
        up
    }
}

impl Module for ResizeUpsampler {
    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn device(&self) -> Device {
        self.device
    }

    fn set_inference(&mut self) {
        self.inference = true;
    }

    fn is_inference(&self) -> bool {
        self.inference
    }

    fn load_state(&mut self, state: &StateDict) -> Result<(), CheckpointError> {
        if state.is_empty() {
            return Ok(());
        }
        self.history_blend = state.require_scalar("history_blend")?.clamp(0.0, 1.0);
        Ok(())
    }
}

impl Upsampler for ResizeUpsampler {
    fn num_steps_conditioning(&self) -> usize {
        self.num_steps_conditioning
    }

    fn upsampling_factor(&self) -> usize {
        self.factor
    }

    fn sample_upsampled(
        &self,
        low_res_next: &Frame,
        full_res: &[Frame],
        _act: &[Action],
        sampler: &DiffusionSamplerConfig,
        rng: &mut StdRng,
    ) -> Denoised {
        debug_assert_eq!(low_res_next.dim().0, self.channels);
        sample_toward(self.target(low_res_next, full_res), sampler, rng)
    }

    fn compiled(&self) -> Option<Arc<dyn Upsampler>> {
        Some(Arc::new(Self {
            fused: true,
            ..self.clone()
        }))
    }
}

// ──────────────────────────────────────────────────────────────
// Reward / end head
// ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct RewardEndHead {
    channels: usize,
    /// `[3, channels]` logits for rewards -1, 0, +1.
    reward_weights: Array2<f32>,
    reward_bias: Array1<f32>,
    end_weights: Array1<f32>,
    end_bias: f32,
    hidden_decay: f32,
    end_threshold: f32,
    device: Device,
    inference: bool,
}

impl RewardEndHead {
    /// Defaults predict reward 0 and never end.
    pub fn new(cfg: &RewEndModelConfig) -> Self {
        let channels = cfg.img_channels;
        Self {
            channels,
            reward_weights: Array2::zeros((3, channels)),
            reward_bias: Array1::from_vec(vec![0.0, 1.0, 0.0]),
            end_weights: Array1::zeros(channels),
            end_bias: -10.0,
            hidden_decay: 0.9,
            end_threshold: cfg.end_threshold,
            device: Device::Cpu,
            inference: false,
        }
    }
}

impl Module for RewardEndHead {
    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn device(&self) -> Device {
        self.device
    }

    fn set_inference(&mut self) {
        self.inference = true;
    }

    fn is_inference(&self) -> bool {
        self.inference
    }

    fn load_state(&mut self, state: &StateDict) -> Result<(), CheckpointError> {
        if state.is_empty() {
            return Ok(());
        }
        self.reward_weights = state.require_array2("reward_weights", 3, self.channels)?;
        self.reward_bias = state.require_array1("reward_bias", 3)?;
        self.end_weights = state.require_array1("end_weights", self.channels)?;
        self.end_bias = state.require_scalar("end_bias")?;
        if let Some(decay) = state.scalar("hidden_decay")? {
            self.hidden_decay = decay.clamp(0.0, 1.0);
        }
        Ok(())
    }
}

impl RewardEndModel for RewardEndHead {
    fn predict(
        &self,
        state: &mut RecurrentState,
        obs: &Frame,
        _act: Action,
        next_obs: &Frame,
    ) -> RewardEnd {
        let feat = channel_means(next_obs) - channel_means(obs);
        let hidden = match state.hidden.take() {
            Some(h) if h.len() == feat.len() => h * self.hidden_decay + &feat,
            _ => feat,
        };

        let (reward, end) = if hidden.len() == self.channels {
            let logits = self.reward_weights.dot(&hidden) + &self.reward_bias;
            let class = logits
                .iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0;
            let end_logit = self.end_weights.dot(&hidden) + self.end_bias;
            let p_end = 1.0 / (1.0 + (-end_logit).exp());
            (class as f32 - 1.0, p_end > self.end_threshold)
        } else {
            (0.0, false)
        };

        state.hidden = Some(hidden);
        RewardEnd { reward, end }
    }
}

// ──────────────────────────────────────────────────────────────
// Builder
// ──────────────────────────────────────────────────────────────

/// Builds the reference backend from the `agent` section.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceBuilder;

impl AgentBuilder for ReferenceBuilder {
    fn build(&self, cfg: &AgentConfig, num_actions: usize) -> anyhow::Result<AgentParts> {
        if num_actions == 0 {
            bail!("env.num_actions must be at least 1");
        }
        if cfg.denoiser.inner_model.num_steps_conditioning == 0 {
            bail!("agent.denoiser.inner_model.num_steps_conditioning must be at least 1");
        }
        let channels = cfg.denoiser.inner_model.img_channels;
        if let Some(up) = &cfg.upsampler {
            if up.inner_model.img_channels != channels {
                bail!(
                    "upsampler has {} channels but the denoiser produces {}",
                    up.inner_model.img_channels,
                    channels
                );
            }
        }

        Ok(AgentParts {
            denoiser: Box::new(BlendDenoiser::new(&cfg.denoiser, num_actions)),
            upsampler: cfg
                .upsampler
                .as_ref()
                .map(|u| Box::new(ResizeUpsampler::new(u)) as Box<dyn Upsampler>),
            rew_end_model: cfg
                .rew_end_model
                .as_ref()
                .map(|r| Box::new(RewardEndHead::new(r)) as Box<dyn RewardEndModel>),
            num_actions,
        })
    }
}
