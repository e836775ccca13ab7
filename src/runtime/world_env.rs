//! World-model environment.
//!
//! Holds one rolling context of `context_length` frames and actions. Each
//! step writes the chosen action into the newest slot, asks the denoiser for
//! the next low-resolution frame, optionally upsamples it, and predicts
//! reward and termination. The new frame is then pushed and the oldest one
//! dropped.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, ensure};
use rand::rngs::StdRng;
use tracing::debug;

use crate::model::agent::{Agent, Denoiser, RecurrentState, RewardEndModel, Upsampler};
use crate::model::frame::{upscale_nearest, Action, Frame};
use crate::runtime::spawn::{SpawnEntry, SpawnPool};
use crate::runtime::LoadError;
use crate::settings::schema::{DiffusionSamplerConfig, WorldModelEnvConfig};
use crate::settings::SettingsError;

/// Optional per-step captures.
#[derive(Clone, Debug, Default)]
pub struct StepInfo {
    /// The frame before upsampling.
    pub obs_low_res: Option<Frame>,
    pub denoising_trajectory: Option<Vec<Frame>>,
    pub upsampling_trajectory: Option<Vec<Frame>>,
}

#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub obs: Frame,
    pub reward: f32,
    pub end: bool,
    pub trunc: bool,
    pub info: StepInfo,
}

/// What to keep in [`StepInfo`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Captures {
    pub denoising_trajectory: bool,
    pub original_obs: bool,
}

pub struct WorldModelEnv {
    denoiser: Arc<dyn Denoiser>,
    upsampler: Option<Arc<dyn Upsampler>>,
    rew_end_model: Option<Arc<dyn RewardEndModel>>,
    num_actions: usize,
    spawn: SpawnPool,
    context_length: usize,
    horizon: usize,
    sampler_next_obs: DiffusionSamplerConfig,
    sampler_upsampling: Option<DiffusionSamplerConfig>,
    captures: Captures,
    low_res: VecDeque<Frame>,
    full_res: VecDeque<Frame>,
    actions: VecDeque<Action>,
    rew_state: RecurrentState,
    t: usize,
    rng: StdRng,
}

impl WorldModelEnv {
    pub fn new(
        agent: &Agent,
        spawn_dir: &Path,
        context_length: usize,
        cfg: &WorldModelEnvConfig,
        captures: Captures,
        rng: StdRng,
    ) -> Result<Self, LoadError> {
        let sampler_upsampling = match (&agent.upsampler, &cfg.diffusion_sampler_upsampling) {
            (Some(_), None) => {
                return Err(SettingsError::MissingKey(
                    "world_model_env.diffusion_sampler_upsampling".into(),
                )
                .into())
            }
            (Some(_), Some(s)) => Some(s.clone()),
            (None, _) => None,
        };
        let spawn = SpawnPool::open(spawn_dir, cfg.num_batches_to_preload)?;

        Ok(Self {
            denoiser: Arc::clone(&agent.denoiser),
            upsampler: agent.upsampler.clone(),
            rew_end_model: agent.rew_end_model.clone(),
            num_actions: agent.num_actions,
            spawn,
            context_length: context_length.max(1),
            horizon: cfg.horizon,
            sampler_next_obs: cfg.diffusion_sampler_next_obs.clone(),
            sampler_upsampling,
            captures,
            low_res: VecDeque::with_capacity(context_length),
            full_res: VecDeque::with_capacity(context_length),
            actions: VecDeque::with_capacity(context_length),
            rew_state: RecurrentState::default(),
            t: 0,
            rng,
        })
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn captures(&self) -> Captures {
        self.captures
    }

    pub fn has_upsampler(&self) -> bool {
        self.upsampler.is_some()
    }

    pub fn denoiser(&self) -> &Arc<dyn Denoiser> {
        &self.denoiser
    }

    pub fn upsampler(&self) -> Option<&Arc<dyn Upsampler>> {
        self.upsampler.as_ref()
    }

    /// Swap the per-step denoiser call path.
    pub fn set_denoiser(&mut self, denoiser: Arc<dyn Denoiser>) {
        self.denoiser = denoiser;
    }

    /// Swap the per-step upsampler call path. No-op without an upsampler.
    pub fn set_upsampler(&mut self, upsampler: Arc<dyn Upsampler>) {
        if self.upsampler.is_some() {
            self.upsampler = Some(upsampler);
        }
    }

    /// Steps taken since the last reset.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Start a new episode from a random spawn entry.
    pub fn reset(&mut self) -> anyhow::Result<(Frame, StepInfo)> {
        let entry = self.spawn.sample(&mut self.rng)?;
        self.reset_from(&entry)
    }

    /// Start a new episode from a given starting context.
    pub fn reset_from(&mut self, entry: &SpawnEntry) -> anyhow::Result<(Frame, StepInfo)> {
        entry
            .validate()
            .map_err(|reason| anyhow!("invalid spawn entry: {reason}"))?;
        let n = self.context_length;

        self.low_res = left_padded(&entry.low_res, n).into();
        self.actions = left_padded(&entry.act, n).into();
        self.full_res.clear();
        if let Some(up) = &self.upsampler {
            let full = match &entry.full_res {
                Some(full) => left_padded(full, n),
                None => self
                    .low_res
                    .iter()
                    .map(|f| upscale_nearest(f, up.upsampling_factor()))
                    .collect(),
            };
            self.full_res = full.into();
        }
        self.rew_state = RecurrentState::default();
        self.t = 0;

        let low = self.low_res.back().cloned().unwrap_or_default();
        let obs = self.full_res.back().cloned().unwrap_or_else(|| low.clone());
        let info = StepInfo {
            obs_low_res: self.captures.original_obs.then_some(low),
            ..StepInfo::default()
        };
        Ok((obs, info))
    }

    pub fn step(&mut self, action: Action) -> anyhow::Result<StepOutcome> {
        ensure!(!self.low_res.is_empty(), "step called before reset");
        ensure!(
            (action as usize) < self.num_actions,
            "action {} out of range 0..{}",
            action,
            self.num_actions
        );

        if let Some(slot) = self.actions.back_mut() {
            *slot = action;
        }
        let acts = self.actions.make_contiguous();
        let low = self.low_res.make_contiguous();

        let nd = self.denoiser.num_steps_conditioning().clamp(1, low.len());
        let denoised = self.denoiser.sample_next_obs(
            &low[low.len() - nd..],
            &acts[acts.len() - nd..],
            &self.sampler_next_obs,
            &mut self.rng,
        );
        let next_low = denoised.frame;

        let mut upsampling_trajectory = None;
        let next_full = match (&self.upsampler, &self.sampler_upsampling) {
            (Some(up), Some(sampler)) => {
                let full = self.full_res.make_contiguous();
                let nu = up.num_steps_conditioning().clamp(1, full.len());
                let out = up.sample_upsampled(
                    &next_low,
                    &full[full.len() - nu..],
                    &acts[acts.len() - nu..],
                    sampler,
                    &mut self.rng,
                );
                upsampling_trajectory = Some(out.trajectory);
                Some(out.frame)
            }
            _ => None,
        };

        let (reward, end) = match (&self.rew_end_model, low.last()) {
            (Some(model), Some(prev)) => {
                let re = model.predict(&mut self.rew_state, prev, action, &next_low);
                (re.reward, re.end)
            }
            _ => (0.0, false),
        };

        self.push(next_low.clone(), next_full.clone(), action);
        self.t += 1;
        let trunc = self.horizon > 0 && self.t >= self.horizon;
        debug!("t={} reward={} end={} trunc={}", self.t, reward, end, trunc);

        let info = StepInfo {
            obs_low_res: self.captures.original_obs.then(|| next_low.clone()),
            denoising_trajectory: self
                .captures
                .denoising_trajectory
                .then_some(denoised.trajectory),
            upsampling_trajectory: if self.captures.denoising_trajectory {
                upsampling_trajectory
            } else {
                None
            },
        };
        Ok(StepOutcome {
            obs: next_full.unwrap_or(next_low),
            reward,
            end,
            trunc,
            info,
        })
    }

    fn push(&mut self, low: Frame, full: Option<Frame>, action: Action) {
        if self.low_res.len() >= self.context_length {
            self.low_res.pop_front();
            self.actions.pop_front();
        }
        self.low_res.push_back(low);
        // Placeholder for the next step's action.
        self.actions.push_back(action);
        if let Some(full) = full {
            if self.full_res.len() >= self.context_length {
                self.full_res.pop_front();
            }
            self.full_res.push_back(full);
        }
    }
}

/// The last `n` items, left-padded by repeating the first.
fn left_padded<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    let tail = &items[items.len().saturating_sub(n)..];
    let mut out = Vec::with_capacity(n);
    if let Some(first) = tail.first() {
        out.extend(std::iter::repeat(first.clone()).take(n - tail.len()));
    }
    out.extend_from_slice(tail);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::AgentBuilder;
    use crate::model::checkpoint::StateDict;
    use crate::model::reference::ReferenceBuilder;
    use crate::settings::schema::{
        AgentConfig, DenoiserConfig, InnerModelConfig, RewEndModelConfig, UpsamplerConfig,
    };
    use ndarray::Array3;
    use rand::SeedableRng;

    fn sampler() -> DiffusionSamplerConfig {
        DiffusionSamplerConfig {
            num_steps_denoising: 2,
            sigma_min: 2e-3,
            sigma_max: 5.0,
            rho: 7.0,
        }
    }

    fn env_cfg(horizon: usize) -> WorldModelEnvConfig {
        WorldModelEnvConfig {
            horizon,
            num_batches_to_preload: 1,
            diffusion_sampler_next_obs: sampler(),
            diffusion_sampler_upsampling: Some(sampler()),
        }
    }

    fn agent(n_den: usize, upsampler: Option<usize>, rew: bool) -> Agent {
        let inner = |n| InnerModelConfig {
            img_channels: 3,
            num_steps_conditioning: n,
        };
        let cfg = AgentConfig {
            denoiser: DenoiserConfig {
                inner_model: inner(n_den),
            },
            upsampler: upsampler.map(|n| UpsamplerConfig {
                inner_model: inner(n),
                upsampling_factor: 2,
            }),
            rew_end_model: rew.then(|| RewEndModelConfig {
                img_channels: 3,
                end_threshold: 0.5,
            }),
        };
        let mut parts = ReferenceBuilder.build(&cfg, 4).unwrap();
        parts.set_inference();
        parts.into_agent()
    }

    fn spawn_dir(frames: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let entry = SpawnEntry {
            low_res: (0..frames)
                .map(|i| Array3::from_elem((3, 4, 4), i as f32 * 0.1))
                .collect(),
            act: vec![0; frames],
            full_res: None,
        };
        entry
            .to_state()
            .unwrap()
            .save(dir.path().join("0.safetensors"))
            .unwrap();
        dir
    }

    fn env(agent: &Agent, dir: &Path, n: usize, horizon: usize, captures: Captures) -> WorldModelEnv {
        WorldModelEnv::new(
            agent,
            dir,
            n,
            &env_cfg(horizon),
            captures,
            StdRng::seed_from_u64(5),
        )
        .unwrap()
    }

    #[test]
    fn test_left_padding() {
        assert_eq!(left_padded(&[1, 2], 4), vec![1, 1, 1, 2]);
        assert_eq!(left_padded(&[1, 2, 3, 4, 5], 3), vec![3, 4, 5]);
        assert_eq!(left_padded::<u32>(&[], 3), Vec::<u32>::new());
    }

    #[test]
    fn test_reset_fills_context() {
        let agent = agent(4, None, false);
        let dir = spawn_dir(2);
        let mut env = env(&agent, dir.path(), 4, 100, Captures::default());
        let (obs, info) = env.reset().unwrap();
        assert_eq!(env.low_res.len(), 4);
        assert_eq!(env.actions.len(), 4);
        assert!((obs[[0, 0, 0]] - 0.1).abs() < 1e-6);
        assert!((env.low_res[0][[0, 0, 0]]).abs() < 1e-6);
        assert!(info.obs_low_res.is_none());
    }

    #[test]
    fn test_step_keeps_context_length() {
        let agent = agent(3, None, false);
        let dir = spawn_dir(5);
        let mut env = env(&agent, dir.path(), 3, 100, Captures::default());
        env.reset().unwrap();
        for a in [0, 1, 2, 3, 1] {
            let out = env.step(a).unwrap();
            assert_eq!(out.obs.dim(), (3, 4, 4));
            assert_eq!(out.reward, 0.0);
            assert!(!out.end);
            assert_eq!(env.low_res.len(), 3);
            assert_eq!(env.actions.len(), 3);
        }
        assert_eq!(env.steps(), 5);
        assert_eq!(env.actions.iter().copied().collect::<Vec<_>>(), vec![3, 1, 1]);
    }

    #[test]
    fn test_identity_predictor_repeats_frame() {
        let agent = agent(2, None, false);
        let dir = spawn_dir(3);
        let mut env = env(&agent, dir.path(), 2, 100, Captures::default());
        let (obs, _) = env.reset().unwrap();
        let out = env.step(0).unwrap();
        let diff = (&out.obs - &obs).iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_horizon_truncates() {
        let agent = agent(2, None, false);
        let dir = spawn_dir(2);
        let mut env = env(&agent, dir.path(), 2, 3, Captures::default());
        env.reset().unwrap();
        assert!(!env.step(0).unwrap().trunc);
        assert!(!env.step(0).unwrap().trunc);
        assert!(env.step(0).unwrap().trunc);
        env.reset().unwrap();
        assert_eq!(env.steps(), 0);
    }

    #[test]
    fn test_upsampler_and_captures() {
        let agent = agent(2, Some(3), true);
        let dir = spawn_dir(4);
        let captures = Captures {
            denoising_trajectory: true,
            original_obs: true,
        };
        let mut env = env(&agent, dir.path(), 3, 100, captures);
        let (obs, info) = env.reset().unwrap();
        assert_eq!(obs.dim(), (3, 8, 8));
        assert_eq!(info.obs_low_res.unwrap().dim(), (3, 4, 4));

        let out = env.step(1).unwrap();
        assert_eq!(out.obs.dim(), (3, 8, 8));
        assert_eq!(out.info.obs_low_res.unwrap().dim(), (3, 4, 4));
        assert_eq!(out.info.denoising_trajectory.unwrap().len(), 2);
        assert_eq!(out.info.upsampling_trajectory.unwrap().len(), 2);
        assert_eq!(env.full_res.len(), 3);
    }

    #[test]
    fn test_invalid_action_and_step_before_reset() {
        let agent = agent(2, None, false);
        let dir = spawn_dir(2);
        let mut env = env(&agent, dir.path(), 2, 100, Captures::default());
        assert!(env.step(0).is_err());
        env.reset().unwrap();
        assert!(env.step(4).is_err());
    }

    fn short_entry() -> SpawnEntry {
        SpawnEntry {
            low_res: vec![Array3::zeros((3, 4, 4)); 2],
            act: vec![0, 1],
            full_res: None,
        }
    }

    #[test]
    fn test_reset_from_rejects_missing_actions() {
        let agent = agent(2, None, false);
        let dir = spawn_dir(2);
        let mut env = env(&agent, dir.path(), 2, 100, Captures::default());
        let mut entry = short_entry();
        entry.act.clear();
        assert!(env.reset_from(&entry).is_err());
        // The rejected entry leaves the environment unreset.
        assert!(env.step(0).is_err());
    }

    #[test]
    fn test_reset_from_rejects_empty_full_res() {
        let agent = agent(2, Some(2), false);
        let dir = spawn_dir(2);
        let mut env = env(&agent, dir.path(), 2, 100, Captures::default());
        let mut entry = short_entry();
        entry.full_res = Some(Vec::new());
        assert!(env.reset_from(&entry).is_err());
        assert!(env.step(0).is_err());

        env.reset_from(&short_entry()).unwrap();
        assert_eq!(env.step(0).unwrap().obs.dim(), (3, 8, 8));
    }

    #[test]
    fn test_upsampler_requires_sampler_config() {
        let agent = agent(2, Some(2), false);
        let dir = spawn_dir(2);
        let mut cfg = env_cfg(10);
        cfg.diffusion_sampler_upsampling = None;
        let err = WorldModelEnv::new(
            &agent,
            dir.path(),
            2,
            &cfg,
            Captures::default(),
            StdRng::seed_from_u64(0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LoadError::Config(SettingsError::MissingKey(_))));
    }

    #[test]
    fn test_checkpointed_reward_head_reports() {
        let cfg = AgentConfig {
            denoiser: DenoiserConfig {
                inner_model: InnerModelConfig {
                    img_channels: 3,
                    num_steps_conditioning: 1,
                },
            },
            upsampler: None,
            rew_end_model: Some(RewEndModelConfig {
                img_channels: 3,
                end_threshold: 0.5,
            }),
        };
        let mut parts = ReferenceBuilder.build(&cfg, 2).unwrap();
        let mut sd = StateDict::new();
        sd.insert("rew_end_model.reward_weights", ndarray::Array2::<f32>::zeros((3, 3)).into_dyn());
        sd.insert("rew_end_model.reward_bias", ndarray::arr1(&[0.0f32, 0.0, 1.0]).into_dyn());
        sd.insert("rew_end_model.end_weights", ndarray::Array1::<f32>::zeros(3).into_dyn());
        sd.insert("rew_end_model.end_bias", ndarray::arr1(&[5.0f32]).into_dyn());
        parts.load_state(&sd).unwrap();
        let agent = parts.into_agent();

        let dir = spawn_dir(1);
        let mut env = env(&agent, dir.path(), 1, 100, Captures::default());
        env.reset().unwrap();
        let out = env.step(1).unwrap();
        assert_eq!(out.reward, 1.0);
        assert!(out.end);
    }
}
