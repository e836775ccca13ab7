//! The play session: agent and world-model environment, plus recording.

use std::path::PathBuf;

use anyhow::{ensure, Context};
use tracing::debug;

use crate::model::agent::Agent;
use crate::model::frame::{Action, Frame};
use crate::play::recorder::{Episode, EpisodeRecorder};
use crate::runtime::world_env::{StepOutcome, WorldModelEnv};

pub struct PlayEnv {
    agent: Agent,
    env: WorldModelEnv,
    record: bool,
    store_denoising_trajectory: bool,
    store_original_obs: bool,
    recorder: Option<EpisodeRecorder>,
    episode: Episode,
    saved: Vec<PathBuf>,
}

impl PlayEnv {
    /// `recorder` is required when `record` is set. The two `store_*` flags
    /// only take effect while recording.
    pub fn new(
        agent: Agent,
        env: WorldModelEnv,
        record: bool,
        store_denoising_trajectory: bool,
        store_original_obs: bool,
        recorder: Option<EpisodeRecorder>,
    ) -> anyhow::Result<Self> {
        ensure!(!record || recorder.is_some(), "recording requires a recorder");
        Ok(Self {
            agent,
            env,
            record,
            store_denoising_trajectory: record && store_denoising_trajectory,
            store_original_obs: record && store_original_obs,
            recorder: if record { recorder } else { None },
            episode: Episode::default(),
            saved: Vec::new(),
        })
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn world_env(&self) -> &WorldModelEnv {
        &self.env
    }

    pub fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    pub fn is_recording(&self) -> bool {
        self.record
    }

    /// Tensor files written so far.
    pub fn saved_episodes(&self) -> &[PathBuf] {
        &self.saved
    }

    /// Start a new episode; an unfinished recorded episode is saved first.
    pub fn reset(&mut self) -> anyhow::Result<Frame> {
        self.flush()?;
        let (obs, info) = self.env.reset()?;
        if self.record {
            self.episode.obs.push(obs.clone());
            if self.store_original_obs {
                if let Some(low) = info.obs_low_res {
                    self.episode.obs_low_res.push(low);
                }
            }
        }
        Ok(obs)
    }

    pub fn step(&mut self, action: Action) -> anyhow::Result<StepOutcome> {
        let out = self.env.step(action)?;
        if self.record {
            let ep = &mut self.episode;
            ep.obs.push(out.obs.clone());
            ep.act.push(action);
            ep.rew.push(out.reward);
            ep.end.push(out.end);
            ep.trunc.push(out.trunc);
            if self.store_original_obs {
                if let Some(low) = &out.info.obs_low_res {
                    ep.obs_low_res.push(low.clone());
                }
            }
            if self.store_denoising_trajectory {
                if let Some(t) = &out.info.denoising_trajectory {
                    ep.denoising_trajectory.push(t.clone());
                }
                if let Some(t) = &out.info.upsampling_trajectory {
                    ep.upsampling_trajectory.push(t.clone());
                }
            }
            if out.end || out.trunc {
                self.flush()?;
            }
        }
        Ok(out)
    }

    /// Save any recorded steps not yet written.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.flush()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        let episode = std::mem::take(&mut self.episode);
        if episode.is_empty() {
            return Ok(());
        }
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(());
        };
        let path = recorder
            .save(&episode)
            .with_context(|| format!("failed to record episode to {}", recorder.dir().display()))?;
        debug!("episode saved: {}", path.display());
        self.saved.push(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::AgentBuilder;
    use crate::model::checkpoint::StateDict;
    use crate::model::reference::ReferenceBuilder;
    use crate::runtime::spawn::SpawnEntry;
    use crate::runtime::world_env::Captures;
    use crate::settings::schema::{
        AgentConfig, DenoiserConfig, DiffusionSamplerConfig, InnerModelConfig,
        WorldModelEnvConfig,
    };
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn play_env(dir: &std::path::Path, record: bool, store: bool, horizon: usize) -> PlayEnv {
        let cfg = AgentConfig {
            denoiser: DenoiserConfig {
                inner_model: InnerModelConfig {
                    img_channels: 3,
                    num_steps_conditioning: 2,
                },
            },
            upsampler: None,
            rew_end_model: None,
        };
        let agent = ReferenceBuilder.build(&cfg, 3).unwrap().into_agent();

        let spawn = dir.join("spawn");
        std::fs::create_dir_all(&spawn).unwrap();
        let entry = SpawnEntry {
            low_res: vec![Array3::from_elem((3, 4, 4), 0.2f32); 2],
            act: vec![0, 0],
            full_res: None,
        };
        entry.to_state().unwrap().save(spawn.join("0.safetensors")).unwrap();

        let sampler = DiffusionSamplerConfig {
            num_steps_denoising: 2,
            sigma_min: 2e-3,
            sigma_max: 5.0,
            rho: 7.0,
        };
        let wm_cfg = WorldModelEnvConfig {
            horizon,
            num_batches_to_preload: 1,
            diffusion_sampler_next_obs: sampler,
            diffusion_sampler_upsampling: None,
        };
        let captures = Captures {
            denoising_trajectory: record && store,
            original_obs: record && store,
        };
        let wm = WorldModelEnv::new(&agent, &spawn, 2, &wm_cfg, captures, StdRng::seed_from_u64(1))
            .unwrap();
        let recorder = record.then(|| EpisodeRecorder::open(dir.join("rec"), "test").unwrap());
        PlayEnv::new(agent, wm, record, store, store, recorder).unwrap()
    }

    #[test]
    fn test_not_recording_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = play_env(dir.path(), false, true, 2);
        env.reset().unwrap();
        env.step(0).unwrap();
        env.step(1).unwrap();
        env.finish().unwrap();
        assert!(env.saved_episodes().is_empty());
        assert!(!dir.path().join("rec").exists());
    }

    #[test]
    fn test_truncation_saves_episode() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = play_env(dir.path(), true, false, 2);
        env.reset().unwrap();
        env.step(0).unwrap();
        assert!(env.step(2).unwrap().trunc);
        assert_eq!(env.saved_episodes().len(), 1);

        let sd = StateDict::load(&env.saved_episodes()[0]).unwrap();
        assert_eq!(sd.get("obs").unwrap().shape(), &[3, 3, 4, 4]);
        assert_eq!(sd.get("act").unwrap().as_slice().unwrap(), &[0.0, 2.0]);
        assert!(sd.get("denoising_trajectory").is_none());
    }

    #[test]
    fn test_optional_streams_follow_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = play_env(dir.path(), true, true, 100);
        env.reset().unwrap();
        env.step(1).unwrap();
        env.finish().unwrap();

        let sd = StateDict::load(&env.saved_episodes()[0]).unwrap();
        assert_eq!(sd.get("obs_low_res").unwrap().shape(), &[2, 3, 4, 4]);
        assert_eq!(
            sd.get("denoising_trajectory").unwrap().shape(),
            &[1, 2, 3, 4, 4]
        );
    }

    #[test]
    fn test_reset_flushes_partial_episode() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = play_env(dir.path(), true, false, 100);
        env.reset().unwrap();
        env.step(0).unwrap();
        env.reset().unwrap();
        assert_eq!(env.saved_episodes().len(), 1);
        env.finish().unwrap();
        assert_eq!(env.saved_episodes().len(), 1);
    }

    #[test]
    fn test_record_without_recorder_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = play_env(dir.path(), false, false, 10);
        let PlayEnv { agent, env: wm, .. } = env;
        assert!(PlayEnv::new(agent, wm, true, false, false, None).is_err());
    }
}
