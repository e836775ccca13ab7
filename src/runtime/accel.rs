//! One-time compilation of the per-step call paths.

use tracing::info;

use crate::runtime::device::Device;
use crate::runtime::world_env::WorldModelEnv;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileOutcome {
    NotRequested,
    /// The device has no compilation path; the eager path stays in place.
    Skipped,
    /// `stages` call paths were swapped for compiled variants.
    Compiled { stages: usize },
}

/// Swap the environment's denoiser and upsampler for compiled variants when
/// `requested` and the device supports it.
pub fn compile_step_paths(env: &mut WorldModelEnv, device: Device, requested: bool) -> CompileOutcome {
    if !requested {
        return CompileOutcome::NotRequested;
    }
    if !device.supports_compilation() {
        info!("Compilation is not available on {device}, running eagerly");
        return CompileOutcome::Skipped;
    }

    info!("Compiling models...");
    let mut stages = 0;
    if let Some(compiled) = env.denoiser().compiled() {
        env.set_denoiser(compiled);
        stages += 1;
    }
    if let Some(compiled) = env.upsampler().and_then(|u| u.compiled()) {
        env.set_upsampler(compiled);
        stages += 1;
    }
    if stages == 0 {
        info!("Backend has no compiled call path, running eagerly");
        return CompileOutcome::Skipped;
    }
    CompileOutcome::Compiled { stages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::AgentBuilder;
    use crate::model::reference::ReferenceBuilder;
    use crate::runtime::spawn::SpawnEntry;
    use crate::runtime::world_env::Captures;
    use crate::settings::schema::{
        AgentConfig, DenoiserConfig, DiffusionSamplerConfig, InnerModelConfig, UpsamplerConfig,
        WorldModelEnvConfig,
    };
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build_env(dir: &std::path::Path) -> WorldModelEnv {
        let inner = InnerModelConfig {
            img_channels: 3,
            num_steps_conditioning: 2,
        };
        let cfg = AgentConfig {
            denoiser: DenoiserConfig {
                inner_model: inner.clone(),
            },
            upsampler: Some(UpsamplerConfig {
                inner_model: inner,
                upsampling_factor: 2,
            }),
            rew_end_model: None,
        };
        let agent = ReferenceBuilder.build(&cfg, 3).unwrap().into_agent();

        let entry = SpawnEntry {
            low_res: (0..2)
                .map(|i| Array3::from_shape_fn((3, 4, 4), |(c, y, x)| (c + y + x + i) as f32 * 0.05))
                .collect(),
            act: vec![0, 1],
            full_res: None,
        };
        entry.to_state().unwrap().save(dir.join("0.safetensors")).unwrap();

        let sampler = DiffusionSamplerConfig {
            num_steps_denoising: 3,
            sigma_min: 2e-3,
            sigma_max: 5.0,
            rho: 7.0,
        };
        let wm = WorldModelEnvConfig {
            horizon: 100,
            num_batches_to_preload: 1,
            diffusion_sampler_next_obs: sampler.clone(),
            diffusion_sampler_upsampling: Some(sampler),
        };
        WorldModelEnv::new(&agent, dir, 2, &wm, Captures::default(), StdRng::seed_from_u64(9))
            .unwrap()
    }

    fn rollout(env: &mut WorldModelEnv) -> Vec<Array3<f32>> {
        env.reset().unwrap();
        [0, 2, 1, 1]
            .into_iter()
            .map(|a| env.step(a).unwrap().obs)
            .collect()
    }

    #[test]
    fn test_skipped_on_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let mut eager = build_env(dir.path());
        let mut env = build_env(dir.path());
        assert_eq!(
            compile_step_paths(&mut env, Device::Cpu, true),
            CompileOutcome::Skipped
        );
        assert_eq!(rollout(&mut eager), rollout(&mut env));
    }

    #[test]
    fn test_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = build_env(dir.path());
        assert_eq!(
            compile_step_paths(&mut env, Device::Cuda(0), false),
            CompileOutcome::NotRequested
        );
    }

    #[test]
    fn test_compiled_on_cuda_matches_eager() {
        let dir = tempfile::tempdir().unwrap();
        let mut eager = build_env(dir.path());
        let mut env = build_env(dir.path());
        assert_eq!(
            compile_step_paths(&mut env, Device::Cuda(0), true),
            CompileOutcome::Compiled { stages: 2 }
        );
        for (a, b) in rollout(&mut eager).iter().zip(rollout(&mut env).iter()) {
            let diff = (a - b).iter().fold(0.0f32, |m, v| m.max(v.abs()));
            assert!(diff < 1e-5);
        }
    }
}
