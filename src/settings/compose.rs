//! Packaged base configurations.

use super::{ConfigTree, SettingsError};

const TRAINER_YAML: &str = include_str!("../../config/trainer.yaml");

/// Compose a named base configuration from the packaged defaults.
pub fn compose(name: &str) -> Result<ConfigTree, SettingsError> {
    match name {
        "trainer" => ConfigTree::from_yaml_str(TRAINER_YAML),
        other => Err(SettingsError::UnknownConfig(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::schema::{AgentConfig, EnvConfig, FrameSize, WorldModelEnvConfig};

    #[test]
    fn test_trainer_sections_deserialize() {
        let cfg = compose("trainer").unwrap();
        let env: EnvConfig = cfg.extract("env").unwrap();
        assert_eq!(env.train.size, FrameSize::Square(64));

        let agent: AgentConfig = cfg.extract("agent").unwrap();
        let rew_end = agent.rew_end_model.expect("packaged default has a reward head");
        assert_eq!(rew_end.img_channels, agent.denoiser.inner_model.img_channels);

        let wm: WorldModelEnvConfig = cfg.extract("world_model_env").unwrap();
        assert!(wm.horizon > 0);
        assert!(wm.diffusion_sampler_upsampling.is_some());
    }

    #[test]
    fn test_unknown_config_name() {
        assert!(matches!(
            compose("evaluator"),
            Err(SettingsError::UnknownConfig(n)) if n == "evaluator"
        ));
    }
}
