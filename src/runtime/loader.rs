//! Model loading.
//!
//! A bundle for model `<name>` lives under a root directory:
//!
//! ```text
//! <root>/<name>/model/<name>.pt
//! <root>/<name>/spawn/
//! <root>/<name>/config/agent/<name>.yaml
//! <root>/<name>/config/env/<name>.yaml
//! ```
//!
//! The root is either a local directory or the registry snapshot the bundle
//! was fetched into. The two config documents replace the base
//! configuration's `agent` and `env` sections, and `env.train.id` must name
//! the model before anything is built.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::model::agent::{Agent, AgentBuilder};
use crate::runtime::device::Device;
use crate::runtime::identity::IdentitySource;
use crate::runtime::registry::ArtifactRegistry;
use crate::runtime::LoadError;
use crate::settings::schema::{AgentConfig, EnvConfig};
use crate::settings::ConfigTree;

/// Paths derived from the bundle root and model name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub name: String,
    pub checkpoint: PathBuf,
    pub spawn_dir: PathBuf,
    pub agent_config: PathBuf,
    pub env_config: PathBuf,
}

impl ModelPaths {
    pub fn new(root: &Path, name: &str) -> Self {
        let dir = root.join(name);
        Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            checkpoint: dir.join("model").join(format!("{name}.pt")),
            spawn_dir: dir.join("spawn"),
            agent_config: dir.join("config").join("agent").join(format!("{name}.yaml")),
            env_config: dir.join("config").join("env").join(format!("{name}.yaml")),
        }
    }
}

/// A loaded model and the configuration it was loaded with.
#[derive(Debug)]
pub struct LoadedModel {
    pub paths: ModelPaths,
    /// Base configuration with the bundle's sections applied, resolved.
    pub config: ConfigTree,
    pub env: EnvConfig,
    pub agent_config: AgentConfig,
    pub agent: Agent,
}

/// An empty override path counts as no override.
pub fn effective_override(dir: Option<&Path>) -> Option<&Path> {
    dir.filter(|d| !d.as_os_str().is_empty())
}

pub struct ModelLoader<'a> {
    pub registry: &'a dyn ArtifactRegistry,
    pub builder: &'a dyn AgentBuilder,
    /// Local bundle root; bypasses the registry when set.
    pub model_dir: Option<PathBuf>,
    pub device: Device,
}

impl ModelLoader<'_> {
    pub fn load(
        &self,
        base: &ConfigTree,
        identity: &mut dyn IdentitySource,
    ) -> Result<LoadedModel, LoadError> {
        let name = identity.model_name().map_err(LoadError::Identity)?;
        validate_name(&name)?;

        let root = match effective_override(self.model_dir.as_deref()) {
            Some(dir) => {
                info!("Using local model directory {}", dir.display());
                dir.to_path_buf()
            }
            None => self.registry.fetch_subtree(&name)?,
        };
        let paths = ModelPaths::new(&root, &name);

        let config = bundle_config(base, &paths)?;
        let env: EnvConfig = config.extract("env")?;
        if env.train.id != name {
            return Err(LoadError::IdentityMismatch {
                expected: name,
                found: env.train.id,
            });
        }
        let agent_config: AgentConfig = config.extract("agent")?;

        let mut parts = self
            .builder
            .build(&agent_config, env.num_actions)
            .map_err(|e| LoadError::Build(e.into()))?;
        parts.to_device(self.device);
        parts.set_inference();
        parts.load(&paths.checkpoint)?;
        let agent = parts.into_agent();
        info!("Loaded '{}' on {}: {:?}", name, self.device, agent);

        Ok(LoadedModel {
            paths,
            config,
            env,
            agent_config,
            agent,
        })
    }
}

fn validate_name(name: &str) -> Result<(), LoadError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if ok {
        Ok(())
    } else {
        Err(LoadError::InvalidName(name.to_string()))
    }
}

/// Base configuration with the bundle's `agent` and `env` documents in
/// place of its own, resolved.
fn bundle_config(base: &ConfigTree, paths: &ModelPaths) -> Result<ConfigTree, LoadError> {
    let mut cfg = base.clone();
    for (key, path) in [("agent", &paths.agent_config), ("env", &paths.env_config)] {
        if !path.is_file() {
            return Err(LoadError::MissingArtifact {
                kind: "config document",
                path: path.clone(),
            });
        }
        cfg.replace_section(key, ConfigTree::load(path)?);
    }
    let resolved = cfg.resolve()?;
    debug!("resolved configuration:\n{}", resolved.to_yaml_string());
    Ok(resolved)
}
