//! Session orchestration.
//!
//! 1. Check the run options (inconsistent flags only warn)
//! 2. Compose the base configuration
//! 3. Derive the window size from `env.train.size`
//! 4. Select the device and load the model
//! 5. Size the context window and build the world-model environment
//! 6. Optionally compile the per-step call paths
//! 7. Bind the play session for the play loop

use std::path::PathBuf;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::config;
use crate::model::agent::AgentBuilder;
use crate::play::game::GameSettings;
use crate::play::play_env::PlayEnv;
use crate::play::recorder::EpisodeRecorder;
use crate::runtime::accel::{compile_step_paths, CompileOutcome};
use crate::runtime::context::resolve_context_length;
use crate::runtime::device::{select_device, Device, DeviceProbe};
use crate::runtime::identity::IdentitySource;
use crate::runtime::loader::ModelLoader;
use crate::runtime::registry::ArtifactRegistry;
use crate::runtime::world_env::{Captures, WorldModelEnv};
use crate::settings::schema::{FrameSize, WindowSize, WorldModelEnvConfig};
use crate::settings::{compose, ConfigTree, SettingsError};

/// Flags resolved once from the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Record played episodes to disk.
    pub record: bool,
    /// Keep denoising steps in recorded episodes. Needs `record`.
    pub store_denoising_trajectory: bool,
    /// Keep pre-upsampling frames in recorded episodes. Needs `record`.
    pub store_original_obs: bool,
    pub mouse_multiplier: u32,
    /// Window scale over the training frame size.
    pub size_multiplier: u32,
    /// Compile the per-step call paths where the device supports it.
    pub compile: bool,
    /// Headless rendering for hosted notebooks.
    pub colab: bool,
    /// Target tick rate; 0 runs unthrottled.
    pub fps: u32,
    /// Hide the status header.
    pub no_header: bool,
    /// Local bundle root. Empty counts as unset.
    pub model: Option<PathBuf>,
    /// Overrides `play.record_dir`.
    pub record_dir: Option<PathBuf>,
    /// Overrides `common.seed`; random when both are unset.
    pub seed: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            record: false,
            store_denoising_trajectory: false,
            store_original_obs: false,
            mouse_multiplier: config::DEFAULT_MOUSE_MULTIPLIER,
            size_multiplier: config::DEFAULT_SIZE_MULTIPLIER,
            compile: false,
            colab: false,
            fps: config::DEFAULT_FPS,
            no_header: false,
            model: None,
            record_dir: None,
            seed: None,
        }
    }
}

impl RunOptions {
    /// Warn about flags that have no effect. Returns whether it warned.
    pub fn check(&self) -> bool {
        let ignored = !self.record && (self.store_denoising_trajectory || self.store_original_obs);
        if ignored {
            warn!("Not in recording mode, ignoring --store* options");
        }
        ignored
    }

    pub fn captures(&self) -> Captures {
        Captures {
            denoising_trajectory: self.record && self.store_denoising_trajectory,
            original_obs: self.record && self.store_original_obs,
        }
    }
}

/// `env.train.size` times `multiplier`.
pub fn window_size(cfg: &ConfigTree, multiplier: u32) -> Result<WindowSize, SettingsError> {
    let size: FrameSize = cfg.extract("env.train.size")?;
    Ok(size.window(multiplier))
}

/// External collaborators of a session.
pub struct Collaborators<'a> {
    pub identity: &'a mut dyn IdentitySource,
    pub registry: &'a dyn ArtifactRegistry,
    pub builder: &'a dyn AgentBuilder,
    pub probe: &'a dyn DeviceProbe,
}

/// Everything the play loop needs, plus what was decided on the way.
pub struct Session {
    pub play_env: PlayEnv,
    pub game: GameSettings,
    pub model_name: String,
    pub device: Device,
    pub context_length: usize,
    pub compile: CompileOutcome,
    pub seed: u64,
}

pub fn prepare(opts: &RunOptions, collab: Collaborators<'_>) -> anyhow::Result<Session> {
    opts.check();

    let base = compose(config::BASE_CONFIG_NAME).context("failed to compose base configuration")?;
    let window = window_size(&base, opts.size_multiplier)?;

    let device = select_device(collab.probe);
    info!("Using device {device}");

    let loader = ModelLoader {
        registry: collab.registry,
        builder: collab.builder,
        model_dir: opts.model.clone(),
        device,
    };
    let loaded = loader
        .load(&base, collab.identity)
        .context("failed to load model")?;

    let context_length = resolve_context_length(
        loaded.agent.denoiser.num_steps_conditioning(),
        loaded
            .agent
            .upsampler
            .as_ref()
            .map(|u| u.num_steps_conditioning()),
    );

    let mut wm_cfg: WorldModelEnvConfig = loaded.config.extract("world_model_env")?;
    wm_cfg.num_batches_to_preload = config::PLAY_BATCHES_TO_PRELOAD;

    let seed = match opts.seed {
        Some(seed) => seed,
        None => config_seed(&loaded.config)?.unwrap_or_else(rand::random),
    };
    info!("Context length {context_length}, seed {seed}");

    let mut wm_env = WorldModelEnv::new(
        &loaded.agent,
        &loaded.paths.spawn_dir,
        context_length,
        &wm_cfg,
        opts.captures(),
        StdRng::seed_from_u64(seed),
    )
    .context("failed to build world-model environment")?;
    let compile = compile_step_paths(&mut wm_env, device, opts.compile);

    let recorder = if opts.record {
        let dir = record_dir(opts, &loaded.config)?;
        info!("Recording episodes to {}", dir.display());
        Some(EpisodeRecorder::open(dir, loaded.paths.name.clone())?)
    } else {
        None
    };
    let play_env = PlayEnv::new(
        loaded.agent,
        wm_env,
        opts.record,
        opts.store_denoising_trajectory,
        opts.store_original_obs,
        recorder,
    )?;

    Ok(Session {
        play_env,
        game: GameSettings {
            window,
            mouse_multiplier: opts.mouse_multiplier,
            fps: opts.fps,
            verbose: !opts.no_header,
            use_colab: opts.colab,
        },
        model_name: loaded.paths.name,
        device,
        context_length,
        compile,
        seed,
    })
}

fn config_seed(cfg: &ConfigTree) -> Result<Option<u64>, SettingsError> {
    if cfg.contains("common.seed") {
        cfg.extract("common.seed")
    } else {
        Ok(None)
    }
}

fn record_dir(opts: &RunOptions, cfg: &ConfigTree) -> Result<PathBuf, SettingsError> {
    if let Some(dir) = opts.record_dir.as_ref().filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir.clone());
    }
    if cfg.contains("play.record_dir") {
        return cfg.extract("play.record_dir");
    }
    Ok(PathBuf::from(config::DEFAULT_RECORD_DIR))
}
