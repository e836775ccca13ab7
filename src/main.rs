//! worldplay: play inside a learned world model.
//!
//! This is the CLI binary entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use worldplay::config;
use worldplay::model::reference::ReferenceBuilder;
use worldplay::play::actions::{ActionSource, RandomActions, ScriptedActions};
use worldplay::play::{HeadlessGame, PlayLoop};
use worldplay::runtime::device::SystemProbe;
use worldplay::runtime::identity::{FixedIdentity, IdentitySource, PromptIdentity};
use worldplay::runtime::registry::HubRegistry;
use worldplay::runtime::session::{self, Collaborators, RunOptions};

/// Play a world model in real time.
#[derive(Parser, Debug)]
#[command(name = "worldplay", about = "Play inside a learned world model", version)]
struct Cli {
    /// Record episodes in the play session.
    #[arg(short, long)]
    record: bool,

    /// Save denoising steps with recorded episodes.
    #[arg(long)]
    store_denoising_trajectory: bool,

    /// Save original (pre-resize) observations with recorded episodes.
    #[arg(long)]
    store_original_obs: bool,

    /// Multiplication factor for pointer movement.
    #[arg(long, default_value_t = config::DEFAULT_MOUSE_MULTIPLIER)]
    mouse_multiplier: u32,

    /// Multiplication factor for the screen size.
    #[arg(long, default_value_t = config::DEFAULT_SIZE_MULTIPLIER)]
    size_multiplier: u32,

    /// Compile the per-step models (CUDA only; ignored elsewhere).
    #[arg(long)]
    compile: bool,

    /// Headless rendering path for hosted notebooks.
    #[arg(long)]
    colab: bool,

    /// Frame rate. 0 runs unthrottled.
    #[arg(long, default_value_t = config::DEFAULT_FPS)]
    fps: u32,

    /// Hide the status header.
    #[arg(long)]
    no_header: bool,

    /// Directory holding a downloaded model bundle; skips the registry.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Model name. Prompted for when omitted.
    #[arg(long)]
    name: Option<String>,

    /// Stop after this many ticks.
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Where recorded episodes go (default: `play.record_dir`).
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Seed for spawn sampling, denoising noise and random actions.
    #[arg(long)]
    seed: Option<u64>,

    /// Comma-separated action script, `q` to quit (e.g. "0,3,3,q").
    /// Random actions when omitted.
    #[arg(long)]
    actions: Option<String>,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            record: self.record,
            store_denoising_trajectory: self.store_denoising_trajectory,
            store_original_obs: self.store_original_obs,
            mouse_multiplier: self.mouse_multiplier,
            size_multiplier: self.size_multiplier,
            compile: self.compile,
            colab: self.colab,
            fps: self.fps,
            no_header: self.no_header,
            model: self.model.clone(),
            record_dir: self.record_dir.clone(),
            seed: self.seed,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("worldplay v{}", env!("CARGO_PKG_VERSION"));

    let opts = cli.run_options();
    let mut identity: Box<dyn IdentitySource> = match &cli.name {
        Some(name) => Box::new(FixedIdentity(name.clone())),
        None => Box::new(PromptIdentity::stdin()),
    };
    let registry = HubRegistry::published();

    let session = session::prepare(
        &opts,
        Collaborators {
            identity: identity.as_mut(),
            registry: &registry,
            builder: &ReferenceBuilder,
            probe: &SystemProbe,
        },
    )?;

    let actions: Box<dyn ActionSource> = match &cli.actions {
        Some(script) => Box::new(ScriptedActions::parse(script).context("invalid --actions")?),
        None => Box::new(RandomActions::new(StdRng::seed_from_u64(
            session.seed.wrapping_add(1),
        ))),
    };
    let mut game = HeadlessGame::new(session.game, actions, cli.max_ticks);
    game.run(session.play_env)?;

    tracing::info!("Done.");
    Ok(())
}
