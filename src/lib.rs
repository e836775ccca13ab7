//! # worldplay
//!
//! Play inside a learned world model. A trained predictor, conditioned on a
//! short history of frames and actions, synthesises the next frame every
//! tick; there is no game engine behind it.
//!
//! ## Components
//!
//! 1. **Settings**: layered YAML configuration and `${eval:...}` arithmetic
//! 2. **Model**: predictor traits, checkpoint I/O and a reference backend
//! 3. **Runtime**: device selection, model loading, context sizing, the
//!    world-model environment, and the session orchestrator
//! 4. **Play**: the play session, episode recording and a headless play loop
//!
//! ## Session flow
//!
//! CLI options → base configuration → model bundle (local or remote) →
//! agent on device → world-model environment → play loop.

pub mod model;
pub mod play;
pub mod runtime;
pub mod settings;

/// Crate-wide defaults.
pub mod config {
    /// Remote registry repository holding the published model bundles.
    pub const REGISTRY_REPO: &str = "DereWah/diamond-mariokart64";

    /// Registry endpoint.
    pub const REGISTRY_ENDPOINT: &str = "https://huggingface.co";

    /// Registry revision to download from.
    pub const REGISTRY_REVISION: &str = "main";

    /// Name of the packaged base configuration.
    pub const BASE_CONFIG_NAME: &str = "trainer";

    /// Target frame rate.
    pub const DEFAULT_FPS: u32 = 15;

    /// Pointer-derived action magnitude scale.
    pub const DEFAULT_MOUSE_MULTIPLIER: u32 = 10;

    /// On-screen window scale.
    pub const DEFAULT_SIZE_MULTIPLIER: u32 = 2;

    /// Interactive play drives exactly one episode.
    pub const PLAY_BATCH_SIZE: usize = 1;

    /// Spawn entries read eagerly when the world-model environment is built.
    pub const PLAY_BATCHES_TO_PRELOAD: usize = 1;

    /// Directory recorded episodes land in unless overridden.
    pub const DEFAULT_RECORD_DIR: &str = "dataset/recorded";

    /// Maximum nesting depth for `${...}` interpolation.
    pub const MAX_INTERPOLATION_DEPTH: usize = 16;
}
