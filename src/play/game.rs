//! Play loops.
//!
//! A play loop owns the session once it starts: it picks an action every
//! tick, steps the session, shows or records the result, and keeps the
//! tick rate at the configured fps. The windowed front end is an external
//! collaborator behind [`PlayLoop`]; [`HeadlessGame`] drives a session
//! without one.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::play::actions::ActionSource;
use crate::play::play_env::PlayEnv;
use crate::play::timing::FrameTimer;
use crate::settings::schema::WindowSize;

/// Front-end settings handed over by the session orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameSettings {
    /// Display size: the training frame size times the size multiplier.
    pub window: WindowSize,
    /// Scale applied to pointer movement before it becomes an action.
    pub mouse_multiplier: u32,
    /// Target tick rate; 0 runs unthrottled.
    pub fps: u32,
    /// Show the header/status line.
    pub verbose: bool,
    /// Hosted-notebook rendering; tags the header in the headless loop.
    pub use_colab: bool,
}

impl GameSettings {
    pub fn frame_budget(&self) -> Option<Duration> {
        (self.fps > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(self.fps)))
    }
}

pub trait PlayLoop {
    fn run(&mut self, env: PlayEnv) -> anyhow::Result<()>;
}

/// Summary of a finished headless run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub episodes: u64,
    pub total_reward: f32,
    pub quit: bool,
}

pub struct HeadlessGame {
    settings: GameSettings,
    actions: Box<dyn ActionSource>,
    max_ticks: Option<u64>,
    timer: FrameTimer,
    summary: RunSummary,
}

impl HeadlessGame {
    pub fn new(settings: GameSettings, actions: Box<dyn ActionSource>, max_ticks: Option<u64>) -> Self {
        Self {
            settings,
            actions,
            max_ticks,
            timer: FrameTimer::default(),
            summary: RunSummary::default(),
        }
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn timer(&self) -> &FrameTimer {
        &self.timer
    }

    fn header(&self, env: &PlayEnv, episode_reward: f32) {
        info!(
            "[{}x{}{}] tick {} | episode {} step {} | reward {:+.0} | {:.1} ms/tick (p99 {:.1}) | {:.1} fps{}",
            self.settings.window.width,
            self.settings.window.height,
            if self.settings.use_colab { " colab" } else { "" },
            self.summary.ticks,
            self.summary.episodes,
            env.world_env().steps(),
            episode_reward,
            self.timer.mean_ms(),
            self.timer.p99_ms(),
            self.timer.achieved_fps(),
            if env.is_recording() { " | REC" } else { "" },
        );
    }
}

impl PlayLoop for HeadlessGame {
    fn run(&mut self, mut env: PlayEnv) -> anyhow::Result<()> {
        let budget = self.settings.frame_budget();
        info!(
            "Headless play: {} actions, window {}x{}, mouse x{}, fps {}",
            env.num_actions(),
            self.settings.window.width,
            self.settings.window.height,
            self.settings.mouse_multiplier,
            self.settings.fps
        );

        let mut obs = env.reset()?;
        let mut episode_reward = 0.0f32;
        let mut last_header = Instant::now();

        while self.max_ticks.map_or(true, |max| self.summary.ticks < max) {
            let start = Instant::now();
            let Some(action) = self.actions.next_action(&obs, env.num_actions()) else {
                info!("Quit requested");
                self.summary.quit = true;
                break;
            };

            let out = env.step(action)?;
            self.summary.ticks += 1;
            self.summary.total_reward += out.reward;
            episode_reward += out.reward;
            obs = out.obs;

            if out.end || out.trunc {
                debug!(
                    "episode {} over after {} steps (end={}, trunc={}), reward {}",
                    self.summary.episodes,
                    env.world_env().steps(),
                    out.end,
                    out.trunc,
                    episode_reward
                );
                self.summary.episodes += 1;
                episode_reward = 0.0;
                obs = env.reset()?;
            }

            self.timer.record(start.elapsed());
            if self.settings.verbose && last_header.elapsed() >= Duration::from_secs(1) {
                self.header(&env, episode_reward);
                last_header = Instant::now();
            }
            if let Some(budget) = budget {
                let elapsed = start.elapsed();
                if elapsed < budget {
                    thread::sleep(budget - elapsed);
                }
            }
        }

        env.finish()?;
        info!(
            "Played {} ticks over {} finished episode(s), total reward {}",
            self.summary.ticks, self.summary.episodes, self.summary.total_reward
        );
        Ok(())
    }
}
