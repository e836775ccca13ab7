//! Episode recording.
//!
//! Each finished episode becomes two files in the record directory:
//! `episode_{n:06}.safetensors` with the tensors below and
//! `episode_{n:06}.meta.json` describing them. Both are written to a
//! temporary name first and renamed into place.
//!
//! | tensor | shape |
//! |---|---|
//! | `obs` | `[T+1, C, H, W]` |
//! | `act`, `rew`, `end`, `trunc` | `[T]` |
//! | `obs_low_res` (optional) | `[T+1, C, h, w]` |
//! | `denoising_trajectory` (optional) | `[T, S, C, h, w]` |
//! | `upsampling_trajectory` (optional) | `[T, S', C, H, W]` |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::{Array1, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::checkpoint::{CheckpointError, StateDict};
use crate::model::frame::{stack_frames, Action, Frame};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tensor encoding: {0}")]
    Encode(#[from] CheckpointError),
    #[error("inconsistent frame shapes: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("episode has no frames")]
    Empty,
}

/// One episode in memory.
#[derive(Clone, Debug, Default)]
pub struct Episode {
    pub obs: Vec<Frame>,
    pub obs_low_res: Vec<Frame>,
    pub act: Vec<Action>,
    pub rew: Vec<f32>,
    pub end: Vec<bool>,
    pub trunc: Vec<bool>,
    pub denoising_trajectory: Vec<Vec<Frame>>,
    pub upsampling_trajectory: Vec<Vec<Frame>>,
}

impl Episode {
    /// Steps recorded so far.
    pub fn len(&self) -> usize {
        self.act.len()
    }

    pub fn is_empty(&self) -> bool {
        self.act.is_empty()
    }

    pub fn total_reward(&self) -> f32 {
        self.rew.iter().sum()
    }

    fn to_state(&self) -> Result<StateDict, RecordError> {
        if self.obs.is_empty() {
            return Err(RecordError::Empty);
        }
        let mut sd = StateDict::new();
        sd.insert("obs", stack_frames(&self.obs)?);
        sd.insert("act", scalars(self.act.iter().map(|&a| a as f32)));
        sd.insert("rew", scalars(self.rew.iter().copied()));
        sd.insert("end", scalars(self.end.iter().map(|&b| f32::from(u8::from(b)))));
        sd.insert("trunc", scalars(self.trunc.iter().map(|&b| f32::from(u8::from(b)))));
        if !self.obs_low_res.is_empty() {
            sd.insert("obs_low_res", stack_frames(&self.obs_low_res)?);
        }
        if !self.denoising_trajectory.is_empty() {
            sd.insert("denoising_trajectory", stack_nested(&self.denoising_trajectory)?);
        }
        if !self.upsampling_trajectory.is_empty() {
            sd.insert("upsampling_trajectory", stack_nested(&self.upsampling_trajectory)?);
        }
        Ok(sd)
    }
}

fn scalars(values: impl Iterator<Item = f32>) -> ArrayD<f32> {
    Array1::from_iter(values).into_dyn()
}

/// `[T][S]` frames to `[T, S, C, H, W]`.
fn stack_nested(steps: &[Vec<Frame>]) -> Result<ArrayD<f32>, ndarray::ShapeError> {
    let s = steps.first().map_or(0, Vec::len);
    if steps.iter().any(|t| t.len() != s) {
        return Err(ndarray::ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape));
    }
    let flat: Vec<Frame> = steps.iter().flatten().cloned().collect();
    let stacked = stack_frames(&flat)?;
    let mut shape = vec![steps.len(), s];
    shape.extend_from_slice(&stacked.shape()[1..]);
    stacked.into_shape(IxDyn(&shape))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub episode: u64,
    pub model: String,
    pub num_steps: usize,
    /// `[C, H, W]` of `obs`.
    pub frame_shape: Vec<usize>,
    pub total_reward: f32,
    pub ended: bool,
    pub truncated: bool,
    pub streams: Vec<String>,
    pub created_unix_s: u64,
}

/// Numbered episode writer for one directory.
#[derive(Debug)]
pub struct EpisodeRecorder {
    dir: PathBuf,
    model: String,
    next_index: u64,
}

impl EpisodeRecorder {
    /// Create `dir` if needed and continue numbering after any episodes
    /// already in it.
    pub fn open(dir: impl Into<PathBuf>, model: impl Into<String>) -> Result<Self, RecordError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RecordError::Io {
            path: dir.clone(),
            source,
        })?;
        let next_index = next_free_index(&dir)?;
        Ok(Self {
            dir,
            model: model.into(),
            next_index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn tensors_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("episode_{index:06}.safetensors"))
    }

    pub fn meta_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("episode_{index:06}.meta.json"))
    }

    /// Write `episode` and return its tensor file path.
    pub fn save(&mut self, episode: &Episode) -> Result<PathBuf, RecordError> {
        let sd = episode.to_state()?;
        let index = self.next_index;

        let final_st = self.tensors_path(index);
        write_atomic(&final_st, &sd.to_bytes()?)?;

        let meta = EpisodeMeta {
            episode: index,
            model: self.model.clone(),
            num_steps: episode.len(),
            frame_shape: episode.obs.first().map(|f| f.shape().to_vec()).unwrap_or_default(),
            total_reward: episode.total_reward(),
            ended: episode.end.last().copied().unwrap_or(false),
            truncated: episode.trunc.last().copied().unwrap_or(false),
            streams: sd.names().map(str::to_string).collect(),
            created_unix_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        };
        write_atomic(&self.meta_path(index), &serde_json::to_vec_pretty(&meta)?)?;

        self.next_index += 1;
        info!(
            "Recorded episode {} ({} steps) to {}",
            index,
            episode.len(),
            final_st.display()
        );
        Ok(final_st)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecordError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

fn next_free_index(dir: &Path) -> Result<u64, RecordError> {
    let io_err = |source| RecordError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut next = 0;
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let index = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("episode_"))
            .and_then(|n| n.strip_suffix(".safetensors"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(i) = index {
            next = next.max(i + 1);
        }
    }
    Ok(next)
}
