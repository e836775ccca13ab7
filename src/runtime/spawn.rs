//! Spawn pool: recorded starting contexts the environment resets into.
//!
//! Every `*.safetensors` file in the spawn directory is one entry:
//! - `low_res`  `[T, C, H, W]` frames at predictor resolution
//! - `act`      `[T]` actions, stored as f32
//! - `full_res` `[T, C, H', W']` optional upsampled frames
//!
//! Entries are listed once and read lazily; the first
//! `num_batches_to_preload` are read when the pool opens.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{ArrayD, Axis, Ix3};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use crate::model::checkpoint::StateDict;
use crate::model::frame::{stack_frames, Action, Frame};
use crate::runtime::LoadError;

#[derive(Clone, Debug)]
pub struct SpawnEntry {
    pub low_res: Vec<Frame>,
    pub act: Vec<Action>,
    pub full_res: Option<Vec<Frame>>,
}

impl SpawnEntry {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        Self::from_state(&StateDict::load(path)?, path)
    }

    fn from_state(sd: &StateDict, path: &Path) -> Result<Self, LoadError> {
        let bad = |reason: String| LoadError::Spawn {
            path: path.to_path_buf(),
            reason,
        };

        let low_res = sd
            .get("low_res")
            .ok_or_else(|| bad("missing tensor 'low_res'".into()))
            .and_then(|t| frames(t).map_err(bad))?;
        let act = sd
            .get("act")
            .ok_or_else(|| bad("missing tensor 'act'".into()))
            .and_then(|t| actions(t).map_err(bad))?;
        let full_res = sd.get("full_res").map(frames).transpose().map_err(bad)?;

        let entry = Self {
            low_res,
            act,
            full_res,
        };
        entry.validate().map_err(bad)?;
        Ok(entry)
    }

    /// Check that the entry can seed a context: at least one frame, one
    /// action per frame, and a matching number of `full_res` frames.
    pub fn validate(&self) -> Result<(), String> {
        if self.low_res.is_empty() {
            return Err("entry holds no frames".into());
        }
        if self.act.len() != self.low_res.len() {
            return Err(format!(
                "{} actions for {} frames",
                self.act.len(),
                self.low_res.len()
            ));
        }
        if let Some(full) = &self.full_res {
            if full.len() != self.low_res.len() {
                return Err(format!(
                    "{} full_res frames for {} low_res frames",
                    full.len(),
                    self.low_res.len()
                ));
            }
        }
        Ok(())
    }

    /// Tensor form, as stored on disk.
    pub fn to_state(&self) -> Result<StateDict, ndarray::ShapeError> {
        let mut sd = StateDict::new();
        sd.insert("low_res", stack_frames(&self.low_res)?);
        sd.insert("act", action_tensor(&self.act));
        if let Some(full) = &self.full_res {
            sd.insert("full_res", stack_frames(full)?);
        }
        Ok(sd)
    }

    pub fn len(&self) -> usize {
        self.low_res.len()
    }

    pub fn is_empty(&self) -> bool {
        self.low_res.is_empty()
    }
}

fn frames(t: &ArrayD<f32>) -> Result<Vec<Frame>, String> {
    if t.ndim() != 4 {
        return Err(format!("expected [T, C, H, W], got {:?}", t.shape()));
    }
    t.axis_iter(Axis(0))
        .map(|f| {
            f.into_dimensionality::<Ix3>()
                .map(|v| v.to_owned())
                .map_err(|e| e.to_string())
        })
        .collect()
}

fn actions(t: &ArrayD<f32>) -> Result<Vec<Action>, String> {
    if t.ndim() != 1 {
        return Err(format!("expected [T] actions, got {:?}", t.shape()));
    }
    t.iter()
        .map(|&a| {
            if a.is_finite() && a >= 0.0 {
                Ok(a.round() as Action)
            } else {
                Err(format!("invalid action value {a}"))
            }
        })
        .collect()
}

fn action_tensor(act: &[Action]) -> ArrayD<f32> {
    ndarray::Array1::from_iter(act.iter().map(|&a| a as f32)).into_dyn()
}

/// Uniformly sampled, lazily loaded spawn entries.
#[derive(Debug)]
pub struct SpawnPool {
    paths: Vec<PathBuf>,
    loaded: Vec<Option<Arc<SpawnEntry>>>,
}

impl SpawnPool {
    /// List `dir` and read the first `preload` entries.
    pub fn open(dir: &Path, preload: usize) -> Result<Self, LoadError> {
        if !dir.is_dir() {
            return Err(LoadError::MissingArtifact {
                kind: "spawn directory",
                path: dir.to_path_buf(),
            });
        }
        let read_err = |e: std::io::Error| LoadError::Spawn {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "safetensors") {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(LoadError::EmptySpawn(dir.to_path_buf()));
        }
        paths.sort();

        let mut pool = Self {
            loaded: vec![None; paths.len()],
            paths,
        };
        for i in 0..preload.min(pool.paths.len()) {
            pool.entry(i)?;
        }
        debug!(
            "spawn pool: {} entries in {}, {} preloaded",
            pool.len(),
            dir.display(),
            pool.loaded_count()
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.iter().filter(|e| e.is_some()).count()
    }

    pub fn entry(&mut self, index: usize) -> Result<Arc<SpawnEntry>, LoadError> {
        if let Some(Some(e)) = self.loaded.get(index) {
            return Ok(Arc::clone(e));
        }
        let path = self.paths.get(index).ok_or_else(|| LoadError::Spawn {
            path: PathBuf::new(),
            reason: format!("index {index} out of range"),
        })?;
        let entry = Arc::new(SpawnEntry::load(path)?);
        self.loaded[index] = Some(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn sample(&mut self, rng: &mut StdRng) -> Result<Arc<SpawnEntry>, LoadError> {
        let index = rng.gen_range(0..self.paths.len());
        self.entry(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;

    fn entry(t: usize, value: f32) -> SpawnEntry {
        SpawnEntry {
            low_res: (0..t).map(|i| Array3::from_elem((3, 4, 4), value + i as f32 * 0.1)).collect(),
            act: (0..t as u32).collect(),
            full_res: None,
        }
    }

    fn write(dir: &Path, name: &str, e: &SpawnEntry) {
        e.to_state().unwrap().save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_entry_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry(3, 0.0);
        write(dir.path(), "0.safetensors", &e);

        let loaded = SpawnEntry::load(&dir.path().join("0.safetensors")).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.act, vec![0, 1, 2]);
        assert!(loaded.full_res.is_none());
        assert!((loaded.low_res[2][[0, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_actions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = entry(3, 0.0);
        e.act.pop();
        write(dir.path(), "bad.safetensors", &e);
        let err = SpawnEntry::load(&dir.path().join("bad.safetensors")).unwrap_err();
        assert!(matches!(err, LoadError::Spawn { .. }));
    }

    #[test]
    fn test_validate_rejects_inconsistent_entries() {
        assert!(entry(2, 0.0).validate().is_ok());
        assert!(entry(0, 0.0).validate().is_err());

        let mut short_act = entry(2, 0.0);
        short_act.act.clear();
        assert!(short_act.validate().is_err());

        let mut empty_full = entry(2, 0.0);
        empty_full.full_res = Some(Vec::new());
        assert!(empty_full.validate().is_err());
    }

    #[test]
    fn test_open_preloads_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            write(dir.path(), &format!("{i}.safetensors"), &entry(2, i as f32));
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut pool = SpawnPool::open(dir.path(), 1).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.loaded_count(), 1);

        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let e = pool.sample(&mut rng).unwrap();
            assert_eq!(e.len(), 2);
        }
        assert!(pool.loaded_count() >= 1);
    }

    #[test]
    fn test_empty_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SpawnPool::open(dir.path(), 1),
            Err(LoadError::EmptySpawn(_))
        ));
    }

    #[test]
    fn test_missing_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SpawnPool::open(&dir.path().join("spawn"), 1),
            Err(LoadError::MissingArtifact { .. })
        ));
    }
}
