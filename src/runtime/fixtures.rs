//! Bundle fixtures shared by the runtime tests.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{arr1, Array2, Array3};

use crate::model::checkpoint::StateDict;
use crate::runtime::registry::{ArtifactRegistry, RegistryError};
use crate::runtime::spawn::SpawnEntry;

pub const AGENT_YAML: &str = "\
denoiser:
  inner_model:
    img_channels: 3
    num_steps_conditioning: 2
upsampler:
  inner_model:
    img_channels: ${agent.denoiser.inner_model.img_channels}
    num_steps_conditioning: ${eval:'${agent.denoiser.inner_model.num_steps_conditioning} + 1'}
  upsampling_factor: 2
rew_end_model:
  img_channels: 3
  end_threshold: 0.5
";

/// Write a complete bundle for `name` whose env document declares `env_id`.
/// Five actions, 8×8 frames, context length 3.
pub fn write_bundle(root: &Path, name: &str, env_id: &str) {
    let dir = root.join(name);
    for sub in ["model", "spawn", "config/agent", "config/env"] {
        fs::create_dir_all(dir.join(sub)).unwrap();
    }

    fs::write(dir.join(format!("config/agent/{name}.yaml")), AGENT_YAML).unwrap();
    fs::write(
        dir.join(format!("config/env/{name}.yaml")),
        format!("train:\n  id: {env_id}\n  size: 8\nnum_actions: 5\n"),
    )
    .unwrap();

    let mut sd = StateDict::new();
    sd.insert("denoiser.frame_weights", arr1(&[0.0f32, 1.0]).into_dyn());
    sd.insert("denoiser.action_bias", Array2::<f32>::zeros((5, 3)).into_dyn());
    sd.insert("upsampler.history_blend", arr1(&[0.0f32]).into_dyn());
    sd.save(dir.join(format!("model/{name}.pt"))).unwrap();

    let entry = SpawnEntry {
        low_res: (0..3)
            .map(|i| Array3::from_shape_fn((3, 8, 8), |(c, y, x)| ((c + y * x + i) % 7) as f32 / 7.0))
            .collect(),
        act: vec![0, 1, 2],
        full_res: None,
    };
    entry
        .to_state()
        .unwrap()
        .save(dir.join("spawn/0.safetensors"))
        .unwrap();
}

/// Registry stand-in serving a local directory and counting requests.
pub struct CountingRegistry {
    root: PathBuf,
    calls: Cell<usize>,
    last: RefCell<Option<String>>,
}

impl CountingRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            calls: Cell::new(0),
            last: RefCell::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn last_subtree(&self) -> Option<String> {
        self.last.borrow().clone()
    }
}

impl ArtifactRegistry for CountingRegistry {
    fn fetch_subtree(&self, subtree: &str) -> Result<PathBuf, RegistryError> {
        self.calls.set(self.calls.get() + 1);
        *self.last.borrow_mut() = Some(subtree.to_string());
        if !self.root.join(subtree).is_dir() {
            return Err(RegistryError::EmptySubtree(subtree.to_string()));
        }
        Ok(self.root.clone())
    }
}

/// Device probe with fixed answers.
pub struct FixedProbe {
    pub cuda: bool,
    pub mps: bool,
}

impl crate::runtime::device::DeviceProbe for FixedProbe {
    fn cuda_available(&self) -> bool {
        self.cuda
    }

    fn mps_available(&self) -> bool {
        self.mps
    }
}
