//! Checkpoint I/O.
//!
//! A checkpoint is a safetensors file of f32 tensors. Tensor names carry the
//! owning component as a prefix (`denoiser.`, `upsampler.`, `rew_end_model.`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytemuck::cast_slice;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("checkpoint is missing tensor '{0}'")]
    Missing(String),
    #[error("tensor '{name}' has dtype {dtype:?}, expected F32")]
    Dtype { name: String, dtype: Dtype },
    #[error("tensor '{name}' has shape {got:?}, expected {want:?}")]
    Shape {
        name: String,
        got: Vec<usize>,
        want: Vec<usize>,
    },
}

/// Named f32 tensors.
#[derive(Clone, Debug, Default)]
pub struct StateDict {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Tensors under `prefix.`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> StateDict {
        let dotted = format!("{prefix}.");
        let tensors = self
            .tensors
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&dotted).map(|rest| (rest.to_string(), v.clone())))
            .collect();
        StateDict { tensors }
    }

    /// Fetch a 1-D tensor of exactly `len` elements, if present.
    pub fn array1(&self, name: &str, len: usize) -> Result<Option<Array1<f32>>, CheckpointError> {
        let Some(t) = self.tensors.get(name) else {
            return Ok(None);
        };
        if t.shape() != [len].as_slice() {
            return Err(CheckpointError::Shape {
                name: name.to_string(),
                got: t.shape().to_vec(),
                want: vec![len],
            });
        }
        Ok(Some(t.iter().copied().collect()))
    }

    /// Fetch a 2-D tensor of exactly `rows × cols`, if present.
    pub fn array2(
        &self,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<Option<Array2<f32>>, CheckpointError> {
        let Some(t) = self.tensors.get(name) else {
            return Ok(None);
        };
        if t.shape() != [rows, cols].as_slice() {
            return Err(CheckpointError::Shape {
                name: name.to_string(),
                got: t.shape().to_vec(),
                want: vec![rows, cols],
            });
        }
        let values: Vec<f32> = t.iter().copied().collect();
        Ok(Some(Array2::from_shape_vec((rows, cols), values).map_err(|_| {
            CheckpointError::Shape {
                name: name.to_string(),
                got: t.shape().to_vec(),
                want: vec![rows, cols],
            }
        })?))
    }

    pub fn require_array1(&self, name: &str, len: usize) -> Result<Array1<f32>, CheckpointError> {
        self.array1(name, len)?
            .ok_or_else(|| CheckpointError::Missing(name.to_string()))
    }

    pub fn require_array2(
        &self,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f32>, CheckpointError> {
        self.array2(name, rows, cols)?
            .ok_or_else(|| CheckpointError::Missing(name.to_string()))
    }

    pub fn require_scalar(&self, name: &str) -> Result<f32, CheckpointError> {
        self.scalar(name)?
            .ok_or_else(|| CheckpointError::Missing(name.to_string()))
    }

    /// Fetch a scalar stored as a one-element tensor, if present.
    pub fn scalar(&self, name: &str) -> Result<Option<f32>, CheckpointError> {
        Ok(self.array1(name, 1)?.map(|a| a[0]))
    }

    /// Parse safetensors bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let st = SafeTensors::deserialize(bytes)?;
        let mut tensors = BTreeMap::new();
        for (name, view) in st.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(CheckpointError::Dtype {
                    name,
                    dtype: view.dtype(),
                });
            }
            // Views are not guaranteed to be 4-byte aligned.
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let shape = view.shape().to_vec();
            let array = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| {
                CheckpointError::Shape {
                    name: name.clone(),
                    got: shape.clone(),
                    want: shape.clone(),
                }
            })?;
            tensors.insert(name, array);
        }
        Ok(Self { tensors })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        let flat: Vec<(&String, Vec<usize>, Vec<f32>)> = self
            .tensors
            .iter()
            .map(|(k, v)| (k, v.shape().to_vec(), v.iter().copied().collect()))
            .collect();

        let mut views: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
        for (name, shape, values) in &flat {
            views.insert(
                (*name).clone(),
                TensorView::new(Dtype::F32, shape.clone(), cast_slice(values))?,
            );
        }
        Ok(safetensors::serialize(&views, &None)?)
    }

    /// Write atomically via a temporary file and rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
