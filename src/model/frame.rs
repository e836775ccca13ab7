//! Frame and action types shared by the model and the runtime.

use ndarray::{stack, Array3, ArrayD, Axis, ShapeError};

/// One observation, `[channels, height, width]`, values in `[-1, 1]`.
pub type Frame = Array3<f32>;

/// Discrete action index, `0..num_actions`.
pub type Action = u32;

/// Nearest-neighbour upscale by an integer factor.
pub fn upscale_nearest(frame: &Frame, factor: usize) -> Frame {
    if factor <= 1 {
        return frame.clone();
    }
    let (c, h, w) = frame.dim();
    Array3::from_shape_fn((c, h * factor, w * factor), |(ci, y, x)| {
        frame[[ci, y / factor, x / factor]]
    })
}

/// Stack equally shaped frames along a new leading axis.
pub fn stack_frames(frames: &[Frame]) -> Result<ArrayD<f32>, ShapeError> {
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    Ok(stack(Axis(0), &views)?.into_dyn())
}

/// Per-channel mean.
pub fn channel_means(frame: &Frame) -> ndarray::Array1<f32> {
    frame
        .mean_axis(Axis(2))
        .and_then(|m| m.mean_axis(Axis(1)))
        .unwrap_or_else(|| ndarray::Array1::zeros(frame.dim().0))
}
