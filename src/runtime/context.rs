//! Context window sizing.

/// Frames of history the rolling buffer must hold: the larger of the two
/// stages' conditioning lengths, or the denoiser's alone.
pub fn resolve_context_length(denoiser: usize, upsampler: Option<usize>) -> usize {
    match upsampler {
        Some(up) => denoiser.max(up),
        None => denoiser,
    }
}
