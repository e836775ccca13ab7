//! Compute device selection.
//!
//! The probe runs once at start-up, in fixed priority order:
//!   CUDA → MPS → CPU (always available).
//! The chosen device is injected into every component for the session.

use std::fmt;

/// Compute backend for the whole session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    /// Accelerated parallel processor, by ordinal.
    Cuda(usize),
    /// Unified-memory processor.
    Mps,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda(i) => write!(f, "cuda:{i}"),
            Device::Mps => write!(f, "mps"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

impl Device {
    /// Whether per-step calls can be swapped for compiled variants here.
    pub fn supports_compilation(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

/// Backend availability queries.
pub trait DeviceProbe {
    fn cuda_available(&self) -> bool;
    fn mps_available(&self) -> bool;
}

/// Probe of the machine we are running on.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn cuda_available(&self) -> bool {
        cuda_available()
    }

    fn mps_available(&self) -> bool {
        mps_available()
    }
}

/// Pick the first available backend.
pub fn select_device(probe: &dyn DeviceProbe) -> Device {
    if probe.cuda_available() {
        return Device::Cuda(0);
    }
    if probe.mps_available() {
        return Device::Mps;
    }
    Device::Cpu
}

/// Select from the running machine.
pub fn detect_device() -> Device {
    select_device(&SystemProbe)
}

/// The driver exposes its version file once a GPU is bound.
#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    std::path::Path::new("/proc/driver/nvidia/version").exists()
        || std::path::Path::new("/dev/nvidia0").exists()
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
    false
}

#[cfg(all(feature = "mps", target_os = "macos", target_arch = "aarch64"))]
fn mps_available() -> bool {
    true
}

#[cfg(not(all(feature = "mps", target_os = "macos", target_arch = "aarch64")))]
fn mps_available() -> bool {
    false
}
