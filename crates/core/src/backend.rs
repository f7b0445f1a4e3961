//! Native inference backend boundary.
//!
//! [`InferenceBackend`] is the capability the pipeline controller is built on:
//! device enumeration, model binding, in-place inference on a pixel buffer, and
//! release. The ONNX Runtime adapter lives in [`crate::ort_backend`]; tests
//! inject scripted doubles through the same trait.

use std::path::Path;

use crate::error::BridgeResult;
use crate::types::Device;

/// Operations a native inference engine must provide to the bridge.
///
/// Buffer contract for [`run`](Self::run): the backend receives an exclusive
/// borrow of `width * height * 4` RGBA8 bytes at the bound resolution and must
/// write the output image of identical dimensions into that same slice before
/// returning. It must not keep any pointer into the slice after the call. If
/// it returns an error it must leave the slice untouched.
pub trait InferenceBackend: Send {
    /// Devices in a stable, backend-defined order. Index 0 is the default.
    fn enumerate_devices(&self) -> BridgeResult<Vec<Device>>;

    /// Compile `model` for a fixed `width` x `height` input on the device at
    /// `device_index`, returning the device actually bound.
    fn initialize(
        &mut self,
        model: &Path,
        width: u32,
        height: u32,
        device_index: usize,
    ) -> BridgeResult<Device>;

    /// Transform `pixels` in place.
    fn run(&mut self, pixels: &mut [u8]) -> BridgeResult<()>;

    /// Free every resource tied to the current binding. Must be idempotent.
    fn release(&mut self);
}

/// Execution provider a device maps to in ONNX Runtime.
///
/// `Tensorrt` requires TensorRT runtime libraries (`libnvinfer.so.10` or
/// `nvinfer.dll`); when they are missing at session build time the CUDA
/// provider registered behind it takes over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecutionTarget {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl ExecutionTarget {
    /// Preference order used when listing devices.
    pub const ALL: [ExecutionTarget; 3] = [Self::Cuda, Self::Tensorrt, Self::Cpu];

    /// Human-readable device name reported through the [`Device`] catalog.
    pub fn device_name(&self) -> &'static str {
        match self {
            Self::Cuda => "CUDA",
            Self::Tensorrt => "TensorRT",
            Self::Cpu => "CPU",
        }
    }

    pub fn is_gpu(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}
