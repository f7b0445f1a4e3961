//! Inference session: one (model, device, resolution) binding at a time.
//!
//! State machine: `Idle -> Bound` on a successful `initialize`, back to `Idle`
//! on `release` or on a failed `initialize`. `run` is only legal while bound.

use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{Device, FrameBuffer, ModelDescriptor, Resolution, SessionBinding};

pub struct InferenceSession {
    backend: Box<dyn InferenceBackend>,
    binding: Option<SessionBinding>,
}

impl InferenceSession {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            binding: None,
        }
    }

    pub fn backend(&self) -> &dyn InferenceBackend {
        self.backend.as_ref()
    }

    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Bind `model` for a fixed `width` x `height` input on `device_index`.
    ///
    /// Any previous binding is released first. Returns the device the backend
    /// actually bound, which may differ from the one at `device_index`.
    pub fn initialize(
        &mut self,
        model: &ModelDescriptor,
        width: u32,
        height: u32,
        device_index: usize,
    ) -> BridgeResult<Device> {
        self.release();

        if width == 0 || height == 0 {
            return Err(BridgeError::session_init(
                &model.description_path,
                format!("resolution {width}x{height} must be positive"),
            ));
        }

        let device = self
            .backend
            .initialize(&model.description_path, width, height, device_index)
            .inspect_err(|_| self.backend.release())?;

        let resolution = Resolution::new(width, height);
        info!(
            model = %model.display_name,
            device = %device.name,
            resolution = %resolution,
            "Session bound"
        );
        self.binding = Some(SessionBinding {
            model: model.clone(),
            device: device.clone(),
            resolution,
        });
        Ok(device)
    }

    /// Run inference on `buffer` in place.
    ///
    /// The size check happens before the backend sees the buffer, so a
    /// rejected buffer is never partially written.
    pub fn run(&mut self, buffer: &mut FrameBuffer) -> BridgeResult<()> {
        let Some(binding) = &self.binding else {
            return Err(BridgeError::inference(
                "no session bound; initialize must succeed before run",
            ));
        };

        let expected = binding.resolution.byte_len();
        if buffer.len() != expected || buffer.resolution() != binding.resolution {
            return Err(BridgeError::inference(format!(
                "buffer is {} bytes at {}, session expects {expected} bytes at {}",
                buffer.len(),
                buffer.resolution(),
                binding.resolution
            )));
        }

        self.backend.run(buffer.as_mut_slice())
    }

    /// Free backend resources. No-op when idle.
    pub fn release(&mut self) {
        if let Some(binding) = self.binding.take() {
            debug!(model = %binding.model.display_name, "Releasing session");
            self.backend.release();
        }
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        if self.binding.is_some() {
            warn!("Inference session dropped while bound; releasing");
        }
        self.release();
    }
}
