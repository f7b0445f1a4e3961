//! Read-only view of the compute devices a backend exposes.

use tracing::debug;

use crate::backend::InferenceBackend;
use crate::error::BridgeResult;
use crate::types::Device;

/// Query the backend for its devices.
///
/// Order is whatever the backend reports and stays stable for the process
/// lifetime; index 0 is the default device.
pub fn list_devices(backend: &dyn InferenceBackend) -> BridgeResult<Vec<Device>> {
    let devices = backend.enumerate_devices()?;
    for device in &devices {
        debug!(index = device.index, name = %device.name, "Available device");
    }
    Ok(devices)
}

/// Default device: the first one listed.
pub fn default_device(devices: &[Device]) -> Option<&Device> {
    devices.first()
}
