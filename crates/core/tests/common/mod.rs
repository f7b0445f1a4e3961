use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use framebridge_core::backend::InferenceBackend;
use framebridge_core::controller::{ControllerOptions, PipelineController};
use framebridge_core::error::{BridgeError, BridgeResult};
use framebridge_core::types::Device;

#[derive(Debug, Default)]
pub struct Record {
    pub enumerate_calls: usize,
    pub initialized: Vec<(PathBuf, u32, u32, usize)>,
    pub run_sizes: Vec<usize>,
    pub releases: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum Behavior {
    #[default]
    Identity,
    /// Overwrite every byte with the value.
    Fill(u8),
}

#[derive(Default)]
pub struct Script {
    pub backend_missing: bool,
    pub fail_init: bool,
    /// Zero-based index of the `run` call that fails.
    pub fail_run_at: Option<usize>,
    pub behavior: Behavior,
}

pub struct ScriptedBackend {
    script: Script,
    record: Arc<Mutex<Record>>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> (Self, Arc<Mutex<Record>>) {
        let record = Arc::new(Mutex::new(Record::default()));
        (
            Self {
                script,
                record: record.clone(),
            },
            record,
        )
    }
}

impl InferenceBackend for ScriptedBackend {
    fn enumerate_devices(&self) -> BridgeResult<Vec<Device>> {
        self.record.lock().unwrap().enumerate_calls += 1;
        if self.script.backend_missing {
            return Err(BridgeError::backend_unavailable("library not loaded"));
        }
        Ok(vec![Device {
            index: 0,
            name: "Scripted".into(),
        }])
    }

    fn initialize(
        &mut self,
        model: &Path,
        width: u32,
        height: u32,
        device_index: usize,
    ) -> BridgeResult<Device> {
        self.record.lock().unwrap().initialized.push((
            model.to_path_buf(),
            width,
            height,
            device_index,
        ));
        if self.script.fail_init {
            return Err(BridgeError::session_init(model, "malformed model"));
        }
        Ok(Device {
            index: device_index,
            name: "Scripted".into(),
        })
    }

    fn run(&mut self, pixels: &mut [u8]) -> BridgeResult<()> {
        let mut record = self.record.lock().unwrap();
        let call = record.run_sizes.len();
        record.run_sizes.push(pixels.len());
        if self.script.fail_run_at == Some(call) {
            return Err(BridgeError::inference("device removed"));
        }
        if let Behavior::Fill(value) = self.script.behavior {
            pixels.fill(value);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.record.lock().unwrap().releases += 1;
    }
}

/// A models directory holding one empty description file per name.
pub fn models_dir(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for name in names {
        fs::write(dir.path().join(name), b"model").expect("write model fixture");
    }
    dir
}

pub fn controller(
    models_dir: &Path,
    script: Script,
) -> (PipelineController, Arc<Mutex<Record>>) {
    let (backend, record) = ScriptedBackend::new(script);
    let options = ControllerOptions {
        models_dir: models_dir.to_path_buf(),
        ..ControllerOptions::default()
    };
    (PipelineController::new(Box::new(backend), options), record)
}
