//! Pipeline controller: owns the inference session and decides, per frame,
//! whether the frame goes through the model or straight to the destination.
//!
//! Setup failures degrade to passthrough and are never returned to the host.
//! A failure in the steady state disables inference for the rest of the run
//! (fail-static); the failing frame itself is passed through so the
//! destination is always fully written.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backend::InferenceBackend;
use crate::device_catalog::list_devices;
use crate::error::{BridgeError, BridgeResult};
use crate::frame_adapter::{passthrough, FrameAdapter, ResampleAlgorithm};
use crate::model_catalog::{ModelCatalog, DEFAULT_DESCRIPTION_EXTENSION};
use crate::session::InferenceSession;
use crate::types::{Device, Frame, ModelDescriptor, Resolution};

/// Settings the controller reads at setup.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub models_dir: PathBuf,
    pub extension: String,
    /// Display name of the model to bind. `None` picks the first discovered.
    pub model: Option<String>,
    pub device_index: usize,
    pub resample: ResampleAlgorithm,
    /// Initial state of the user toggle.
    pub enabled: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            extension: DEFAULT_DESCRIPTION_EXTENSION.to_string(),
            model: None,
            device_index: 0,
            resample: ResampleAlgorithm::default(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    Inference {
        model: ModelDescriptor,
        device: Device,
        resolution: Resolution,
    },
    Passthrough {
        reason: String,
    },
}

impl SetupOutcome {
    pub fn is_inference(&self) -> bool {
        matches!(self, Self::Inference { .. })
    }
}

/// Which path a frame took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePath {
    Inferred,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Capability,
    Setup,
    Capture,
    Inference,
    Reintegrate,
}

/// Record left behind whenever the controller falls back to passthrough.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub inferred: u64,
    pub passthrough: u64,
}

pub struct PipelineController {
    session: InferenceSession,
    options: ControllerOptions,
    adapter: Option<FrameAdapter>,
    /// Source size the adapter was set up for.
    screen: Option<Resolution>,
    /// Last source size seen that differs from `screen`.
    resized_source: Option<Resolution>,
    capable: bool,
    enabled: bool,
    faulted: bool,
    diagnostics: Vec<Diagnostic>,
    stats: FrameStats,
}

impl PipelineController {
    pub fn new(backend: Box<dyn InferenceBackend>, options: ControllerOptions) -> Self {
        let enabled = options.enabled;
        Self {
            session: InferenceSession::new(backend),
            options,
            adapter: None,
            screen: None,
            resized_source: None,
            capable: false,
            enabled,
            faulted: false,
            diagnostics: Vec::new(),
            stats: FrameStats::default(),
        }
    }

    /// Prepare the pipeline for frames of `screen` size.
    ///
    /// Calling it again tears down the previous session and starts over,
    /// clearing any earlier fault. Frames of any other size than `screen`
    /// pass through until `setup` runs again for the new size.
    pub fn setup(
        &mut self,
        screen: Resolution,
        target_height: u32,
        has_compatible_hardware: bool,
    ) -> SetupOutcome {
        self.session.release();
        self.adapter = None;
        self.screen = None;
        self.resized_source = None;
        self.faulted = false;
        self.enabled = self.options.enabled;
        self.capable = has_compatible_hardware;

        if !has_compatible_hardware {
            self.enabled = false;
            let reason = "no compatible graphics hardware; inference disabled".to_string();
            warn!("{reason}");
            self.record(Stage::Capability, reason.clone());
            return SetupOutcome::Passthrough { reason };
        }

        match self.bind(screen, target_height) {
            Ok((model, device, resolution)) => {
                self.adapter = Some(FrameAdapter::new(resolution, self.options.resample));
                self.screen = Some(screen);
                info!(
                    model = %model.display_name,
                    device = %device.name,
                    screen = %screen,
                    resolution = %resolution,
                    enabled = self.enabled,
                    "Inference pipeline ready"
                );
                SetupOutcome::Inference {
                    model,
                    device,
                    resolution,
                }
            }
            Err(error) => {
                self.enabled = false;
                warn!(
                    kind = error.kind(),
                    error = %error,
                    "Inference setup failed; frames pass through unchanged"
                );
                let reason = error.to_string();
                self.record(Stage::Setup, reason.clone());
                SetupOutcome::Passthrough { reason }
            }
        }
    }

    fn bind(
        &mut self,
        screen: Resolution,
        target_height: u32,
    ) -> BridgeResult<(ModelDescriptor, Device, Resolution)> {
        let catalog = ModelCatalog::discover(
            self.options.models_dir.clone(),
            &self.options.extension,
        )?;
        let model = catalog.select(self.options.model.as_deref())?.clone();

        let Some(resolution) = Resolution::scaled_to_height(screen, target_height) else {
            return Err(BridgeError::session_init(
                &model.description_path,
                format!(
                    "cannot scale screen {screen} to height {target_height}; \
                     both must be positive"
                ),
            ));
        };

        let devices = list_devices(self.session.backend())?;
        let device_index = self.options.device_index;
        if device_index >= devices.len() {
            return Err(BridgeError::session_init(
                &model.description_path,
                format!(
                    "device index {device_index} out of range ({} devices)",
                    devices.len()
                ),
            ));
        }

        let device = self.session.initialize(
            &model,
            resolution.width,
            resolution.height,
            device_index,
        )?;
        Ok((model, device, resolution))
    }

    /// Produce the destination frame for `source`.
    pub fn per_frame(&mut self, source: &Frame, destination: &mut Frame) -> FramePath {
        if self.is_active() && self.matches_screen(source.resolution()) {
            match self.infer_frame(source, destination) {
                Ok(()) => {
                    self.stats.inferred += 1;
                    return FramePath::Inferred;
                }
                Err((stage, error)) => self.fault(stage, error),
            }
        }

        passthrough(source, destination);
        self.stats.passthrough += 1;
        FramePath::Passthrough
    }

    /// A source whose size differs from the setup screen would be stretched
    /// into the session resolution, so it takes the passthrough path. One
    /// diagnostic is recorded per new size.
    fn matches_screen(&mut self, source: Resolution) -> bool {
        let Some(screen) = self.screen else {
            return false;
        };
        if source == screen {
            self.resized_source = None;
            return true;
        }
        if self.resized_source != Some(source) {
            self.resized_source = Some(source);
            warn!(source = %source, screen = %screen, "Source size changed since setup");
            self.record(
                Stage::Capture,
                format!(
                    "source is {source} but the pipeline was set up for {screen}; \
                     passing frames through until setup runs again"
                ),
            );
        }
        false
    }

    fn infer_frame(
        &mut self,
        source: &Frame,
        destination: &mut Frame,
    ) -> Result<(), (Stage, BridgeError)> {
        let Some(adapter) = self.adapter.as_ref() else {
            return Err((
                Stage::Capture,
                BridgeError::inference("no frame adapter configured"),
            ));
        };

        let mut buffer = adapter
            .capture(source)
            .map_err(|e| (Stage::Capture, e))?;
        self.session
            .run(&mut buffer)
            .map_err(|e| (Stage::Inference, e))?;
        adapter
            .reintegrate(&buffer, destination)
            .map_err(|e| (Stage::Reintegrate, e))
    }

    fn fault(&mut self, stage: Stage, error: BridgeError) {
        if error.is_contract_violation() {
            error!(
                stage = ?stage,
                kind = error.kind(),
                error = %error,
                "Internal fault in frame pipeline; inference disabled for this run"
            );
        } else {
            error!(
                stage = ?stage,
                kind = error.kind(),
                error = %error,
                "Frame inference failed; inference disabled for this run"
            );
        }
        self.record(stage, error.to_string());
        self.faulted = true;
        self.enabled = false;
        self.session.release();
    }

    fn record(&mut self, stage: Stage, message: String) {
        self.diagnostics.push(Diagnostic {
            at: Utc::now(),
            stage,
            message,
        });
    }

    /// User toggle. Enabling is refused while inference cannot run.
    /// Returns the resulting state.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if !enabled {
            self.enabled = false;
            return false;
        }

        let refusal = if !self.capable {
            Some("no compatible graphics hardware")
        } else if self.faulted {
            Some("inference faulted earlier in this run")
        } else if !self.session.is_bound() {
            Some("no inference session is bound")
        } else {
            None
        };

        match refusal {
            Some(reason) => {
                warn!(reason, "Refusing to enable inference");
                self.enabled = false;
            }
            None => self.enabled = true,
        }
        self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True when the next frame will go through the model.
    pub fn is_active(&self) -> bool {
        self.capable
            && self.enabled
            && !self.faulted
            && self.adapter.is_some()
            && self.session.is_bound()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn has_compatible_hardware(&self) -> bool {
        self.capable
    }

    /// Inference resolution of the bound session.
    pub fn resolution(&self) -> Option<Resolution> {
        self.session.binding().map(|b| b.resolution)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn shutdown(&mut self) {
        self.adapter = None;
        self.screen = None;
        self.enabled = false;
        self.session.release();
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::types::PixelFormat;

    #[derive(Default)]
    struct Log {
        initialized: Vec<(u32, u32, usize)>,
        runs: usize,
        releases: usize,
    }

    struct Scripted {
        log: Arc<Mutex<Log>>,
        fail_run_at: Option<usize>,
    }

    impl InferenceBackend for Scripted {
        fn enumerate_devices(&self) -> BridgeResult<Vec<Device>> {
            Ok(vec![
                Device {
                    index: 0,
                    name: "CUDA".into(),
                },
                Device {
                    index: 1,
                    name: "CPU".into(),
                },
            ])
        }

        fn initialize(
            &mut self,
            _model: &Path,
            width: u32,
            height: u32,
            device_index: usize,
        ) -> BridgeResult<Device> {
            self.log
                .lock()
                .unwrap()
                .initialized
                .push((width, height, device_index));
            Ok(Device {
                index: device_index,
                name: if device_index == 0 { "CUDA" } else { "CPU" }.into(),
            })
        }

        fn run(&mut self, pixels: &mut [u8]) -> BridgeResult<()> {
            let mut log = self.log.lock().unwrap();
            if self.fail_run_at == Some(log.runs) {
                log.runs += 1;
                return Err(BridgeError::inference("device lost"));
            }
            log.runs += 1;
            pixels.fill(9);
            Ok(())
        }

        fn release(&mut self) {
            self.log.lock().unwrap().releases += 1;
        }
    }

    fn controller(
        models: &[&str],
        fail_run_at: Option<usize>,
    ) -> (PipelineController, Arc<Mutex<Log>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for name in models {
            std::fs::write(dir.path().join(name), b"onnx").unwrap();
        }
        let log = Arc::new(Mutex::new(Log::default()));
        let backend = Scripted {
            log: log.clone(),
            fail_run_at,
        };
        let options = ControllerOptions {
            models_dir: dir.path().to_path_buf(),
            ..ControllerOptions::default()
        };
        (
            PipelineController::new(Box::new(backend), options),
            log,
            dir,
        )
    }

    fn source() -> Frame {
        Frame::filled(8, 4, PixelFormat::Rgba8, &[1, 2, 3, 255])
    }

    #[test]
    fn setup_binds_first_model_at_scaled_resolution() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], None);
        let outcome = ctl.setup(Resolution::new(1920, 1080), 540, true);
        match outcome {
            SetupOutcome::Inference {
                model,
                device,
                resolution,
            } => {
                assert_eq!(model.display_name, "a");
                assert_eq!(device.index, 0);
                assert_eq!(resolution, Resolution::new(960, 540));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(log.lock().unwrap().initialized, vec![(960, 540, 0)]);
        assert!(ctl.is_active());
    }

    #[test]
    fn no_capability_skips_discovery_and_forces_toggle_off() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], None);
        let outcome = ctl.setup(Resolution::new(1920, 1080), 540, false);
        assert!(!outcome.is_inference());
        assert!(!ctl.is_enabled());
        assert!(!ctl.set_enabled(true));
        assert!(log.lock().unwrap().initialized.is_empty());
        assert_eq!(ctl.diagnostics()[0].stage, Stage::Capability);
    }

    #[test]
    fn configured_model_and_device_are_used() {
        let (mut ctl, log, _dir) = controller(&["a.onnx", "b.onnx"], None);
        ctl.options.model = Some("b".into());
        ctl.options.device_index = 1;
        match ctl.setup(Resolution::new(16, 9), 9, true) {
            SetupOutcome::Inference { model, device, .. } => {
                assert_eq!(model.display_name, "b");
                assert_eq!(device.name, "CPU");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(log.lock().unwrap().initialized, vec![(16, 9, 1)]);
    }

    #[test]
    fn zero_target_height_is_rejected_before_binding() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], None);
        let outcome = ctl.setup(Resolution::new(1920, 1080), 0, true);
        let SetupOutcome::Passthrough { reason } = outcome else {
            panic!("expected passthrough");
        };
        assert!(reason.starts_with("session initialization failed"), "{reason}");
        assert!(log.lock().unwrap().initialized.is_empty());
        assert!(ctl.resolution().is_none());
        assert!(!ctl.is_enabled());
    }

    #[test]
    fn failed_setup_turns_toggle_off() {
        let (mut ctl, _log, _dir) = controller(&[], None);
        assert!(ctl.is_enabled());
        assert!(!ctl.setup(Resolution::new(16, 9), 9, true).is_inference());
        assert!(!ctl.is_enabled());
        assert!(!ctl.is_active());
    }

    #[test]
    fn out_of_range_device_degrades_to_passthrough() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], None);
        ctl.options.device_index = 5;
        let outcome = ctl.setup(Resolution::new(16, 9), 9, true);
        assert!(matches!(outcome, SetupOutcome::Passthrough { .. }));
        assert!(log.lock().unwrap().initialized.is_empty());
        assert_eq!(ctl.diagnostics()[0].stage, Stage::Setup);
    }

    #[test]
    fn inferred_frame_is_written_at_destination_size() {
        let (mut ctl, _log, _dir) = controller(&["a.onnx"], None);
        ctl.setup(Resolution::new(8, 4), 2, true);

        let mut destination = Frame::filled(8, 4, PixelFormat::Rgba8, &[0, 0, 0, 0]);
        assert_eq!(ctl.per_frame(&source(), &mut destination), FramePath::Inferred);
        assert_eq!(destination.resolution(), Resolution::new(8, 4));
        assert!(destination.data.iter().all(|&b| b == 9));
        assert_eq!(ctl.stats().inferred, 1);
    }

    #[test]
    fn run_failure_disables_permanently_and_passes_frame_through() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], Some(1));
        ctl.setup(Resolution::new(8, 4), 2, true);
        let src = source();
        let mut destination = Frame::empty();

        assert_eq!(ctl.per_frame(&src, &mut destination), FramePath::Inferred);
        assert_eq!(ctl.per_frame(&src, &mut destination), FramePath::Passthrough);
        assert_eq!(destination, src);
        assert!(ctl.is_faulted());
        assert!(!ctl.set_enabled(true));

        for _ in 0..3 {
            assert_eq!(ctl.per_frame(&src, &mut destination), FramePath::Passthrough);
        }
        let log = log.lock().unwrap();
        assert_eq!(log.runs, 2);
        assert_eq!(log.releases, 1);
        assert_eq!(ctl.diagnostics().last().unwrap().stage, Stage::Inference);
    }

    #[test]
    fn toggle_switches_paths_without_rebinding() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], None);
        ctl.setup(Resolution::new(8, 4), 2, true);
        let src = source();
        let mut destination = Frame::empty();

        assert!(!ctl.set_enabled(false));
        assert_eq!(ctl.per_frame(&src, &mut destination), FramePath::Passthrough);
        assert!(ctl.set_enabled(true));
        assert_eq!(ctl.per_frame(&src, &mut destination), FramePath::Inferred);
        assert_eq!(log.lock().unwrap().initialized.len(), 1);
    }

    #[test]
    fn shutdown_releases_once() {
        let (mut ctl, log, _dir) = controller(&["a.onnx"], None);
        ctl.setup(Resolution::new(8, 4), 2, true);
        ctl.shutdown();
        assert!(!ctl.is_active());
        drop(ctl);
        assert_eq!(log.lock().unwrap().releases, 1);
    }
}
