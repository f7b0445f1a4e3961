//! ONNX Runtime implementation of [`InferenceBackend`].
//!
//! Devices map to execution providers (CUDA, TensorRT, CPU). A binding owns
//! one `ort::Session` compiled for a fixed `1x3xHxW` input; each `run` packs
//! the RGBA8 buffer into a normalized NCHW tensor, runs the session, and writes
//! RGB back into the same buffer. Alpha is carried through untouched.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use half::f16;
use ndarray::{Array4, ArrayViewD, Ix4};
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info, warn};

use crate::backend::{ExecutionTarget, InferenceBackend};
use crate::error::{BridgeError, BridgeResult};
use crate::runtime::RuntimeLibrary;
use crate::types::{Device, Resolution, RGBA_CHANNELS};

#[derive(Debug, Clone, PartialEq)]
pub struct OrtBackendOptions {
    /// Upper bound of the value range the model works in: `1.0` for models
    /// normalized to `[0, 1]`, `255.0` for models fed raw 8-bit values.
    pub value_range: f32,
    /// Base directory for TensorRT engine caches. `None` disables caching.
    pub trt_cache_dir: Option<PathBuf>,
}

impl Default for OrtBackendOptions {
    fn default() -> Self {
        Self {
            value_range: 1.0,
            trt_cache_dir: Some(PathBuf::from("trt_cache")),
        }
    }
}

struct BoundModel {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    resolution: Resolution,
}

pub struct OrtBackend {
    library: RuntimeLibrary,
    options: OrtBackendOptions,
    bound: Option<BoundModel>,
}

impl OrtBackend {
    pub fn new(library: RuntimeLibrary, options: OrtBackendOptions) -> Self {
        Self {
            library,
            options,
            bound: None,
        }
    }

    fn ensure_loaded(&self) -> BridgeResult<()> {
        match self.library.path() {
            Some(path) if path.is_file() => Ok(()),
            Some(path) => Err(BridgeError::backend_unavailable(format!(
                "runtime library {} does not exist",
                path.display()
            ))),
            None => Err(BridgeError::backend_unavailable(
                "ONNX Runtime library was not found",
            )),
        }
    }

    fn available_targets(&self) -> Vec<ExecutionTarget> {
        ExecutionTarget::ALL
            .into_iter()
            .filter(|target| match target {
                ExecutionTarget::Cuda => CUDAExecutionProvider::default()
                    .is_available()
                    .unwrap_or(false),
                ExecutionTarget::Tensorrt => TensorRTExecutionProvider::default()
                    .is_available()
                    .unwrap_or(false),
                ExecutionTarget::Cpu => true,
            })
            .collect()
    }

    fn bind(
        &self,
        model: &Path,
        resolution: Resolution,
        target: ExecutionTarget,
    ) -> Result<BoundModel> {
        let started = Instant::now();
        let providers = execution_providers(target, self.trt_cache_for(model, resolution));

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?
            .commit_from_file(model)
            .with_context(|| format!("failed to load ONNX model: {}", model.display()))?;

        let Some(input) = session.inputs().first() else {
            bail!("model declares no inputs");
        };
        let Some(output) = session.outputs().first() else {
            bail!("model declares no outputs");
        };
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(
            model = %model.display(),
            input = %input_name,
            output = %output_name,
            is_fp16,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session committed"
        );

        Ok(BoundModel {
            session,
            input_name,
            output_name,
            is_fp16,
            resolution,
        })
    }

    fn trt_cache_for(&self, model: &Path, resolution: Resolution) -> Option<PathBuf> {
        let base = self.options.trt_cache_dir.as_deref()?;
        let stem = model.file_stem()?.to_string_lossy();
        let key = trt_cache_key(&stem, resolution);
        Some(resolve_trt_cache_dir(base, Some(key.as_str())))
    }
}

impl InferenceBackend for OrtBackend {
    fn enumerate_devices(&self) -> BridgeResult<Vec<Device>> {
        self.ensure_loaded()?;
        Ok(self
            .available_targets()
            .into_iter()
            .enumerate()
            .map(|(index, target)| Device {
                index,
                name: target.device_name().to_string(),
            })
            .collect())
    }

    fn initialize(
        &mut self,
        model: &Path,
        width: u32,
        height: u32,
        device_index: usize,
    ) -> BridgeResult<Device> {
        self.ensure_loaded()?;
        self.release();

        if width == 0 || height == 0 {
            return Err(BridgeError::session_init(
                model,
                format!("unsupported resolution {width}x{height}"),
            ));
        }

        let targets = self.available_targets();
        let Some(&target) = targets.get(device_index) else {
            return Err(BridgeError::session_init(
                model,
                format!(
                    "device index {device_index} out of range ({} devices)",
                    targets.len()
                ),
            ));
        };

        let resolution = Resolution::new(width, height);
        let mut bound = self
            .bind(model, resolution, target)
            .map_err(|err| BridgeError::session_init(model, format!("{err:#}")))?;

        // A warmup pass proves the model accepts this resolution and maps it
        // onto itself, which the in-place buffer contract needs.
        let mut probe = vec![0u8; resolution.byte_len()];
        bound
            .run(&mut probe, self.options.value_range)
            .map_err(|err| BridgeError::session_init(model, format!("{err:#}")))?;

        info!(
            model = %model.display(),
            device = target.device_name(),
            provider = %target,
            resolution = %resolution,
            "Inference session bound"
        );
        self.bound = Some(bound);

        Ok(Device {
            index: device_index,
            name: target.device_name().to_string(),
        })
    }

    fn run(&mut self, pixels: &mut [u8]) -> BridgeResult<()> {
        let value_range = self.options.value_range;
        let bound = self
            .bound
            .as_mut()
            .ok_or_else(|| BridgeError::inference("no model bound"))?;
        bound
            .run(pixels, value_range)
            .map_err(|err| BridgeError::inference(format!("{err:#}")))
    }

    fn release(&mut self) {
        if let Some(bound) = self.bound.take() {
            debug!(resolution = %bound.resolution, "Releasing inference session");
        }
    }
}

impl BoundModel {
    fn run(&mut self, pixels: &mut [u8], value_range: f32) -> Result<()> {
        let Resolution { width, height } = self.resolution;
        let (w, h) = (width as usize, height as usize);
        if pixels.len() != self.resolution.byte_len() {
            bail!(
                "buffer holds {} bytes, session expects {}",
                pixels.len(),
                self.resolution.byte_len()
            );
        }

        let input = rgba_to_nchw(pixels, w, h, value_range);
        let output = if self.is_fp16 {
            let tensor = Tensor::from_array(input.mapv(f16::from_f32))?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            view.mapv(f16::to_f32)
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            view.to_owned()
        };

        write_nchw_into_rgba(output.view(), w, h, value_range, pixels)
    }
}

fn execution_providers(
    target: ExecutionTarget,
    trt_cache_dir: Option<PathBuf>,
) -> Vec<ExecutionProviderDispatch> {
    match target {
        ExecutionTarget::Cuda => vec![CUDAExecutionProvider::default()
            .build()
            .error_on_failure()],
        ExecutionTarget::Tensorrt => {
            let mut trt = TensorRTExecutionProvider::default()
                .with_fp16(true)
                .with_device_id(0);
            if let Some(dir) = trt_cache_dir {
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Failed to create TRT cache directory"
                    );
                }
                trt = trt
                    .with_engine_cache(true)
                    .with_engine_cache_path(dir.to_string_lossy().to_string());
            }
            // TRT may fail at runtime if libnvinfer is not installed; CUDA takes over.
            vec![trt.build(), CUDAExecutionProvider::default().build()]
        }
        ExecutionTarget::Cpu => Vec::new(),
    }
}

/// Format: `{model_stem}_{height}x{width}`
pub fn trt_cache_key(model_stem: &str, resolution: Resolution) -> String {
    format!("{}_{}x{}", model_stem, resolution.height, resolution.width)
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

/// Pack RGBA8 pixels into a `1x3xHxW` tensor scaled to `[0, value_range]`.
pub(crate) fn rgba_to_nchw(pixels: &[u8], w: usize, h: usize, value_range: f32) -> Array4<f32> {
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    let scale = value_range / 255.0;
    for (i, px) in pixels.chunks_exact(RGBA_CHANNELS).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..3 {
            nchw[[0, c, y, x]] = px[c] as f32 * scale;
        }
    }
    nchw
}

/// Write the RGB planes of a model output back into an RGBA8 buffer.
///
/// Shape is checked before the first byte is written, so a mismatched output
/// leaves `pixels` as it was.
pub(crate) fn write_nchw_into_rgba(
    output: ArrayViewD<'_, f32>,
    w: usize,
    h: usize,
    value_range: f32,
    pixels: &mut [u8],
) -> Result<()> {
    let shape = output.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] < 3 || shape[2] != h || shape[3] != w {
        bail!(
            "model output shape {shape:?} does not match input 1x3x{h}x{w}; \
             in-place inference needs identical dimensions"
        );
    }

    let output = output.into_dimensionality::<Ix4>()?;
    let scale = 255.0 / value_range;
    for (i, px) in pixels.chunks_exact_mut(RGBA_CHANNELS).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..3 {
            let value = output[[0, c, y, x]] * scale;
            px[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: usize, h: usize) -> Vec<u8> {
        (0..w * h)
            .flat_map(|i| [(i * 7 % 256) as u8, (i * 13 % 256) as u8, (i * 29 % 256) as u8, 200])
            .collect()
    }

    #[test]
    fn test_nchw_roundtrip_preserves_rgb_and_alpha() {
        let (w, h) = (5, 3);
        let source = gradient(w, h);
        let nchw = rgba_to_nchw(&source, w, h, 1.0);
        assert_eq!(nchw.shape(), &[1, 3, h, w]);

        let mut target = vec![0u8; source.len()];
        for px in target.chunks_exact_mut(4) {
            px[3] = 200;
        }
        write_nchw_into_rgba(nchw.view().into_dyn(), w, h, 1.0, &mut target).unwrap();
        assert_eq!(target, source);
    }

    #[test]
    fn test_value_range_255_keeps_raw_values() {
        let pixels = vec![10, 20, 30, 255];
        let nchw = rgba_to_nchw(&pixels, 1, 1, 255.0);
        assert_eq!(nchw[[0, 0, 0, 0]], 10.0);
        assert_eq!(nchw[[0, 1, 0, 0]], 20.0);
        assert_eq!(nchw[[0, 2, 0, 0]], 30.0);
    }

    #[test]
    fn test_planar_layout_is_row_major() {
        // 2x1 image: left pixel red, right pixel blue.
        let pixels = vec![255, 0, 0, 255, 0, 0, 255, 255];
        let nchw = rgba_to_nchw(&pixels, 2, 1, 1.0);
        assert_eq!(nchw[[0, 0, 0, 0]], 1.0);
        assert_eq!(nchw[[0, 0, 0, 1]], 0.0);
        assert_eq!(nchw[[0, 2, 0, 1]], 1.0);
    }

    #[test]
    fn test_output_values_are_clamped() {
        let mut out = Array4::<f32>::zeros((1, 3, 1, 1));
        out[[0, 0, 0, 0]] = 2.0;
        out[[0, 1, 0, 0]] = -1.0;
        out[[0, 2, 0, 0]] = 0.5;
        let mut pixels = vec![0, 0, 0, 9];
        write_nchw_into_rgba(out.view().into_dyn(), 1, 1, 1.0, &mut pixels).unwrap();
        assert_eq!(pixels, vec![255, 0, 128, 9]);
    }

    #[test]
    fn test_mismatched_output_shape_leaves_buffer_untouched() {
        let upscaled = Array4::<f32>::ones((1, 3, 4, 4));
        let mut pixels = gradient(2, 2);
        let before = pixels.clone();
        let err = write_nchw_into_rgba(upscaled.view().into_dyn(), 2, 2, 1.0, &mut pixels)
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
        assert_eq!(pixels, before);
    }

    #[test]
    fn test_missing_library_is_backend_unavailable() {
        let backend = OrtBackend::new(RuntimeLibrary::Missing, OrtBackendOptions::default());
        let err = backend.enumerate_devices().unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }));
    }

    #[test]
    fn test_initialize_without_library_fails_and_stays_idle() {
        let missing = std::env::temp_dir().join("framebridge-no-such-runtime.so");
        let mut backend = OrtBackend::new(
            RuntimeLibrary::FromEnv(missing),
            OrtBackendOptions::default(),
        );
        let err = backend
            .initialize(Path::new("model.onnx"), 960, 540, 0)
            .unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }));

        let mut pixels = vec![0u8; 4];
        let err = backend.run(&mut pixels).unwrap_err();
        assert!(matches!(err, BridgeError::InferenceFailed { .. }));
    }

    #[test]
    fn test_trt_cache_key() {
        let key = trt_cache_key("denoise", Resolution::new(960, 540));
        assert_eq!(key, "denoise_540x960");
    }

    #[test]
    fn test_resolve_trt_cache_dir() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(
            resolve_trt_cache_dir(&base, Some("denoise_540x960")),
            PathBuf::from("trt_cache/denoise_540x960")
        );
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
    }
}
