//! Frame adapter: host surface <-> fixed-size RGBA8 inference buffer.
//!
//! `capture` converts a source frame to RGBA8 and resamples it to the session
//! resolution; `reintegrate` takes the (possibly inferred) buffer back and
//! composes it into the destination surface. Pure-Rust bilinear and
//! nearest-neighbor resampling.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};
use crate::types::{Frame, FrameBuffer, PixelFormat, Resolution, RGBA_CHANNELS};

/// Supported resample algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

impl ResampleAlgorithm {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "nearest" | "neighbor" | "nn" => Self::Nearest,
            _ => Self::Bilinear,
        }
    }
}

pub struct FrameAdapter {
    resolution: Resolution,
    algorithm: ResampleAlgorithm,
}

impl FrameAdapter {
    pub fn new(resolution: Resolution, algorithm: ResampleAlgorithm) -> Self {
        Self {
            resolution,
            algorithm,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Resample `source` into a buffer of exactly the adapter resolution.
    pub fn capture(&self, source: &Frame) -> BridgeResult<FrameBuffer> {
        capture(source, self.resolution, self.algorithm)
    }

    /// Compose `buffer` into `destination`.
    ///
    /// The buffer must carry the adapter resolution; anything else means
    /// capture and reintegrate were not paired and is reported as
    /// `DimensionMismatch`.
    pub fn reintegrate(&self, buffer: &FrameBuffer, destination: &mut Frame) -> BridgeResult<()> {
        let expected = self.resolution.byte_len();
        if buffer.resolution() != self.resolution || buffer.len() != expected {
            return Err(BridgeError::DimensionMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        reintegrate(buffer, destination, self.algorithm)
    }
}

/// Convert `source` to RGBA8 and resample it to `target`.
pub fn capture(
    source: &Frame,
    target: Resolution,
    algorithm: ResampleAlgorithm,
) -> BridgeResult<FrameBuffer> {
    if source.data.len() != source.expected_len() {
        return Err(BridgeError::DimensionMismatch {
            expected: source.expected_len(),
            actual: source.data.len(),
        });
    }
    if source.resolution().is_empty() || target.is_empty() {
        return Err(BridgeError::DimensionMismatch {
            expected: target.byte_len(),
            actual: source.data.len(),
        });
    }

    let rgba = to_rgba(&source.data, source.format);
    let data = resample(
        &rgba,
        source.resolution(),
        target,
        algorithm,
    );
    trace!(
        from = %source.resolution(),
        to = %target,
        "Captured frame"
    );
    FrameBuffer::from_rgba(target, data)
}

/// Write `buffer` into `destination`, resampling to the destination size.
///
/// An unallocated destination takes the buffer's resolution and RGBA8 layout.
/// An allocated one keeps its size and pixel format.
pub fn reintegrate(
    buffer: &FrameBuffer,
    destination: &mut Frame,
    algorithm: ResampleAlgorithm,
) -> BridgeResult<()> {
    let source_res = buffer.resolution();
    if buffer.len() != source_res.byte_len() {
        return Err(BridgeError::DimensionMismatch {
            expected: source_res.byte_len(),
            actual: buffer.len(),
        });
    }

    if destination.resolution().is_empty() {
        destination.width = source_res.width;
        destination.height = source_res.height;
        destination.format = PixelFormat::Rgba8;
    }

    let target = destination.resolution();
    let rgba = resample(buffer.as_slice(), source_res, target, algorithm);
    destination.data = from_rgba(rgba, destination.format);
    Ok(())
}

/// Identity copy used whenever inference is off.
pub fn passthrough(source: &Frame, destination: &mut Frame) {
    destination.width = source.width;
    destination.height = source.height;
    destination.format = source.format;
    destination.data.clear();
    destination.data.extend_from_slice(&source.data);
}

fn resample(
    rgba: &[u8],
    from: Resolution,
    to: Resolution,
    algorithm: ResampleAlgorithm,
) -> Vec<u8> {
    if from == to {
        return rgba.to_vec();
    }
    let (src_w, src_h) = (from.width as usize, from.height as usize);
    let (dst_w, dst_h) = (to.width as usize, to.height as usize);
    match algorithm {
        ResampleAlgorithm::Bilinear => resize_bilinear(rgba, src_w, src_h, dst_w, dst_h),
        ResampleAlgorithm::Nearest => resize_nearest(rgba, src_w, src_h, dst_w, dst_h),
    }
}

fn to_rgba(data: &[u8], format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgba8 => data.to_vec(),
        PixelFormat::Bgra8 => data
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0], px[3]])
            .collect(),
        PixelFormat::Rgb8 => data
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], u8::MAX])
            .collect(),
    }
}

fn from_rgba(rgba: Vec<u8>, format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgba8 => rgba,
        PixelFormat::Bgra8 => rgba
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0], px[3]])
            .collect(),
        PixelFormat::Rgb8 => rgba
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
    }
}

/// Nearest-neighbor resize for RGBA8 data.
pub(crate) fn resize_nearest(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * RGBA_CHANNELS];

    for dst_y in 0..dst_h {
        let src_y = ((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize;
        let src_y = src_y.min(src_h - 1);

        for dst_x in 0..dst_w {
            let src_x = ((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize;
            let src_x = src_x.min(src_w - 1);

            let si = (src_y * src_w + src_x) * RGBA_CHANNELS;
            let di = (dst_y * dst_w + dst_x) * RGBA_CHANNELS;
            dst[di..di + RGBA_CHANNELS].copy_from_slice(&src[si..si + RGBA_CHANNELS]);
        }
    }

    dst
}

/// Bilinear interpolation resize for RGBA8 data.
pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * RGBA_CHANNELS];

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = (src_yf.floor().max(0.0) as usize).min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = (src_xf.floor().max(0.0) as usize).min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * RGBA_CHANNELS;

            for c in 0..RGBA_CHANNELS {
                let p00 = src[(src_y0 * src_w + src_x0) * RGBA_CHANNELS + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * RGBA_CHANNELS + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * RGBA_CHANNELS + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * RGBA_CHANNELS + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
