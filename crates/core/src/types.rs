use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Bytes per pixel of every buffer exchanged with the inference backend.
pub const RGBA_CHANNELS: usize = 4;

/// A compute device exposed by the inference backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub index: usize,
    pub name: String,
}

/// One installed model, found by its description file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub display_name: String,
    pub description_path: PathBuf,
    /// Co-located weights file, when one with a matching stem exists.
    pub weights_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Derive the inference resolution from the live screen size: height is
    /// the requested value, width follows the screen aspect ratio.
    ///
    /// `None` when the screen or the requested height is zero.
    pub fn scaled_to_height(screen: Resolution, target_height: u32) -> Option<Self> {
        if screen.is_empty() || target_height == 0 {
            return None;
        }
        let scale = target_height as f64 / screen.height as f64;
        let width = (screen.width as f64 * scale).round().max(1.0) as u32;
        Some(Self {
            width,
            height: target_height,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size in bytes of an RGBA8 buffer at this resolution.
    pub fn byte_len(&self) -> usize {
        self.pixel_count() * RGBA_CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The active (model, device, resolution) binding of an inference session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub model: ModelDescriptor,
    pub device: Device,
    pub resolution: Resolution,
}

/// Fixed-size RGBA8 pixel buffer, row-major, origin top-left.
///
/// The same allocation carries the input to the backend and receives the
/// output, so a buffer is created once per frame and mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    resolution: Resolution,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn zeroed(resolution: Resolution) -> Self {
        Self {
            resolution,
            data: vec![0u8; resolution.byte_len()],
        }
    }

    /// Wrap existing bytes. Fails when the length does not match the resolution.
    pub fn from_rgba(resolution: Resolution, data: Vec<u8>) -> BridgeResult<Self> {
        if data.len() != resolution.byte_len() {
            return Err(BridgeError::DimensionMismatch {
                expected: resolution.byte_len(),
                actual: data.len(),
            });
        }
        Ok(Self { resolution, data })
    }

    /// Build a buffer whose byte length is not tied to its nominal resolution.
    /// Only useful to exercise size validation downstream.
    #[doc(hidden)]
    pub fn from_raw_parts_unchecked(resolution: Resolution, data: Vec<u8>) -> Self {
        Self { resolution, data }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Pixel layouts accepted on the host render surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Rgba8,
    Bgra8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Rgb8 => 3,
        }
    }
}

/// A host render surface: source and destination of every frame cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> BridgeResult<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(BridgeError::DimensionMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// An unallocated surface. Reintegration sizes it to the capture resolution.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn filled(width: u32, height: u32, format: PixelFormat, pixel: &[u8]) -> Self {
        let bpp = format.bytes_per_pixel();
        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        for _ in 0..width as usize * height as usize {
            data.extend_from_slice(&pixel[..bpp]);
        }
        Self {
            width,
            height,
            format,
            data,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}
