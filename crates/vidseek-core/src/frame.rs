//! Decoded frame handles and surface layouts.
//!
//! Decoder output lives in an opaque memory space (device or host). Frames
//! never expose a bare address: a [`FrameHandle`] pairs the address with the
//! [`SurfaceLayout`] that describes its planes, so consumers never have to
//! recompute strides on the side.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Pixel format of a decoded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:0, Y plane followed by interleaved UV
    #[default]
    Nv12,
    /// 16-bit container 4:2:0 (10/12-bit content), NV12 layout
    P016,
    /// 8-bit 4:4:4 planar
    Yuv444,
    /// 16-bit container 4:4:4 planar
    Yuv444P16,
    /// 8-bit interleaved RGB
    Rgb,
    /// 8-bit planar RGB
    RgbPlanar,
}

impl PixelFormat {
    /// Bytes per sample in each plane.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Nv12 | Self::Yuv444 | Self::Rgb | Self::RgbPlanar => 1,
            Self::P016 | Self::Yuv444P16 => 2,
        }
    }

    /// Number of planes for this format.
    pub fn plane_count(self) -> usize {
        match self {
            Self::Rgb => 1,
            Self::Nv12 | Self::P016 => 2,
            Self::Yuv444 | Self::Yuv444P16 | Self::RgbPlanar => 3,
        }
    }

    /// Native decoder output for a stream of the given bit depth and chroma.
    pub fn native_for(bit_depth: u8, chroma: ChromaFormat) -> Self {
        match (chroma, bit_depth > 8) {
            (ChromaFormat::Yuv444, false) => Self::Yuv444,
            (ChromaFormat::Yuv444, true) => Self::Yuv444P16,
            (_, false) => Self::Nv12,
            (_, true) => Self::P016,
        }
    }
}

/// Chroma subsampling of the coded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

/// Geometry of a single plane inside a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the plane from the surface base.
    pub offset: usize,
    /// Bytes per row (may include padding)
    pub pitch: usize,
    /// Width in samples
    pub width: u32,
    /// Height in rows
    pub height: u32,
}

impl PlaneLayout {
    /// Bytes occupied by this plane.
    #[inline]
    pub fn size(&self) -> usize {
        self.pitch * self.height as usize
    }
}

/// Plane geometry of a decoded surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: SmallVec<[PlaneLayout; 3]>,
}

impl SurfaceLayout {
    /// Compute the layout of a `width × height` surface, padding each row to
    /// `pitch_alignment` bytes (0 or 1 means tightly packed).
    pub fn new(format: PixelFormat, width: u32, height: u32, pitch_alignment: usize) -> Self {
        let bps = format.bytes_per_sample();
        let align = |bytes: usize| match pitch_alignment {
            0 | 1 => bytes,
            a => bytes.div_ceil(a) * a,
        };
        let chroma_height = height.div_ceil(2);

        let dims: SmallVec<[(usize, u32, u32); 3]> = match format {
            PixelFormat::Rgb => smallvec::smallvec![(width as usize * 3, width, height)],
            PixelFormat::Nv12 | PixelFormat::P016 => smallvec::smallvec![
                (width as usize * bps, width, height),            // Y
                (width as usize * bps, width / 2, chroma_height), // UV interleaved
            ],
            _ => smallvec::smallvec![
                (width as usize * bps, width, height),
                (width as usize * bps, width, height),
                (width as usize * bps, width, height),
            ],
        };

        let mut offset = 0;
        let planes = dims
            .into_iter()
            .map(|(row_bytes, w, h)| {
                let plane = PlaneLayout {
                    offset,
                    pitch: align(row_bytes),
                    width: w,
                    height: h,
                };
                offset += plane.size();
                plane
            })
            .collect();

        Self {
            format,
            width,
            height,
            planes,
        }
    }

    /// Total bytes needed for one surface.
    pub fn total_size(&self) -> usize {
        self.planes.iter().map(PlaneLayout::size).sum()
    }

    #[inline]
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Pitch of the luma (or packed) plane.
    #[inline]
    pub fn pitch(&self) -> usize {
        self.planes.first().map_or(0, |p| p.pitch)
    }
}

/// Where a surface's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLocation {
    Device,
    Host,
}

/// Opaque address of a decoder surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A typed, borrowed view of one decoder surface.
///
/// The handle does not own the memory; the decoder's frame pool does. It is
/// valid while the frame is locked or until the next decode call for
/// unlocked frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHandle {
    pub ptr: DevicePtr,
    pub location: MemoryLocation,
    pub layout: SurfaceLayout,
}

impl FrameHandle {
    /// Address of plane `index`, if the surface has that many planes.
    pub fn plane_ptr(&self, index: usize) -> Option<DevicePtr> {
        self.layout
            .planes
            .get(index)
            .map(|plane| DevicePtr(self.ptr.0 + plane.offset as u64))
    }
}

/// Readiness of a frame's memory, signalled by the device once the decode
/// and copy-out work for the frame has completed.
pub trait CompletionSignal: Send + Sync + fmt::Debug {
    fn is_complete(&self) -> bool;

    /// Block until the memory is safe to read.
    fn wait(&self);
}

/// Host-side fence: a flag plus condition variable.
#[derive(Debug, Default)]
pub struct HostFence {
    done: Mutex<bool>,
    cond: Condvar,
}

impl HostFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fence that is already signalled.
    pub fn signaled() -> Self {
        Self {
            done: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Re-arm the fence for the next use of its surface.
    pub fn reset(&self) {
        *self.done.lock() = false;
    }
}

impl CompletionSignal for HostFence {
    fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Per-frame side-channel message (e.g. an SEI payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideMetadata {
    pub message_type: u32,
    pub uncompressed: bool,
    pub payload: Vec<u8>,
}

/// One decoder output.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub handle: FrameHandle,
    /// Presentation timestamp in stream time-base ticks.
    pub pts: i64,
    pub side_data: Vec<SideMetadata>,
    pub completion: Option<Arc<dyn CompletionSignal>>,
    /// Display index this frame was retrieved for, when retrieved by index.
    pub frame_index: Option<u32>,
}

impl DecodedFrame {
    /// Block until the frame memory is readable.
    pub fn wait_ready(&self) {
        if let Some(signal) = &self.completion {
            signal.wait();
        }
    }

    #[inline]
    pub fn ptr(&self) -> DevicePtr {
        self.handle.ptr
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.handle.layout.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.handle.layout.height
    }
}
