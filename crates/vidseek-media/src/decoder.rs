//! Hardware decoder interface.
//!
//! The decode engine is a black box that accepts compressed units and yields
//! zero or more frames per call. Decoded surfaces are handed out through the
//! decoder's [`FramePool`], which is shareable across threads.

use crate::demux::StreamParams;
use crate::frame_pool::FramePool;
use crate::metadata::Codec;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;
use vidseek_core::{
    ChromaFormat, DecodedFrame, DevicePtr, FrameRate, OutputColorType, PixelFormat, Result,
    SideMetadata, VidSeekError,
};

bitflags! {
    /// Flags attached to a submitted compressed unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DecodeFlags: u32 {
        /// The unit carries a valid presentation timestamp.
        const TIMESTAMP = 1 << 0;
        /// No more units follow; flush every buffered picture.
        const END_OF_STREAM = 1 << 1;
        /// The next unit does not follow the previous one in decode order.
        const DISCONTINUITY = 1 << 2;
    }
}

/// Cache key identifying interchangeable decoder instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderKey {
    pub bit_depth: u8,
    pub codec: Codec,
    pub chroma: ChromaFormat,
}

impl DecoderKey {
    pub fn from_params(params: &StreamParams) -> Self {
        Self {
            bit_depth: params.bit_depth,
            codec: params.codec,
            chroma: params.chroma,
        }
    }
}

/// Sequence header information reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: Codec,
    pub bit_depth: u8,
    pub chroma: ChromaFormat,
    pub coded_width: u32,
    pub coded_height: u32,
    pub frame_rate: FrameRate,
    /// Minimum number of surfaces the stream needs for decoding.
    pub min_surfaces: u32,
}

/// Scalable-stream operating points advertised by the decoder (AV1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingPointInfo {
    pub codec: Codec,
    pub count: u32,
}

/// Upcalls a decoder makes while decoding. Registered once at decoder
/// construction through [`DecoderParams::events`].
pub trait DecoderEvents: Send + Sync {
    /// A new sequence header was parsed.
    fn on_sequence(&self, format: &VideoFormat) -> Result<()>;

    /// A picture was submitted to the hardware.
    fn on_picture_decode(&self, picture_index: u32);

    /// A picture is ready for display.
    fn on_picture_display(&self, pts: i64);

    /// Pick an operating point; `None` leaves the decoder default.
    fn on_operating_point(&self, info: &OperatingPointInfo) -> Option<u32>;

    /// Side-channel messages arrived for the picture at `pts`.
    fn on_side_metadata(&self, pts: i64, messages: &[SideMetadata]);
}

/// Everything needed to construct a decoder instance.
#[derive(Clone)]
pub struct DecoderParams {
    pub codec: Codec,
    pub bit_depth: u8,
    pub chroma: ChromaFormat,
    /// Display size of the stream the decoder is created for.
    pub width: u32,
    pub height: u32,
    /// Largest display size the instance must handle without recreation.
    pub max_width: u32,
    pub max_height: u32,
    pub gpu_id: u32,
    pub use_device_memory: bool,
    pub output_color: OutputColorType,
    pub events: Option<Arc<dyn DecoderEvents>>,
}

impl DecoderParams {
    pub fn key(&self) -> DecoderKey {
        DecoderKey {
            bit_depth: self.bit_depth,
            codec: self.codec,
            chroma: self.chroma,
        }
    }

    /// Pixel format of the surfaces this decoder will produce.
    pub fn output_format(&self) -> PixelFormat {
        match self.output_color {
            OutputColorType::Native => PixelFormat::native_for(self.bit_depth, self.chroma),
            OutputColorType::Rgb => PixelFormat::Rgb,
            OutputColorType::RgbPlanar => PixelFormat::RgbPlanar,
        }
    }
}

impl std::fmt::Debug for DecoderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderParams")
            .field("codec", &self.codec)
            .field("bit_depth", &self.bit_depth)
            .field("chroma", &self.chroma)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("max_width", &self.max_width)
            .field("max_height", &self.max_height)
            .field("gpu_id", &self.gpu_id)
            .field("output_color", &self.output_color)
            .finish_non_exhaustive()
    }
}

/// Hardware limits used to reject streams at decoder-creation time.
#[derive(Debug, Clone)]
pub struct DecoderCaps {
    pub codecs: Vec<Codec>,
    pub max_width: u32,
    pub max_height: u32,
    pub max_bit_depth: u8,
}

impl DecoderCaps {
    pub fn check(&self, params: &DecoderParams) -> Result<()> {
        if !self.codecs.contains(&params.codec) {
            return Err(VidSeekError::Capability(format!(
                "codec {} is not supported",
                params.codec
            )));
        }
        if params.bit_depth > self.max_bit_depth {
            return Err(VidSeekError::Capability(format!(
                "bit depth {} exceeds maximum {}",
                params.bit_depth, self.max_bit_depth
            )));
        }
        if params.max_width > self.max_width || params.max_height > self.max_height {
            return Err(VidSeekError::Capability(format!(
                "resolution {}x{} exceeds maximum {}x{}",
                params.max_width, params.max_height, self.max_width, self.max_height
            )));
        }
        Ok(())
    }
}

/// A stateful hardware decode session.
///
/// `decode` may buffer units internally (reorder buffer) and returns how
/// many frames became ready; those frames are then retrieved one by one.
pub trait VideoDecoder: Send {
    /// Submit one compressed unit. An empty `data` slice together with
    /// [`DecodeFlags::END_OF_STREAM`] or [`DecodeFlags::DISCONTINUITY`]
    /// flushes the reorder buffer.
    fn decode(&mut self, data: &[u8], flags: DecodeFlags, pts: i64) -> Result<usize>;

    fn frame_pool(&self) -> &Arc<FramePool>;

    fn key(&self) -> DecoderKey;

    fn max_width(&self) -> u32;

    fn max_height(&self) -> u32;

    /// Adapt to a new display size within the current maximum dimensions.
    fn reconfigure(&mut self, width: u32, height: u32) -> Result<()>;

    fn get_frame(&self) -> Option<DecodedFrame> {
        self.frame_pool().get_frame()
    }

    fn get_locked_frame(&self) -> Option<DecodedFrame> {
        self.frame_pool().get_locked_frame()
    }

    fn unlock(&self, ptr: DevicePtr) -> bool {
        self.frame_pool().unlock(ptr)
    }

    /// Unlock the oldest `count` locked frames.
    fn unlock_locked_frames(&self, count: usize) -> usize {
        self.frame_pool().unlock_oldest(count)
    }
}

/// Creates decoder instances.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, params: &DecoderParams) -> Result<Box<dyn VideoDecoder>>;
}

/// A decoder instance shared between the session, its cache and (in threaded
/// mode) the decode thread.
pub type SharedDecoder = Arc<Mutex<Box<dyn VideoDecoder>>>;

pub fn share(decoder: Box<dyn VideoDecoder>) -> SharedDecoder {
    Arc::new(Mutex::new(decoder))
}
