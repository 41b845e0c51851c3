//! VidSeek Core - Foundation types for indexed frame retrieval
//!
//! This crate provides the fundamental types used throughout VidSeek:
//! - Error taxonomy shared by every layer
//! - Timestamp / frame-index conversions (FrameRate, TimeBase)
//! - Typed decoder surface handles and completion signals
//! - Session configuration

pub mod config;
pub mod error;
pub mod frame;
pub mod time;

pub use config::{OutputColorType, SessionConfig};
pub use error::{Result, VidSeekError};
pub use frame::{
    ChromaFormat, CompletionSignal, DecodedFrame, DevicePtr, FrameHandle, HostFence,
    MemoryLocation, PixelFormat, PlaneLayout, SideMetadata, SurfaceLayout,
};
pub use time::{frame_to_pts, pts_to_frame_number, seconds_to_pts, FrameRate, TimeBase};
