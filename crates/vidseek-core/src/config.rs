//! Session configuration.

use crate::error::{Result, VidSeekError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Default number of decoder instances kept alive per session.
pub const DEFAULT_DECODER_CACHE_CAPACITY: usize = 4;

/// Default forward distance (in frames) below which a GOP change is decoded
/// through instead of seeking.
pub const DEFAULT_SEEK_FORWARD_THRESHOLD: u32 = 4;

/// Default capacity of the threaded decode buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16;

/// Highest device ordinal accepted by [`SessionConfig::validate`].
pub const MAX_GPU_ID: u32 = 63;

/// Colour layout of decoded surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputColorType {
    /// Decoder-native YUV layout.
    #[default]
    Native,
    /// Interleaved RGB.
    Rgb,
    /// Planar RGB.
    RgbPlanar,
}

/// Configuration for a decode session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device ordinal to decode on.
    pub gpu_id: u32,
    /// Keep decoded surfaces in device memory (host memory otherwise).
    pub use_device_memory: bool,
    /// Largest width the initial decoder must handle (0 = stream width).
    pub max_width: u32,
    /// Largest height the initial decoder must handle (0 = stream height).
    pub max_height: u32,
    /// Scan the whole container for per-packet metadata in the background.
    pub need_scanned_metadata: bool,
    /// Decoder instances kept for reconfiguration (values below 1 are clamped).
    pub decoder_cache_capacity: usize,
    pub output_color: OutputColorType,
    /// Forward distance below which crossing into a new GOP is decoded
    /// through rather than seeking.
    pub seek_forward_threshold: u32,
    /// Capacity of the threaded decode buffer.
    pub buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            use_device_memory: true,
            max_width: 0,
            max_height: 0,
            need_scanned_metadata: false,
            decoder_cache_capacity: DEFAULT_DECODER_CACHE_CAPACITY,
            output_color: OutputColorType::Native,
            seek_forward_threshold: DEFAULT_SEEK_FORWARD_THRESHOLD,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject settings no session can run with.
    ///
    /// A zero decoder cache capacity is clamped to 1 with a warning rather
    /// than rejected.
    pub fn validate(&mut self) -> Result<()> {
        if self.gpu_id > MAX_GPU_ID {
            return Err(VidSeekError::Configuration(format!(
                "GPU ordinal {} out of range (0-{})",
                self.gpu_id, MAX_GPU_ID
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(VidSeekError::Configuration(
                "buffer capacity must be at least 1".to_string(),
            ));
        }
        if self.decoder_cache_capacity < 1 {
            warn!(
                requested = self.decoder_cache_capacity,
                "decoder cache capacity must be at least 1, using 1"
            );
            self.decoder_cache_capacity = 1;
        }
        Ok(())
    }
}
