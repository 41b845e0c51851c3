//! Stream metadata reported by the container, and the richer metadata
//! produced by a full linear scan.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Video codec of the coded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    Mpeg2,
    Mpeg4,
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Mjpeg,
}

impl Codec {
    /// Short codec name as containers report it.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mpeg2 => "mpeg2video",
            Self::Mpeg4 => "mpeg4",
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Mjpeg => "mjpeg",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata the container reports up front.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    /// Frame count from the container header (0 when unknown).
    pub num_frames: u32,
    pub average_fps: u32,
    /// Duration in seconds (0.0 when unknown).
    pub duration: f64,
    pub bitrate: f32,
    pub codec_name: String,
}

impl StreamMetadata {
    /// Whether the header is missing the fields a scan can recover.
    pub fn is_incomplete(&self) -> bool {
        self.duration == 0.0 || self.num_frames == 0
    }

    /// Overwrite the common fields with values recovered by a scan.
    pub fn fill_from_scan(&mut self, scanned: &ScannedStreamMetadata) {
        self.width = scanned.width;
        self.height = scanned.height;
        self.num_frames = scanned.num_frames;
        self.average_fps = scanned.average_fps;
        self.duration = scanned.duration;
        self.bitrate = scanned.bitrate;
        self.codec_name = scanned.codec_name.clone();
    }
}

/// Metadata collected by reading every packet of the stream.
///
/// Per-packet vectors are sorted in presentation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannedStreamMetadata {
    pub width: u32,
    pub height: u32,
    pub num_frames: u32,
    pub average_fps: u32,
    pub duration: f64,
    pub bitrate: f32,
    pub codec_name: String,
    /// Display indices of key frames.
    pub key_frame_indices: Vec<u32>,
    pub packet_sizes: Vec<u32>,
    pub pts: Vec<i64>,
    pub dts: Vec<i64>,
}

/// One packet observed during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub size: u32,
    pub pts: i64,
    pub dts: i64,
    /// Display duration in ticks (0 when unknown).
    pub duration: u64,
    pub is_key_frame: bool,
}

impl ScannedStreamMetadata {
    /// Build scan results from packets observed in decode order.
    ///
    /// `seconds_per_tick` is used to derive the duration from the pts span,
    /// up to the end of the last frame, when `header` does not report one.
    pub fn from_packets(
        header: &StreamMetadata,
        mut packets: Vec<PacketInfo>,
        seconds_per_tick: f64,
    ) -> Self {
        packets.sort_by_key(|p| p.pts);

        let mut scanned = Self {
            width: header.width,
            height: header.height,
            num_frames: packets.len() as u32,
            average_fps: header.average_fps,
            duration: header.duration,
            bitrate: header.bitrate,
            codec_name: header.codec_name.clone(),
            ..Default::default()
        };

        for (index, packet) in packets.iter().enumerate() {
            scanned.packet_sizes.push(packet.size);
            if packet.is_key_frame {
                scanned.key_frame_indices.push(index as u32);
            }
            scanned.pts.push(packet.pts);
            scanned.dts.push(packet.dts);
        }

        if scanned.duration == 0.0 {
            if let (Some(first), Some(last)) = (packets.first(), packets.last()) {
                let span = last.pts - first.pts + last.duration as i64;
                scanned.duration = span as f64 * seconds_per_tick;
            }
        }
        scanned
    }
}
