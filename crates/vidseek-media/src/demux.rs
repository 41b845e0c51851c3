//! Demuxer interface.
//!
//! Container parsing itself is outside VidSeek; implementations wrap a real
//! container library and expose compressed access units plus the container's
//! seek index through [`Demuxer`].

use crate::metadata::{Codec, PacketInfo, ScannedStreamMetadata, StreamMetadata};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};
use vidseek_core::{time, ChromaFormat, FrameRate, Result, TimeBase, VidSeekError};

/// One demultiplexed access unit.
///
/// The payload is borrowed from the demuxer's single-slot packet buffer and
/// is only valid until the next call to [`Demuxer::demux`].
#[derive(Debug, Clone, Copy)]
pub struct CompressedUnit<'a> {
    pub data: &'a [u8],
    pub pts: i64,
    pub dts: i64,
    pub duration: u64,
    /// Byte position in the container.
    pub position: u64,
    pub is_key_frame: bool,
    pub discontinuity: bool,
}

/// Container family, as far as timestamp resolution is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFormat {
    /// ISO-BMFF family (mov, mp4, m4a, 3gp, ...)
    Mov,
    Matroska,
    Flv,
    MpegTs,
    Avi,
    Other(String),
}

/// How a frame index is resolved to its nearest preceding key frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameStrategy {
    /// Compute the target timestamp from frame rate and time base, then
    /// search the index backwards from it.
    FrameRateRational,
    /// Read the persisted index entry at the frame position.
    IndexTable,
}

impl ContainerFormat {
    /// Classify a demuxer format name such as `"mov,mp4,m4a,3gp,3g2,mj2"`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "flv" => Self::Flv,
            "matroska,webm" | "matroska" | "webm" => Self::Matroska,
            "mpegts" => Self::MpegTs,
            "avi" => Self::Avi,
            n if n.split(',').any(|part| part == "mov" || part == "mp4") => Self::Mov,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Mov => "mov,mp4,m4a,3gp,3g2,mj2",
            Self::Matroska => "matroska,webm",
            Self::Flv => "flv",
            Self::MpegTs => "mpegts",
            Self::Avi => "avi",
            Self::Other(name) => name,
        }
    }

    pub fn key_frame_strategy(&self) -> KeyFrameStrategy {
        match self {
            Self::Flv | Self::Matroska => KeyFrameStrategy::FrameRateRational,
            _ => KeyFrameStrategy::IndexTable,
        }
    }

    /// Containers whose timestamps already start at zero for frame numbering.
    pub fn ignores_start_time(&self) -> bool {
        matches!(self, Self::Flv | Self::Mov)
    }

    /// Containers whose metadata is reliable enough to never need a scan.
    pub fn skips_metadata_scan(&self) -> bool {
        matches!(self, Self::Flv | Self::Matroska)
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of the container's persisted seek index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub is_key_frame: bool,
}

/// Coded-stream parameters the decoder and seek engine need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub codec: Codec,
    pub bit_depth: u8,
    pub chroma: ChromaFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub time_base: TimeBase,
    /// Timestamp of the first frame, in time-base ticks.
    pub start_time: i64,
}

/// A source of compressed access units.
pub trait Demuxer: Send {
    /// Next access unit, or `None` at end-of-stream.
    fn demux(&mut self) -> Result<Option<CompressedUnit<'_>>>;

    /// Position the demuxer so the next unit is the key frame at or before
    /// `frame_index`.
    fn seek(&mut self, frame_index: u32) -> Result<()>;

    /// Return to the start of the stream.
    fn rewind(&mut self) -> Result<()>;

    /// Entry at `position` in the container index, if present.
    fn index_entry(&self, position: usize) -> Option<IndexEntry>;

    /// Position of the last key-frame index entry at or before `timestamp`.
    fn search_index(&self, timestamp: i64) -> Option<usize>;

    fn container_format(&self) -> ContainerFormat;

    fn params(&self) -> StreamParams;

    fn metadata(&self) -> StreamMetadata;

    fn is_seekable(&self) -> bool;

    /// Timestamp of display frame `frame` under a constant frame rate.
    fn frame_to_pts(&self, frame: u32) -> i64 {
        let params = self.params();
        time::frame_to_pts(frame as i64, params.frame_rate, params.time_base)
    }

    /// Display frame number of the frame at `pts`.
    fn pts_to_frame_number(&self, pts: i64) -> i64 {
        let params = self.params();
        let start = if self.container_format().ignores_start_time() {
            0
        } else {
            params.start_time
        };
        time::pts_to_frame_number(
            pts,
            start,
            params.frame_rate.to_fps_f64(),
            params.time_base,
        )
    }

    /// Read every packet to collect per-packet metadata, then rewind.
    fn scan(&mut self) -> Result<ScannedStreamMetadata> {
        if !self.is_seekable() {
            error!("stream is not seekable, not scanning for stream metadata");
            return Err(VidSeekError::NotSeekable(
                "metadata scan needs to rewind the stream".to_string(),
            ));
        }

        let header = self.metadata();
        let seconds_per_tick = self.params().time_base.to_seconds(1);
        let mut packets = Vec::new();
        let scanned = loop {
            match self.demux() {
                Ok(Some(unit)) => packets.push(PacketInfo {
                    size: unit.data.len() as u32,
                    pts: unit.pts,
                    dts: unit.dts,
                    duration: unit.duration,
                    is_key_frame: unit.is_key_frame,
                }),
                Ok(None) => {
                    break Ok(ScannedStreamMetadata::from_packets(
                        &header,
                        packets,
                        seconds_per_tick,
                    ))
                }
                Err(e) => break Err(e),
            }
        };

        // Rewind even when the scan failed part-way.
        self.rewind()?;
        debug!(
            frames = scanned.as_ref().map(|s| s.num_frames).unwrap_or(0),
            "metadata scan finished"
        );
        scanned
    }
}

/// Opens demuxers for a source string (path or URL).
pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn Demuxer>>;
}
