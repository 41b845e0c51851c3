//! Deterministic in-process demuxer and decoder.
//!
//! A [`SyntheticStream`] describes a GOP-structured stream with B-frame
//! reordering, closed by default. Each packet payload carries its display index, so decoded
//! frames can be checked against the index they were requested for without
//! any real codec in the loop.

use crate::decoder::{
    DecodeFlags, DecoderCaps, DecoderFactory, DecoderKey, DecoderParams,
    OperatingPointInfo, VideoDecoder, VideoFormat,
};
use crate::demux::{
    CompressedUnit, ContainerFormat, Demuxer, IndexEntry, SourceOpener, StreamParams,
};
use crate::frame_pool::FramePool;
use crate::metadata::{Codec, StreamMetadata};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use vidseek_core::{
    time, ChromaFormat, CompletionSignal, DevicePtr, FrameRate, HostFence, MemoryLocation,
    Result, SideMetadata, SurfaceLayout, TimeBase, VidSeekError,
};

/// Side-data message type attached to key frames (SEI user data).
pub const KEY_FRAME_SEI_TYPE: u32 = 5;

const PAYLOAD_HEADER: usize = 5;
const PITCH_ALIGNMENT: usize = 256;

/// Shape of a synthetic stream.
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    pub num_frames: u32,
    pub gop_size: u32,
    /// Consecutive B-frames between anchors.
    pub b_frames: u32,
    pub codec: Codec,
    pub bit_depth: u8,
    pub chroma: ChromaFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub time_base: TimeBase,
    pub start_time: i64,
    pub container: ContainerFormat,
    pub seekable: bool,
    /// Whether the container header reports frame count and duration.
    pub header_complete: bool,
    /// Trailing B-frames of each GOP reference the next key frame and are
    /// decoded after it.
    pub open_gop: bool,
}

impl Default for SyntheticStream {
    fn default() -> Self {
        Self {
            num_frames: 120,
            gop_size: 12,
            b_frames: 2,
            codec: Codec::H264,
            bit_depth: 8,
            chroma: ChromaFormat::Yuv420,
            width: 320,
            height: 240,
            frame_rate: FrameRate::FPS_25,
            time_base: TimeBase::MPEG_90K,
            start_time: 0,
            container: ContainerFormat::Mov,
            seekable: true,
            header_complete: true,
            open_gop: false,
        }
    }
}

impl SyntheticStream {
    pub fn params(&self) -> StreamParams {
        StreamParams {
            codec: self.codec,
            bit_depth: self.bit_depth,
            chroma: self.chroma,
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            time_base: self.time_base,
            start_time: self.start_time,
        }
    }

    /// Presentation timestamp of display frame `index`.
    pub fn pts_of(&self, index: u32) -> i64 {
        self.start_time + time::frame_to_pts(index as i64, self.frame_rate, self.time_base)
    }

    pub fn is_key_frame(&self, index: u32) -> bool {
        index % self.gop_size.max(1) == 0
    }

    /// Display indices in decode order. Each GOP starts with its key frame,
    /// followed by anchors that precede the B-frames they reference. In an
    /// open GOP the B-frames before the next key frame follow that key frame.
    pub fn decode_order(&self) -> Vec<u32> {
        let gop = self.gop_size.max(1);
        let mut order = Vec::with_capacity(self.num_frames as usize);
        let mut leading = 0..0;
        let mut start = 0;
        while start < self.num_frames {
            let end = (start + gop).min(self.num_frames);
            order.push(start);
            order.extend(std::mem::replace(&mut leading, 0..0));
            let mut next = start + 1;
            while next < end {
                if self.open_gop && end < self.num_frames && next + self.b_frames >= end {
                    leading = next..end;
                    break;
                }
                let anchor = (next + self.b_frames).min(end - 1);
                order.push(anchor);
                order.extend(next..anchor);
                next = anchor + 1;
            }
            start = end;
        }
        order
    }

    fn metadata(&self) -> StreamMetadata {
        let fps = self.frame_rate.to_fps_f64();
        let (num_frames, duration) = if self.header_complete {
            (self.num_frames, self.num_frames as f64 / fps)
        } else {
            (0, 0.0)
        };
        StreamMetadata {
            width: self.width,
            height: self.height,
            num_frames,
            average_fps: fps.round() as u32,
            duration,
            bitrate: 1_000_000.0,
            codec_name: self.codec.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Packet {
    index: u32,
    pts: i64,
    dts: i64,
    key: bool,
    size: usize,
}

/// Demuxer over a [`SyntheticStream`].
#[derive(Debug)]
pub struct SyntheticDemuxer {
    stream: SyntheticStream,
    packets: Vec<Packet>,
    /// Presentation timestamps in display order, for index searches.
    display_pts: Vec<i64>,
    cursor: usize,
    buffer: Vec<u8>,
    pending_discontinuity: bool,
}

impl SyntheticDemuxer {
    pub fn new(stream: SyntheticStream) -> Self {
        let packets = stream
            .decode_order()
            .into_iter()
            .enumerate()
            .map(|(position, index)| {
                let key = stream.is_key_frame(index);
                Packet {
                    index,
                    pts: stream.pts_of(index),
                    dts: stream.start_time
                        + time::frame_to_pts(
                            position as i64 - 1,
                            stream.frame_rate,
                            stream.time_base,
                        ),
                    key,
                    size: if key { 64 } else { 16 },
                }
            })
            .collect();
        let display_pts = (0..stream.num_frames).map(|i| stream.pts_of(i)).collect();
        Self {
            stream,
            packets,
            display_pts,
            cursor: 0,
            buffer: Vec::new(),
            pending_discontinuity: false,
        }
    }

    pub fn stream(&self) -> &SyntheticStream {
        &self.stream
    }
}

impl Demuxer for SyntheticDemuxer {
    fn demux(&mut self) -> Result<Option<CompressedUnit<'_>>> {
        let Some(packet) = self.packets.get(self.cursor).copied() else {
            return Ok(None);
        };
        self.cursor += 1;

        self.buffer.clear();
        self.buffer.extend_from_slice(&packet.index.to_le_bytes());
        self.buffer.push(packet.key as u8);
        self.buffer.resize(packet.size, 0);

        let discontinuity = std::mem::take(&mut self.pending_discontinuity);
        Ok(Some(CompressedUnit {
            data: &self.buffer,
            pts: packet.pts,
            dts: packet.dts,
            duration: time::frame_to_pts(1, self.stream.frame_rate, self.stream.time_base) as u64,
            position: self.cursor as u64,
            is_key_frame: packet.key,
            discontinuity,
        }))
    }

    fn seek(&mut self, frame_index: u32) -> Result<()> {
        if !self.stream.seekable {
            return Err(VidSeekError::NotSeekable(format!(
                "cannot seek to frame {frame_index}"
            )));
        }
        if frame_index >= self.stream.num_frames {
            return Err(VidSeekError::Seek(format!(
                "frame {frame_index} is past the end of the stream"
            )));
        }
        let gop = self.stream.gop_size.max(1);
        let key = frame_index - frame_index % gop;
        self.cursor = self
            .packets
            .iter()
            .position(|packet| packet.index == key)
            .ok_or_else(|| VidSeekError::Seek(format!("no packet for key frame {key}")))?;
        self.pending_discontinuity = true;
        trace!(frame_index, position = self.cursor, "synthetic seek");
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        if !self.stream.seekable && self.cursor != 0 {
            return Err(VidSeekError::NotSeekable("cannot rewind".to_string()));
        }
        self.cursor = 0;
        self.pending_discontinuity = false;
        Ok(())
    }

    fn index_entry(&self, position: usize) -> Option<IndexEntry> {
        self.display_pts.get(position).map(|&timestamp| IndexEntry {
            timestamp,
            is_key_frame: self.stream.is_key_frame(position as u32),
        })
    }

    fn search_index(&self, timestamp: i64) -> Option<usize> {
        let after = self.display_pts.partition_point(|&pts| pts <= timestamp);
        let position = after.checked_sub(1)?;
        let gop = self.stream.gop_size.max(1) as usize;
        Some(position - position % gop)
    }

    fn container_format(&self) -> ContainerFormat {
        self.stream.container.clone()
    }

    fn params(&self) -> StreamParams {
        self.stream.params()
    }

    fn metadata(&self) -> StreamMetadata {
        self.stream.metadata()
    }

    fn is_seekable(&self) -> bool {
        self.stream.seekable
    }
}

/// Opens registered synthetic streams by name.
#[derive(Debug, Default)]
pub struct SyntheticOpener {
    streams: Mutex<HashMap<String, SyntheticStream>>,
    opened: AtomicUsize,
}

impl SyntheticOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(self, source: impl Into<String>, stream: SyntheticStream) -> Self {
        self.register(source, stream);
        self
    }

    pub fn register(&self, source: impl Into<String>, stream: SyntheticStream) {
        self.streams.lock().insert(source.into(), stream);
    }

    /// Number of demuxers opened so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl SourceOpener for SyntheticOpener {
    fn open(&self, source: &str) -> Result<Box<dyn Demuxer>> {
        let stream = self
            .streams
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| VidSeekError::Demux(format!("cannot open source {source}")))?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SyntheticDemuxer::new(stream)))
    }
}

/// Decoder that reorders synthetic packets into display order.
pub struct SyntheticDecoder {
    params: DecoderParams,
    pool: Arc<FramePool>,
    reorder_depth: usize,
    duplicate_key_frames: bool,
    /// When set, each output's fence signals this long after the frame is
    /// published, like a device copy still in flight.
    completion_delay: Option<Duration>,
    fences: HashMap<DevicePtr, Arc<HostFence>>,
    /// Pending pictures keyed by pts.
    reorder: BinaryHeap<Reverse<(i64, u32, bool)>>,
    sequence_started: bool,
    pictures_decoded: u32,
    next_addr: u64,
    width: u32,
    height: u32,
}

impl SyntheticDecoder {
    pub fn new(params: DecoderParams, reorder_depth: usize, duplicate_key_frames: bool) -> Self {
        let location = if params.use_device_memory {
            MemoryLocation::Device
        } else {
            MemoryLocation::Host
        };
        let layout = SurfaceLayout::new(
            params.output_format(),
            params.width,
            params.height,
            PITCH_ALIGNMENT,
        );
        let next_addr = match location {
            MemoryLocation::Device => 0x7f00_0000_0000,
            MemoryLocation::Host => 0x1000_0000,
        };
        Self {
            width: params.width,
            height: params.height,
            params,
            pool: Arc::new(FramePool::new(layout, location)),
            reorder_depth,
            duplicate_key_frames,
            completion_delay: None,
            fences: HashMap::new(),
            reorder: BinaryHeap::new(),
            sequence_started: false,
            pictures_decoded: 0,
            next_addr,
        }
    }

    /// Signal each output's fence `delay` after publishing it instead of
    /// handing out frames that are already readable.
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = Some(delay);
        self
    }

    fn start_sequence(&mut self) -> Result<()> {
        if let Some(events) = &self.params.events {
            events.on_sequence(&VideoFormat {
                codec: self.params.codec,
                bit_depth: self.params.bit_depth,
                chroma: self.params.chroma,
                coded_width: self.width,
                coded_height: self.height,
                frame_rate: FrameRate::default(),
                min_surfaces: self.reorder_depth as u32 + 1,
            })?;
            if self.params.codec == Codec::Av1 {
                let selected = events.on_operating_point(&OperatingPointInfo {
                    codec: self.params.codec,
                    count: 1,
                });
                debug!(?selected, "operating point selected");
            }
        }
        self.sequence_started = true;
        Ok(())
    }

    fn output(&mut self, pts: i64, index: u32, key: bool) -> Result<usize> {
        let copies = if key && self.duplicate_key_frames { 2 } else { 1 };
        let side_data = if key {
            vec![SideMetadata {
                message_type: KEY_FRAME_SEI_TYPE,
                uncompressed: true,
                payload: index.to_le_bytes().to_vec(),
            }]
        } else {
            Vec::new()
        };

        for _ in 0..copies {
            let next_addr = &mut self.next_addr;
            let fences = &mut self.fences;
            let surface = self.pool.acquire(|layout| {
                let ptr = DevicePtr(*next_addr);
                *next_addr += layout.total_size().max(1) as u64;
                let fence = Arc::new(HostFence::signaled());
                fences.insert(ptr, Arc::clone(&fence));
                let signal: Arc<dyn CompletionSignal> = fence;
                Ok((ptr, Some(signal)))
            })?;
            let fence = self.fences.get(&surface.ptr);
            if let (Some(delay), Some(fence)) = (self.completion_delay, fence) {
                // A surface released unread may still have its last copy in flight.
                fence.wait();
                fence.reset();
                let fence = Arc::clone(fence);
                std::thread::Builder::new()
                    .name("synthetic-fence".into())
                    .spawn(move || {
                        std::thread::sleep(delay);
                        fence.signal();
                    })?;
            }
            if let Some(events) = &self.params.events {
                events.on_picture_display(pts);
                if !side_data.is_empty() {
                    events.on_side_metadata(pts, &side_data);
                }
            }
            self.pool.publish(surface, pts, side_data.clone());
        }
        Ok(copies)
    }

    fn drain_reorder(&mut self, keep: usize) -> Result<usize> {
        let mut produced = 0;
        while self.reorder.len() > keep {
            if let Some(Reverse((pts, index, key))) = self.reorder.pop() {
                produced += self.output(pts, index, key)?;
            }
        }
        Ok(produced)
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn decode(&mut self, data: &[u8], flags: DecodeFlags, pts: i64) -> Result<usize> {
        self.pool.begin_decode();
        let retired = self.pool.drain_retired();
        for surface in &retired {
            self.fences.remove(&surface.ptr);
        }
        if !retired.is_empty() {
            debug!(count = retired.len(), "released retired surfaces");
        }

        let mut produced = 0;
        if !data.is_empty() {
            if data.len() < PAYLOAD_HEADER {
                return Err(VidSeekError::Decoder(format!(
                    "truncated unit of {} bytes",
                    data.len()
                )));
            }
            if !self.sequence_started {
                self.start_sequence()?;
            }
            let index = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let key = data[4] != 0;
            if let Some(events) = &self.params.events {
                events.on_picture_decode(self.pictures_decoded);
            }
            self.pictures_decoded = self.pictures_decoded.wrapping_add(1);
            self.reorder.push(Reverse((pts, index, key)));
            produced += self.drain_reorder(self.reorder_depth)?;
        }

        if flags.intersects(DecodeFlags::END_OF_STREAM | DecodeFlags::DISCONTINUITY) {
            produced += self.drain_reorder(0)?;
        }
        Ok(produced)
    }

    fn frame_pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    fn key(&self) -> DecoderKey {
        self.params.key()
    }

    fn max_width(&self) -> u32 {
        self.params.max_width
    }

    fn max_height(&self) -> u32 {
        self.params.max_height
    }

    fn reconfigure(&mut self, width: u32, height: u32) -> Result<()> {
        if width > self.params.max_width || height > self.params.max_height {
            return Err(VidSeekError::InvalidParameter(format!(
                "{width}x{height} exceeds decoder maximum {}x{}",
                self.params.max_width, self.params.max_height
            )));
        }
        self.width = width;
        self.height = height;
        self.reorder.clear();
        self.sequence_started = false;
        self.pool.set_layout(SurfaceLayout::new(
            self.params.output_format(),
            width,
            height,
            PITCH_ALIGNMENT,
        ));
        debug!(width, height, "synthetic decoder reconfigured");
        Ok(())
    }
}

/// Factory producing [`SyntheticDecoder`]s.
#[derive(Debug)]
pub struct SyntheticFactory {
    pub caps: DecoderCaps,
    pub reorder_depth: usize,
    /// Emit every key frame twice, the way some hardware decoders repeat
    /// the first picture after a flush.
    pub duplicate_key_frames: bool,
    /// Delay before each output frame's fence signals.
    pub completion_delay: Option<Duration>,
    created: AtomicUsize,
}

impl Default for SyntheticFactory {
    fn default() -> Self {
        Self {
            caps: DecoderCaps {
                codecs: vec![
                    Codec::Mpeg2,
                    Codec::Mpeg4,
                    Codec::H264,
                    Codec::Hevc,
                    Codec::Vp8,
                    Codec::Vp9,
                    Codec::Av1,
                    Codec::Mjpeg,
                ],
                max_width: 8192,
                max_height: 8192,
                max_bit_depth: 12,
            },
            reorder_depth: 3,
            duplicate_key_frames: false,
            completion_delay: None,
            created: AtomicUsize::new(0),
        }
    }
}

impl SyntheticFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of decoders created so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl DecoderFactory for SyntheticFactory {
    fn create(&self, params: &DecoderParams) -> Result<Box<dyn VideoDecoder>> {
        self.caps.check(params)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(?params, "creating synthetic decoder");
        let decoder =
            SyntheticDecoder::new(params.clone(), self.reorder_depth, self.duplicate_key_frames);
        Ok(Box::new(match self.completion_delay {
            Some(delay) => decoder.with_completion_delay(delay),
            None => decoder,
        }))
    }
}

/// Display index a synthetic key frame's side data refers to.
pub fn side_data_index(side_data: &[SideMetadata]) -> Option<u32> {
    side_data
        .iter()
        .find(|m| m.message_type == KEY_FRAME_SEI_TYPE && m.payload.len() >= 4)
        .map(|m| u32::from_le_bytes([m.payload[0], m.payload[1], m.payload[2], m.payload[3]]))
}
