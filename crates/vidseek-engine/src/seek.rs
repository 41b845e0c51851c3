//! GOP-aware frame retrieval by display index.
//!
//! The engine turns a list of requested display indices into decoded frames,
//! in request order. It seeks the container only when decoding forward from
//! the current position would be wasteful, discards dependency frames and
//! stale duplicates after a flush, and keeps frames decoded past the current
//! target for the next request.
//!
//! Every frame handed to the caller is locked in the decoder's pool and
//! stays valid until the next retrieval call (or [`SeekEngine::clear_state`]).

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace, warn};
use vidseek_core::{DecodedFrame, DevicePtr, Result};
use vidseek_media::{DecodeFlags, Demuxer, KeyFrameStrategy, VideoDecoder};

/// Resolve the display index of the key frame that starts the GOP holding
/// `index`. `None` when the container index has no usable entry.
pub fn key_frame_index(demuxer: &dyn Demuxer, index: u32) -> Option<u32> {
    match demuxer.container_format().key_frame_strategy() {
        KeyFrameStrategy::FrameRateRational => {
            let target = demuxer.frame_to_pts(index);
            let position = demuxer.search_index(target)?;
            let entry = demuxer.index_entry(position)?;
            u32::try_from(demuxer.pts_to_frame_number(entry.timestamp)).ok()
        }
        KeyFrameStrategy::IndexTable => {
            let entry = demuxer.index_entry(index as usize)?;
            let position = demuxer.search_index(entry.timestamp)?;
            u32::try_from(position).ok()
        }
    }
}

/// Counters for one engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeekStats {
    /// Container-level seeks issued.
    pub seeks: u64,
    /// Compressed units (including end-of-stream sentinels) submitted.
    pub units_submitted: u64,
    /// Decoded frames released without being returned.
    pub frames_discarded: u64,
    /// Targets served from the pending queue without decoding.
    pub pending_hits: u64,
}

#[derive(Debug)]
pub struct SeekEngine {
    forward_threshold: u32,
    previous_target: Option<u32>,
    previous_key: Option<u32>,
    next_batch_start: Option<u32>,
    /// Display index of the next frame the decoder yields.
    decode_position: i64,
    /// Timestamp of the key frame that opened the current GOP run.
    key_pts: Option<i64>,
    /// Timestamps seen since the last seek.
    seen_pts: HashSet<i64>,
    /// Locked frames decoded past a target, in display order.
    pending: VecDeque<(i64, DecodedFrame)>,
    /// Frames returned by the previous call, still locked.
    held: Vec<DevicePtr>,
    discontinuity: bool,
    end_of_stream: bool,
    stats: SeekStats,
}

impl SeekEngine {
    /// `forward_threshold`: a key frame fewer than this many frames past the
    /// previous target is reached by decoding forward instead of seeking.
    pub fn new(forward_threshold: u32) -> Self {
        Self {
            forward_threshold,
            previous_target: None,
            previous_key: None,
            next_batch_start: None,
            decode_position: 0,
            key_pts: None,
            seen_pts: HashSet::new(),
            pending: VecDeque::new(),
            held: Vec::new(),
            discontinuity: false,
            end_of_stream: false,
            stats: SeekStats::default(),
        }
    }

    pub fn previous_target(&self) -> Option<u32> {
        self.previous_target
    }

    pub fn stats(&self) -> SeekStats {
        self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Mark the decoder as drained so the next [`clear_state`] flushes it.
    ///
    /// [`clear_state`]: Self::clear_state
    pub fn set_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    /// Decode the frames at `indices`, returned in request order.
    ///
    /// Indices without an index entry, or past the end of the stream, are
    /// skipped with a warning. Container seek and decode failures abort the
    /// call.
    pub fn frames_by_index_list(
        &mut self,
        demuxer: &mut dyn Demuxer,
        decoder: &mut dyn VideoDecoder,
        indices: &[u32],
    ) -> Result<Vec<DecodedFrame>> {
        self.release_held(decoder);

        let mut frames = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(key) = key_frame_index(demuxer, index) else {
                warn!(index, "no index entry for frame, skipping");
                continue;
            };

            match self.retrieve(demuxer, decoder, index, key)? {
                Some(mut frame) => {
                    frame.frame_index = Some(index);
                    self.held.push(frame.ptr());
                    frames.push(frame);
                    self.previous_target = Some(index);
                    self.previous_key = Some(key);
                }
                None => warn!(index, "stream ended before frame was decoded"),
            }
        }
        Ok(frames)
    }

    /// Decode the next `count` frames after the previous target, or from the
    /// index given to [`seek_to_index`](Self::seek_to_index). Indices at or
    /// past `num_frames` are dropped.
    pub fn frames_by_batch(
        &mut self,
        demuxer: &mut dyn Demuxer,
        decoder: &mut dyn VideoDecoder,
        count: usize,
        num_frames: u32,
    ) -> Result<Vec<DecodedFrame>> {
        let start = match (self.next_batch_start.take(), self.previous_target) {
            (Some(start), _) => start,
            (None, Some(previous)) => previous.saturating_add(1),
            (None, None) => 0,
        };
        let requested_end = start.saturating_add(u32::try_from(count).unwrap_or(u32::MAX));
        let end = requested_end.min(num_frames);
        if requested_end > end {
            warn!(
                start,
                count, num_frames, "batch runs past the end of the stream, clipping"
            );
        }
        let indices: Vec<u32> = (start..end.max(start)).collect();
        self.frames_by_index_list(demuxer, decoder, &indices)
    }

    /// Make the next batch start at `index`. Nothing is decoded.
    pub fn seek_to_index(&mut self, index: u32) {
        self.next_batch_start = Some(index);
    }

    /// Whether retrieving `index` would need to go back past the previous
    /// target.
    pub fn is_seek_backwards(&self, index: u32) -> bool {
        self.previous_target.is_some_and(|previous| index <= previous)
    }

    /// Decide whether reaching `index` (whose GOP starts at `key`) needs a
    /// container seek.
    pub fn should_seek(&self, index: u32, key: u32) -> bool {
        let Some(previous) = self.previous_target else {
            return true;
        };
        // The decoder cannot go back, and cannot continue after end-of-stream.
        if self.end_of_stream || i64::from(index) < self.decode_position {
            return true;
        }
        if self.previous_key == Some(key) {
            return false;
        }
        i64::from(key) - i64::from(previous) >= i64::from(self.forward_threshold)
    }

    /// Reset to a fresh session: release every locked frame, forget all
    /// seek history and rewind the container. A decoder that reached
    /// end-of-stream (or when `force_eos` is set) is flushed and drained.
    pub fn clear_state(
        &mut self,
        demuxer: &mut dyn Demuxer,
        decoder: &mut dyn VideoDecoder,
        force_eos: bool,
    ) -> Result<()> {
        self.reset(decoder, force_eos)?;
        demuxer.rewind()
    }

    /// Everything [`clear_state`](Self::clear_state) does except rewinding.
    /// Used when the demuxer is about to be replaced.
    pub fn reset(&mut self, decoder: &mut dyn VideoDecoder, force_eos: bool) -> Result<()> {
        self.release_held(decoder);
        self.release_pending(decoder);
        self.seen_pts.clear();
        self.key_pts = None;
        self.previous_target = None;
        self.previous_key = None;
        self.next_batch_start = None;
        self.decode_position = 0;
        self.discontinuity = false;

        if self.end_of_stream || force_eos {
            decoder.decode(&[], DecodeFlags::END_OF_STREAM, 0)?;
            let mut drained = 0;
            while decoder.get_frame().is_some() {
                drained += 1;
            }
            debug!(drained, "flushed decoder");
        }
        self.end_of_stream = false;
        Ok(())
    }

    fn retrieve(
        &mut self,
        demuxer: &mut dyn Demuxer,
        decoder: &mut dyn VideoDecoder,
        index: u32,
        key: u32,
    ) -> Result<Option<DecodedFrame>> {
        if let Some(frame) = self.take_pending(decoder, index) {
            self.stats.pending_hits += 1;
            trace!(index, "served from pending frames");
            return Ok(Some(frame));
        }
        if self.should_seek(index, key) {
            self.seek(demuxer, decoder, key)?;
        }
        self.decode_until(demuxer, decoder, index)
    }

    fn seek(
        &mut self,
        demuxer: &mut dyn Demuxer,
        decoder: &dyn VideoDecoder,
        key: u32,
    ) -> Result<()> {
        demuxer.seek(key)?;
        self.release_pending(decoder);
        self.seen_pts.clear();
        self.key_pts = None;
        self.decode_position = i64::from(key);
        self.discontinuity = true;
        self.end_of_stream = false;
        self.stats.seeks += 1;
        debug!(key, "seeked to key frame");
        Ok(())
    }

    fn decode_until(
        &mut self,
        demuxer: &mut dyn Demuxer,
        decoder: &mut dyn VideoDecoder,
        index: u32,
    ) -> Result<Option<DecodedFrame>> {
        let mut found = None;
        while found.is_none() && !self.end_of_stream {
            if self.discontinuity {
                self.flush_discontinuity(decoder)?;
            }

            let ready = match demuxer.demux()? {
                Some(unit) => {
                    if self.key_pts.is_none() && unit.is_key_frame {
                        self.key_pts = Some(unit.pts);
                    }
                    decoder.decode(unit.data, DecodeFlags::TIMESTAMP, unit.pts)?
                }
                None => {
                    self.end_of_stream = true;
                    decoder.decode(&[], DecodeFlags::END_OF_STREAM, 0)?
                }
            };
            self.stats.units_submitted += 1;

            for _ in 0..ready {
                let Some(frame) = decoder.get_locked_frame() else {
                    break;
                };
                self.place_frame(decoder, frame, index, &mut found);
            }
        }
        Ok(found)
    }

    /// Drop whatever the decoder still holds from the abandoned GOP.
    fn flush_discontinuity(&mut self, decoder: &mut dyn VideoDecoder) -> Result<()> {
        decoder.decode(&[], DecodeFlags::DISCONTINUITY, 0)?;
        while decoder.get_frame().is_some() {
            self.stats.frames_discarded += 1;
        }
        self.discontinuity = false;
        Ok(())
    }

    fn place_frame(
        &mut self,
        decoder: &dyn VideoDecoder,
        frame: DecodedFrame,
        index: u32,
        found: &mut Option<DecodedFrame>,
    ) {
        let duplicate = !self.seen_pts.insert(frame.pts);
        let leading = self.key_pts.is_some_and(|key_pts| frame.pts < key_pts);
        if duplicate || leading {
            trace!(pts = frame.pts, duplicate, "dropping frame");
            self.discard(decoder, &frame);
            return;
        }

        let position = self.decode_position;
        self.decode_position += 1;
        match position.cmp(&i64::from(index)) {
            Ordering::Less => self.discard(decoder, &frame),
            Ordering::Equal => *found = Some(frame),
            Ordering::Greater => self.pending.push_back((position, frame)),
        }
    }

    fn take_pending(&mut self, decoder: &dyn VideoDecoder, index: u32) -> Option<DecodedFrame> {
        let index = i64::from(index);
        while let Some((position, _)) = self.pending.front() {
            if *position >= index {
                break;
            }
            if let Some((_, stale)) = self.pending.pop_front() {
                self.discard(decoder, &stale);
            }
        }
        if self
            .pending
            .front()
            .is_some_and(|(position, _)| *position == index)
        {
            self.pending.pop_front().map(|(_, frame)| frame)
        } else {
            None
        }
    }

    fn discard(&mut self, decoder: &dyn VideoDecoder, frame: &DecodedFrame) {
        decoder.unlock(frame.ptr());
        self.stats.frames_discarded += 1;
    }

    fn release_held(&mut self, decoder: &dyn VideoDecoder) {
        for ptr in self.held.drain(..) {
            decoder.unlock(ptr);
        }
    }

    fn release_pending(&mut self, decoder: &dyn VideoDecoder) {
        for (_, frame) in self.pending.drain(..) {
            decoder.unlock(frame.ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidseek_core::{FrameRate, OutputColorType};
    use vidseek_media::synthetic::{SyntheticDecoder, SyntheticDemuxer, SyntheticStream};
    use vidseek_media::{ContainerFormat, DecoderParams};

    fn setup(stream: SyntheticStream, duplicate_keys: bool) -> (SyntheticDemuxer, SyntheticDecoder) {
        let params = DecoderParams {
            codec: stream.codec,
            bit_depth: stream.bit_depth,
            chroma: stream.chroma,
            width: stream.width,
            height: stream.height,
            max_width: stream.width,
            max_height: stream.height,
            gpu_id: 0,
            use_device_memory: true,
            output_color: OutputColorType::Native,
            events: None,
        };
        (
            SyntheticDemuxer::new(stream),
            SyntheticDecoder::new(params, 3, duplicate_keys),
        )
    }

    fn thirty_fps() -> SyntheticStream {
        SyntheticStream {
            num_frames: 90,
            gop_size: 30,
            frame_rate: FrameRate::FPS_30,
            ..Default::default()
        }
    }

    fn assert_frames(stream: &SyntheticStream, frames: &[DecodedFrame], expected: &[u32]) {
        let got: Vec<u32> = frames.iter().filter_map(|f| f.frame_index).collect();
        assert_eq!(got, expected);
        for frame in frames {
            let index = frame.frame_index.unwrap();
            assert_eq!(frame.pts, stream.pts_of(index), "frame {index} has wrong pts");
        }
    }

    #[test]
    fn test_key_frame_index_per_container() {
        for container in [ContainerFormat::Mov, ContainerFormat::Matroska] {
            let (demuxer, _) = setup(
                SyntheticStream {
                    container: container.clone(),
                    ..Default::default()
                },
                false,
            );
            assert_eq!(key_frame_index(&demuxer, 0), Some(0), "{container}");
            assert_eq!(key_frame_index(&demuxer, 30), Some(24), "{container}");
            assert_eq!(key_frame_index(&demuxer, 119), Some(108), "{container}");
        }
        let (demuxer, _) = setup(SyntheticStream::default(), false);
        assert_eq!(key_frame_index(&demuxer, 500), None);
    }

    #[test]
    fn test_same_gop_request_does_not_reseek() {
        let stream = thirty_fps();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);

        let first = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[45])
            .unwrap();
        assert_frames(&stream, &first, &[45]);
        assert_eq!(engine.stats().seeks, 1);

        let second = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[46])
            .unwrap();
        assert_frames(&stream, &second, &[46]);
        assert_eq!(engine.stats().seeks, 1);
    }

    #[test]
    fn test_should_seek_rules() {
        let (mut demuxer, mut decoder) = setup(thirty_fps(), false);
        let mut engine = SeekEngine::new(4);
        assert!(engine.should_seek(10, 0));

        engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[28])
            .unwrap();
        // Key frame 30 is only two frames ahead of 28.
        assert!(!engine.should_seek(31, 30));
        // Far ahead.
        assert!(engine.should_seek(65, 60));
        // Behind the decode position.
        assert!(engine.should_seek(5, 0));
    }

    #[test]
    fn test_output_follows_request_order() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);
        let indices = [50, 3, 77, 3, 4];
        let frames = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &indices)
            .unwrap();
        assert_frames(&stream, &frames, &indices);
    }

    #[test]
    fn test_duplicate_frames_after_flush_are_dropped() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), true);
        let mut engine = SeekEngine::new(4);
        let indices: Vec<u32> = (20..40).collect();
        let frames = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &indices)
            .unwrap();
        assert_frames(&stream, &frames, &indices);
        let mut pts: Vec<i64> = frames.iter().map(|f| f.pts).collect();
        pts.dedup();
        assert_eq!(pts.len(), indices.len());
    }

    #[test]
    fn test_invalid_indices_are_skipped() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);
        let frames = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[5, 500, 6])
            .unwrap();
        assert_frames(&stream, &frames, &[5, 6]);
    }

    #[test]
    fn test_missing_target_keeps_previous_target() {
        let stream = SyntheticStream {
            container: ContainerFormat::Matroska,
            ..Default::default()
        };
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);

        // 200 resolves to the last GOP's key frame but never decodes.
        let frames = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[10, 200])
            .unwrap();
        assert_frames(&stream, &frames, &[10]);
        assert_eq!(engine.previous_target(), Some(10));
        assert!(engine.is_end_of_stream());

        let next = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 2, 120)
            .unwrap();
        assert_frames(&stream, &next, &[11, 12]);
    }

    #[test]
    fn test_open_gop_leading_frames_are_dropped() {
        let stream = SyntheticStream {
            open_gop: true,
            ..Default::default()
        };
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);

        // Decode order after the seek is 24, 22, 23, 27, 25, 26: frames 22
        // and 23 come out first but belong to the previous GOP.
        let frames = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[26])
            .unwrap();
        assert_frames(&stream, &frames, &[26]);
        let stats = engine.stats();
        assert_eq!(stats.seeks, 1);
        // Two leading frames plus 24 and 25.
        assert_eq!(stats.frames_discarded, 4);

        let next = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[27, 36, 37])
            .unwrap();
        assert_frames(&stream, &next, &[27, 36, 37]);
    }

    #[test]
    fn test_last_frame_comes_out_of_the_final_flush() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);
        let frames = engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[119, 118])
            .unwrap();
        assert_frames(&stream, &frames, &[119, 118]);
        assert_eq!(engine.stats().seeks, 2);
    }

    #[test]
    fn test_batch_continues_after_previous_target() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);

        let first = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 4, 120)
            .unwrap();
        assert_frames(&stream, &first, &[0, 1, 2, 3]);
        let second = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 4, 120)
            .unwrap();
        assert_frames(&stream, &second, &[4, 5, 6, 7]);
        assert_eq!(engine.stats().seeks, 1);
    }

    #[test]
    fn test_batch_clips_at_end_of_stream() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);
        engine.seek_to_index(117);
        let frames = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 8, 120)
            .unwrap();
        assert_frames(&stream, &frames, &[117, 118, 119]);
        let none = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 8, 120)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_seek_to_index_matches_index_list() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);
        engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[90])
            .unwrap();
        engine.seek_to_index(40);
        let frames = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 5, 120)
            .unwrap();
        assert_frames(&stream, &frames, &[40, 41, 42, 43, 44]);
    }

    #[test]
    fn test_backwards_detection() {
        let (mut demuxer, mut decoder) = setup(SyntheticStream::default(), false);
        let mut engine = SeekEngine::new(4);
        assert!(!engine.is_seek_backwards(0));
        engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[10])
            .unwrap();
        assert!(engine.is_seek_backwards(10));
        assert!(engine.is_seek_backwards(3));
        assert!(!engine.is_seek_backwards(11));
    }

    #[test]
    fn test_returned_frames_stay_locked_until_next_call() {
        let (mut demuxer, mut decoder) = setup(SyntheticStream::default(), false);
        let mut engine = SeekEngine::new(4);
        let pool = std::sync::Arc::clone(decoder.frame_pool());

        engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[1, 2, 3])
            .unwrap();
        assert_eq!(pool.locked_count(), 3 + engine.pending_len());

        engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[4])
            .unwrap();
        assert_eq!(pool.locked_count(), 1 + engine.pending_len());
        assert!(pool.stats().is_consistent());
    }

    #[test]
    fn test_clear_state_releases_and_rewinds() {
        let stream = SyntheticStream::default();
        let (mut demuxer, mut decoder) = setup(stream.clone(), false);
        let mut engine = SeekEngine::new(4);
        let pool = std::sync::Arc::clone(decoder.frame_pool());

        engine
            .frames_by_index_list(&mut demuxer, &mut decoder, &[60, 119])
            .unwrap();
        assert!(engine.is_end_of_stream());
        engine
            .clear_state(&mut demuxer, &mut decoder, false)
            .unwrap();
        assert_eq!(pool.locked_count(), 0);
        assert_eq!(pool.ready_count(), 0);
        assert!(engine.previous_target().is_none());
        assert!(!engine.is_end_of_stream());

        let frames = engine
            .frames_by_batch(&mut demuxer, &mut decoder, 2, 120)
            .unwrap();
        assert_frames(&stream, &frames, &[0, 1]);
    }
}
