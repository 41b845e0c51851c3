//! Integration tests for indexed retrieval.
//!
//! Exercises vidseek-engine's random-access front-end against the synthetic
//! demuxer/decoder from vidseek-media.

use proptest::prelude::*;
use std::sync::Arc;
use vidseek_core::{DecodedFrame, FrameRate, SessionConfig};
use vidseek_engine::{FrameRequest, SimpleDecoder};
use vidseek_media::synthetic::{SyntheticFactory, SyntheticOpener, SyntheticStream};
use vidseek_media::ContainerFormat;

// ── Helpers ────────────────────────────────────────────────────

fn open(stream: SyntheticStream) -> SimpleDecoder {
    SimpleDecoder::open(
        "clip",
        SessionConfig::default(),
        Arc::new(SyntheticOpener::new().with_stream("clip", stream)),
        Arc::new(SyntheticFactory::new()),
        None,
    )
    .unwrap()
}

fn indices(frames: &[DecodedFrame]) -> Vec<u32> {
    frames.iter().filter_map(|f| f.frame_index).collect()
}

fn assert_pts(stream: &SyntheticStream, frames: &[DecodedFrame]) {
    for frame in frames {
        let index = frame.frame_index.unwrap();
        assert_eq!(frame.pts, stream.pts_of(index), "frame {index}");
    }
}

fn thirty_fps_gop_thirty() -> SyntheticStream {
    SyntheticStream {
        num_frames: 90,
        gop_size: 30,
        frame_rate: FrameRate::FPS_30,
        ..Default::default()
    }
}

// ── Order preservation ─────────────────────────────────────────

#[test]
fn unsorted_request_comes_back_in_request_order() {
    let stream = SyntheticStream::default();
    let mut decoder = open(stream.clone());
    let request = vec![64, 12, 90, 13, 5];
    let frames = decoder.get(FrameRequest::List(request.clone())).unwrap().into_vec();
    assert_eq!(indices(&frames), request);
    assert_pts(&stream, &frames);
}

#[test]
fn order_preserved_for_every_container_strategy() {
    for container in [
        ContainerFormat::Mov,
        ContainerFormat::Matroska,
        ContainerFormat::Flv,
        ContainerFormat::MpegTs,
    ] {
        let stream = SyntheticStream {
            container: container.clone(),
            ..Default::default()
        };
        let mut decoder = open(stream.clone());
        let frames = decoder
            .get(FrameRequest::List(vec![30, 31, 100, 2]))
            .unwrap()
            .into_vec();
        assert_eq!(indices(&frames), vec![30, 31, 100, 2], "{container}");
        assert_pts(&stream, &frames);
    }
}

// ── GOP scenarios ──────────────────────────────────────────────

#[test]
fn frame_46_after_45_decodes_forward() {
    let stream = thirty_fps_gop_thirty();
    let mut decoder = open(stream.clone());

    let frame = decoder.get_frame(45).unwrap();
    assert_eq!(frame.pts, stream.pts_of(45));
    let after_first = decoder.session().engine().stats();
    assert_eq!(after_first.seeks, 1);

    let frame = decoder.get_frame(46).unwrap();
    assert_eq!(frame.frame_index, Some(46));
    assert_eq!(frame.pts, stream.pts_of(46));

    let after_second = decoder.session().engine().stats();
    assert_eq!(after_second.seeks, 1, "46 shares a GOP with 45");
    assert!(after_second.units_submitted - after_first.units_submitted <= 2);
}

#[test]
fn no_duplicate_frames_across_gop_boundary() {
    let stream = SyntheticStream::default();
    let mut decoder = open(stream.clone());
    let request: Vec<u32> = vec![10, 11, 40, 41, 42, 80];
    let frames = decoder.get(FrameRequest::List(request.clone())).unwrap().into_vec();

    let mut seen = std::collections::HashSet::new();
    for frame in &frames {
        assert!(seen.insert(frame.pts), "pts {} delivered twice", frame.pts);
    }
    assert_eq!(indices(&frames), request);
}

#[test]
fn seek_to_index_then_batch_matches_index_list() {
    let stream = SyntheticStream::default();

    let mut batched = open(stream.clone());
    batched.seek_to_index(37).unwrap();
    let from_batch = batched.get_batch_frames(9).unwrap();

    let mut listed = open(stream.clone());
    let from_list = listed
        .get(FrameRequest::List((37..46).collect()))
        .unwrap()
        .into_vec();

    assert_eq!(indices(&from_batch), indices(&from_list));
    let pts_batch: Vec<i64> = from_batch.iter().map(|f| f.pts).collect();
    let pts_list: Vec<i64> = from_list.iter().map(|f| f.pts).collect();
    assert_eq!(pts_batch, pts_list);
}

#[test]
fn batch_is_clipped_to_stream_length() {
    let stream = SyntheticStream::default();
    let mut decoder = open(stream);
    decoder.seek_to_index(115).unwrap();
    let frames = decoder.get_batch_frames(10).unwrap();
    assert_eq!(indices(&frames), vec![115, 116, 117, 118, 119]);
}

#[test]
fn backward_request_restarts_and_still_answers() {
    let stream = thirty_fps_gop_thirty();
    let opener = Arc::new(SyntheticOpener::new().with_stream("clip", stream.clone()));
    let mut decoder = SimpleDecoder::open(
        "clip",
        SessionConfig::default(),
        opener.clone(),
        Arc::new(SyntheticFactory::new()),
        None,
    )
    .unwrap();

    decoder.get_frame(70).unwrap();
    let frame = decoder.get_frame(20).unwrap();
    assert_eq!(frame.pts, stream.pts_of(20));
    assert_eq!(opener.open_count(), 2);
}

#[test]
fn out_of_range_targets_are_skipped() {
    let mut decoder = open(SyntheticStream::default());
    let frames = decoder
        .get(FrameRequest::List(vec![5, 400, 6]))
        .unwrap()
        .into_vec();
    assert_eq!(indices(&frames), vec![5, 6]);
}

// ── Lock conservation ──────────────────────────────────────────
// Locked surfaces are the returned frames plus the pending carryover.

#[test]
fn only_latest_result_and_pending_stay_locked() {
    let mut decoder = open(SyntheticStream::default());
    let pool = decoder.session().frame_pool();

    let frames = decoder.get(FrameRequest::List(vec![3, 4, 5])).unwrap().into_vec();
    let pending = decoder.session().engine().pending_len();
    assert_eq!(pool.locked_count(), frames.len() + pending);

    let frames = decoder.get(FrameRequest::List(vec![50])).unwrap().into_vec();
    let pending = decoder.session().engine().pending_len();
    assert_eq!(pool.locked_count(), frames.len() + pending);
    assert!(pool.stats().is_consistent());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn any_request_order_is_preserved(request in prop::collection::vec(0u32..120, 1..8)) {
        let stream = SyntheticStream::default();
        let mut decoder = open(stream.clone());
        let frames = decoder.get(FrameRequest::List(request.clone())).unwrap().into_vec();

        prop_assert_eq!(indices(&frames), request);
        for frame in &frames {
            prop_assert_eq!(frame.pts, stream.pts_of(frame.frame_index.unwrap()));
        }
        let pool = decoder.session().frame_pool();
        let pending = decoder.session().engine().pending_len();
        prop_assert_eq!(pool.locked_count(), frames.len() + pending);
        prop_assert!(pool.stats().is_consistent());
    }
}
