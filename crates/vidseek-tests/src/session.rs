//! Integration tests for session lifecycle: reconfiguration, decoder reuse,
//! metadata and the start-up barrier.

use std::sync::Arc;
use std::thread;
use vidseek_core::{ChromaFormat, SessionConfig, VidSeekError};
use vidseek_engine::{InitBarrier, SimpleDecoder};
use vidseek_media::synthetic::{SyntheticFactory, SyntheticOpener, SyntheticStream};
use vidseek_media::{Codec, ContainerFormat};

// ── Helpers ────────────────────────────────────────────────────

fn library() -> Arc<SyntheticOpener> {
    Arc::new(
        SyntheticOpener::new()
            .with_stream("h264", SyntheticStream::default())
            .with_stream(
                "h264-wide",
                SyntheticStream {
                    width: 1280,
                    height: 720,
                    ..Default::default()
                },
            )
            .with_stream(
                "hevc10",
                SyntheticStream {
                    codec: Codec::Hevc,
                    bit_depth: 10,
                    chroma: ChromaFormat::Yuv420,
                    num_frames: 48,
                    ..Default::default()
                },
            )
            .with_stream(
                "no-header",
                SyntheticStream {
                    header_complete: false,
                    num_frames: 60,
                    ..Default::default()
                },
            )
            .with_stream(
                "webm",
                SyntheticStream {
                    container: ContainerFormat::Matroska,
                    codec: Codec::Vp9,
                    ..Default::default()
                },
            ),
    )
}

fn open_with(
    source: &str,
    config: SessionConfig,
    opener: Arc<SyntheticOpener>,
    factory: Arc<SyntheticFactory>,
) -> SimpleDecoder {
    SimpleDecoder::open(source, config, opener, factory, None).unwrap()
}

// ── Decoder reuse ──────────────────────────────────────────────

#[test]
fn alternating_sources_reuse_cached_decoders() {
    let factory = Arc::new(SyntheticFactory::new());
    let mut decoder = open_with("h264", SessionConfig::default(), library(), factory.clone());

    decoder.get_frame(10).unwrap();
    decoder.reconfigure("hevc10").unwrap();
    let frame = decoder.get_frame(10).unwrap();
    assert_eq!(frame.frame_index, Some(10));

    decoder.reconfigure("h264").unwrap();
    decoder.get_frame(10).unwrap();
    decoder.reconfigure("hevc10").unwrap();
    decoder.get_frame(10).unwrap();

    assert_eq!(factory.created_count(), 2);
    assert_eq!(decoder.session().cache().len(), 2);
}

#[test]
fn larger_stream_replaces_cached_decoder() {
    let factory = Arc::new(SyntheticFactory::new());
    let mut decoder = open_with("h264", SessionConfig::default(), library(), factory.clone());
    decoder.reconfigure("h264-wide").unwrap();

    let frame = decoder.get_frame(3).unwrap();
    assert_eq!((frame.width(), frame.height()), (1280, 720));
    assert_eq!(factory.created_count(), 2);

    // Going back down fits the grown decoder.
    decoder.reconfigure("h264").unwrap();
    let frame = decoder.get_frame(3).unwrap();
    assert_eq!((frame.width(), frame.height()), (320, 240));
    assert_eq!(factory.created_count(), 2);
}

#[test]
fn single_slot_cache_recreates_on_every_switch() {
    let factory = Arc::new(SyntheticFactory::new());
    let config = SessionConfig {
        decoder_cache_capacity: 1,
        ..Default::default()
    };
    let mut decoder = open_with("h264", config, library(), factory.clone());
    decoder.reconfigure("hevc10").unwrap();
    decoder.reconfigure("h264").unwrap();

    assert_eq!(factory.created_count(), 3);
    assert_eq!(decoder.session().cache().len(), 1);
}

// ── Metadata ───────────────────────────────────────────────────

#[test]
fn missing_header_fields_come_from_scan() {
    let mut decoder = open_with(
        "no-header",
        SessionConfig::default(),
        library(),
        Arc::new(SyntheticFactory::new()),
    );
    let metadata = decoder.metadata().unwrap();
    assert_eq!(metadata.num_frames, 60);
    // 60 frames at 25 fps.
    assert!((metadata.duration - 2.4).abs() < 1e-9);
}

#[test]
fn scan_lists_key_frames_in_display_order() {
    let config = SessionConfig {
        need_scanned_metadata: true,
        ..Default::default()
    };
    let mut decoder = open_with("h264", config, library(), Arc::new(SyntheticFactory::new()));
    let scanned = decoder.scanned_metadata().unwrap();

    let expected: Vec<u32> = (0..120).step_by(12).collect();
    assert_eq!(scanned.key_frame_indices, expected);
    assert_eq!(scanned.pts.len(), 120);
    assert!(scanned.pts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn scanned_metadata_without_request_is_an_error() {
    let mut decoder = open_with(
        "h264",
        SessionConfig::default(),
        library(),
        Arc::new(SyntheticFactory::new()),
    );
    assert!(matches!(
        decoder.scanned_metadata(),
        Err(VidSeekError::Configuration(_))
    ));
}

#[test]
fn matroska_source_answers_by_time() {
    let mut decoder = open_with(
        "webm",
        SessionConfig::default(),
        library(),
        Arc::new(SyntheticFactory::new()),
    );
    let index = decoder.index_from_time(2.0);
    assert_eq!(index, 50);
    let frame = decoder.get_frame(index as u32).unwrap();
    assert_eq!(frame.frame_index, Some(50));
}

// ── Start-up barrier ───────────────────────────────────────────

#[test]
fn sessions_sharing_a_barrier_start_together() {
    let barrier = Arc::new(InitBarrier::new(2));
    let handles: Vec<_> = ["h264", "hevc10"]
        .into_iter()
        .map(|source| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut decoder = SimpleDecoder::open(
                    source,
                    SessionConfig::default(),
                    library(),
                    Arc::new(SyntheticFactory::new()),
                    Some(barrier),
                )
                .unwrap();
                decoder.get_frame(1).unwrap();
                decoder.session_init_time()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap().is_some());
    }
    assert!(barrier.is_released());
}
