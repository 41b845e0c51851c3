//! Integration tests for the threaded pipeline and its bounded buffer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vidseek_core::{SessionConfig, VidSeekError};
use vidseek_engine::{BoundedBuffer, ThreadedDecoder};
use vidseek_media::synthetic::{SyntheticFactory, SyntheticOpener, SyntheticStream};

fn open(stream: SyntheticStream, capacity: usize) -> ThreadedDecoder {
    open_with(stream, capacity, SyntheticFactory::new())
}

fn open_with(
    stream: SyntheticStream,
    capacity: usize,
    factory: SyntheticFactory,
) -> ThreadedDecoder {
    let config = SessionConfig {
        buffer_capacity: capacity,
        ..Default::default()
    };
    ThreadedDecoder::open(
        "clip",
        config,
        Arc::new(SyntheticOpener::new().with_stream("clip", stream)),
        Arc::new(factory),
        None,
    )
    .unwrap()
}

// ── Bounded buffer ─────────────────────────────────────────────

#[test]
fn pop_five_waits_for_five_items() {
    let buffer = Arc::new(BoundedBuffer::new(8).unwrap());
    let popped = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let buffer = Arc::clone(&buffer);
        let popped = Arc::clone(&popped);
        thread::spawn(move || {
            let items = buffer.pop(5).unwrap();
            popped.store(items.len(), Ordering::SeqCst);
            items
        })
    };

    for i in 0..4 {
        buffer.push(i);
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(popped.load(Ordering::SeqCst), 0, "pop returned early");

    buffer.push(4);
    assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn push_below_capacity_does_not_block() {
    let buffer = BoundedBuffer::new(8).unwrap();
    for i in 0..5 {
        buffer.push(i);
    }
    buffer.push(5);
    assert_eq!(buffer.len(), 6);
}

#[test]
fn drain_after_done_returns_remainder_then_nothing() {
    let buffer = BoundedBuffer::new(4).unwrap();
    buffer.push('a');
    buffer.push('b');
    buffer.push('c');
    buffer.push_done();

    assert_eq!(buffer.pop(0).unwrap(), vec!['a', 'b', 'c']);
    assert!(buffer.pop(2).unwrap().is_empty());
}

#[test]
fn oversized_pop_is_reported() {
    let buffer: BoundedBuffer<u8> = BoundedBuffer::new(2).unwrap();
    assert!(matches!(
        buffer.pop(3),
        Err(VidSeekError::InvalidParameter(_))
    ));
}

// ── Pipeline ───────────────────────────────────────────────────

#[test]
fn whole_stream_arrives_once_in_display_order() {
    let stream = SyntheticStream {
        num_frames: 90,
        gop_size: 15,
        b_frames: 2,
        ..Default::default()
    };
    let mut decoder = open(stream.clone(), 6);

    let mut pts = Vec::new();
    loop {
        let batch = decoder.get_batch_frames(4).unwrap();
        if batch.is_empty() {
            break;
        }
        assert!(batch.len() <= 4);
        assert!(decoder.frame_pool().locked_count() >= batch.len());
        pts.extend(batch.iter().map(|f| f.pts));
    }

    let expected: Vec<i64> = (0..90).map(|i| stream.pts_of(i)).collect();
    assert_eq!(pts, expected);
}

#[test]
fn frames_are_readable_after_waiting_on_completion() {
    let stream = SyntheticStream {
        num_frames: 36,
        ..Default::default()
    };
    let mut factory = SyntheticFactory::new();
    factory.completion_delay = Some(Duration::from_millis(2));
    let mut decoder = open_with(stream.clone(), 4, factory);

    let mut delivered = 0;
    loop {
        let batch = decoder.get_batch_frames(3).unwrap();
        if batch.is_empty() {
            break;
        }
        for frame in &batch {
            let signal = frame.completion.as_ref().expect("frame carries a fence");
            frame.wait_ready();
            assert!(signal.is_complete());
            assert_eq!(frame.pts, stream.pts_of(delivered));
            delivered += 1;
        }
    }
    assert_eq!(delivered, 36);
    decoder.end().unwrap();
    assert_eq!(decoder.frame_pool().locked_count(), 0);
}

#[test]
fn open_gop_stream_arrives_in_display_order() {
    let stream = SyntheticStream {
        num_frames: 48,
        open_gop: true,
        ..Default::default()
    };
    let mut decoder = open(stream.clone(), 5);
    let mut pts = Vec::new();
    loop {
        let batch = decoder.get_batch_frames(5).unwrap();
        if batch.is_empty() {
            break;
        }
        pts.extend(batch.iter().map(|f| f.pts));
    }
    let expected: Vec<i64> = (0..48).map(|i| stream.pts_of(i)).collect();
    assert_eq!(pts, expected);
}

#[test]
fn ending_mid_stream_releases_every_frame() {
    let mut decoder = open(SyntheticStream::default(), 3);
    decoder.get_batch_frames(3).unwrap();
    decoder.get_batch_frames(2).unwrap();
    thread::sleep(Duration::from_millis(10));

    decoder.end().unwrap();
    let stats = decoder.frame_pool().stats();
    assert_eq!(stats.locked, 0);
    assert_eq!(stats.ready, 0);
    assert!(decoder.is_ended());
}

#[test]
fn end_is_idempotent() {
    let mut decoder = open(SyntheticStream::default(), 4);
    decoder.end().unwrap();
    decoder.end().unwrap();
}

#[test]
fn non_seekable_source_streams() {
    let stream = SyntheticStream {
        num_frames: 24,
        seekable: false,
        ..Default::default()
    };
    let mut decoder = open(stream, 8);
    let mut total = 0;
    loop {
        let batch = decoder.get_batch_frames(8).unwrap();
        if batch.is_empty() {
            break;
        }
        total += batch.len();
    }
    assert_eq!(total, 24);
}
