//! Integration tests for the decoder cache and the frame pool bookkeeping
//! it relies on at teardown.

use proptest::prelude::*;
use std::sync::Arc;
use vidseek_core::{ChromaFormat, OutputColorType};
use vidseek_engine::{DecoderCache, SessionDecoderCache};
use vidseek_media::synthetic::SyntheticFactory;
use vidseek_media::{share, Codec, DecoderFactory, DecoderParams};

fn params(codec: Codec, bit_depth: u8) -> DecoderParams {
    DecoderParams {
        codec,
        bit_depth,
        chroma: ChromaFormat::Yuv420,
        width: 320,
        height: 240,
        max_width: 320,
        max_height: 240,
        gpu_id: 0,
        use_device_memory: true,
        output_color: OutputColorType::Native,
        events: None,
    }
}

#[test]
fn capacity_plus_one_evicts_least_recent() {
    let mut cache = DecoderCache::new(3);
    for key in ["a", "b", "c"] {
        assert!(cache.push(key, key.len()).is_none());
    }
    let evicted = cache.push("d", 1);
    assert_eq!(evicted.map(|(k, _)| k), Some("a"));
    assert!(!cache.contains(&"a"));
}

#[test]
fn get_protects_entry_from_eviction() {
    let mut cache = DecoderCache::new(3);
    cache.push("a", 0);
    cache.push("b", 1);
    cache.push("c", 2);
    assert_eq!(cache.get(&"a"), Some(&0));

    let evicted = cache.push("d", 3);
    assert_eq!(evicted.map(|(k, _)| k), Some("b"));
    assert!(cache.contains(&"a"));
}

#[test]
fn evicted_decoders_are_handed_back_for_teardown() {
    let factory = SyntheticFactory::new();
    let mut cache: SessionDecoderCache = DecoderCache::new(1);

    let h264 = params(Codec::H264, 8);
    let hevc = params(Codec::Hevc, 10);
    cache.push(h264.key(), share(factory.create(&h264).unwrap()));
    let evicted = cache.push(hevc.key(), share(factory.create(&hevc).unwrap()));

    let (key, decoder) = evicted.unwrap();
    assert_eq!(key, h264.key());
    assert_eq!(Arc::strong_count(&decoder), 1);
    assert_eq!(decoder.lock().key(), h264.key());

    let (last_key, _) = cache.remove_one().unwrap();
    assert_eq!(last_key, hevc.key());
    assert!(cache.is_empty());
}

#[test]
fn zero_capacity_is_clamped_to_one() {
    let mut cache = DecoderCache::new(0);
    assert_eq!(cache.capacity(), 1);
    cache.push(1u8, ());
    assert_eq!(cache.push(2u8, ()).map(|(k, _)| k), Some(1));
}

proptest! {
    #[test]
    fn cache_never_exceeds_capacity(
        capacity in 1usize..6,
        ops in prop::collection::vec((any::<bool>(), 0u8..10), 1..64),
    ) {
        let mut cache = DecoderCache::new(capacity);
        for (is_get, key) in ops {
            if is_get {
                cache.get(&key);
            } else {
                cache.push(key, ());
            }
            prop_assert!(cache.len() <= capacity);
        }
    }
}
