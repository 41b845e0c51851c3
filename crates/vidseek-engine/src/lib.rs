//! VidSeek Engine - indexed and streaming frame retrieval
//!
//! This crate handles:
//! - Key-frame resolution and the seek/decode-forward decision
//! - Per-session LRU caching of decoders keyed by stream shape
//! - Decode sessions (demuxer, decoder, metadata scan, start-up barrier)
//! - The random-access front-end ([`SimpleDecoder`])
//! - The background-thread streaming front-end ([`ThreadedDecoder`])

pub mod barrier;
pub mod buffer;
pub mod decoder_cache;
pub mod seek;
pub mod session;
pub mod simple;
pub mod threaded;

pub use barrier::InitBarrier;
pub use buffer::BoundedBuffer;
pub use decoder_cache::{DecoderCache, SessionDecoderCache};
pub use seek::{key_frame_index, SeekEngine, SeekStats};
pub use session::{DecodeSession, SessionEvents};
pub use simple::{FrameRequest, Frames, SimpleDecoder};
pub use threaded::ThreadedDecoder;
