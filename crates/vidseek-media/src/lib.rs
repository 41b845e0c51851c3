//! VidSeek Media - demuxer/decoder interfaces and decoded-frame lifecycle
//!
//! This crate handles:
//! - The demuxer and source-opener contracts, including the container seek index
//! - The hardware decoder contract, decoder events and decoder creation
//! - Stream metadata and full-scan metadata
//! - The frame pool that tracks which decoded surfaces are locked
//! - A deterministic synthetic backend (feature `synthetic`)

pub mod decoder;
pub mod demux;
pub mod frame_pool;
pub mod metadata;
#[cfg(feature = "synthetic")]
pub mod synthetic;

pub use decoder::{
    share, DecodeFlags, DecoderCaps, DecoderEvents, DecoderFactory, DecoderKey, DecoderParams,
    OperatingPointInfo, SharedDecoder, VideoDecoder, VideoFormat,
};
pub use demux::{
    CompressedUnit, ContainerFormat, Demuxer, IndexEntry, KeyFrameStrategy, SourceOpener,
    StreamParams,
};
pub use frame_pool::{FramePool, PoolStats};
pub use metadata::{Codec, PacketInfo, ScannedStreamMetadata, StreamMetadata};
