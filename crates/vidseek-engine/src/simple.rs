//! Random-access front-end.

use crate::barrier::InitBarrier;
use crate::session::DecodeSession;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use vidseek_core::{DecodedFrame, Result, SessionConfig, VidSeekError};
use vidseek_media::{
    DecoderFactory, ScannedStreamMetadata, SharedDecoder, SourceOpener, StreamMetadata,
};

/// What to retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRequest {
    Single(u32),
    /// Indices in the order the frames should be returned.
    List(Vec<u32>),
}

/// Frames returned for a [`FrameRequest`].
#[derive(Debug, Clone)]
pub enum Frames {
    Single(DecodedFrame),
    List(Vec<DecodedFrame>),
}

impl Frames {
    pub fn into_vec(self) -> Vec<DecodedFrame> {
        match self {
            Self::Single(frame) => vec![frame],
            Self::List(frames) => frames,
        }
    }
}

/// Retrieves frames by display index from a seekable source.
///
/// Returned frames stay locked (valid) until the next retrieval call.
pub struct SimpleDecoder {
    session: DecodeSession,
}

impl SimpleDecoder {
    pub fn open(
        source: &str,
        config: SessionConfig,
        opener: Arc<dyn SourceOpener>,
        factory: Arc<dyn DecoderFactory>,
        barrier: Option<Arc<InitBarrier>>,
    ) -> Result<Self> {
        let session = DecodeSession::open(source, config, opener, factory, barrier)?;
        ensure_seekable(&session)?;
        Ok(Self { session })
    }

    pub fn get(&mut self, request: FrameRequest) -> Result<Frames> {
        match request {
            FrameRequest::Single(index) => {
                self.reset_if_required(&[index])?;
                self.session
                    .frames_by_index_list(&[index])?
                    .into_iter()
                    .next()
                    .map(Frames::Single)
                    .ok_or_else(|| VidSeekError::NotFound(format!("frame {index}")))
            }
            FrameRequest::List(indices) => {
                if indices.is_empty() {
                    return Ok(Frames::List(Vec::new()));
                }
                self.reset_if_required(&indices)?;
                Ok(Frames::List(self.session.frames_by_index_list(&indices)?))
            }
        }
    }

    pub fn get_frame(&mut self, index: u32) -> Result<DecodedFrame> {
        match self.get(FrameRequest::Single(index))? {
            Frames::Single(frame) => Ok(frame),
            Frames::List(mut frames) => frames
                .pop()
                .ok_or_else(|| VidSeekError::NotFound(format!("frame {index}"))),
        }
    }

    /// Next `count` frames after the previous target.
    pub fn get_batch_frames(&mut self, count: usize) -> Result<Vec<DecodedFrame>> {
        self.session.frames_by_batch(count)
    }

    /// Make the next batch start at `index`. A start at or before the
    /// previous target restarts the source first.
    pub fn seek_to_index(&mut self, index: u32) -> Result<()> {
        self.reset_if_required(&[index])?;
        self.session.seek_to_index(index);
        Ok(())
    }

    pub fn reconfigure(&mut self, source: &str) -> Result<()> {
        self.session.reconfigure(source)?;
        ensure_seekable(&self.session)
    }

    pub fn metadata(&mut self) -> Result<StreamMetadata> {
        self.session.metadata()
    }

    pub fn scanned_metadata(&mut self) -> Result<ScannedStreamMetadata> {
        self.session.scanned_metadata()
    }

    pub fn index_from_time(&self, seconds: f64) -> i64 {
        self.session.index_from_time(seconds)
    }

    pub fn session_init_time(&self) -> Option<Duration> {
        self.session.session_init_time()
    }

    pub fn decoder(&self) -> &SharedDecoder {
        self.session.decoder()
    }

    pub fn session(&self) -> &DecodeSession {
        &self.session
    }

    /// The decode pipeline only moves forward: going back past the previous
    /// target restarts the source.
    fn reset_if_required(&mut self, indices: &[u32]) -> Result<()> {
        let Some(&smallest) = indices.iter().min() else {
            return Ok(());
        };
        if self.session.is_seek_backwards(smallest) {
            debug!(session = %self.session.id(), smallest, "backward request, restarting source");
            self.session.set_end_of_stream();
            let source = self.session.source().to_string();
            self.session.reconfigure(&source)?;
        }
        Ok(())
    }
}

impl Drop for SimpleDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.session.clear_state(false) {
            error!(session = %self.session.id(), "failed to clear decoder state: {e}");
        }
    }
}

fn ensure_seekable(session: &DecodeSession) -> Result<()> {
    if session.is_seekable() {
        Ok(())
    } else {
        Err(VidSeekError::NotSeekable(format!(
            "{} does not support random access",
            session.source()
        )))
    }
}
