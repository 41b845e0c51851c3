//! Streaming front-end with a background decode thread.
//!
//! The decode thread demuxes and decodes the whole source in order and
//! pushes locked frames into a [`BoundedBuffer`]. The consumer pulls batches;
//! each batch stays valid until the next call to
//! [`ThreadedDecoder::get_batch_frames`].

use crate::barrier::InitBarrier;
use crate::buffer::BoundedBuffer;
use crate::session::DecodeSession;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vidseek_core::{DecodedFrame, DevicePtr, Result, SessionConfig, VidSeekError};
use vidseek_media::{
    DecodeFlags, DecoderFactory, Demuxer, FramePool, SharedDecoder, SourceOpener, StreamMetadata,
};

type Failure = Arc<Mutex<Option<String>>>;

pub struct ThreadedDecoder {
    session: DecodeSession,
    buffer: Arc<BoundedBuffer<DecodedFrame>>,
    pool: Arc<FramePool>,
    stop: Arc<AtomicBool>,
    failure: Failure,
    worker: Option<JoinHandle<Box<dyn Demuxer>>>,
    /// Frames handed out by the previous batch, still locked.
    held: Vec<DevicePtr>,
    delivered: u32,
    ended: bool,
}

impl ThreadedDecoder {
    /// Open `source` and start decoding in the background.
    pub fn open(
        source: &str,
        config: SessionConfig,
        opener: Arc<dyn SourceOpener>,
        factory: Arc<dyn DecoderFactory>,
        barrier: Option<Arc<InitBarrier>>,
    ) -> Result<Self> {
        let session = DecodeSession::open(source, config, opener, factory, barrier)?;
        let buffer = Arc::new(BoundedBuffer::new(session.config().buffer_capacity)?);
        let pool = session.frame_pool();
        let mut decoder = Self {
            session,
            buffer,
            pool,
            stop: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            worker: None,
            held: Vec::new(),
            delivered: 0,
            ended: true,
        };
        decoder.initialize()?;
        Ok(decoder)
    }

    /// Start the decode thread over the session's current demuxer.
    pub fn initialize(&mut self) -> Result<()> {
        if !self.ended {
            return Err(VidSeekError::Internal(
                "decode thread is already running".to_string(),
            ));
        }
        let demuxer = self.session.take_demuxer()?;
        let decoder = Arc::clone(self.session.decoder());
        self.pool = self.session.frame_pool();
        self.buffer.clear();
        self.stop.store(false, Ordering::Release);
        *self.failure.lock() = None;
        self.delivered = 0;

        let worker = {
            let buffer = Arc::clone(&self.buffer);
            let pool = Arc::clone(&self.pool);
            let stop = Arc::clone(&self.stop);
            let failure = Arc::clone(&self.failure);
            std::thread::Builder::new()
                .name("vidseek-decode".into())
                .spawn(move || produce(demuxer, &decoder, &pool, &buffer, &stop, &failure))?
        };
        self.worker = Some(worker);
        self.ended = false;
        info!(session = %self.session.id(), source = self.session.source(), "decode thread started");
        Ok(())
    }

    /// Up to `count` next frames in display order. Fewer than `count`
    /// frames means the stream is ending; an empty batch means it has ended.
    pub fn get_batch_frames(&mut self, count: usize) -> Result<Vec<DecodedFrame>> {
        if self.ended {
            return Err(VidSeekError::Internal("decoder has ended".to_string()));
        }
        self.release_held();

        let mut frames = self.buffer.pop(count)?;
        for frame in &mut frames {
            frame.frame_index = Some(self.delivered);
            self.delivered += 1;
            self.held.push(frame.ptr());
        }
        if frames.len() < count {
            if let Some(message) = self.failure.lock().clone() {
                return Err(VidSeekError::Decoder(message));
            }
        }
        Ok(frames)
    }

    /// Stop the decode thread and release every frame it produced.
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.stop.store(true, Ordering::Release);
        // Free a slot for a producer parked on a full buffer.
        for frame in self.buffer.pop(1)? {
            self.pool.unlock(frame.ptr());
        }

        let joined = self.worker.take().map(JoinHandle::join);
        let drained = self.buffer.pop(0)?;
        for frame in &drained {
            self.pool.unlock(frame.ptr());
        }
        let released = self.held.len();
        self.release_held();
        self.buffer.clear();
        self.ended = true;
        debug!(
            session = %self.session.id(),
            drained = drained.len(),
            released,
            "decode thread stopped"
        );

        match joined {
            Some(Ok(demuxer)) => {
                self.session.restore_demuxer(demuxer);
                Ok(())
            }
            Some(Err(_)) => Err(VidSeekError::Internal(
                "decode thread panicked".to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Stop, switch the session to `source` and restart decoding.
    pub fn reconfigure(&mut self, source: &str) -> Result<()> {
        self.end()?;
        self.session.reconfigure(source)?;
        self.initialize()
    }

    pub fn metadata(&mut self) -> Result<StreamMetadata> {
        self.session.metadata()
    }

    pub fn session_init_time(&self) -> Option<Duration> {
        self.session.session_init_time()
    }

    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn session(&self) -> &DecodeSession {
        &self.session
    }

    fn release_held(&mut self) {
        for ptr in self.held.drain(..) {
            self.pool.unlock(ptr);
        }
    }
}

impl Drop for ThreadedDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            error!(session = %self.session.id(), "failed to stop decode thread: {e}");
        }
    }
}

fn produce(
    mut demuxer: Box<dyn Demuxer>,
    decoder: &SharedDecoder,
    pool: &FramePool,
    buffer: &BoundedBuffer<DecodedFrame>,
    stop: &AtomicBool,
    failure: &Mutex<Option<String>>,
) -> Box<dyn Demuxer> {
    if let Err(e) = decode_loop(demuxer.as_mut(), decoder, pool, buffer, stop) {
        error!("decode thread failed: {e}");
        *failure.lock() = Some(e.to_string());
    }
    buffer.push_done();
    demuxer
}

fn decode_loop(
    demuxer: &mut dyn Demuxer,
    decoder: &SharedDecoder,
    pool: &FramePool,
    buffer: &BoundedBuffer<DecodedFrame>,
    stop: &AtomicBool,
) -> Result<()> {
    let mut pushed = 0u64;
    while !stop.load(Ordering::Acquire) {
        let (ready, end_of_stream) = {
            let mut decoder = decoder.lock();
            match demuxer.demux()? {
                Some(unit) => (
                    decoder.decode(unit.data, DecodeFlags::TIMESTAMP, unit.pts)?,
                    false,
                ),
                None => (decoder.decode(&[], DecodeFlags::END_OF_STREAM, 0)?, true),
            }
        };

        // Never park on a full buffer while holding the decoder.
        for _ in 0..ready {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let Some(frame) = pool.get_locked_frame() else {
                break;
            };
            buffer.push(frame);
            pushed += 1;
        }

        if end_of_stream {
            debug!(pushed, "decode thread reached end of stream");
            return Ok(());
        }
    }

    // Stopped early: flush and drop what the decoder still holds.
    let mut decoder = decoder.lock();
    decoder.decode(&[], DecodeFlags::END_OF_STREAM, 0)?;
    let discarded = pool.discard_ready();
    if discarded > 0 {
        warn!(discarded, pushed, "decode thread stopped before end of stream");
    }
    Ok(())
}
