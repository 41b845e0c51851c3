//! Decode session coordinator.
//!
//! A [`DecodeSession`] binds one source's demuxer to a decoder instance,
//! the per-session decoder cache and the seek engine. It owns the
//! reconfiguration logic (switching to another source while reusing a
//! compatible cached decoder) and the background metadata scan.

use crate::barrier::InitBarrier;
use crate::decoder_cache::SessionDecoderCache;
use crate::seek::SeekEngine;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vidseek_core::{
    time, DecodedFrame, Result, SessionConfig, SideMetadata, VidSeekError,
};
use vidseek_media::{
    share, ContainerFormat, DecoderEvents, DecoderFactory, DecoderKey, DecoderParams, Demuxer,
    FramePool, OperatingPointInfo, ScannedStreamMetadata, SharedDecoder, SourceOpener,
    StreamMetadata, StreamParams, VideoFormat,
};

#[derive(Debug, Default)]
struct EventState {
    format: Option<VideoFormat>,
    init_time: Option<Duration>,
    pictures_decoded: u64,
    pictures_displayed: u64,
    side_messages: u64,
}

/// The session's decoder event sink.
#[derive(Debug)]
pub struct SessionEvents {
    session_id: Uuid,
    barrier: Option<Arc<InitBarrier>>,
    operating_point: u32,
    state: Mutex<EventState>,
}

impl SessionEvents {
    pub fn new(session_id: Uuid, barrier: Option<Arc<InitBarrier>>) -> Self {
        Self {
            session_id,
            barrier,
            operating_point: 0,
            state: Mutex::new(EventState::default()),
        }
    }

    /// Operating point to request from scalable (AV1) streams.
    pub fn with_operating_point(mut self, operating_point: u32) -> Self {
        self.operating_point = operating_point;
        self
    }

    /// Format from the most recent sequence header.
    pub fn format(&self) -> Option<VideoFormat> {
        self.state.lock().format
    }

    /// Time spent waiting at the init barrier, once the first sequence
    /// header has arrived.
    pub fn init_time(&self) -> Option<Duration> {
        self.state.lock().init_time
    }

    pub fn pictures_decoded(&self) -> u64 {
        self.state.lock().pictures_decoded
    }

    pub fn pictures_displayed(&self) -> u64 {
        self.state.lock().pictures_displayed
    }

    pub fn side_messages(&self) -> u64 {
        self.state.lock().side_messages
    }
}

impl DecoderEvents for SessionEvents {
    fn on_sequence(&self, format: &VideoFormat) -> Result<()> {
        let first = {
            let mut state = self.state.lock();
            state.format = Some(*format);
            state.init_time.is_none()
        };
        debug!(
            session = %self.session_id,
            codec = %format.codec,
            width = format.coded_width,
            height = format.coded_height,
            "sequence header"
        );
        if first {
            // Wait without holding the state lock.
            let waited = self
                .barrier
                .as_ref()
                .map_or(Duration::ZERO, |barrier| barrier.wait());
            self.state.lock().init_time = Some(waited);
        }
        Ok(())
    }

    fn on_picture_decode(&self, _picture_index: u32) {
        self.state.lock().pictures_decoded += 1;
    }

    fn on_picture_display(&self, _pts: i64) {
        self.state.lock().pictures_displayed += 1;
    }

    fn on_operating_point(&self, info: &OperatingPointInfo) -> Option<u32> {
        if info.count == 0 {
            return None;
        }
        let selected = self.operating_point.min(info.count - 1);
        if selected != self.operating_point {
            warn!(
                requested = self.operating_point,
                available = info.count,
                "operating point out of range, clamping"
            );
        }
        Some(selected)
    }

    fn on_side_metadata(&self, _pts: i64, messages: &[SideMetadata]) {
        self.state.lock().side_messages += messages.len() as u64;
    }
}

/// Background full-container scan.
struct MetadataScan {
    rx: Receiver<Result<ScannedStreamMetadata>>,
    thread: Option<JoinHandle<()>>,
    outcome: Option<std::result::Result<ScannedStreamMetadata, String>>,
}

impl MetadataScan {
    fn spawn(opener: Arc<dyn SourceOpener>, source: String) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("vidseek-scan".into())
            .spawn(move || {
                let result = opener.open(&source).and_then(|mut demuxer| demuxer.scan());
                // The session may have been dropped already.
                tx.send(result).ok();
            })?;
        Ok(Self {
            rx,
            thread: Some(thread),
            outcome: None,
        })
    }

    fn wait(&mut self) -> Result<&ScannedStreamMetadata> {
        if self.outcome.is_none() {
            let outcome = match self.rx.recv() {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("metadata scan exited without a result".to_string()),
            };
            self.join();
            self.outcome = Some(outcome);
        }
        match &self.outcome {
            Some(Ok(scanned)) => Ok(scanned),
            Some(Err(message)) => Err(VidSeekError::Demux(message.clone())),
            None => Err(VidSeekError::Internal("scan outcome missing".to_string())),
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("metadata scan thread panicked");
            }
        }
    }
}

impl Drop for MetadataScan {
    fn drop(&mut self) {
        self.join();
    }
}

/// One source bound to a decoder, a decoder cache and a seek engine.
pub struct DecodeSession {
    id: Uuid,
    config: SessionConfig,
    opener: Arc<dyn SourceOpener>,
    factory: Arc<dyn DecoderFactory>,
    events: Arc<SessionEvents>,
    source: String,
    /// `None` while lent to a decode thread.
    demuxer: Option<Box<dyn Demuxer>>,
    params: StreamParams,
    container: ContainerFormat,
    metadata: StreamMetadata,
    decoder: SharedDecoder,
    cache: SessionDecoderCache,
    engine: SeekEngine,
    scan: Option<MetadataScan>,
    /// Header metadata is incomplete and waits on the scan.
    backfill_from_scan: bool,
}

impl DecodeSession {
    /// Open `source` and create its decoder.
    pub fn open(
        source: &str,
        mut config: SessionConfig,
        opener: Arc<dyn SourceOpener>,
        factory: Arc<dyn DecoderFactory>,
        barrier: Option<Arc<InitBarrier>>,
    ) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let events = Arc::new(SessionEvents::new(id, barrier));

        let demuxer = opener.open(source)?;
        let params = demuxer.params();
        let container = demuxer.container_format();
        let metadata = demuxer.metadata();
        let backfill_from_scan = metadata.is_incomplete();
        let want_scan = config.need_scanned_metadata || backfill_from_scan;

        let mut session = Self {
            id,
            engine: SeekEngine::new(config.seek_forward_threshold),
            cache: SessionDecoderCache::new(config.decoder_cache_capacity),
            decoder: share(factory.create(&decoder_params(
                &config,
                &params,
                config.max_width.max(params.width),
                config.max_height.max(params.height),
                &events,
            ))?),
            config,
            opener,
            factory,
            events,
            source: source.to_string(),
            params,
            container,
            metadata,
            demuxer: None,
            scan: None,
            backfill_from_scan,
        };
        session
            .cache
            .push(DecoderKey::from_params(&params), Arc::clone(&session.decoder));
        session.start_scan(demuxer.as_ref(), want_scan)?;
        session.demuxer = Some(demuxer);

        info!(
            session = %id,
            source,
            codec = %params.codec,
            width = params.width,
            height = params.height,
            container = %session.container,
            "session opened"
        );
        Ok(session)
    }

    /// Switch to `source`, reusing a cached decoder when its configuration
    /// matches.
    pub fn reconfigure(&mut self, source: &str) -> Result<()> {
        // The previous source's scan no longer matters.
        self.scan = None;
        {
            let mut decoder = self.decoder.lock();
            self.engine.reset(&mut **decoder, false)?;
        }

        let demuxer = self.opener.open(source)?;
        let params = demuxer.params();
        let container = demuxer.container_format();
        let metadata = demuxer.metadata();
        let key = DecoderKey::from_params(&params);

        let cached = self.cache.get(&key).map(Arc::clone);
        self.decoder = match cached {
            Some(decoder) => {
                let (max_width, max_height) = {
                    let guard = decoder.lock();
                    (guard.max_width(), guard.max_height())
                };
                if params.width > max_width || params.height > max_height {
                    let grown = share(self.factory.create(&decoder_params(
                        &self.config,
                        &params,
                        max_width.max(params.width),
                        max_height.max(params.height),
                        &self.events,
                    ))?);
                    debug!(session = %self.id, ?key, "cached decoder too small, replacing");
                    if let Some((old_key, old)) = self.cache.push(key, Arc::clone(&grown)) {
                        self.teardown(old_key, old);
                    }
                    grown
                } else {
                    decoder.lock().reconfigure(params.width, params.height)?;
                    debug!(session = %self.id, ?key, "reusing cached decoder");
                    decoder
                }
            }
            None => {
                let created = share(self.factory.create(&decoder_params(
                    &self.config,
                    &params,
                    self.config.max_width.max(params.width),
                    self.config.max_height.max(params.height),
                    &self.events,
                ))?);
                if let Some((old_key, old)) = self.cache.push(key, Arc::clone(&created)) {
                    self.teardown(old_key, old);
                }
                created
            }
        };

        self.backfill_from_scan = metadata.is_incomplete() && !container.skips_metadata_scan();
        let want_scan = (self.config.need_scanned_metadata || self.backfill_from_scan)
            && !container.skips_metadata_scan();
        self.source = source.to_string();
        self.params = params;
        self.container = container;
        self.metadata = metadata;
        self.start_scan(demuxer.as_ref(), want_scan)?;
        self.demuxer = Some(demuxer);

        info!(
            session = %self.id,
            source,
            codec = %params.codec,
            width = params.width,
            height = params.height,
            "session reconfigured"
        );
        Ok(())
    }

    fn start_scan(&mut self, demuxer: &dyn Demuxer, want_scan: bool) -> Result<()> {
        if !want_scan {
            return Ok(());
        }
        if !demuxer.is_seekable() {
            warn!(session = %self.id, "stream is not seekable, skipping metadata scan");
            self.backfill_from_scan = false;
            return Ok(());
        }
        self.scan = Some(MetadataScan::spawn(
            Arc::clone(&self.opener),
            self.source.clone(),
        )?);
        debug!(session = %self.id, "metadata scan started");
        Ok(())
    }

    fn teardown(&self, key: DecoderKey, decoder: SharedDecoder) {
        debug!(session = %self.id, ?key, "tearing down decoder");
        drop(decoder);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn container_format(&self) -> &ContainerFormat {
        &self.container
    }

    pub fn is_seekable(&self) -> bool {
        self.demuxer.as_ref().is_some_and(|d| d.is_seekable())
    }

    pub fn decoder(&self) -> &SharedDecoder {
        &self.decoder
    }

    pub fn frame_pool(&self) -> Arc<FramePool> {
        Arc::clone(self.decoder.lock().frame_pool())
    }

    pub fn events(&self) -> &Arc<SessionEvents> {
        &self.events
    }

    pub fn cache(&self) -> &SessionDecoderCache {
        &self.cache
    }

    pub fn engine(&self) -> &SeekEngine {
        &self.engine
    }

    /// Time this session waited at the init barrier.
    pub fn session_init_time(&self) -> Option<Duration> {
        self.events.init_time()
    }

    /// Header metadata, back-filled from the scan when the header was
    /// incomplete (blocks until the scan finishes).
    pub fn metadata(&mut self) -> Result<StreamMetadata> {
        if self.backfill_from_scan {
            if let Some(scan) = self.scan.as_mut() {
                let scanned = scan.wait()?;
                self.metadata.fill_from_scan(scanned);
            }
            self.backfill_from_scan = false;
        }
        Ok(self.metadata.clone())
    }

    /// Full-scan metadata. Blocks until the scan finishes.
    pub fn scanned_metadata(&mut self) -> Result<ScannedStreamMetadata> {
        match self.scan.as_mut() {
            Some(scan) => scan.wait().cloned(),
            None => Err(VidSeekError::Configuration(
                "scanned metadata was not requested for this session".to_string(),
            )),
        }
    }

    /// Display index of the frame shown at `seconds`.
    pub fn index_from_time(&self, seconds: f64) -> i64 {
        let pts = time::seconds_to_pts(seconds, self.params.time_base);
        let start = if self.container.ignores_start_time() {
            0
        } else {
            self.params.start_time
        };
        time::pts_to_frame_number(
            pts,
            start,
            self.params.frame_rate.to_fps_f64(),
            self.params.time_base,
        )
    }

    pub fn frames_by_index_list(&mut self, indices: &[u32]) -> Result<Vec<DecodedFrame>> {
        let demuxer = self.demuxer.as_deref_mut().ok_or_else(demuxer_in_use)?;
        let mut decoder = self.decoder.lock();
        self.engine
            .frames_by_index_list(demuxer, &mut **decoder, indices)
    }

    pub fn frames_by_batch(&mut self, count: usize) -> Result<Vec<DecodedFrame>> {
        let num_frames = self.metadata()?.num_frames;
        let demuxer = self.demuxer.as_deref_mut().ok_or_else(demuxer_in_use)?;
        let mut decoder = self.decoder.lock();
        self.engine
            .frames_by_batch(demuxer, &mut **decoder, count, num_frames)
    }

    pub fn seek_to_index(&mut self, index: u32) {
        self.engine.seek_to_index(index);
    }

    pub fn is_seek_backwards(&self, index: u32) -> bool {
        self.engine.is_seek_backwards(index)
    }

    pub fn set_end_of_stream(&mut self) {
        self.engine.set_end_of_stream();
    }

    pub fn clear_state(&mut self, force_eos: bool) -> Result<()> {
        let demuxer = self.demuxer.as_deref_mut().ok_or_else(demuxer_in_use)?;
        let mut decoder = self.decoder.lock();
        self.engine.clear_state(demuxer, &mut **decoder, force_eos)
    }

    /// Lend the demuxer to a decode thread.
    pub fn take_demuxer(&mut self) -> Result<Box<dyn Demuxer>> {
        self.demuxer.take().ok_or_else(demuxer_in_use)
    }

    pub fn restore_demuxer(&mut self, demuxer: Box<dyn Demuxer>) {
        self.demuxer = Some(demuxer);
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.scan = None;
        let mut released = 0;
        while let Some((key, decoder)) = self.cache.remove_one() {
            self.teardown(key, decoder);
            released += 1;
        }
        debug!(session = %self.id, released, "session closed");
    }
}

fn demuxer_in_use() -> VidSeekError {
    VidSeekError::Internal("demuxer is in use by the decode thread".to_string())
}

fn decoder_params(
    config: &SessionConfig,
    params: &StreamParams,
    max_width: u32,
    max_height: u32,
    events: &Arc<SessionEvents>,
) -> DecoderParams {
    let events: Arc<dyn DecoderEvents> = Arc::clone(events) as Arc<dyn DecoderEvents>;
    DecoderParams {
        codec: params.codec,
        bit_depth: params.bit_depth,
        chroma: params.chroma,
        width: params.width,
        height: params.height,
        max_width,
        max_height,
        gpu_id: config.gpu_id,
        use_device_memory: config.use_device_memory,
        output_color: config.output_color,
        events: Some(events),
    }
}
