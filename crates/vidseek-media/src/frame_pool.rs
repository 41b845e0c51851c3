//! Decode-output surface pool with explicit frame locking.
//!
//! Decoders render into a small set of reusable surfaces. Every surface is
//! in exactly one place at a time:
//!
//! - `free`: owned by the decoder, next in line to be overwritten
//! - `in_flight`: handed to the decoder for the current decode
//! - `ready`: decoded, waiting to be retrieved
//! - `returned`: handed to a caller without a lock; recycled at the start of
//!   the next decode call
//! - `locked`: handed to a caller with a hold; recycled only on unlock
//!
//! All state sits behind one mutex, so a producer thread and a consumer
//! thread can share the pool through an `Arc`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};
use vidseek_core::{
    CompletionSignal, DecodedFrame, DevicePtr, FrameHandle, MemoryLocation, Result, SideMetadata,
    SurfaceLayout,
};

/// One pooled decode surface.
#[derive(Debug, Clone)]
pub struct Surface {
    pub ptr: DevicePtr,
    pub completion: Option<Arc<dyn CompletionSignal>>,
    generation: u64,
}

#[derive(Debug)]
struct ReadyFrame {
    surface: Surface,
    pts: i64,
    side_data: Vec<SideMetadata>,
}

#[derive(Debug)]
struct PoolState {
    layout: SurfaceLayout,
    generation: u64,
    free: VecDeque<Surface>,
    ready: VecDeque<ReadyFrame>,
    returned: Vec<Surface>,
    locked: VecDeque<Surface>,
    in_flight: usize,
    allocated: usize,
    /// Surfaces from an older layout, waiting for the decoder to free them.
    retired: Vec<Surface>,
}

/// Snapshot of how the pool's surfaces are partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub free: usize,
    pub in_flight: usize,
    pub ready: usize,
    pub returned: usize,
    pub locked: usize,
    pub allocated: usize,
}

impl PoolStats {
    /// Whether every allocated surface is accounted for exactly once.
    pub fn is_consistent(&self) -> bool {
        self.free + self.in_flight + self.ready + self.returned + self.locked == self.allocated
    }
}

/// Pool of reusable decode surfaces.
#[derive(Debug)]
pub struct FramePool {
    location: MemoryLocation,
    state: Mutex<PoolState>,
}

impl FramePool {
    /// Create an empty pool for surfaces of `layout`.
    pub fn new(layout: SurfaceLayout, location: MemoryLocation) -> Self {
        Self {
            location,
            state: Mutex::new(PoolState {
                layout,
                generation: 0,
                free: VecDeque::new(),
                ready: VecDeque::new(),
                returned: Vec::new(),
                locked: VecDeque::new(),
                in_flight: 0,
                allocated: 0,
                retired: Vec::new(),
            }),
        }
    }

    pub fn layout(&self) -> SurfaceLayout {
        self.state.lock().layout.clone()
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    // ── Decoder side ───────────────────────────────────────────

    /// Recycle surfaces handed out without a lock. Decoders call this at the
    /// start of every decode call.
    pub fn begin_decode(&self) {
        let mut state = self.state.lock();
        let returned = std::mem::take(&mut state.returned);
        state.free.extend(returned);
    }

    /// Take a free surface, or grow the pool through `allocate` when none is
    /// free.
    pub fn acquire<F>(&self, allocate: F) -> Result<Surface>
    where
        F: FnOnce(&SurfaceLayout) -> Result<(DevicePtr, Option<Arc<dyn CompletionSignal>>)>,
    {
        let mut state = self.state.lock();
        if let Some(surface) = state.free.pop_front() {
            state.in_flight += 1;
            return Ok(surface);
        }

        let (ptr, completion) = allocate(&state.layout)?;
        state.allocated += 1;
        state.in_flight += 1;
        debug!(%ptr, allocated = state.allocated, "allocated decode surface");
        Ok(Surface {
            ptr,
            completion,
            generation: state.generation,
        })
    }

    /// Queue a decoded surface for retrieval.
    pub fn publish(&self, surface: Surface, pts: i64, side_data: Vec<SideMetadata>) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.ready.push_back(ReadyFrame {
            surface,
            pts,
            side_data,
        });
    }

    /// Give back an acquired surface that produced no output.
    pub fn abandon(&self, surface: Surface) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        Self::recycle(&mut state, surface);
    }

    /// Switch to a new surface layout (decoder reconfiguration).
    ///
    /// Free surfaces of the old layout are retired immediately; locked ones
    /// are retired when they are unlocked.
    pub fn set_layout(&self, layout: SurfaceLayout) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.layout == layout {
            return;
        }
        state.layout = layout;
        state.generation += 1;
        let stale: Vec<Surface> = state
            .free
            .drain(..)
            .chain(std::mem::take(&mut state.returned))
            .collect();
        state.allocated -= stale.len();
        state.retired.extend(stale);
    }

    /// Surfaces the decoder should now release.
    pub fn drain_retired(&self) -> Vec<Surface> {
        std::mem::take(&mut self.state.lock().retired)
    }

    // ── Caller side ────────────────────────────────────────────

    /// Next decoded frame, valid until the next decode call.
    pub fn get_frame(&self) -> Option<DecodedFrame> {
        let mut state = self.state.lock();
        let ready = state.ready.pop_front()?;
        let frame = self.to_frame(&state.layout, &ready);
        state.returned.push(ready.surface);
        Some(frame)
    }

    /// Next decoded frame, held out of rotation until unlocked.
    pub fn get_locked_frame(&self) -> Option<DecodedFrame> {
        let mut state = self.state.lock();
        let ready = state.ready.pop_front()?;
        let frame = self.to_frame(&state.layout, &ready);
        state.locked.push_back(ready.surface);
        Some(frame)
    }

    /// Return a locked surface to the rotation. Returns `false` if `ptr` was
    /// not locked.
    pub fn unlock(&self, ptr: DevicePtr) -> bool {
        let mut state = self.state.lock();
        match state.locked.iter().position(|s| s.ptr == ptr) {
            Some(pos) => {
                if let Some(surface) = state.locked.remove(pos) {
                    Self::recycle(&mut state, surface);
                }
                true
            }
            None => {
                warn!(%ptr, "unlock requested for a frame that is not locked");
                false
            }
        }
    }

    /// Unlock the `count` oldest locked frames. Requests beyond the number of
    /// locked frames are clamped. Returns how many were unlocked.
    pub fn unlock_oldest(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        let mut count = count;
        if count > state.locked.len() {
            warn!(
                requested = count,
                locked = state.locked.len(),
                "unlock request exceeds locked frames, clamping"
            );
            count = state.locked.len();
        }
        for _ in 0..count {
            if let Some(surface) = state.locked.pop_front() {
                Self::recycle(&mut state, surface);
            }
        }
        count
    }

    /// Drop every decoded-but-unretrieved frame back into rotation.
    pub fn discard_ready(&self) -> usize {
        let mut state = self.state.lock();
        let ready: Vec<ReadyFrame> = state.ready.drain(..).collect();
        let count = ready.len();
        for frame in ready {
            Self::recycle(&mut state, frame.surface);
        }
        count
    }

    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn locked_count(&self) -> usize {
        self.state.lock().locked.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            free: state.free.len(),
            in_flight: state.in_flight,
            ready: state.ready.len(),
            returned: state.returned.len(),
            locked: state.locked.len(),
            allocated: state.allocated,
        }
    }

    fn recycle(state: &mut PoolState, surface: Surface) {
        if surface.generation == state.generation {
            state.free.push_back(surface);
        } else {
            state.allocated -= 1;
            state.retired.push(surface);
        }
    }

    fn to_frame(&self, layout: &SurfaceLayout, ready: &ReadyFrame) -> DecodedFrame {
        DecodedFrame {
            handle: FrameHandle {
                ptr: ready.surface.ptr,
                location: self.location,
                layout: layout.clone(),
            },
            pts: ready.pts,
            side_data: ready.side_data.clone(),
            completion: ready.surface.completion.clone(),
            frame_index: None,
        }
    }
}
