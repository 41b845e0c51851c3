//! Start-up barrier shared by sessions that should begin decoding together.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Blocks each arriving session until `parties` sessions have arrived.
///
/// Single use: once released, later arrivals pass straight through.
#[derive(Debug)]
pub struct InitBarrier {
    parties: usize,
    arrived: Mutex<usize>,
    cond: Condvar,
}

impl InitBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            arrived: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn arrived(&self) -> usize {
        *self.arrived.lock()
    }

    pub fn is_released(&self) -> bool {
        self.arrived() >= self.parties
    }

    /// Arrive and wait for the others. Returns the time spent waiting.
    pub fn wait(&self) -> Duration {
        let start = Instant::now();
        let mut arrived = self.arrived.lock();
        *arrived += 1;
        debug!(arrived = *arrived, parties = self.parties, "session reached init barrier");
        if *arrived >= self.parties {
            self.cond.notify_all();
        } else {
            while *arrived < self.parties {
                self.cond.wait(&mut arrived);
            }
        }
        start.elapsed()
    }
}
