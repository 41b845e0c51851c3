//! Timestamp and frame-index conversions.
//!
//! Containers describe time in integer ticks of a stream time base. The
//! conversions here mirror the integer arithmetic containers use so that a
//! frame index always maps to the same timestamp the demuxer would report.

use num_rational::Rational64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Microsecond ticks, used as the intermediate unit for seconds → ticks.
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Frame rate as a rational number (e.g., 30000/1001 for 29.97 fps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    /// Numerator (e.g., 30000)
    pub numerator: u32,
    /// Denominator (e.g., 1001)
    pub denominator: u32,
}

impl FrameRate {
    /// Create a new frame rate.
    #[inline]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Convert to frames per second as f64.
    #[inline]
    pub fn to_fps_f64(self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        self.numerator as f64 / self.denominator as f64
    }

    /// Whether this rate can be used for arithmetic.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.numerator != 0 && self.denominator != 0
    }

    /// Common frame rates
    pub const FPS_23_976: Self = Self::new(24000, 1001);
    pub const FPS_24: Self = Self::new(24, 1);
    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_29_97: Self = Self::new(30000, 1001);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_60: Self = Self::new(60, 1);
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fps = self.to_fps_f64();
        if (fps - fps.round()).abs() < 0.001 {
            write!(f, "{} fps", fps.round() as u32)
        } else {
            write!(f, "{:.3} fps", fps)
        }
    }
}

/// Duration of one timestamp tick, in seconds (e.g., 1/90000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeBase {
    #[inline]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// MPEG-TS / most broadcast streams.
    pub const MPEG_90K: Self = Self::new(1, 90_000);
    /// Millisecond ticks (FLV, Matroska default).
    pub const MILLIS: Self = Self::new(1, 1000);

    #[inline]
    pub fn as_rational(self) -> Rational64 {
        Rational64::new(self.numerator as i64, self.denominator.max(1) as i64)
    }

    /// Seconds represented by `ticks`.
    #[inline]
    pub fn to_seconds(self, ticks: i64) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        ticks as f64 * self.numerator as f64 / self.denominator as f64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MPEG_90K
    }
}

/// Timestamp of `frame` in a stream with a constant `rate`.
///
/// Integer arithmetic: `frame × (rate.den × tb.den) / (rate.num × tb.num)`.
pub fn frame_to_pts(frame: i64, rate: FrameRate, time_base: TimeBase) -> i64 {
    let divisor = rate.numerator as i64 * time_base.numerator as i64;
    if divisor == 0 {
        return 0;
    }
    frame * rate.denominator as i64 * time_base.denominator as i64 / divisor
}

/// Convert seconds to ticks of `time_base`, rounding to the nearest tick.
pub fn seconds_to_pts(seconds: f64, time_base: TimeBase) -> i64 {
    if time_base.numerator == 0 {
        return 0;
    }
    let micros = (seconds * MICROS_PER_SECOND as f64).round() as i64;
    let ticks = Rational64::new(micros, MICROS_PER_SECOND) / time_base.as_rational();
    ticks.round().to_integer()
}

/// Frame number of the frame displayed at `pts`.
///
/// `start_time` is subtracted first when the container reports one; the
/// result is rounded to the nearest frame.
pub fn pts_to_frame_number(pts: i64, start_time: i64, fps: f64, time_base: TimeBase) -> i64 {
    let seconds = time_base.to_seconds(pts - start_time);
    (fps * seconds + 0.5) as i64
}
