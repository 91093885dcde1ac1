//! Mapping between virtual time and wall-clock waits.
//!
//! The simulator's virtual clock only advances by jumping to the next event,
//! but while it waits for keyboard input it runs against the wall clock,
//! scaled by a timescale:
//!
//! - `timescale > 0`: a virtual gap of `d` is waited out as `d / timescale`
//!   of wall time, during which input may arrive
//! - `timescale == 0`: virtual time jumps straight to the next event; input
//!   already queued is read first, and the loop only blocks on input when
//!   nothing is scheduled

use std::time::Duration;

/// Timescale applied while the simulator waits for input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacer {
    timescale: f64,
}

impl Default for Pacer {
    fn default() -> Self {
        Pacer { timescale: 1.0 }
    }
}

/// How long the main loop may block before the next scheduled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Do not block: take a queued input line if there is one, else the
    /// next scheduled item.
    None,
    /// Block for input up to this much wall time.
    For(Duration),
    /// Nothing is scheduled; block until input arrives.
    Forever,
}

impl Pacer {
    /// Negative timescales are clamped to zero.
    pub fn new(timescale: f64) -> Self {
        Pacer {
            timescale: timescale.max(0.0),
        }
    }

    pub fn timescale(&self) -> f64 {
        self.timescale
    }

    pub fn is_paced(&self) -> bool {
        self.timescale > 0.0
    }

    /// Wall-clock wait for a virtual gap to the next scheduled item, or
    /// [`Wait::Forever`] when nothing is scheduled.
    pub fn wait_for(&self, gap: Option<Duration>) -> Wait {
        match gap {
            None => Wait::Forever,
            Some(gap) if gap.is_zero() || !self.is_paced() => Wait::None,
            Some(gap) => Wait::For(gap.div_f64(self.timescale)),
        }
    }

    /// Virtual time covered by `wall` of real waiting.
    pub fn virtual_elapsed(&self, wall: Duration) -> Duration {
        wall.mul_f64(self.timescale)
    }
}
