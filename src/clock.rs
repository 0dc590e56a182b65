//! Fixed-step clock.
//!
//! Accumulates wall-clock time and converts it into zero, one, or many
//! fixed updates per poll. If the host stalls (breakpoint, window drag,
//! scheduler hiccup) the clock catches up, but never by more than
//! [`MAX_TICKS_PER_POLL`] updates at once - running more would spend the
//! whole next frame simulating, falling further behind, and spiralling.
//!
//! The client feeds its [`FrameTimeCorrector`] output into
//! [`FixedStepClock::set_frame_correction_us`], which stretches or
//! shrinks the effective update duration for upcoming frames.
//!
//! [`FrameTimeCorrector`]: crate::time_corrector::FrameTimeCorrector

use web_time::Instant;

use crate::MAX_TICKS_PER_POLL;

/// Converts elapsed wall-clock time into fixed simulation updates.
#[derive(Debug, Clone)]
pub struct FixedStepClock {
    one_update_us: u64,
    last_poll: Instant,
    accumulated_us: u64,
    correction_us: i64,
}

impl FixedStepClock {
    /// Creates a clock with the given update duration, starting now.
    #[must_use]
    pub fn new(one_update_us: u64) -> Self {
        Self {
            one_update_us: one_update_us.max(1),
            last_poll: Instant::now(),
            accumulated_us: 0,
            correction_us: 0,
        }
    }

    /// Sets the per-update length correction (positive lengthens updates,
    /// slowing the simulation down).
    pub fn set_frame_correction_us(&mut self, correction_us: i64) {
        self.correction_us = correction_us;
    }

    /// The effective duration of one update with the current correction
    /// applied.
    #[must_use]
    pub fn effective_update_us(&self) -> u64 {
        let base = i64::try_from(self.one_update_us).unwrap_or(i64::MAX);
        u64::try_from(base + self.correction_us).unwrap_or(1).max(1)
    }

    /// Returns how many fixed updates to run since the last poll, capped
    /// at [`MAX_TICKS_PER_POLL`]. Time beyond the cap is dropped rather
    /// than accumulated, so a long stall cannot cause a catch-up spiral.
    pub fn poll_ticks(&mut self) -> u32 {
        let now = Instant::now();
        let elapsed_us =
            u64::try_from(now.duration_since(self.last_poll).as_micros()).unwrap_or(u64::MAX);
        self.last_poll = now;
        self.accumulated_us = self.accumulated_us.saturating_add(elapsed_us);
        self.drain_ticks()
    }

    /// Test hook: advances the clock by a synthetic amount of time instead
    /// of wall-clock time.
    pub fn advance_by_us(&mut self, elapsed_us: u64) -> u32 {
        self.accumulated_us = self.accumulated_us.saturating_add(elapsed_us);
        self.drain_ticks()
    }

    fn drain_ticks(&mut self) -> u32 {
        let step = self.effective_update_us();
        let mut ticks = 0;
        while self.accumulated_us >= step && ticks < MAX_TICKS_PER_POLL {
            self.accumulated_us -= step;
            ticks += 1;
        }
        if self.accumulated_us >= step {
            // Still behind after the cap: drop the excess.
            self.accumulated_us %= step;
        }
        ticks
    }
}

// #########
// # TESTS #
// #########
