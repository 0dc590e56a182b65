//! Client frame-time correction.
//!
//! The server piggybacks a timing shift on its outbound moves messages:
//! how many updates the client's input stream runs ahead of (positive) or
//! behind (negative) the server's ideal receive window. The corrector turns
//! that advisory signal into per-frame length adjustments, spread over
//! [`SPREAD_UPDATES`] frames so the game speeds up or slows down gently
//! instead of stuttering.

/// Over how many frames a requested shift is fully applied.
pub const SPREAD_UPDATES: u32 = 10;

/// Spreads server-requested tick-phase corrections over several frames.
#[derive(Debug, Clone)]
pub struct FrameTimeCorrector {
    one_update_us: u64,
    index_shift: i32,
    remaining_updates: u32,
}

impl FrameTimeCorrector {
    /// Creates a corrector for the given fixed update duration.
    #[must_use]
    pub fn new(one_update_us: u64) -> Self {
        Self {
            one_update_us,
            index_shift: 0,
            remaining_updates: 0,
        }
    }

    /// Records the most recent shift requested by the server. A moves
    /// message without an explicit shift carries zero, which cancels any
    /// correction still being spread.
    pub fn update_index_shift(&mut self, shift: i32) {
        self.index_shift = shift;
        self.remaining_updates = if shift == 0 { 0 } else { SPREAD_UPDATES };
    }

    /// The length adjustment for the next frame, in microseconds. Positive
    /// when the client runs too far ahead and should slow down (longer
    /// frames), negative to speed up. Clamped to ±50 % of one update.
    #[must_use]
    pub fn frame_correction_us(&self) -> i64 {
        if self.remaining_updates == 0 || self.index_shift == 0 {
            return 0;
        }
        let one_update = i64::try_from(self.one_update_us).unwrap_or(i64::MAX);
        let raw = i64::from(self.index_shift) * one_update / i64::from(SPREAD_UPDATES);
        let limit = one_update / 2;
        raw.clamp(-limit, limit)
    }

    /// Notes that one fixed update was advanced, consuming one frame of
    /// the spread.
    pub fn on_update_advanced(&mut self) {
        if self.remaining_updates > 0 {
            self.remaining_updates -= 1;
            if self.remaining_updates == 0 {
                self.index_shift = 0;
            }
        }
    }

    /// Whether a correction is still being applied.
    #[must_use]
    pub fn is_correcting(&self) -> bool {
        self.remaining_updates > 0 && self.index_shift != 0
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ONE_FIXED_UPDATE_US;

    #[test]
    fn no_shift_means_no_correction() {
        let corrector = FrameTimeCorrector::new(ONE_FIXED_UPDATE_US);
        assert_eq!(corrector.frame_correction_us(), 0);
        assert!(!corrector.is_correcting());
    }

    #[test]
    fn small_shift_spreads_evenly() {
        let mut corrector = FrameTimeCorrector::new(ONE_FIXED_UPDATE_US);
        corrector.update_index_shift(2);

        // 2 updates ahead: slow down by 2 * 16000 / 10 per frame.
        assert_eq!(corrector.frame_correction_us(), 3200);

        let mut total = 0;
        for _ in 0..SPREAD_UPDATES {
            total += corrector.frame_correction_us();
            corrector.on_update_advanced();
        }
        assert_eq!(total, 2 * 16_000);
        // Fully applied; the correction stops.
        assert_eq!(corrector.frame_correction_us(), 0);
        assert!(!corrector.is_correcting());
    }

    #[test]
    fn negative_shift_speeds_up() {
        let mut corrector = FrameTimeCorrector::new(ONE_FIXED_UPDATE_US);
        corrector.update_index_shift(-3);
        assert_eq!(corrector.frame_correction_us(), -4800);
    }

    #[test]
    fn correction_is_clamped_to_half_an_update() {
        let mut corrector = FrameTimeCorrector::new(ONE_FIXED_UPDATE_US);
        corrector.update_index_shift(100);
        assert_eq!(corrector.frame_correction_us(), 8000);
        corrector.update_index_shift(-100);
        assert_eq!(corrector.frame_correction_us(), -8000);
    }

    #[test]
    fn new_shift_restarts_the_spread() {
        let mut corrector = FrameTimeCorrector::new(ONE_FIXED_UPDATE_US);
        corrector.update_index_shift(2);
        for _ in 0..5 {
            corrector.on_update_advanced();
        }
        corrector.update_index_shift(1);
        assert_eq!(corrector.frame_correction_us(), 1600);
        assert!(corrector.is_correcting());
    }

    #[test]
    fn zero_shift_cancels_pending_correction() {
        let mut corrector = FrameTimeCorrector::new(ONE_FIXED_UPDATE_US);
        corrector.update_index_shift(5);
        assert!(corrector.is_correcting());
        corrector.update_index_shift(0);
        assert_eq!(corrector.frame_correction_us(), 0);
        assert!(!corrector.is_correcting());
    }
}
