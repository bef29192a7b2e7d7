//! Offset stability detector
//!
//! Promotes a locked servo to stable after a run of small offsets. The
//! counter only moves toward zero: a large offset does not advance it but
//! does not set it back either. Only [`StabilityDetector::rearm`] restores it.

/// Counter-based stability filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StabilityDetector {
    /// Offset threshold in ns (0 = disabled)
    threshold: u64,
    /// Samples required
    required: u32,
    /// Samples still needed, in `0..=required`
    remaining: u32,
}

impl StabilityDetector {
    pub fn new(threshold: u64, required: u32) -> Self {
        StabilityDetector {
            threshold,
            required,
            remaining: required,
        }
    }

    /// Feed a locked sample's offset; returns true once stable.
    pub fn check(&mut self, offset: i64) -> bool {
        if !self.is_enabled() {
            return false;
        }

        if offset.unsigned_abs() < self.threshold && self.remaining > 0 {
            self.remaining -= 1;
        }

        self.remaining == 0
    }

    /// Require a full run again
    #[inline]
    pub fn rearm(&mut self) {
        self.remaining = self.required;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.threshold != 0
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn required(&self) -> u32 {
        self.required
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}
