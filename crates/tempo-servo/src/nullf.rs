//! Null servo: classifies offsets, never adjusts frequency.
//!
//! Used when something else owns the clock frequency and the daemon only
//! needs to know when to step.

use crate::{AlgorithmState, SampleContext, ServoAlgorithm};

#[derive(Clone, Debug, Default)]
pub struct NullServo;

impl NullServo {
    pub fn new() -> Self {
        NullServo
    }
}

impl ServoAlgorithm for NullServo {
    fn sample(
        &mut self,
        ctx: &SampleContext,
        offset: i64,
        _local_ts: u64,
        _weight: f64,
    ) -> (f64, AlgorithmState) {
        let state = if ctx.exceeds_step_threshold(offset as f64) {
            AlgorithmState::Jump
        } else {
            AlgorithmState::Locked
        };
        (0.0, state)
    }

    fn reset(&mut self) {}

    fn set_sync_interval(&mut self, _interval: f64) {}

    fn destroy(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_without_thresholds() {
        let ctx = SampleContext {
            max_frequency: 1e6,
            step_threshold: 0.0,
            first_step_threshold: 0.0,
            first_update: true,
        };
        let mut servo = NullServo::new();

        assert_eq!(servo.sample(&ctx, i64::MAX, 0, 1.0), (0.0, AlgorithmState::Locked));
        assert_eq!(servo.rate_ratio(), None);
    }

    #[test]
    fn test_jump_over_threshold() {
        let ctx = SampleContext {
            max_frequency: 1e6,
            step_threshold: 1000.0,
            first_step_threshold: 0.0,
            first_update: false,
        };
        let mut servo = NullServo::new();

        assert_eq!(servo.sample(&ctx, -1001, 0, 1.0), (0.0, AlgorithmState::Jump));
        assert_eq!(servo.sample(&ctx, 999, 0, 1.0), (0.0, AlgorithmState::Locked));
    }
}
