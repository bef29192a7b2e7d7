//! Proportional-integral servo
//!
//! Estimates the frequency offset from the first two samples, then runs a
//! PI loop whose gains scale with the sync interval.

use tracing::debug;

use crate::{
    AlgorithmState, SampleContext, ServoAlgorithm, ServoConfig, ServoError, ServoKind,
    ServoResult, Timestamping, NSEC_PER_SEC,
};

const HWTS_KP_SCALE: f64 = 0.7;
const HWTS_KI_SCALE: f64 = 0.3;
const SWTS_KP_SCALE: f64 = 0.1;
const SWTS_KI_SCALE: f64 = 0.001;

/// Norm caps used with fixed constants
const MAX_KP_NORM_MAX: f64 = 1.0;
const MAX_KI_NORM_MAX: f64 = 2.0;

/// Slack added to the interval between the first two samples
const FREQ_EST_MARGIN: f64 = 0.001;
/// Upper bound on the frequency estimation interval (seconds)
const MAX_FREQ_EST_INTERVAL: f64 = 1000.0;

/// Gain schedule: `gain = scale * interval^exponent`, capped at `norm_max / interval`
#[derive(Clone, Copy, Debug, PartialEq)]
struct Gain {
    scale: f64,
    exponent: f64,
    norm_max: f64,
}

impl Gain {
    fn at(&self, interval: f64) -> f64 {
        let gain = self.scale * interval.powf(self.exponent);
        gain.min(self.norm_max / interval)
    }
}

/// Where the servo is in its start-up sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting for the first sample
    Empty,
    /// One sample stored, waiting for a second to estimate drift
    FirstSample,
    /// Running the PI loop
    Tracking,
}

/// PI controller
#[derive(Clone, Debug)]
pub struct PiServo {
    offset: [i64; 2],
    local: [u64; 2],
    /// Accumulated frequency estimate (ppb)
    drift: f64,
    kp: f64,
    ki: f64,
    last_freq: f64,
    phase: Phase,
    kp_gain: Gain,
    ki_gain: Gain,
}

impl PiServo {
    /// Build from configuration. `fadj` is the clock's current frequency
    /// adjustment (ppb); it seeds the drift estimate.
    pub fn new(config: &ServoConfig, fadj: f64, timestamping: Timestamping) -> ServoResult<Self> {
        let values = [
            config.pi_proportional_const,
            config.pi_integral_const,
            config.pi_proportional_scale,
            config.pi_proportional_exponent,
            config.pi_proportional_norm_max,
            config.pi_integral_scale,
            config.pi_integral_exponent,
            config.pi_integral_norm_max,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ServoError::init_failed(
                ServoKind::Pi,
                "PI constants must be finite",
            ));
        }
        if config.pi_proportional_norm_max < 0.0 || config.pi_integral_norm_max < 0.0 {
            return Err(ServoError::init_failed(
                ServoKind::Pi,
                "PI norm max must not be negative",
            ));
        }

        let mut kp_gain = Gain {
            scale: config.pi_proportional_scale,
            exponent: config.pi_proportional_exponent,
            norm_max: config.pi_proportional_norm_max,
        };
        let mut ki_gain = Gain {
            scale: config.pi_integral_scale,
            exponent: config.pi_integral_exponent,
            norm_max: config.pi_integral_norm_max,
        };

        if config.pi_proportional_const != 0.0 && config.pi_integral_const != 0.0 {
            // Fixed constants, only capped when they would make the loop unstable
            kp_gain = Gain {
                scale: config.pi_proportional_const,
                exponent: 0.0,
                norm_max: MAX_KP_NORM_MAX,
            };
            ki_gain = Gain {
                scale: config.pi_integral_const,
                exponent: 0.0,
                norm_max: MAX_KI_NORM_MAX,
            };
        } else if kp_gain.scale == 0.0 || ki_gain.scale == 0.0 {
            let (kp_scale, ki_scale) = match timestamping {
                Timestamping::Hardware => (HWTS_KP_SCALE, HWTS_KI_SCALE),
                Timestamping::Software => (SWTS_KP_SCALE, SWTS_KI_SCALE),
            };
            kp_gain.scale = kp_scale;
            ki_gain.scale = ki_scale;
        }

        Ok(PiServo {
            offset: [0; 2],
            local: [0; 2],
            drift: fadj,
            kp: 0.0,
            ki: 0.0,
            last_freq: fadj,
            phase: Phase::Empty,
            kp_gain,
            ki_gain,
        })
    }

    /// Current proportional gain
    pub fn kp(&self) -> f64 {
        self.kp
    }

    /// Current integral gain
    pub fn ki(&self) -> f64 {
        self.ki
    }

    /// Current drift estimate (ppb)
    pub fn drift(&self) -> f64 {
        self.drift
    }

    fn estimate_drift(
        &mut self,
        ctx: &SampleContext,
        offset: i64,
        local_ts: u64,
    ) -> Option<AlgorithmState> {
        self.offset[1] = offset;
        self.local[1] = local_ts;

        // The first sample must be older than the second
        if self.local[0] >= self.local[1] {
            self.phase = Phase::Empty;
            return None;
        }

        let elapsed = (self.local[1] - self.local[0]) as f64;
        let mut localdiff = elapsed / NSEC_PER_SEC;
        localdiff += localdiff * FREQ_EST_MARGIN;

        // Too close together for a useful estimate; ki == 0 gives infinity here
        let freq_est_interval = (0.016 / self.ki).min(MAX_FREQ_EST_INTERVAL);
        if localdiff < freq_est_interval {
            return None;
        }

        let delta = self.offset[1] as f64 - self.offset[0] as f64;
        self.drift += (NSEC_PER_SEC - self.drift) * delta / elapsed;
        self.drift = ctx.clamp_frequency(self.drift);
        self.phase = Phase::Tracking;

        if ctx.exceeds_step_threshold(offset as f64) {
            Some(AlgorithmState::Jump)
        } else {
            Some(AlgorithmState::Locked)
        }
    }
}

impl ServoAlgorithm for PiServo {
    fn sample(
        &mut self,
        ctx: &SampleContext,
        offset: i64,
        local_ts: u64,
        weight: f64,
    ) -> (f64, AlgorithmState) {
        let mut ppb = self.last_freq;
        let mut state = AlgorithmState::Unlocked;

        match self.phase {
            Phase::Empty => {
                self.offset[0] = offset;
                self.local[0] = local_ts;
                self.phase = Phase::FirstSample;
            }
            Phase::FirstSample => {
                if let Some(estimated) = self.estimate_drift(ctx, offset, local_ts) {
                    state = estimated;
                    ppb = self.drift;
                }
            }
            Phase::Tracking => {
                // Start over rather than chase a large offset; the step
                // happens after the drift is re-estimated.
                if ctx.step_threshold > 0.0 && (offset as f64).abs() > ctx.step_threshold {
                    self.phase = Phase::Empty;
                } else {
                    let offset = offset as f64;
                    let ki_term = self.ki * offset * weight;
                    let raw = self.kp * offset * weight + self.drift + ki_term;
                    ppb = ctx.clamp_frequency(raw);
                    if ppb == raw {
                        self.drift += ki_term;
                    }
                    state = AlgorithmState::Locked;
                }
            }
        }

        self.last_freq = ppb;
        (ppb, state)
    }

    fn reset(&mut self) {
        self.phase = Phase::Empty;
    }

    fn set_sync_interval(&mut self, interval: f64) {
        self.kp = self.kp_gain.at(interval);
        self.ki = self.ki_gain.at(interval);

        debug!(interval, kp = self.kp, ki = self.ki, "PI servo sync interval");
    }

    fn destroy(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn ctx() -> SampleContext {
        SampleContext {
            max_frequency: 900_000_000.0,
            step_threshold: 0.0,
            first_step_threshold: 0.0,
            first_update: true,
        }
    }

    fn hw_servo() -> PiServo {
        let mut servo =
            PiServo::new(&ServoConfig::default(), 0.0, Timestamping::Hardware).unwrap();
        servo.set_sync_interval(1.0);
        servo
    }

    #[test]
    fn test_default_gains_hardware() {
        let servo = hw_servo();
        assert!((servo.kp() - 0.7).abs() < 1e-12);
        assert!((servo.ki() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_default_gains_software() {
        let mut servo =
            PiServo::new(&ServoConfig::default(), 0.0, Timestamping::Software).unwrap();
        servo.set_sync_interval(1.0);
        assert!((servo.kp() - 0.1).abs() < 1e-12);
        assert!((servo.ki() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_gains_capped_by_norm_max() {
        let mut servo = hw_servo();
        // kp = 0.7 * 4^-0.3 = 0.46, cap 0.7 / 4 = 0.175
        servo.set_sync_interval(4.0);
        assert!((servo.kp() - 0.175).abs() < 1e-12);
        // ki = 0.3 * 4^0.4 = 0.52, cap 0.3 / 4 = 0.075
        assert!((servo.ki() - 0.075).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_constants() {
        let config = ServoConfig {
            pi_proportional_const: 0.5,
            pi_integral_const: 0.1,
            ..ServoConfig::default()
        };
        let mut servo = PiServo::new(&config, 0.0, Timestamping::Hardware).unwrap();
        servo.set_sync_interval(0.125);
        assert!((servo.kp() - 0.5).abs() < 1e-12);
        assert!((servo.ki() - 0.1).abs() < 1e-12);

        // 1.0 / 2.0 caps kick in for long intervals
        servo.set_sync_interval(4.0);
        assert!((servo.kp() - 0.25).abs() < 1e-12);
        assert!((servo.ki() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_invalid_constants() {
        let config = ServoConfig {
            pi_proportional_scale: f64::NAN,
            ..ServoConfig::default()
        };
        assert!(matches!(
            PiServo::new(&config, 0.0, Timestamping::Hardware),
            Err(ServoError::AlgorithmInitFailed { kind: ServoKind::Pi, .. })
        ));

        let config = ServoConfig {
            pi_integral_norm_max: -0.3,
            ..ServoConfig::default()
        };
        assert!(PiServo::new(&config, 0.0, Timestamping::Hardware).is_err());
    }

    #[test]
    fn test_drift_estimation() {
        let mut servo = hw_servo();
        let ctx = ctx();

        let (ppb, state) = servo.sample(&ctx, 0, SEC, 1.0);
        assert_eq!(state, AlgorithmState::Unlocked);
        assert_eq!(ppb, 0.0);

        // 1000 ns gained over one second
        let (ppb, state) = servo.sample(&ctx, 1000, 2 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Locked);
        assert!((ppb - 1000.0).abs() < 1e-6);
        assert!((servo.drift() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_waits_without_sync_interval() {
        let mut servo =
            PiServo::new(&ServoConfig::default(), 0.0, Timestamping::Hardware).unwrap();
        let ctx = ctx();

        servo.sample(&ctx, 0, SEC, 1.0);
        // ki is still zero, so the estimation interval is the 1000 s maximum
        let (_, state) = servo.sample(&ctx, 100, 2 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Unlocked);
        let (_, state) = servo.sample(&ctx, 100, 1002 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Locked);
    }

    #[test]
    fn test_non_increasing_timestamps_restart() {
        let mut servo = hw_servo();
        let ctx = ctx();

        servo.sample(&ctx, 0, 5 * SEC, 1.0);
        let (_, state) = servo.sample(&ctx, 10, 4 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Unlocked);
        assert_eq!(servo.phase, Phase::Empty);
    }

    #[test]
    fn test_first_step_threshold_jumps() {
        let mut servo = hw_servo();
        let ctx = SampleContext {
            first_step_threshold: 20_000.0,
            ..ctx()
        };

        servo.sample(&ctx, 1_000_000, SEC, 1.0);
        let (_, state) = servo.sample(&ctx, 1_000_100, 2 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Jump);
    }

    #[test]
    fn test_step_threshold_restarts_tracking() {
        let mut servo = hw_servo();
        let ctx = SampleContext {
            step_threshold: 1_000_000.0,
            ..ctx()
        };

        servo.sample(&ctx, 0, SEC, 1.0);
        servo.sample(&ctx, 0, 2 * SEC, 1.0);
        let (_, state) = servo.sample(&ctx, 5_000_000, 3 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Unlocked);
        assert_eq!(servo.phase, Phase::Empty);
    }

    #[test]
    fn test_pi_output_and_clamping() {
        let mut servo = hw_servo();
        let ctx = SampleContext {
            max_frequency: 500.0,
            ..ctx()
        };

        servo.sample(&ctx, 0, SEC, 1.0);
        servo.sample(&ctx, 0, 2 * SEC, 1.0);

        // kp * 100 + ki * 100 = 100
        let (ppb, state) = servo.sample(&ctx, 100, 3 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Locked);
        assert!((ppb - 100.0).abs() < 1e-9);
        assert!((servo.drift() - 30.0).abs() < 1e-9);

        // Clamped output does not integrate
        let (ppb, _) = servo.sample(&ctx, 10_000, 4 * SEC, 1.0);
        assert_eq!(ppb, 500.0);
        assert!((servo.drift() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_unlocked_returns_last_frequency() {
        let mut servo =
            PiServo::new(&ServoConfig::default(), -250.0, Timestamping::Hardware).unwrap();
        servo.set_sync_interval(1.0);
        let (ppb, _) = servo.sample(&ctx(), 0, SEC, 1.0);
        assert_eq!(ppb, -250.0);
    }

    #[test]
    fn test_extreme_offsets_estimate_drift() {
        let mut servo = hw_servo();
        let ctx = SampleContext {
            max_frequency: 1000.0,
            ..ctx()
        };

        servo.sample(&ctx, i64::MIN, SEC, 1.0);
        let (ppb, state) = servo.sample(&ctx, i64::MAX, 2 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Locked);
        assert_eq!(ppb, 1000.0);

        let (ppb, _) = servo.sample(&ctx, i64::MIN, 3 * SEC, 1.0);
        assert_eq!(ppb, -1000.0);
    }

    #[test]
    fn test_reset_restarts_estimation() {
        let mut servo = hw_servo();
        let ctx = ctx();

        servo.sample(&ctx, 0, SEC, 1.0);
        servo.sample(&ctx, 0, 2 * SEC, 1.0);
        servo.reset();

        let (_, state) = servo.sample(&ctx, 0, 3 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Unlocked);
    }
}
