//! Servo configuration
//!
//! Daemon-wide options consumed once when a servo is created. Field names
//! match the configuration file keys so a loader can deserialize a partial
//! table straight into [`ServoConfig`].

use serde::{Deserialize, Serialize};

use crate::ServoKind;

/// Nanoseconds per second
pub const NSEC_PER_SEC: f64 = 1_000_000_000.0;

/// Servo configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// Algorithm used by [`Servo::from_config`](crate::Servo::from_config)
    pub clock_servo: ServoKind,
    /// Step when the offset exceeds this many seconds (0 = never)
    pub step_threshold: f64,
    /// Step on the first update when the offset exceeds this many seconds (0 = never)
    pub first_step_threshold: f64,
    /// Ceiling on the frequency adjustment in ppb (non-positive = no ceiling)
    pub max_frequency: i32,
    /// Offset in ns below which a locked sample counts toward stability (0 = disabled)
    pub servo_offset_threshold: u64,
    /// Consecutive in-threshold samples required for stability
    pub servo_num_offset_values: u32,

    // PI servo
    pub pi_proportional_const: f64,
    pub pi_integral_const: f64,
    pub pi_proportional_scale: f64,
    pub pi_proportional_exponent: f64,
    pub pi_proportional_norm_max: f64,
    pub pi_integral_scale: f64,
    pub pi_integral_exponent: f64,
    pub pi_integral_norm_max: f64,

    /// NTP shared-memory unit
    pub ntpshm_segment: i32,
    /// Destination of reference-clock socket samples
    pub refclock_sock_address: String,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            clock_servo: ServoKind::Pi,
            step_threshold: 0.0,
            first_step_threshold: 0.00002,
            max_frequency: 900_000_000,
            servo_offset_threshold: 0,
            servo_num_offset_values: 10,
            pi_proportional_const: 0.0,
            pi_integral_const: 0.0,
            pi_proportional_scale: 0.0,
            pi_proportional_exponent: -0.3,
            pi_proportional_norm_max: 0.7,
            pi_integral_scale: 0.0,
            pi_integral_exponent: 0.4,
            pi_integral_norm_max: 0.3,
            ntpshm_segment: 0,
            refclock_sock_address: "/var/run/refclock.ptp.sock".to_string(),
        }
    }
}

impl ServoConfig {
    /// Step threshold in nanoseconds, 0 when disabled
    pub fn step_threshold_ns(&self) -> f64 {
        seconds_to_threshold(self.step_threshold)
    }

    /// First-step threshold in nanoseconds, 0 when disabled
    pub fn first_step_threshold_ns(&self) -> f64 {
        seconds_to_threshold(self.first_step_threshold)
    }

    /// Effective frequency bound given the caller's bound, never negative
    pub fn frequency_bound(&self, max_ppb: i32) -> i32 {
        let bound = if self.max_frequency > 0 {
            max_ppb.min(self.max_frequency)
        } else {
            max_ppb
        };
        bound.max(0)
    }
}

fn seconds_to_threshold(seconds: f64) -> f64 {
    // NaN falls through to 0 as well
    if seconds > 0.0 {
        seconds * NSEC_PER_SEC
    } else {
        0.0
    }
}
