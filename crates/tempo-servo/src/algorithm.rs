//! The contract every servo algorithm implements

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AlgorithmState, ServoError};

/// Closed set of known servo algorithms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServoKind {
    /// Proportional-integral controller
    #[serde(rename = "pi")]
    Pi,
    /// Linear regression over a sliding window of samples
    #[serde(rename = "linreg")]
    Linreg,
    /// Hands samples to an NTP daemon through a shared-memory record
    #[serde(rename = "ntpshm")]
    NtpShm,
    /// Reports state only, never adjusts frequency
    #[serde(rename = "nullf")]
    Nullf,
    /// Hands samples to a reference-clock socket (chrony SOCK)
    #[serde(rename = "refclock_sock")]
    RefclockSock,
}

impl ServoKind {
    pub const ALL: [ServoKind; 5] = [
        ServoKind::Pi,
        ServoKind::Linreg,
        ServoKind::NtpShm,
        ServoKind::Nullf,
        ServoKind::RefclockSock,
    ];

    /// Configuration tag
    pub fn as_str(self) -> &'static str {
        match self {
            ServoKind::Pi => "pi",
            ServoKind::Linreg => "linreg",
            ServoKind::NtpShm => "ntpshm",
            ServoKind::Nullf => "nullf",
            ServoKind::RefclockSock => "refclock_sock",
        }
    }
}

impl fmt::Display for ServoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServoKind {
    type Err = ServoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServoKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ServoError::UnknownAlgorithm(s.to_string()))
    }
}

impl TryFrom<u32> for ServoKind {
    type Error = ServoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ServoKind::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| ServoError::UnknownAlgorithm(value.to_string()))
    }
}

/// Bounds applied by the factory, handed to the algorithm on every sample
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleContext {
    /// Frequency adjustment bound (ppb)
    pub max_frequency: f64,
    /// Step threshold (ns), 0 = never
    pub step_threshold: f64,
    /// First-update step threshold (ns), 0 = never
    pub first_step_threshold: f64,
    /// No `Jump` or `Locked` sample has been processed yet
    pub first_update: bool,
}

impl SampleContext {
    /// True when `offset` (ns) is large enough that the clock should be stepped
    pub fn exceeds_step_threshold(&self, offset: f64) -> bool {
        let offset = offset.abs();
        (self.first_update && self.first_step_threshold > 0.0 && offset > self.first_step_threshold)
            || (self.step_threshold > 0.0 && offset > self.step_threshold)
    }

    /// Clamp a frequency to `±max_frequency`
    #[inline]
    pub fn clamp_frequency(&self, ppb: f64) -> f64 {
        ppb.clamp(-self.max_frequency, self.max_frequency)
    }
}

/// A servo control algorithm.
///
/// `sample`, `reset`, `set_sync_interval` and `destroy` are required.
/// `rate_ratio` and `leap` are optional capabilities: the defaults report
/// "not supported" and do nothing.
pub trait ServoAlgorithm: Send {
    /// Feed one offset measurement (ns) taken at `local_ts` (ns).
    /// Returns the adjustment and the raw state.
    fn sample(
        &mut self,
        ctx: &SampleContext,
        offset: i64,
        local_ts: u64,
        weight: f64,
    ) -> (f64, AlgorithmState);

    /// Drop accumulated history; the instance stays usable
    fn reset(&mut self);

    /// Measurement interval in seconds
    fn set_sync_interval(&mut self, interval: f64);

    /// Remote/local frequency ratio, `None` if not tracked
    fn rate_ratio(&self) -> Option<f64> {
        None
    }

    /// Pending leap second: 1 insert, -1 delete, 0 none
    fn leap(&mut self, _leap: i32) {}

    /// Release algorithm resources
    fn destroy(self: Box<Self>);
}
