//! Servo lock states

use std::fmt;

/// State an algorithm reports for a single sample.
///
/// Algorithms cannot claim stability; only the dispatcher can promote
/// `Locked` to [`ServoState::LockedStable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlgorithmState {
    /// Not tracking the reference yet
    Unlocked,
    /// The clock must be stepped by the measured offset
    Jump,
    /// Converged and tracking
    Locked,
}

/// State reported to the daemon for a single sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServoState {
    Unlocked,
    Jump,
    Locked,
    /// Locked, and the offset has stayed inside the stability threshold
    /// for the configured number of samples
    LockedStable,
}

impl ServoState {
    /// True for `Locked` and `LockedStable`
    #[inline]
    pub fn is_locked(self) -> bool {
        matches!(self, ServoState::Locked | ServoState::LockedStable)
    }
}

impl From<AlgorithmState> for ServoState {
    fn from(state: AlgorithmState) -> Self {
        match state {
            AlgorithmState::Unlocked => ServoState::Unlocked,
            AlgorithmState::Jump => ServoState::Jump,
            AlgorithmState::Locked => ServoState::Locked,
        }
    }
}

impl fmt::Display for ServoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServoState::Unlocked => "s0",
            ServoState::Jump => "s1",
            ServoState::Locked => "s2",
            ServoState::LockedStable => "s3",
        };
        f.write_str(name)
    }
}
