//! Servo - factory and sample dispatcher shared by every algorithm

use std::fmt;

use tracing::{debug, info};

use crate::{
    AlgorithmState, LinregServo, NtpShmServo, NullServo, PiServo, SampleContext, ServoAlgorithm,
    ServoConfig, ServoKind, ServoResult, ServoState, StabilityDetector,
};

/// How the caller's clock timestamps event messages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timestamping {
    #[default]
    Hardware,
    Software,
}

/// A configured servo: one algorithm plus the bounds and stability
/// bookkeeping every algorithm shares.
///
/// The owner feeds offsets in measurement order through [`Servo::sample`]
/// and tears the servo down with [`Servo::destroy`].
pub struct Servo {
    kind: ServoKind,
    algorithm: Box<dyn ServoAlgorithm>,
    /// Frequency adjustment bound (ppb)
    max_frequency: i32,
    /// Nanoseconds, 0 = never step
    step_threshold: f64,
    /// Nanoseconds, 0 = never step on the first update
    first_step_threshold: f64,
    stability: StabilityDetector,
    first_update: bool,
}

impl Servo {
    /// Create a servo of the given kind.
    ///
    /// `fadj` is the clock's current frequency adjustment and `max_ppb`
    /// the largest adjustment the clock accepts, both in ppb.
    pub fn create(
        config: &ServoConfig,
        kind: ServoKind,
        fadj: f64,
        max_ppb: i32,
        timestamping: Timestamping,
    ) -> ServoResult<Self> {
        let algorithm: Box<dyn ServoAlgorithm> = match kind {
            ServoKind::Pi => Box::new(PiServo::new(config, fadj, timestamping)?),
            ServoKind::Linreg => Box::new(LinregServo::new(fadj)),
            ServoKind::NtpShm => Box::new(NtpShmServo::new(config.ntpshm_segment)?),
            ServoKind::Nullf => Box::new(NullServo::new()),
            ServoKind::RefclockSock => refclock_servo(config)?,
        };

        Ok(Self::with_algorithm(config, kind, algorithm, max_ppb))
    }

    /// Create a servo from the algorithm's configuration tag
    pub fn create_named(
        config: &ServoConfig,
        name: &str,
        fadj: f64,
        max_ppb: i32,
        timestamping: Timestamping,
    ) -> ServoResult<Self> {
        Self::create(config, name.parse()?, fadj, max_ppb, timestamping)
    }

    /// Create the servo selected by `config.clock_servo`
    pub fn from_config(
        config: &ServoConfig,
        fadj: f64,
        max_ppb: i32,
        timestamping: Timestamping,
    ) -> ServoResult<Self> {
        Self::create(config, config.clock_servo, fadj, max_ppb, timestamping)
    }

    /// Wrap an already built algorithm, applying the shared bounds
    pub fn with_algorithm(
        config: &ServoConfig,
        kind: ServoKind,
        algorithm: Box<dyn ServoAlgorithm>,
        max_ppb: i32,
    ) -> Self {
        let servo = Servo {
            kind,
            algorithm,
            max_frequency: config.frequency_bound(max_ppb),
            step_threshold: config.step_threshold_ns(),
            first_step_threshold: config.first_step_threshold_ns(),
            stability: StabilityDetector::new(
                config.servo_offset_threshold,
                config.servo_num_offset_values,
            ),
            first_update: true,
        };

        info!(
            servo = %kind,
            max_frequency = servo.max_frequency,
            step_threshold = servo.step_threshold,
            first_step_threshold = servo.first_step_threshold,
            offset_threshold = servo.stability.threshold(),
            num_offset_values = servo.stability.required(),
            "servo created"
        );

        servo
    }

    fn context(&self) -> SampleContext {
        SampleContext {
            max_frequency: self.max_frequency as f64,
            step_threshold: self.step_threshold,
            first_step_threshold: self.first_step_threshold,
            first_update: self.first_update,
        }
    }

    /// Feed one offset measurement (ns) taken at `local_ts` (ns).
    ///
    /// Returns the algorithm's adjustment unchanged, with the state
    /// promoted to `LockedStable` once the stability detector agrees.
    pub fn sample(&mut self, offset: i64, local_ts: u64, weight: f64) -> (f64, ServoState) {
        let ctx = self.context();
        let (adjustment, raw) = self.algorithm.sample(&ctx, offset, local_ts, weight);

        let state = match raw {
            AlgorithmState::Unlocked => {
                self.rearm_stability();
                ServoState::Unlocked
            }
            AlgorithmState::Jump => {
                self.rearm_stability();
                self.first_update = false;
                ServoState::Jump
            }
            AlgorithmState::Locked => {
                self.first_update = false;
                if self.stability.check(offset) {
                    ServoState::LockedStable
                } else {
                    ServoState::Locked
                }
            }
        };

        (adjustment, state)
    }

    fn rearm_stability(&mut self) {
        if self.stability.is_enabled() && self.stability.remaining() != self.stability.required() {
            debug!(servo = %self.kind, "offset stability lost");
        }
        self.stability.rearm();
    }

    /// Tell the algorithm the current measurement interval (seconds)
    pub fn sync_interval(&mut self, interval: f64) {
        self.algorithm.set_sync_interval(interval);
    }

    /// Clear algorithm history
    pub fn reset(&mut self) {
        self.algorithm.reset();
    }

    /// Remote/local frequency ratio, 1.0 when the algorithm does not track it
    pub fn rate_ratio(&self) -> f64 {
        self.algorithm.rate_ratio().unwrap_or(1.0)
    }

    /// Announce a pending leap second (1 insert, -1 delete, 0 none)
    pub fn leap(&mut self, leap: i32) {
        self.algorithm.leap(leap);
    }

    /// Tear down the servo and its algorithm
    pub fn destroy(self) {
        debug!(servo = %self.kind, "servo destroyed");
        self.algorithm.destroy();
    }

    /// Offset stability threshold (ns), 0 when disabled
    pub fn offset_threshold(&self) -> u64 {
        self.stability.threshold()
    }

    pub fn kind(&self) -> ServoKind {
        self.kind
    }

    /// Effective frequency bound (ppb)
    pub fn max_frequency(&self) -> i32 {
        self.max_frequency
    }

    /// Step threshold (ns), 0 when disabled
    pub fn step_threshold(&self) -> f64 {
        self.step_threshold
    }

    /// First-update step threshold (ns), 0 when disabled
    pub fn first_step_threshold(&self) -> f64 {
        self.first_step_threshold
    }

    /// True until the first `Jump` or `Locked` sample
    pub fn first_update(&self) -> bool {
        self.first_update
    }

    /// Locked samples required for stability
    pub fn num_offset_values(&self) -> u32 {
        self.stability.required()
    }

    /// Locked samples still needed for stability
    pub fn remaining_offset_values(&self) -> u32 {
        self.stability.remaining()
    }
}

impl fmt::Debug for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servo")
            .field("kind", &self.kind)
            .field("max_frequency", &self.max_frequency)
            .field("step_threshold", &self.step_threshold)
            .field("first_step_threshold", &self.first_step_threshold)
            .field("stability", &self.stability)
            .field("first_update", &self.first_update)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn refclock_servo(config: &ServoConfig) -> ServoResult<Box<dyn ServoAlgorithm>> {
    Ok(Box::new(crate::RefclockSockServo::new(
        &config.refclock_sock_address,
    )?))
}

#[cfg(not(unix))]
fn refclock_servo(_config: &ServoConfig) -> ServoResult<Box<dyn ServoAlgorithm>> {
    Err(crate::ServoError::init_failed(
        ServoKind::RefclockSock,
        "Unix datagram sockets are not available on this platform",
    ))
}
