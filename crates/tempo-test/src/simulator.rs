//! Servo loop simulator
//!
//! Simulates:
//! - A local clock with a fixed frequency error (ppb)
//! - Measurement jitter on every offset sample
//! - The daemon side of the loop: frequency writes on lock, clock steps
//!   on jump, nothing while unlocked

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use tempo_servo::{Servo, ServoState};

const NSEC_PER_SEC: f64 = 1_000_000_000.0;

/// Local clock model
#[derive(Clone, Debug)]
pub struct SimulatedClock {
    /// Uncorrected frequency error (ppb, positive = fast)
    pub drift_ppb: f64,
    /// Maximum measurement noise (ns)
    pub jitter_ns: i64,
    /// True local minus reference (ns)
    offset_ns: f64,
    /// Frequency adjustment currently applied (ppb)
    adjustment_ppb: f64,
    /// Reference time (ns)
    reference_ns: u64,
    steps: u32,
}

impl SimulatedClock {
    pub fn new(drift_ppb: f64, jitter_ns: i64, initial_offset_ns: f64) -> Self {
        SimulatedClock {
            drift_ppb,
            jitter_ns,
            offset_ns: initial_offset_ns,
            adjustment_ppb: 0.0,
            reference_ns: 1_000 * NSEC_PER_SEC as u64,
            steps: 0,
        }
    }

    /// Ideal oscillator
    pub fn perfect() -> Self {
        Self::new(0.0, 0, 0.0)
    }

    /// Typical crystal, a few ppm off, hardware timestamps
    pub fn crystal() -> Self {
        Self::new(12_000.0, 20, 0.0)
    }

    /// Noisy software timestamps
    pub fn noisy() -> Self {
        Self::new(-35_000.0, 2_000, 0.0)
    }

    /// True offset (ns)
    pub fn offset(&self) -> f64 {
        self.offset_ns
    }

    /// Number of clock steps applied
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Take a measurement: (measured offset, local timestamp)
    pub fn measure(&self, rng: &mut StdRng) -> (i64, u64) {
        let noise = if self.jitter_ns > 0 {
            rng.gen_range(-self.jitter_ns..=self.jitter_ns)
        } else {
            0
        };
        let offset = self.offset_ns.round() as i64;
        let local = (self.reference_ns as i64).saturating_add(offset) as u64;
        (offset + noise, local)
    }

    pub fn set_frequency(&mut self, ppb: f64) {
        self.adjustment_ppb = ppb;
    }

    pub fn step(&mut self, delta_ns: i64) {
        self.offset_ns += delta_ns as f64;
        self.steps += 1;
    }

    /// Let `interval` seconds pass
    pub fn advance(&mut self, interval: f64) {
        self.offset_ns += (self.drift_ppb + self.adjustment_ppb) * interval;
        self.reference_ns += (interval * NSEC_PER_SEC) as u64;
    }
}

/// One iteration of the loop
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopSample {
    pub measured_offset: i64,
    pub true_offset: f64,
    pub adjustment: f64,
    pub state: ServoState,
}

/// Summary of a run
#[derive(Clone, Debug, Default)]
pub struct ConvergenceReport {
    pub samples: usize,
    /// Index of the first `LockedStable` sample
    pub first_stable: Option<usize>,
    /// Index of the first locked sample
    pub first_locked: Option<usize>,
    pub jumps: u32,
    /// Largest |true offset| after the first stable sample (ns)
    pub max_offset_after_stable: f64,
    pub final_state: Option<ServoState>,
}

/// Daemon-side loop driving a servo against a simulated clock
pub struct ServoLoop {
    servo: Servo,
    clock: SimulatedClock,
    interval: f64,
    rng: StdRng,
    trace: Vec<LoopSample>,
}

impl ServoLoop {
    /// `interval` is the sync interval in seconds
    pub fn new(mut servo: Servo, clock: SimulatedClock, interval: f64, seed: u64) -> Self {
        servo.sync_interval(interval);
        ServoLoop {
            servo,
            clock,
            interval,
            rng: StdRng::seed_from_u64(seed),
            trace: Vec::new(),
        }
    }

    /// Run one measurement and apply the servo's verdict
    pub fn step(&mut self) -> LoopSample {
        let (offset, local_ts) = self.clock.measure(&mut self.rng);
        let (adjustment, state) = self.servo.sample(offset, local_ts, 1.0);

        match state {
            ServoState::Unlocked => {}
            ServoState::Jump => {
                self.clock.set_frequency(-adjustment);
                self.clock.step(-offset);
            }
            ServoState::Locked | ServoState::LockedStable => {
                self.clock.set_frequency(-adjustment);
            }
        }

        let sample = LoopSample {
            measured_offset: offset,
            true_offset: self.clock.offset(),
            adjustment,
            state,
        };
        trace!(?sample, "servo loop");

        self.clock.advance(self.interval);
        self.trace.push(sample);
        sample
    }

    pub fn run(&mut self, iterations: usize) -> ConvergenceReport {
        for _ in 0..iterations {
            self.step();
        }
        self.report()
    }

    pub fn report(&self) -> ConvergenceReport {
        let first_stable = self
            .trace
            .iter()
            .position(|s| s.state == ServoState::LockedStable);
        let first_locked = self.trace.iter().position(|s| s.state.is_locked());
        let max_offset_after_stable = first_stable
            .map(|i| {
                self.trace[i..]
                    .iter()
                    .map(|s| s.true_offset.abs())
                    .fold(0.0, f64::max)
            })
            .unwrap_or(0.0);

        ConvergenceReport {
            samples: self.trace.len(),
            first_stable,
            first_locked,
            jumps: self.clock.steps(),
            max_offset_after_stable,
            final_state: self.trace.last().map(|s| s.state),
        }
    }

    pub fn trace(&self) -> &[LoopSample] {
        &self.trace
    }

    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }

    pub fn servo(&self) -> &Servo {
        &self.servo
    }

    pub fn servo_mut(&mut self) -> &mut Servo {
        &mut self.servo
    }

    /// Hand the servo back for teardown
    pub fn into_servo(self) -> Servo {
        self.servo
    }
}
