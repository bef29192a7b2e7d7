//! Linear regression servo
//!
//! Fits remote time against uncorrected local time over the newest
//! 4, 8, ... 64 samples. Each window keeps a smoothed prediction error and
//! the servo follows the largest window whose error is not worse than the
//! smaller ones.

use tracing::debug;

use crate::{AlgorithmState, SampleContext, ServoAlgorithm, NSEC_PER_SEC};

/// Window sizes are powers of two between these exponents
const MIN_SIZE: usize = 2;
const MAX_SIZE: usize = 6;
const MAX_POINTS: usize = 1 << MAX_SIZE;
const NUM_FITS: usize = MAX_SIZE - MIN_SIZE + 1;

/// Smoothing factor of the long-term prediction error
const ERR_SMOOTH: f64 = 0.02;
/// Updates averaged before switching to exponential smoothing
const ERR_INITIAL_UPDATES: u32 = 10;
/// Errors within this ratio are considered equal
const ERR_EQUALS: f64 = 1.05;

/// x: uncorrected local time, y: remote time (both ns, wrapping)
#[derive(Clone, Copy, Debug, Default)]
struct Point {
    x: u64,
    y: u64,
    w: f64,
}

/// Regression result for one window size, relative to the current reference
#[derive(Clone, Copy, Debug, Default)]
struct Fit {
    fitted: bool,
    slope: f64,
    intercept: f64,
    err: f64,
    err_updates: u32,
}

impl Fit {
    fn record_error(&mut self, e: f64) {
        if self.err_updates < ERR_INITIAL_UPDATES {
            let updates = self.err_updates as f64;
            self.err = (self.err * updates + e) / (updates + 1.0);
            self.err_updates += 1;
        } else {
            self.err += ERR_SMOOTH * (e - self.err);
        }
    }
}

#[inline]
fn relative(value: u64, reference: u64) -> f64 {
    value.wrapping_sub(reference) as i64 as f64
}

/// Linear regression servo
#[derive(Clone, Debug)]
pub struct LinregServo {
    /// Ring buffer, `last_point` is the newest
    points: [Point; MAX_POINTS],
    num_points: usize,
    last_point: usize,
    /// Current position in (x, y)
    reference: Point,
    /// Fractional part carried between x increments
    x_remainder: f64,
    last_update: Option<u64>,
    fits: [Fit; NUM_FITS],
    /// Selected window exponent
    size: Option<usize>,
    /// Frequency currently applied to the clock (ppb)
    clock_freq: f64,
    /// Seconds between samples
    update_interval: f64,
    frequency_ratio: f64,
    leap: i32,
}

impl LinregServo {
    /// `fadj` is the clock's current frequency adjustment (ppb)
    pub fn new(fadj: f64) -> Self {
        LinregServo {
            points: [Point::default(); MAX_POINTS],
            num_points: 0,
            last_point: 0,
            reference: Point::default(),
            x_remainder: 0.0,
            last_update: None,
            fits: [Fit::default(); NUM_FITS],
            size: None,
            clock_freq: -fadj,
            update_interval: 1.0,
            frequency_ratio: 1.0,
            leap: 0,
        }
    }

    /// Number of points in the selected window, 0 before the first fit
    pub fn window(&self) -> usize {
        self.size.map_or(0, |size| 1 << size)
    }

    /// Shift the reference by (dx, dy), keeping every fit expressed
    /// relative to it
    fn move_reference(&mut self, dx: i64, dy: i64) {
        self.reference.x = self.reference.x.wrapping_add_signed(dx);
        self.reference.y = self.reference.y.wrapping_add_signed(dy);

        for fit in self.fits.iter_mut().filter(|fit| fit.fitted) {
            fit.intercept += fit.slope * dx as f64 - dy as f64;
        }
    }

    fn update_reference(&mut self, local_ts: u64) {
        if let Some(last) = self.last_update {
            let y_interval = local_ts.wrapping_sub(last) as i64;

            // Remove the frequency correction applied over the interval
            let x_interval =
                y_interval as f64 / (1.0 + self.clock_freq / NSEC_PER_SEC) + self.x_remainder;
            let whole = x_interval.trunc();
            self.x_remainder = x_interval - whole;

            // Through i128 so out-of-range intervals wrap like the reference
            self.move_reference(whole as i128 as i64, y_interval);
        }

        self.last_update = Some(local_ts);
    }

    fn add_sample(&mut self, offset: i64, weight: f64) {
        self.last_point = (self.last_point + 1) % MAX_POINTS;
        self.points[self.last_point] = Point {
            x: self.reference.x,
            y: self.reference.y.wrapping_sub(offset as u64),
            w: weight,
        };

        if self.num_points < MAX_POINTS {
            self.num_points += 1;
        }
    }

    fn regress(&mut self) {
        let reference = self.reference;
        let newest = self.points[self.last_point];
        let y0 = relative(newest.y, reference.y);

        let mut x_sum = 0.0;
        let mut y_sum = 0.0;
        let mut xy_sum = 0.0;
        let mut x2_sum = 0.0;
        let mut w_sum = 0.0;
        let mut i = 0;

        for size in MIN_SIZE..=MAX_SIZE {
            let n = 1 << size;
            if n > self.num_points {
                break;
            }

            let fit = &mut self.fits[size - MIN_SIZE];
            if fit.fitted {
                fit.record_error((fit.intercept - y0).abs());
            }

            // Windows are nested, so sums carry over from the smaller one
            while i < n {
                let point = self.points[(MAX_POINTS + self.last_point - i) % MAX_POINTS];
                let x = relative(point.x, reference.x);
                let y = relative(point.y, reference.y);
                let w = point.w;

                x_sum += x * w;
                y_sum += y * w;
                xy_sum += x * y * w;
                x2_sum += x * x * w;
                w_sum += w;
                i += 1;
            }

            let denominator = x2_sum - x_sum * x_sum / w_sum;
            if w_sum <= 0.0 || denominator == 0.0 || !denominator.is_finite() {
                *fit = Fit::default();
                break;
            }

            fit.slope = (xy_sum - x_sum * y_sum / w_sum) / denominator;
            fit.intercept = (y_sum - fit.slope * x_sum) / w_sum;
            fit.fitted = true;
        }
    }

    fn update_size(&mut self) {
        let mut best: Option<(usize, f64)> = None;

        for size in MIN_SIZE..=MAX_SIZE {
            let fit = &self.fits[size - MIN_SIZE];
            if !fit.fitted {
                continue;
            }
            match best {
                None => best = Some((size, fit.err)),
                Some((_, best_err))
                    if fit.err_updates >= ERR_INITIAL_UPDATES && best_err * ERR_EQUALS > fit.err =>
                {
                    best = Some((size, fit.err))
                }
                _ => {}
            }
        }

        self.size = best.map(|(size, _)| size);
    }
}

impl ServoAlgorithm for LinregServo {
    fn sample(
        &mut self,
        ctx: &SampleContext,
        offset: i64,
        local_ts: u64,
        weight: f64,
    ) -> (f64, AlgorithmState) {
        // The frequency is assumed to change at local_ts. Close enough as
        // long as the delay is small against the update interval.
        self.update_reference(local_ts);
        self.add_sample(offset, weight);
        self.regress();
        self.update_size();

        let Some(size) = self.size else {
            return (-self.clock_freq, AlgorithmState::Unlocked);
        };
        let fit = self.fits[size - MIN_SIZE];

        debug!(
            points = 1 << size,
            slope = fit.slope,
            intercept = fit.intercept,
            err = fit.err,
            "linreg fit"
        );

        let state = if ctx.exceeds_step_threshold(fit.intercept) {
            // Follow the clock through the step so history stays usable
            self.last_update = Some(local_ts.wrapping_sub(offset as u64));
            self.move_reference(0, offset.wrapping_neg());
            AlgorithmState::Jump
        } else {
            AlgorithmState::Locked
        };

        self.clock_freq = NSEC_PER_SEC * (fit.slope - 1.0);

        if state == AlgorithmState::Locked {
            // Correct the offset over a quarter of the window, which trades
            // response time for noise rejection on the larger windows
            let corr_interval = ((1 << size) as f64 / 4.0).max(1.0) * self.update_interval;
            self.clock_freq += fit.intercept / corr_interval;
        }

        self.clock_freq = ctx.clamp_frequency(self.clock_freq);
        self.frequency_ratio = fit.slope / (1.0 + self.clock_freq / NSEC_PER_SEC);

        (-self.clock_freq, state)
    }

    fn reset(&mut self) {
        self.num_points = 0;
        self.last_update = None;
        self.x_remainder = 0.0;
        self.size = None;
        self.frequency_ratio = 1.0;
        self.fits = [Fit::default(); NUM_FITS];
    }

    fn set_sync_interval(&mut self, interval: f64) {
        if interval > 0.0 && interval.is_finite() {
            self.update_interval = interval;
        }
    }

    fn rate_ratio(&self) -> Option<f64> {
        Some(self.frequency_ratio)
    }

    fn leap(&mut self, leap: i32) {
        // The reference timescale moved by a second once a pending leap
        // clears; shift the reference with it
        if self.leap != 0 && leap == 0 {
            self.move_reference(0, self.leap as i64 * NSEC_PER_SEC as i64);
        }
        self.leap = leap;
    }

    fn destroy(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    /// Minimal closed loop: a clock running `drift` ppb fast, corrected the
    /// way a daemon applies servo output
    struct Loop {
        servo: LinregServo,
        ctx: SampleContext,
        remote: u64,
        offset: f64,
        drift: f64,
        applied: f64,
    }

    impl Loop {
        fn new(drift: f64, first_step_threshold: f64) -> Self {
            Loop {
                servo: LinregServo::new(0.0),
                ctx: SampleContext {
                    max_frequency: 900_000_000.0,
                    step_threshold: 0.0,
                    first_step_threshold,
                    first_update: true,
                },
                remote: 1000 * SEC,
                offset: 0.0,
                drift,
                applied: 0.0,
            }
        }

        fn step(&mut self) -> (i64, AlgorithmState) {
            let measured = self.offset.round() as i64;
            let local_ts = (self.remote as i64 + measured) as u64;
            let (adj, state) = self.servo.sample(&self.ctx, measured, local_ts, 1.0);

            match state {
                AlgorithmState::Unlocked => {}
                AlgorithmState::Jump => {
                    self.applied = -adj;
                    self.offset -= measured as f64;
                    self.ctx.first_update = false;
                }
                AlgorithmState::Locked => {
                    self.applied = -adj;
                    self.ctx.first_update = false;
                }
            }

            self.offset += self.drift + self.applied;
            self.remote += SEC;
            (measured, state)
        }
    }

    #[test]
    fn test_unlocked_until_four_points() {
        let mut servo = LinregServo::new(150.0);
        let ctx = Loop::new(0.0, 0.0).ctx;

        for i in 0..3 {
            let (adj, state) = servo.sample(&ctx, 0, (i + 1) * SEC, 1.0);
            assert_eq!(state, AlgorithmState::Unlocked);
            assert_eq!(adj, 150.0);
        }
        let (_, state) = servo.sample(&ctx, 0, 4 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Locked);
        assert_eq!(servo.window(), 4);
    }

    #[test]
    fn test_tracks_constant_drift() {
        let mut sim = Loop::new(10_000.0, 0.0);

        let mut last = (0, AlgorithmState::Unlocked);
        for _ in 0..40 {
            last = sim.step();
        }

        assert_eq!(last.1, AlgorithmState::Locked);
        assert!(last.0.abs() < 5, "offset {}", last.0);
        assert!((sim.applied + 10_000.0).abs() < 5.0);

        let ratio = sim.servo.rate_ratio().unwrap();
        assert!((ratio - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_first_update_jump_keeps_history() {
        let mut sim = Loop::new(10_000.0, 20_000.0);

        let states: Vec<_> = (0..4).map(|_| sim.step().1).collect();
        assert_eq!(
            states,
            vec![
                AlgorithmState::Unlocked,
                AlgorithmState::Unlocked,
                AlgorithmState::Unlocked,
                AlgorithmState::Jump,
            ]
        );

        // The step removed the offset; the fitted drift survives it
        for _ in 0..10 {
            let (offset, state) = sim.step();
            assert_eq!(state, AlgorithmState::Locked);
            assert!(offset.abs() < 5, "offset {}", offset);
        }
    }

    #[test]
    fn test_reset_clears_history() {
        let mut sim = Loop::new(1_000.0, 0.0);
        for _ in 0..10 {
            sim.step();
        }

        sim.servo.reset();
        assert_eq!(sim.servo.window(), 0);
        assert_eq!(sim.servo.rate_ratio(), Some(1.0));

        let (_, state) = sim.step();
        assert_eq!(state, AlgorithmState::Unlocked);
    }

    #[test]
    fn test_leap_moves_reference_when_cleared() {
        let mut servo = LinregServo::new(0.0);
        let before = servo.reference.y;

        servo.leap(1);
        assert_eq!(servo.reference.y, before);

        servo.leap(0);
        assert_eq!(servo.reference.y, before.wrapping_add(SEC));
    }

    #[test]
    fn test_zero_weights_do_not_fit() {
        let mut servo = LinregServo::new(0.0);
        let ctx = Loop::new(0.0, 0.0).ctx;

        for i in 0..8 {
            let (_, state) = servo.sample(&ctx, 0, (i + 1) * SEC, 0.0);
            assert_eq!(state, AlgorithmState::Unlocked);
        }
    }

    #[test]
    fn test_jump_on_most_negative_offset() {
        let mut servo = LinregServo::new(0.0);
        let ctx = SampleContext {
            first_step_threshold: 20_000.0,
            ..Loop::new(0.0, 0.0).ctx
        };

        for i in 0..3 {
            servo.sample(&ctx, 0, (i + 1) * SEC, 1.0);
        }
        let (adj, state) = servo.sample(&ctx, i64::MIN, 4 * SEC, 1.0);
        assert_eq!(state, AlgorithmState::Jump);
        assert!(adj.abs() <= ctx.max_frequency);

        let (adj, _) = servo.sample(&ctx, i64::MAX, 5 * SEC, 1.0);
        assert!(adj.abs() <= ctx.max_frequency);
    }

    #[test]
    fn test_reference_wraps_on_huge_interval() {
        let mut servo = LinregServo::new(800_000_000.0);
        let ctx = Loop::new(0.0, 0.0).ctx;

        servo.sample(&ctx, 0, 0, 1.0);
        // With the clock slowed to 0.2 the uncorrected interval is past i64::MAX
        servo.sample(&ctx, 0, i64::MAX as u64, 1.0);
        let x_interval = i64::MAX as f64 / (1.0 + -800_000_000.0 / NSEC_PER_SEC);
        assert!(x_interval > i64::MAX as f64);
        assert_eq!(servo.reference.x, x_interval as i128 as i64 as u64);
    }

    #[test]
    fn test_sync_interval_ignores_invalid() {
        let mut servo = LinregServo::new(0.0);
        servo.set_sync_interval(0.25);
        servo.set_sync_interval(0.0);
        servo.set_sync_interval(f64::NAN);
        assert_eq!(servo.update_interval, 0.25);
    }
}
