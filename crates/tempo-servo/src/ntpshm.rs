//! NTP shared-memory servo
//!
//! Does not steer the clock. Every sample is published as an NTP SHM
//! refclock record so that an NTP daemon can discipline the clock instead.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{AlgorithmState, SampleContext, ServoAlgorithm, ServoError, ServoKind, ServoResult};

/// Base System V key of NTP SHM units ("NTP0")
pub const SHM_KEY_BASE: i32 = 0x4e54_5030;

/// Precision advertised to the reader (log2 seconds)
const SHM_PRECISION: i32 = -30;

const LEAP_NOWARNING: i32 = 0;
const LEAP_ADDSECOND: i32 = 1;
const LEAP_DELSECOND: i32 = 2;

/// NTP SHM record, laid out the way NTP readers expect it
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShmTime {
    pub mode: i32,
    pub count: i32,
    pub clock_sec: i64,
    pub clock_usec: i32,
    pub receive_sec: i64,
    pub receive_usec: i32,
    pub leap: i32,
    pub precision: i32,
    pub nsamples: i32,
    pub valid: i32,
    pub clock_nsec: u32,
    pub receive_nsec: u32,
    pub dummy: [i32; 8],
}

/// Shared handle to one SHM unit
#[derive(Clone, Debug)]
pub struct NtpShmSegment {
    unit: i32,
    record: Arc<Mutex<ShmTime>>,
}

impl NtpShmSegment {
    fn new(unit: i32) -> Self {
        let record = ShmTime {
            mode: 1,
            precision: SHM_PRECISION,
            nsamples: 3,
            ..ShmTime::default()
        };
        NtpShmSegment {
            unit,
            record: Arc::new(Mutex::new(record)),
        }
    }

    pub fn unit(&self) -> i32 {
        self.unit
    }

    /// System V key of this unit
    pub fn key(&self) -> i32 {
        SHM_KEY_BASE + self.unit
    }

    /// Copy of the record
    pub fn snapshot(&self) -> ShmTime {
        *self.record.lock()
    }

    /// Latest published sample, `None` while the record is not valid
    pub fn read(&self) -> Option<ShmTime> {
        let record = self.record.lock();
        (record.valid != 0).then_some(*record)
    }
}

fn split_ns(ns: u64) -> (i64, i32, u32) {
    let sec = (ns / 1_000_000_000) as i64;
    let nsec = (ns % 1_000_000_000) as u32;
    (sec, (nsec / 1000) as i32, nsec)
}

/// Servo that publishes samples to NTP shared memory
#[derive(Debug)]
pub struct NtpShmServo {
    segment: NtpShmSegment,
    leap: i32,
}

impl NtpShmServo {
    pub fn new(unit: i32) -> ServoResult<Self> {
        if unit < 0 {
            return Err(ServoError::init_failed(
                ServoKind::NtpShm,
                format!("invalid SHM unit {}", unit),
            ));
        }
        Ok(NtpShmServo {
            segment: NtpShmSegment::new(unit),
            leap: LEAP_NOWARNING,
        })
    }

    /// Handle for the consumer side
    pub fn segment(&self) -> NtpShmSegment {
        self.segment.clone()
    }
}

impl ServoAlgorithm for NtpShmServo {
    fn sample(
        &mut self,
        _ctx: &SampleContext,
        offset: i64,
        local_ts: u64,
        _weight: f64,
    ) -> (f64, AlgorithmState) {
        let clock_ts = if offset >= 0 {
            local_ts.saturating_sub(offset as u64)
        } else {
            local_ts.saturating_add(offset.unsigned_abs())
        };
        let (clock_sec, clock_usec, clock_nsec) = split_ns(clock_ts);
        let (receive_sec, receive_usec, receive_nsec) = split_ns(local_ts);

        let mut record = self.segment.record.lock();
        record.mode = 1;
        record.count = record.count.wrapping_add(1);
        record.valid = 0;

        record.clock_sec = clock_sec;
        record.clock_usec = clock_usec;
        record.clock_nsec = clock_nsec;
        record.receive_sec = receive_sec;
        record.receive_usec = receive_usec;
        record.receive_nsec = receive_nsec;
        record.leap = self.leap;
        record.precision = SHM_PRECISION;

        record.count = record.count.wrapping_add(1);
        record.valid = 1;

        (0.0, AlgorithmState::Unlocked)
    }

    fn reset(&mut self) {}

    fn set_sync_interval(&mut self, _interval: f64) {}

    fn leap(&mut self, leap: i32) {
        self.leap = match leap {
            1 => LEAP_ADDSECOND,
            -1 => LEAP_DELSECOND,
            _ => LEAP_NOWARNING,
        };
    }

    fn destroy(self: Box<Self>) {
        self.segment.record.lock().valid = 0;
    }
}
