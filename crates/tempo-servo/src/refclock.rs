//! Reference-clock socket servo
//!
//! Forwards every sample to chrony's SOCK refclock driver over a Unix
//! datagram socket and leaves the clock alone.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{
    AlgorithmState, SampleContext, ServoAlgorithm, ServoError, ServoKind, ServoResult,
    NSEC_PER_SEC,
};

/// "SOCK"
pub const SOCK_MAGIC: i32 = 0x534f_434b;

/// Encoded size of a [`SockSample`]
pub const SOCK_SAMPLE_LEN: usize = 40;

/// One sample in the chrony SOCK wire format
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SockSample {
    pub tv_sec: i64,
    pub tv_usec: i64,
    /// Reference minus local, seconds
    pub offset: f64,
    pub pulse: i32,
    /// 0 none, 1 insert, 2 delete
    pub leap: i32,
    pub magic: i32,
}

impl SockSample {
    fn new(offset: i64, local_ts: u64, leap: i32) -> Self {
        SockSample {
            tv_sec: (local_ts / 1_000_000_000) as i64,
            tv_usec: ((local_ts % 1_000_000_000) / 1000) as i64,
            offset: -(offset as f64) / NSEC_PER_SEC,
            pulse: 0,
            leap,
            magic: SOCK_MAGIC,
        }
    }

    /// Native-endian struct image, padding zeroed
    pub fn to_bytes(&self) -> [u8; SOCK_SAMPLE_LEN] {
        let mut buf = [0u8; SOCK_SAMPLE_LEN];
        buf[0..8].copy_from_slice(&self.tv_sec.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.tv_usec.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.pulse.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.leap.to_ne_bytes());
        // 32..36 is padding
        buf[36..40].copy_from_slice(&self.magic.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != SOCK_SAMPLE_LEN {
            return None;
        }
        let sample = SockSample {
            tv_sec: i64::from_ne_bytes(buf[0..8].try_into().ok()?),
            tv_usec: i64::from_ne_bytes(buf[8..16].try_into().ok()?),
            offset: f64::from_ne_bytes(buf[16..24].try_into().ok()?),
            pulse: i32::from_ne_bytes(buf[24..28].try_into().ok()?),
            leap: i32::from_ne_bytes(buf[28..32].try_into().ok()?),
            magic: i32::from_ne_bytes(buf[36..40].try_into().ok()?),
        };
        (sample.magic == SOCK_MAGIC).then_some(sample)
    }
}

/// Servo that feeds a chrony SOCK refclock
#[derive(Debug)]
pub struct RefclockSockServo {
    socket: UnixDatagram,
    address: PathBuf,
    leap: i32,
}

impl RefclockSockServo {
    pub fn new(address: impl AsRef<Path>) -> ServoResult<Self> {
        let address = address.as_ref();
        if address.as_os_str().is_empty() {
            return Err(ServoError::init_failed(
                ServoKind::RefclockSock,
                "refclock_sock_address is empty",
            ));
        }

        let socket = UnixDatagram::unbound().map_err(|e| {
            ServoError::init_failed(ServoKind::RefclockSock, format!("socket: {}", e))
        })?;

        Ok(RefclockSockServo {
            socket,
            address: address.to_path_buf(),
            leap: 0,
        })
    }

    pub fn address(&self) -> &Path {
        &self.address
    }
}

impl ServoAlgorithm for RefclockSockServo {
    fn sample(
        &mut self,
        _ctx: &SampleContext,
        offset: i64,
        local_ts: u64,
        _weight: f64,
    ) -> (f64, AlgorithmState) {
        let sample = SockSample::new(offset, local_ts, self.leap);

        match self.socket.send_to(&sample.to_bytes(), &self.address) {
            Ok(SOCK_SAMPLE_LEN) => {}
            Ok(sent) => warn!(sent, address = %self.address.display(), "refclock sample truncated"),
            Err(e) => warn!(address = %self.address.display(), "refclock send failed: {}", e),
        }

        (0.0, AlgorithmState::Unlocked)
    }

    fn reset(&mut self) {}

    fn set_sync_interval(&mut self, _interval: f64) {}

    fn leap(&mut self, leap: i32) {
        self.leap = match leap {
            1 => 1,
            -1 => 2,
            _ => 0,
        };
    }

    fn destroy(self: Box<Self>) {}
}
