//! TEMPO Servo - Clock servo core for time synchronization daemons
//!
//! This crate turns measured clock offsets into corrective actions:
//! - Algorithm contract (`ServoAlgorithm`) and the closed set of algorithms
//!   (PI, linear regression, NTP SHM, null, reference-clock socket)
//! - Factory applying daemon-wide bounds on top of each algorithm
//! - Lock state machine with offset stability detection
//! - Configuration and error types

pub mod algorithm;
pub mod config;
pub mod error;
pub mod linreg;
pub mod ntpshm;
pub mod nullf;
pub mod pi;
#[cfg(unix)]
pub mod refclock;
pub mod servo;
pub mod stability;
pub mod state;

pub use algorithm::*;
pub use config::*;
pub use error::*;
pub use linreg::*;
pub use ntpshm::*;
pub use nullf::*;
pub use pi::*;
#[cfg(unix)]
pub use refclock::*;
pub use servo::*;
pub use stability::*;
pub use state::*;
