//! TEMPO Test - Closed-loop simulation harness for servo validation
//!
//! Provides:
//! - Simulated clocks with frequency error and timestamp jitter
//! - A servo loop that applies frequency and step corrections the way a
//!   synchronization daemon does
//! - Convergence reports for comparing algorithms

pub mod simulator;

pub use simulator::*;
