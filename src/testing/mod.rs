//! Testing utilities and mock implementations
//!
//! Lets the channel, the background jobs and the monitors run without a
//! broker or a fleet system.

pub mod mocks;

pub use mocks::*;
