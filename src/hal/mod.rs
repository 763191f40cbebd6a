//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits
//! defined in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: Test and desktop implementations (no hardware required)
//!
//! Board drivers (servo PWM, MPU6050, MCP3008, GPIO buttons) implement the
//! same traits outside this crate.

pub mod mock;

pub use mock::*;
