//! Trait definitions for hardware abstraction and networking.
//!
//! This module defines the seams that allow turbine-sync to:
//! - Run against real board drivers or the desktop mocks
//! - Swap the broker transport without touching the shadow logic
//!
//! # Submodules
//!
//! - `hardware`: brake servo, accelerometer, ADC, LED, buttons, delay, clock
//! - `network`: MQTT client trait and message type

pub mod hardware;
pub mod network;

pub use hardware::*;
pub use network::*;
