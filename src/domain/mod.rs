//! Domain layer - Core types and port definitions
//!
//! This module defines the capability model and the traits (ports) that
//! the plugin transport and the reconciliation engine implement.

pub mod ports;

pub use ports::*;
