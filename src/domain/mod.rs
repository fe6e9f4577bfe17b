//! Domain layer - Hierarchy records, units and port definitions
//!
//! This module defines the core traits (ports) that driver adapters
//! implement, following hexagonal architecture principles.

pub mod model;
pub mod ports;
pub mod units;

pub use model::*;
pub use ports::*;
pub use units::*;
