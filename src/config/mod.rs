//! # packfs Configuration Module
//!
//! Centralizes the tunable constants of the transactional core. Constants
//! whose values depend on each other live side by side and the relationships
//! are enforced through compile-time assertions.

pub mod constants;
pub use constants::*;
