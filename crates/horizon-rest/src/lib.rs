//! # Horizon REST
//!
//! Admin HTTP surface: dead-letter review, job lookup and cancellation,
//! and health checks.

pub mod controllers;
pub mod middleware;
pub mod responses;
pub mod router;
pub mod state;

pub use router::*;
pub use state::*;
