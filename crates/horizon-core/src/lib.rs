//! # Horizon Core
//!
//! Shared error type, typed identifiers and result aliases used by every
//! Horizon crate.

pub mod error;
pub mod id;
pub mod result;

pub use error::*;
pub use id::*;
pub use result::*;
