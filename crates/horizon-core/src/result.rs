//! Result type aliases for Horizon.

use crate::HorizonError;

/// A specialized `Result` type for Horizon operations.
pub type HorizonResult<T> = Result<T, HorizonError>;
