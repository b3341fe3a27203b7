//! REST API controllers.

pub mod dead_letter_controller;
pub mod health_controller;
pub mod jobs_controller;

pub use health_controller::*;
