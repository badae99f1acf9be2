//! Domain layer for the delivery engine.
//!
//! This module contains value objects shared by the engine components.

pub mod value_objects;

pub use value_objects::*;

// Re-export delivery enums from database models for convenience
pub use crate::database::models::{DeliveryChannel, DeliveryStatus};
