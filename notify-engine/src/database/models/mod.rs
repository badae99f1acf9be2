//! Database models for the delivery engine.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod delivery_attempt;
pub mod notification;

pub use delivery_attempt::*;
pub use notification::*;
