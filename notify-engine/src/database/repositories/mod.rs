//! Repository layer for database access.
//!
//! Each repository is an async trait with a sqlx-backed implementation so the
//! engine can be exercised against doubles where useful.

pub mod delivery_attempt;
pub mod notification;

pub use delivery_attempt::*;
pub use notification::*;
