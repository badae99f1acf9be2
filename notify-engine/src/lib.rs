//! notify-engine library crate.
//!
//! Multi-channel notification delivery with a persisted delivery log,
//! retry scheduling and read-state tracking.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;

pub use error::{Error, Result};
