//! Domain and protocol types for vmexpired
//!
//! This crate defines the types every other crate agrees on:
//! - VM records and their lifecycle status
//! - Tasks handed to the dispatcher
//! - Control-socket commands, responses and events
//! - Versioning

mod commands;
mod events;
mod tasks;
mod types;

pub use commands::*;
pub use events::*;
pub use tasks::*;
pub use types::*;

/// Current control protocol version
pub const API_VERSION: u32 = 1;
