//! Shared utilities for vmexpired
//!
//! This crate provides:
//! - ID types (VmId, ProjectId, ClientId, TaskId)
//! - Clock helpers (UTC wall clock with a debug-only mock override, day arithmetic)
//! - Default paths for socket, data, and config files

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
