//! Expiration lifecycle engine for vmexpired
//!
//! This crate is the heart of vmexpired, containing:
//! - The VM record state machine (Active -> Notified -> Expired -> Deleting -> Deleted)
//! - The expiration sweep and the extension/exclusion policy
//! - Task execution and dispatch (inline or through a worker pool)
//! - The scheduler loop and the creation listener

mod clock;
mod dispatch;
mod engine;
mod error;
mod events;
mod executor;
pub mod lifecycle;
mod listener;
mod scheduler;
mod workers;

#[cfg(test)]
mod testing;

pub use clock::*;
pub use dispatch::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use executor::*;
pub use listener::*;
pub use scheduler::*;
pub use workers::*;
