//! Capability interfaces for vmexpired
//!
//! This crate defines the seam between the expiration core and the outside
//! world: a notifier that reaches VM owners and a deleter that talks to the
//! compute provider. It contains no provider code itself.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
