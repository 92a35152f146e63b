//! Concrete adapters for vmexpired
//!
//! - [`ComputeDeleter`]: deletes servers through the compute API
//! - [`RelayNotifier`]: posts owner mail to an HTTP mail relay
//! - [`LogNotifier`]: writes owner messages to the service log

mod compute;
mod log;
mod relay;

pub use compute::*;
pub use log::*;
pub use relay::*;

use std::time::Duration;
use vmexpire_adapter_api::AdapterError;

/// Shared HTTP client setup for the adapters
fn build_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| AdapterError::Internal(format!("failed to create HTTP client: {}", e)))
}

/// Map a transport-level failure onto the adapter taxonomy
fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Unavailable(err.to_string())
    }
}
