//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    #[serde(default)]
    pub service: RawServiceConfig,

    #[serde(default)]
    pub expiration: RawExpirationConfig,

    #[serde(default)]
    pub scheduler: RawSchedulerConfig,

    #[serde(default)]
    pub dispatch: RawDispatchConfig,

    #[serde(default)]
    pub adapters: RawAdapterConfig,

    #[serde(default)]
    pub compute: RawComputeConfig,

    #[serde(default)]
    pub notifier: RawNotifierConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: /run/vmexpire/vmexpired.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,
}

/// Expiration bounds
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawExpirationConfig {
    /// Lifetime granted at creation (default 60)
    pub max_vm_duration_days: Option<u32>,

    /// Ceiling on cumulative extension (default 30)
    pub max_vm_extend_days: Option<u32>,

    /// Warning lead time before expiration, 0 disables the warning (default 10)
    pub notify_before_days: Option<u32>,

    /// Projects whose VMs are never expired
    #[serde(default)]
    pub excluded_projects: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSchedulerConfig {
    pub tick_interval_seconds: Option<u64>,

    /// Upper bound on records examined per sweep
    pub batch_size: Option<usize>,

    /// Records processed concurrently within one sweep
    pub sweep_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDispatchConfig {
    pub mode: Option<RawDispatchMode>,

    /// Worker pool size (queued mode)
    pub workers: Option<usize>,

    /// How often idle workers re-check the queue
    pub poll_interval_ms: Option<u64>,

    /// How long shutdown waits for in-flight tasks
    pub drain_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawDispatchMode {
    Inline,
    Queued,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawAdapterConfig {
    /// Timeout applied to every notifier and deleter call
    pub call_timeout_seconds: Option<u64>,
}

/// Compute provider endpoint
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawComputeConfig {
    /// Base URL of the compute API (default http://controller:8774/v2.1)
    pub url: Option<String>,

    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawNotifierConfig {
    /// "log" (default) or "relay"
    pub kind: Option<RawNotifierKind>,

    /// Mail relay endpoint, required for the relay notifier
    pub relay_url: Option<String>,

    /// Sender address put on outgoing mail
    pub from: Option<String>,

    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawNotifierKind {
    Log,
    Relay,
}
