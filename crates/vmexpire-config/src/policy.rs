//! Validated policy structures

use crate::schema::{
    RawAdapterConfig, RawComputeConfig, RawConfig, RawDispatchConfig, RawDispatchMode,
    RawExpirationConfig, RawNotifierConfig, RawNotifierKind, RawSchedulerConfig,
    RawServiceConfig,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use vmexpire_util::{data_dir_without_env, socket_path_without_env, ProjectId};

pub const DEFAULT_MAX_DURATION_DAYS: u32 = 60;
pub const DEFAULT_MAX_EXTEND_DAYS: u32 = 30;
pub const DEFAULT_NOTIFY_BEFORE_DAYS: u32 = 10;
pub const DEFAULT_COMPUTE_URL: &str = "http://controller:8774/v2.1";

const DEFAULT_TICK_SECONDS: u64 = 60;
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_SWEEP_CONCURRENCY: usize = 4;
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_DRAIN_SECONDS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MAIL_FROM: &str = "noreply@localhost";

/// Validated policy ready for use by the core engine
#[derive(Debug, Clone)]
pub struct Policy {
    pub service: ServiceConfig,
    pub expiration: ExpirationPolicy,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub adapters: AdapterConfig,
    pub compute: ComputeConfig,
    pub notifier: NotifierConfig,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            expiration: ExpirationPolicy::from_raw(raw.expiration),
            scheduler: SchedulerConfig::from_raw(raw.scheduler),
            dispatch: DispatchConfig::from_raw(raw.dispatch),
            adapters: AdapterConfig::from_raw(raw.adapters),
            compute: ComputeConfig::from_raw(raw.compute),
            notifier: NotifierConfig::from_raw(raw.notifier),
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            expiration: ExpirationPolicy::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            adapters: AdapterConfig::default(),
            compute: ComputeConfig::from_raw(RawComputeConfig::default()),
            notifier: NotifierConfig::Log,
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(socket_path_without_env),
            data_dir: raw.data_dir.unwrap_or_else(data_dir_without_env),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// The single global expiration rule applied to every VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationPolicy {
    /// Lifetime granted at creation
    pub max_duration_days: u32,
    /// Ceiling on the sum of all extensions of one VM
    pub max_extend_days: u32,
    /// Warning lead time; 0 disables the warning
    pub notify_before_days: u32,
    pub excluded_projects: HashSet<ProjectId>,
}

impl ExpirationPolicy {
    fn from_raw(raw: RawExpirationConfig) -> Self {
        Self {
            max_duration_days: raw.max_vm_duration_days.unwrap_or(DEFAULT_MAX_DURATION_DAYS),
            max_extend_days: raw.max_vm_extend_days.unwrap_or(DEFAULT_MAX_EXTEND_DAYS),
            notify_before_days: raw.notify_before_days.unwrap_or(DEFAULT_NOTIFY_BEFORE_DAYS),
            excluded_projects: raw
                .excluded_projects
                .into_iter()
                .map(ProjectId::new)
                .collect(),
        }
    }

    pub fn max_duration(&self) -> chrono::Duration {
        vmexpire_util::days(self.max_duration_days)
    }

    /// Warning lead time, `None` when warnings are disabled
    pub fn notify_before(&self) -> Option<chrono::Duration> {
        (self.notify_before_days > 0).then(|| vmexpire_util::days(self.notify_before_days))
    }

    pub fn is_project_excluded(&self, project_id: &ProjectId) -> bool {
        self.excluded_projects.contains(project_id)
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::from_raw(RawExpirationConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Upper bound on records examined per sweep
    pub batch_size: usize,
    /// Records processed concurrently within one sweep
    pub sweep_concurrency: usize,
}

impl SchedulerConfig {
    fn from_raw(raw: RawSchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(
                raw.tick_interval_seconds.unwrap_or(DEFAULT_TICK_SECONDS),
            ),
            batch_size: raw.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            sweep_concurrency: raw.sweep_concurrency.unwrap_or(DEFAULT_SWEEP_CONCURRENCY),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_raw(RawSchedulerConfig::default())
    }
}

/// How tasks reach the adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Execute before `submit` returns
    Inline,
    /// Durable queue drained by a worker pool
    Queued,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub workers: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl DispatchConfig {
    fn from_raw(raw: RawDispatchConfig) -> Self {
        let mode = match raw.mode {
            Some(RawDispatchMode::Queued) => DispatchMode::Queued,
            Some(RawDispatchMode::Inline) | None => DispatchMode::Inline,
        };
        Self {
            mode,
            workers: raw.workers.unwrap_or(DEFAULT_WORKERS),
            poll_interval: Duration::from_millis(raw.poll_interval_ms.unwrap_or(DEFAULT_POLL_MS)),
            drain_timeout: Duration::from_secs(
                raw.drain_timeout_seconds.unwrap_or(DEFAULT_DRAIN_SECONDS),
            ),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from_raw(RawDispatchConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Timeout applied to every notifier and deleter call
    pub call_timeout: Duration,
}

impl AdapterConfig {
    fn from_raw(raw: RawAdapterConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(
                raw.call_timeout_seconds
                    .unwrap_or(DEFAULT_CALL_TIMEOUT_SECONDS),
            ),
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::from_raw(RawAdapterConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ComputeConfig {
    pub url: String,
    pub auth_token: Option<String>,
}

impl ComputeConfig {
    fn from_raw(raw: RawComputeConfig) -> Self {
        Self {
            url: raw
                .url
                .unwrap_or_else(|| DEFAULT_COMPUTE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            auth_token: raw.auth_token,
        }
    }
}

/// Which notifier delivers owner messages
#[derive(Debug, Clone)]
pub enum NotifierConfig {
    /// Messages only go to the service log
    Log,
    /// Messages are posted to a mail relay
    Relay {
        url: String,
        from: String,
        auth_token: Option<String>,
    },
}

impl NotifierConfig {
    fn from_raw(raw: RawNotifierConfig) -> Self {
        match (raw.kind, raw.relay_url) {
            (Some(RawNotifierKind::Relay), Some(url)) => NotifierConfig::Relay {
                url,
                from: raw.from.unwrap_or_else(|| DEFAULT_MAIL_FROM.to_string()),
                auth_token: raw.auth_token,
            },
            _ => NotifierConfig::Log,
        }
    }
}
