//! Configuration validation

use crate::policy::{DEFAULT_MAX_DURATION_DAYS, DEFAULT_NOTIFY_BEFORE_DAYS};
use crate::schema::{RawConfig, RawDispatchMode, RawNotifierKind};
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("[{section}] {field}: {message}")]
    InvalidValue {
        section: &'static str,
        field: &'static str,
        message: String,
    },

    #[error("notify_before_days ({notify}) must be shorter than max_vm_duration_days ({duration})")]
    NoticeExceedsLifetime { notify: u32, duration: u32 },

    #[error("Duplicate excluded project: {0}")]
    DuplicateExcludedProject(String),
}

impl ValidationError {
    fn invalid(section: &'static str, field: &'static str, message: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            section,
            field,
            message: message.into(),
        }
    }
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let expiration = &config.expiration;
    let duration = expiration
        .max_vm_duration_days
        .unwrap_or(DEFAULT_MAX_DURATION_DAYS);
    let notify = expiration
        .notify_before_days
        .unwrap_or(DEFAULT_NOTIFY_BEFORE_DAYS);

    if duration == 0 {
        errors.push(ValidationError::invalid(
            "expiration",
            "max_vm_duration_days",
            "must be at least 1",
        ));
    } else if notify >= duration {
        errors.push(ValidationError::NoticeExceedsLifetime { notify, duration });
    }

    let mut seen = HashSet::new();
    for project in &expiration.excluded_projects {
        if project.trim().is_empty() {
            errors.push(ValidationError::invalid(
                "expiration",
                "excluded_projects",
                "project id cannot be empty",
            ));
        } else if !seen.insert(project) {
            errors.push(ValidationError::DuplicateExcludedProject(project.clone()));
        }
    }

    if config.scheduler.tick_interval_seconds == Some(0) {
        errors.push(ValidationError::invalid(
            "scheduler",
            "tick_interval_seconds",
            "must be greater than 0",
        ));
    }
    if config.scheduler.batch_size == Some(0) {
        errors.push(ValidationError::invalid(
            "scheduler",
            "batch_size",
            "must be greater than 0",
        ));
    }
    if config.scheduler.sweep_concurrency == Some(0) {
        errors.push(ValidationError::invalid(
            "scheduler",
            "sweep_concurrency",
            "must be greater than 0",
        ));
    }

    let queued = config.dispatch.mode == Some(RawDispatchMode::Queued);
    if queued && config.dispatch.workers == Some(0) {
        errors.push(ValidationError::invalid(
            "dispatch",
            "workers",
            "queued dispatch needs at least one worker",
        ));
    }
    if config.dispatch.poll_interval_ms == Some(0) {
        errors.push(ValidationError::invalid(
            "dispatch",
            "poll_interval_ms",
            "must be greater than 0",
        ));
    }

    if config.adapters.call_timeout_seconds == Some(0) {
        errors.push(ValidationError::invalid(
            "adapters",
            "call_timeout_seconds",
            "must be greater than 0",
        ));
    }

    if let Some(url) = &config.compute.url {
        if !is_http_url(url) {
            errors.push(ValidationError::invalid(
                "compute",
                "url",
                format!("'{}' is not an http(s) URL", url),
            ));
        }
    }

    if config.notifier.kind == Some(RawNotifierKind::Relay) {
        match &config.notifier.relay_url {
            Some(url) if is_http_url(url) => {}
            Some(url) => errors.push(ValidationError::invalid(
                "notifier",
                "relay_url",
                format!("'{}' is not an http(s) URL", url),
            )),
            None => errors.push(ValidationError::invalid(
                "notifier",
                "relay_url",
                "required when kind = \"relay\"",
            )),
        }
    }

    errors
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
