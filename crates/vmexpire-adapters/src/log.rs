//! Log-only notifier

use async_trait::async_trait;
use tracing::info;
use vmexpire_adapter_api::{AdapterResult, Notice, Notifier};

/// Writes owner messages to the service log instead of mailing them.
///
/// Used when no mail relay is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notice: &Notice) -> AdapterResult<()> {
        info!(
            project_id = %notice.project_id,
            vm_id = %notice.vm_id,
            kind = %notice.kind,
            subject = %notice.subject(),
            "Owner notification"
        );
        Ok(())
    }
}
