//! HTTP mail relay notifier

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use vmexpire_adapter_api::{AdapterError, AdapterResult, Notice, Notifier};
use vmexpire_api::NotificationKind;
use vmexpire_util::{ProjectId, VmId};

use crate::{build_client, transport_error};

/// Mail envelope as posted to the relay
#[derive(Debug, Serialize)]
struct MailEnvelope<'a> {
    from: &'a str,
    project_id: &'a ProjectId,
    vm_id: &'a VmId,
    kind: NotificationKind,
    subject: String,
    body: String,
}

/// Posts owner mail to an HTTP relay which resolves the project's
/// contacts and does the SMTP delivery
pub struct RelayNotifier {
    client: Client,
    url: String,
    from: String,
    auth_token: Option<String>,
}

impl RelayNotifier {
    pub fn new(
        url: impl Into<String>,
        from: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> AdapterResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            from: from.into(),
            auth_token,
        })
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send(&self, notice: &Notice) -> AdapterResult<()> {
        let envelope = MailEnvelope {
            from: &self.from,
            project_id: &notice.project_id,
            vm_id: &notice.vm_id,
            kind: notice.kind,
            subject: notice.subject(),
            body: notice.body(),
        };

        let mut request = self.client.post(&self.url).json(&envelope);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            debug!(vm_id = %notice.vm_id, kind = %notice.kind, "Mail handed to relay");
            Ok(())
        } else if status.is_client_error() {
            warn!(vm_id = %notice.vm_id, status = status.as_u16(), "Mail relay rejected message");
            Err(AdapterError::Rejected(format!("mail relay answered {}", status)))
        } else {
            Err(AdapterError::Unavailable(format!("mail relay answered {}", status)))
        }
    }
}
