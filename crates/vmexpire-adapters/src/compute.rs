//! Compute API deleter

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};
use vmexpire_adapter_api::{AdapterError, AdapterResult, Deleter};
use vmexpire_util::VmId;

use crate::{build_client, transport_error};

/// Deletes servers with `DELETE {base_url}/servers/{id}`
pub struct ComputeDeleter {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ComputeDeleter {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> AdapterResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn server_url(&self, vm_id: &VmId) -> String {
        format!("{}/servers/{}", self.base_url, vm_id)
    }
}

#[async_trait]
impl Deleter for ComputeDeleter {
    async fn delete(&self, vm_id: &VmId) -> AdapterResult<()> {
        let url = self.server_url(vm_id);
        debug!(vm_id = %vm_id, url = %url, "Deleting server");

        let mut request = self.client.delete(&url);
        if let Some(token) = &self.auth_token {
            request = request.header("X-Auth-Token", token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        match status {
            s if s.is_success() => {
                info!(vm_id = %vm_id, status = s.as_u16(), "Server deletion accepted");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                info!(vm_id = %vm_id, "Server already gone");
                Err(AdapterError::VmNotFound)
            }
            StatusCode::CONFLICT | StatusCode::FORBIDDEN => {
                warn!(vm_id = %vm_id, status = status.as_u16(), "Server deletion refused");
                Err(AdapterError::Rejected(format!("compute API answered {}", status)))
            }
            _ => {
                warn!(vm_id = %vm_id, status = status.as_u16(), "Server deletion failed");
                Err(AdapterError::Unavailable(format!("compute API answered {}", status)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn delete_sends_token_and_path() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/v2.1/servers/abc")
            .match_header("x-auth-token", "tok")
            .with_status(204)
            .create_async()
            .await;

        let deleter = ComputeDeleter::new(
            format!("{}/v2.1/", server.url()),
            Some("tok".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        deleter.delete(&VmId::new("abc")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let mut server = Server::new_async().await;
        server
            .mock("DELETE", "/servers/abc")
            .with_status(404)
            .create_async()
            .await;
        let deleter = ComputeDeleter::new(server.url(), None, Duration::from_secs(5)).unwrap();

        let err = deleter.delete(&VmId::new("abc")).await.unwrap_err();
        assert_eq!(err, AdapterError::VmNotFound);
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let mut server = Server::new_async().await;
        server
            .mock("DELETE", "/servers/abc")
            .with_status(503)
            .create_async()
            .await;
        let deleter = ComputeDeleter::new(server.url(), None, Duration::from_secs(5)).unwrap();

        let err = deleter.delete(&VmId::new("abc")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn conflict_is_a_refusal() {
        let mut server = Server::new_async().await;
        server
            .mock("DELETE", "/servers/locked")
            .with_status(409)
            .create_async()
            .await;
        let deleter = ComputeDeleter::new(server.url(), None, Duration::from_secs(5)).unwrap();

        let err = deleter.delete(&VmId::new("locked")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        // Bind and release a port so nothing listens on it
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let deleter =
            ComputeDeleter::new(format!("http://{}", addr), None, Duration::from_secs(2)).unwrap();

        let err = deleter.delete(&VmId::new("abc")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
