use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::domains::sync::types::{MutationPush, PushResponse, SyncConfig};
use crate::errors::{SyncError, SyncResult};

/// The HTTP/JSON surface of the central service.
///
/// The server deduplicates on `client_mutation_id`, so a retried push whose
/// first response was lost is answered as applied-with-no-op rather than
/// double-applied. The engine relies on that and does not deduplicate beyond
/// re-sending the same key.
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Push one queued mutation. `Ok` carries the remote verdict (applied,
    /// conflict, or permanent rejection); `Err` is a transport-level failure
    /// eligible for retry.
    async fn push_mutation(&self, push: &MutationPush) -> SyncResult<PushResponse>;
}

/// Implementation of RemoteSyncClient that talks to the central API server.
pub struct ApiRemoteSyncClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ApiRemoteSyncClient {
    pub fn new(config: &SyncConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }

    fn mutations_url(&self) -> String {
        format!("{}/api/sync/mutations", self.base_url)
    }
}

#[async_trait]
impl RemoteSyncClient for ApiRemoteSyncClient {
    async fn push_mutation(&self, push: &MutationPush) -> SyncResult<PushResponse> {
        debug!(
            "Pushing {} {} for {} (key {})",
            push.action.as_str(),
            push.entity_kind.as_str(),
            push.entity_id,
            push.client_mutation_id
        );

        let response = self
            .client
            .post(self.mutations_url())
            .json(push)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout
                } else {
                    SyncError::Network(format!("Failed to push mutation: {}", e))
                }
            })?;

        let status = response.status();

        // 5xx means the server may or may not have applied the mutation;
        // the idempotency key makes the retry safe either way.
        if status.is_server_error() {
            return Err(SyncError::ServerError(format!(
                "Server returned {} for mutation {}",
                status, push.client_mutation_id
            )));
        }

        if status == StatusCode::CONFLICT {
            let body: PushResponse = response.json().await.map_err(|e| {
                SyncError::Network(format!("Invalid conflict response body: {}", e))
            })?;
            return Ok(body);
        }

        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            warn!(
                "Mutation {} permanently rejected: {} {}",
                push.client_mutation_id, status, message
            );
            return Ok(PushResponse::rejected(&format!("{}: {}", status, message)));
        }

        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("Invalid response body: {}", e)))?;
        Ok(body)
    }
}

impl std::fmt::Debug for ApiRemoteSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRemoteSyncClient")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
