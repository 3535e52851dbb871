//! HTTP implementation of [`RemoteTransport`].
//!
//! Object calls go to `{address}{data_path}/{action}/{schema}/{table}/` with
//! the session token as a bearer credential. Session calls go to
//! `{address}{session_path}/`.

use crate::config::HttpConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{
    Discovery, PasswordRequest, RemoteTransport, RetrievalRequest, SessionEnvelope, SessionInfo,
    SessionRequest, SignatureResponse, StorageRequest,
};
use async_trait::async_trait;
use remora_types::{Criteria, Location, Object, ObjectId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Talks to remote servers over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpConfig,
    client: Client,
}

impl HttpTransport {
    /// Creates a transport. Fails only if the TLS backend cannot initialize.
    pub fn new(config: HttpConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn data_url(&self, action: &str, location: &Location) -> String {
        format!(
            "{}{}/{}/{}/{}/",
            location.address.trim_end_matches('/'),
            self.config.data_path,
            action,
            urlencoding::encode(&location.schema),
            urlencoding::encode(&location.table),
        )
    }

    fn session_url(&self, address: &str, suffix: &str) -> String {
        format!(
            "{}{}/{}",
            address.trim_end_matches('/'),
            self.config.session_path,
            suffix
        )
    }

    /// Sends a request and decodes a JSON body, mapping failure statuses.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        address: &str,
        schema: Option<&str>,
    ) -> SyncResult<T> {
        let response = check(request, address, schema).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(format!("invalid response body: {e}")))
    }

    async fn send_session(&self, request: RequestBuilder, address: &str) -> SyncResult<SessionInfo> {
        let envelope: SessionEnvelope = self.send(request, address, None).await?;
        Ok(envelope.session)
    }
}

async fn check(request: RequestBuilder, address: &str, schema: Option<&str>) -> SyncResult<Response> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthorized {
            address: address.to_string(),
        },
        StatusCode::FORBIDDEN => SyncError::Forbidden {
            address: address.to_string(),
            schema: schema.map(str::to_string),
        },
        StatusCode::CONFLICT => SyncError::Conflict(message),
        _ => SyncError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn discover(
        &self,
        location: &Location,
        criteria: &Criteria,
        token: &str,
    ) -> SyncResult<Discovery> {
        debug!("discovery at {location}");
        let request = self
            .client
            .post(self.data_url("discovery", location))
            .bearer_auth(token)
            .json(criteria);
        self.send(request, &location.address, Some(&location.schema))
            .await
    }

    async fn retrieve(
        &self,
        location: &Location,
        ids: &[ObjectId],
        background: bool,
        token: &str,
    ) -> SyncResult<Vec<Object>> {
        debug!("retrieving {} objects from {location}", ids.len());
        let body = RetrievalRequest {
            ids: ids.to_vec(),
            background,
        };
        let request = self
            .client
            .post(self.data_url("retrieval", location))
            .bearer_auth(token)
            .json(&body);
        self.send(request, &location.address, Some(&location.schema))
            .await
    }

    async fn store(
        &self,
        location: &Location,
        objects: &[Value],
        token: &str,
    ) -> SyncResult<Vec<Object>> {
        debug!("storing {} objects at {location}", objects.len());
        let body = StorageRequest {
            objects: objects.to_vec(),
        };
        let request = self
            .client
            .post(self.data_url("storage", location))
            .bearer_auth(token)
            .json(&body);
        self.send(request, &location.address, Some(&location.schema))
            .await
    }

    async fn signature(&self, address: &str, schema: &str, token: &str) -> SyncResult<String> {
        let url = format!(
            "{}{}/signature/{}/",
            address.trim_end_matches('/'),
            self.config.data_path,
            urlencoding::encode(schema),
        );
        let request = self.client.get(url).bearer_auth(token);
        let response: SignatureResponse = self.send(request, address, Some(schema)).await?;
        Ok(response.signature)
    }

    async fn create_session(
        &self,
        address: &str,
        request: &SessionRequest,
    ) -> SyncResult<SessionInfo> {
        let request = self.client.post(self.session_url(address, "")).json(request);
        self.send_session(request, address).await
    }

    async fn fetch_session(&self, address: &str, handle: &str) -> SyncResult<SessionInfo> {
        let request = self
            .client
            .get(self.session_url(address, ""))
            .query(&[("handle", handle)]);
        self.send_session(request, address).await
    }

    async fn authenticate(
        &self,
        address: &str,
        request: &PasswordRequest,
    ) -> SyncResult<SessionInfo> {
        let request = self
            .client
            .post(self.session_url(address, "htpasswd/"))
            .json(request);
        self.send_session(request, address).await
    }

    async fn delete_session(&self, address: &str, handle: &str) -> SyncResult<()> {
        let request = self
            .client
            .delete(self.session_url(address, ""))
            .query(&[("handle", handle)]);
        check(request, address, None).await?;
        Ok(())
    }
}
