use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::{TimelineDomain, TimelineEntity, TimelinePutResponse};
use crate::config::TimelineConfig;

/// Errors surfaced by a timeline client.
///
/// Every variant is a network-level failure and therefore retryable; an
/// application-level rejection arrives as a successful response whose error
/// list is non-empty and is never retried.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("timeline server unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("timeline server returned status {status}: {message}")]
    Status { status: u16, message: String },
}

/// Capability set of the remote Timeline Server.
///
/// The worker owns the client once the service has started and is the only
/// caller of the put operations.
pub trait TimelineClient: Send + Sync + 'static {
    /// Registers an access-control domain.
    fn put_domain(
        &self,
        domain: &TimelineDomain,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Posts one entity.
    fn put_entity(
        &self,
        entity: &TimelineEntity,
    ) -> impl Future<Output = Result<TimelinePutResponse, ClientError>> + Send;

    /// Posts one entity under an attempt/group pair (v1.5 mode).
    fn put_entity_grouped(
        &self,
        attempt_id: Option<&str>,
        group_id: &str,
        entity: &TimelineEntity,
    ) -> impl Future<Output = Result<TimelinePutResponse, ClientError>> + Send;

    /// Whether `flush` does anything for this client.
    fn supports_flush(&self) -> bool {
        false
    }

    /// Flushes buffered writes, when supported.
    fn flush(&self) -> impl Future<Output = Result<(), ClientError>> + Send {
        async { Ok(()) }
    }

    /// Releases client resources. Called exactly once, by whichever side
    /// owns the client when the service stops.
    fn stop(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Wire wrapper for entity puts: the server accepts a batch envelope even for
/// single entities.
#[derive(Serialize)]
struct TimelineEntities<'a> {
    entities: [&'a TimelineEntity; 1],
}

/// HTTP client for the Timeline Server's v1 REST API.
pub struct HttpTimelineClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTimelineClient {
    /// Builds a client for the configured endpoint.
    pub fn new(cfg: &TimelineConfig) -> Result<Self> {
        let timeout = if cfg.request_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.request_timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL of the timeline REST API.
    fn timeline_url(&self) -> String {
        format!("{}/ws/v1/timeline", self.endpoint)
    }

    async fn post_entity(
        &self,
        query: &[(&str, &str)],
        entity: &TimelineEntity,
    ) -> Result<TimelinePutResponse, ClientError> {
        let body = TimelineEntities { entities: [entity] };

        let response = self
            .http
            .post(self.timeline_url())
            .query(query)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        // The server replies with an empty body when everything was accepted.
        if bytes.is_empty() {
            return Ok(TimelinePutResponse::default());
        }

        match serde_json::from_slice(&bytes) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                debug!(error = %e, "unparseable put response body, assuming acceptance");
                Ok(TimelinePutResponse::default())
            }
        }
    }
}

impl TimelineClient for HttpTimelineClient {
    async fn put_domain(&self, domain: &TimelineDomain) -> Result<(), ClientError> {
        let url = format!("{}/domain", self.timeline_url());

        let response = self.http.put(&url).json(domain).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    async fn put_entity(&self, entity: &TimelineEntity) -> Result<TimelinePutResponse, ClientError> {
        self.post_entity(&[], entity).await
    }

    async fn put_entity_grouped(
        &self,
        attempt_id: Option<&str>,
        group_id: &str,
        entity: &TimelineEntity,
    ) -> Result<TimelinePutResponse, ClientError> {
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(attempt) = attempt_id {
            query.push(("appattemptId", attempt));
        }
        query.push(("groupId", group_id));

        self.post_entity(&query, entity).await
    }

    async fn stop(&self) {
        debug!(endpoint = %self.endpoint, "timeline client stopped");
    }
}
