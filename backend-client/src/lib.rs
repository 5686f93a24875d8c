//! HTTP client for the backend session API.
//!
//! The session runtime consumes the backend through the [`SessionApi`]
//! trait; [`SessionApiClient`] is the reqwest implementation. The client
//! deliberately knows nothing about retries, breakers, or caching — it
//! performs one call per method and maps every failure into the
//! [`ApplicationError`] taxonomy (transport errors included), so the
//! layers above can make retry decisions from `ErrorKind` alone.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use valo_protocol::{ApplicationError, CorrelationId, ErrorKind, ValuationSession, classify_status};

/// Default backend origin for local development.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Header used to stitch client and backend logs together.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const SESSIONS_PATH: &str = "api/valuation/sessions";
const HEALTH_PATH: &str = "health";

/// Connection settings for [`SessionApiClient`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("valo-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Backend `/health` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub environment: String,
    pub timestamp: String,
}

/// The session endpoints as consumed by the synchronization layer.
///
/// A trait seam so orchestration code can be exercised against scripted
/// in-process fakes instead of a live HTTP server.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// `POST /api/valuation/sessions` — create the session; 409 when a
    /// session for the same report already exists.
    async fn create_session(
        &self,
        session: &ValuationSession,
        correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError>;

    /// `GET /api/valuation/sessions/{report_id}`.
    async fn fetch_session(
        &self,
        report_id: &str,
        correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError>;

    /// `PUT /api/valuation/sessions/{report_id}` — replace mutable fields.
    async fn update_session(
        &self,
        session: &ValuationSession,
        correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError>;
}

/// reqwest-backed implementation of [`SessionApi`].
pub struct SessionApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl SessionApiClient {
    pub fn new(config: BackendConfig) -> Result<Self, ApplicationError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ApplicationError::validation(format!("invalid backend base URL: {e}"))
                .with_context("baseUrl", config.base_url.as_str())
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| {
                ApplicationError::integration(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { http, base_url })
    }

    /// Liveness probe against the backend's `/health` endpoint.
    pub async fn health(&self) -> Result<HealthStatus, ApplicationError> {
        let url = self.endpoint(&[HEALTH_PATH])?;
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        read_response(response).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApplicationError> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url.path_segments_mut().map_err(|()| {
                ApplicationError::validation("backend base URL cannot be a base")
            })?;
            parts.pop_if_empty();
            for segment in segments {
                for piece in segment.split('/') {
                    parts.push(piece);
                }
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl SessionApi for SessionApiClient {
    async fn create_session(
        &self,
        session: &ValuationSession,
        correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError> {
        let url = self.endpoint(&[SESSIONS_PATH])?;
        tracing::debug!(
            report_id = %session.report_id,
            correlation = %correlation,
            "creating session on backend"
        );
        let response = self
            .http
            .post(url)
            .header(CORRELATION_HEADER, correlation.as_str())
            .json(session)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }

    async fn fetch_session(
        &self,
        report_id: &str,
        correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError> {
        let url = self.endpoint(&[SESSIONS_PATH, report_id])?;
        tracing::debug!(report_id, correlation = %correlation, "fetching session from backend");
        let response = self
            .http
            .get(url)
            .header(CORRELATION_HEADER, correlation.as_str())
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }

    async fn update_session(
        &self,
        session: &ValuationSession,
        correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError> {
        let url = self.endpoint(&[SESSIONS_PATH, &session.report_id])?;
        tracing::debug!(
            report_id = %session.report_id,
            correlation = %correlation,
            "updating session on backend"
        );
        let response = self
            .http
            .put(url)
            .header(CORRELATION_HEADER, correlation.as_str())
            .json(session)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }
}

/// Error body the backend attaches to non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Map a transport-level failure. Timeouts get their own kind so the
/// retry layer can distinguish a slow backend from an unreachable one.
fn transport_error(error: reqwest::Error) -> ApplicationError {
    if error.is_timeout() {
        ApplicationError::new(ErrorKind::Timeout, format!("backend request timed out: {error}"))
    } else {
        ApplicationError::network(format!("backend request failed: {error}"))
    }
}

/// Parse a `Retry-After` header; only the delta-seconds form is honored.
fn retry_after_hint(response: &Response) -> Option<Duration> {
    let raw = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

async fn read_response<T: DeserializeOwned>(response: Response) -> Result<T, ApplicationError> {
    let status = response.status();
    if status.is_success() {
        return parse_body(response, status).await;
    }

    let retry_after = retry_after_hint(&response);
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = body
        .message
        .unwrap_or_else(|| format!("backend request failed with status {status}"));
    let mut error = classify_status(status.as_u16(), message);
    if let Some(delay) = retry_after {
        error = error.with_retry_after(delay);
    }
    Err(error)
}

async fn parse_body<T: DeserializeOwned>(
    response: Response,
    status: StatusCode,
) -> Result<T, ApplicationError> {
    response.json::<T>().await.map_err(|e| {
        ApplicationError::integration(format!("malformed backend response body: {e}"))
            .with_context("httpStatus", status.as_u16())
    })
}
