//! The valuation session: the unit of synchronized state between the
//! client and the backend for one valuation report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApplicationError;
use crate::values::ValueMap;

/// Which entry flow the user is working in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionView {
    Manual,
    Conversational,
}

impl std::fmt::Display for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionView::Manual => f.write_str("manual"),
            SessionView::Conversational => f.write_str("conversational"),
        }
    }
}

/// Min/max bracket around the point estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationRange {
    pub min: i64,
    pub max: i64,
}

/// Terminal output of a completed valuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationResult {
    pub valuation_id: String,
    pub equity_value: i64,
    pub valuation_range: ValuationRange,
    pub confidence_score: f64,
    pub methodology: String,
    /// Backend-enriched fields we carry but do not interpret.
    #[serde(flatten)]
    pub details: ValueMap,
}

/// Client-held snapshot of one valuation session.
///
/// Identity is two-part: `report_id` is the stable business key shared
/// with the backend, `session_id` the instance assigned at creation and
/// never reused. `updated_at` is monotonically non-decreasing across
/// every write the client observes; [`ValuationSession::touch`] enforces
/// the clamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationSession {
    pub report_id: String,
    pub session_id: String,
    pub current_view: SessionView,
    /// In-progress answers, not yet confirmed.
    #[serde(default)]
    pub partial_data: ValueMap,
    /// Confirmed answers.
    #[serde(default)]
    pub session_data: ValueMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present once the session reached its terminal, complete state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valuation_result: Option<ValuationResult>,
    /// Rendered report body. Large; excluded from durable caches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_html: Option<String>,
}

impl ValuationSession {
    /// Construct an optimistic local session before any backend contact.
    pub fn new_local(report_id: impl Into<String>, view: SessionView, prefilled: ValueMap) -> Self {
        let now = Utc::now();
        Self {
            report_id: report_id.into(),
            session_id: format!("sess_{}", Uuid::new_v4().simple()),
            current_view: view,
            partial_data: prefilled,
            session_data: ValueMap::new(),
            created_at: now,
            updated_at: now,
            valuation_result: None,
            report_html: None,
        }
    }

    /// Identity fields must be present before the session may be cached
    /// or shipped to the backend.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        if self.report_id.trim().is_empty() {
            return Err(ApplicationError::validation("session is missing a reportId")
                .with_context("sessionId", self.session_id.as_str()));
        }
        if self.session_id.trim().is_empty() {
            return Err(ApplicationError::validation("session is missing a sessionId")
                .with_context("reportId", self.report_id.as_str()));
        }
        Ok(())
    }

    /// A session is complete once any terminal artifact exists.
    pub fn is_complete(&self) -> bool {
        self.valuation_result.is_some() || self.report_html.is_some()
    }

    /// Copy with large artifacts removed, suitable for durable caching.
    pub fn stripped_for_cache(&self) -> Self {
        let mut stripped = self.clone();
        stripped.report_html = None;
        stripped
    }

    /// Version used for compare-before-overwrite cache writes.
    pub fn version(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }

    /// Record a write, keeping `updated_at` non-decreasing even if the
    /// wall clock stepped backwards.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }
}
