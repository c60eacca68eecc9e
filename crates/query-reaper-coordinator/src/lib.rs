//! Blocking client for the coordinator's query-status API.
//!
//! [`HttpCoordinator`] talks to a live coordinator; [`StaticCoordinator`]
//! replays a fixed snapshot and records cancellations for dry runs and tests.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use query_reaper_core::{parse_records, RawQueryRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_COORDINATOR_PORT: u16 = 8443;
const STATUS_PATH: &str = "/v1/query";
const UI_QUERY_PATH: &str = "/query.html";

pub trait Coordinator {
    /// Fetches every query the coordinator currently tracks.
    #[allow(clippy::missing_errors_doc)]
    fn fetch_queries(&self) -> Result<Vec<RawQueryRecord>>;

    /// Requests cancellation of one query. Failures are reported in the
    /// returned outcome, never raised.
    fn cancel_query(&self, query_id: &str) -> CancelOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelOutcome {
    pub query_id: String,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl CancelOutcome {
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub verify_tls: bool,
    pub timeout_ms: Option<u64>,
}

impl CoordinatorConfig {
    /// TLS on port 8443 without certificate verification.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_COORDINATOR_PORT,
            use_tls: true,
            verify_tls: false,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }

    #[must_use]
    pub fn status_url(&self) -> String {
        format!("{}{STATUS_PATH}", self.base_url())
    }

    #[must_use]
    pub fn cancel_url(&self, query_id: &str) -> String {
        format!("{}/{query_id}", self.status_url())
    }

    #[must_use]
    pub fn referer(&self, query_id: &str) -> String {
        format!("{}{UI_QUERY_PATH}?{query_id}", self.base_url())
    }
}

pub struct HttpCoordinator {
    config: CoordinatorConfig,
    agent: ureq::Agent,
}

impl HttpCoordinator {
    /// Builds the HTTP agent for the configured transport.
    ///
    /// # Errors
    /// Returns an error when the TLS connector cannot be initialized.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout_ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        if config.use_tls {
            let connector = if config.verify_tls {
                native_tls::TlsConnector::new()
            } else {
                native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
            }
            .context("failed to initialize TLS connector")?;
            builder = builder.tls_connector(Arc::new(connector));
        }

        Ok(Self {
            config,
            agent: builder.build(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}

impl Coordinator for HttpCoordinator {
    fn fetch_queries(&self) -> Result<Vec<RawQueryRecord>> {
        let url = self.config.status_url();
        tracing::debug!(url = %url, "polling coordinator");

        let payload: Value = match self.agent.get(&url).call() {
            Ok(response) => response
                .into_json()
                .with_context(|| format!("coordinator returned a non-JSON listing from {url}"))?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("coordinator returned http status {code} for {url}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure polling {url}: {err}"));
            }
        };

        let records = parse_records(&payload)
            .with_context(|| format!("failed to resolve query listing from {url}"))?;
        tracing::info!(count = records.len(), "polled coordinator queries");
        Ok(records)
    }

    fn cancel_query(&self, query_id: &str) -> CancelOutcome {
        let url = self.config.cancel_url(query_id);
        let referer = self.config.referer(query_id);
        tracing::info!(query_id, url = %url, "cancelling query");

        let (status_code, error) = match self
            .agent
            .delete(&url)
            .set("referer", &referer)
            .call()
        {
            Ok(response) => (Some(response.status()), None),
            Err(ureq::Error::Status(code, _)) => (Some(code), Some(format!("http status {code}"))),
            Err(ureq::Error::Transport(err)) => {
                (None, Some(format!("http transport failure: {err}")))
            }
        };

        match &error {
            None => tracing::info!(query_id, status = status_code, "cancellation accepted"),
            Some(message) => tracing::warn!(query_id, error = %message, "cancellation failed"),
        }

        CancelOutcome {
            query_id: query_id.to_string(),
            status_code,
            error,
        }
    }
}

/// Serves a fixed snapshot and records cancellation requests in order.
#[derive(Debug, Default)]
pub struct StaticCoordinator {
    records: Vec<RawQueryRecord>,
    cancelled: RefCell<Vec<String>>,
}

impl StaticCoordinator {
    #[must_use]
    pub fn new(records: Vec<RawQueryRecord>) -> Self {
        Self {
            records,
            cancelled: RefCell::new(Vec::new()),
        }
    }

    /// Loads a snapshot previously captured from `/v1/query`.
    ///
    /// # Errors
    /// Returns an error when the payload is not a valid query listing.
    pub fn from_json(payload: &Value) -> Result<Self> {
        Ok(Self::new(parse_records(payload)?))
    }

    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.borrow().clone()
    }
}

impl Coordinator for StaticCoordinator {
    fn fetch_queries(&self) -> Result<Vec<RawQueryRecord>> {
        Ok(self.records.clone())
    }

    fn cancel_query(&self, query_id: &str) -> CancelOutcome {
        self.cancelled.borrow_mut().push(query_id.to_string());
        CancelOutcome {
            query_id: query_id.to_string(),
            status_code: None,
            error: None,
        }
    }
}
