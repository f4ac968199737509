//! HTTP delivery of queued actions.
//!
//! Each action type maps to one endpoint. Deliveries are JSON `POST`s
//! carrying the action id as an idempotency key, so an endpoint that
//! applied a mutation before the response was lost can recognise the
//! replay.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use outbox_common::{ActionType, Error, PendingAction, Result};

use crate::dispatcher::{ActionDispatcher, ActionHandler};

/// Header carrying the action id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
/// Header carrying the action's wire type name.
pub const ACTION_TYPE_HEADER: &str = "X-Action-Type";

/// Where each action type is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpoints {
    /// Base URL that endpoint paths are joined onto.
    pub base_url: String,
    /// Per-type path overrides.
    #[serde(default)]
    pub routes: HashMap<ActionType, String>,
    /// Transport timeout for one request.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl HttpEndpoints {
    /// Endpoints under `base_url` with default routes.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            routes: HashMap::new(),
            timeout: None,
        }
    }

    /// Override the path for one type.
    pub fn with_route(mut self, action_type: ActionType, path: impl Into<String>) -> Self {
        self.routes.insert(action_type, path.into());
        self
    }

    /// Set the per-request transport timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve the endpoint URL for a type.
    ///
    /// # Errors
    /// - Base URL or route is not a valid URL
    pub fn url_for(&self, action_type: ActionType) -> Result<Url> {
        let mut base = Url::parse(&self.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", self.base_url, e)))?;
        // Without a trailing slash `join` would replace the last segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let route = self
            .routes
            .get(&action_type)
            .cloned()
            .unwrap_or_else(|| format!("actions/{}", action_type.kebab_name()));

        base.join(route.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid route for {}: {}", action_type, e)))
    }
}

/// Delivers actions of one type to one URL.
pub struct HttpHandler {
    http: Client,
    url: Url,
}

impl HttpHandler {
    /// Create a handler posting to `url`.
    pub fn new(http: Client, url: Url) -> Self {
        Self { http, url }
    }

    /// Target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ActionHandler for HttpHandler {
    async fn apply(&self, action: &PendingAction) -> Result<()> {
        debug!("POST {} for {}", self.url, action.id);

        let response = self
            .http
            .post(self.url.clone())
            .header(IDEMPOTENCY_HEADER, action.id.as_str())
            .header(ACTION_TYPE_HEADER, action.action_type.as_str())
            .json(&action.payload)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, &body))
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("Delivery timed out: {}", err))
    } else {
        Error::Network(format!("Delivery failed: {}", err))
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    Error::Network(format!("{}: {}", status, body.trim()))
}

impl ActionDispatcher {
    /// Dispatcher with an HTTP handler for every action type.
    ///
    /// # Errors
    /// - Invalid base URL or route
    /// - HTTP client construction failure
    pub fn http(endpoints: &HttpEndpoints) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!("outbox/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = endpoints.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        let mut dispatcher = ActionDispatcher::new();
        for action_type in ActionType::ALL {
            let url = endpoints.url_for(action_type)?;
            dispatcher.register(action_type, Arc::new(HttpHandler::new(http.clone(), url)))?;
        }
        Ok(dispatcher)
    }
}
