//! Server endpoint configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Path of the global event feed under the base URL.
pub const DEFAULT_EVENT_PATH: &str = "/global/event";

/// One server the client can mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    pub label: String,
    pub base_url: String,
    /// Working directory the feed is scoped to.
    pub directory: String,
    /// Already-encoded `Basic` token.
    #[serde(default, skip_serializing)]
    pub basic_auth: Option<String>,
    #[serde(default = "default_event_path")]
    pub event_path: String,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub connect_timeout: Option<Duration>,
}

fn default_event_path() -> String {
    DEFAULT_EVENT_PATH.to_owned()
}

impl ServerConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, directory: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: base_url.clone(),
            base_url,
            directory: directory.into(),
            basic_auth: None,
            event_path: default_event_path(),
            extra_headers: BTreeMap::new(),
            connect_timeout: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn with_basic_auth(mut self, token: impl Into<String>) -> Self {
        self.basic_auth = Some(token.into());
        self
    }

    /// Encode `user:password` as the `Basic` token.
    #[must_use]
    pub fn with_basic_credentials(self, user: &str, password: &str) -> Self {
        let token = general_purpose::STANDARD.encode(format!("{user}:{password}"));
        self.with_basic_auth(token)
    }

    #[must_use]
    pub fn with_event_path(mut self, path: impl Into<String>) -> Self {
        self.event_path = path.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// `Authorization` header value, when credentials are configured.
    #[must_use]
    pub fn authorization(&self) -> Option<String> {
        self.basic_auth
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| format!("Basic {token}"))
    }

    /// URL of the event feed.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidUrl` when the base URL does not parse
    /// or cannot carry a path.
    pub fn event_url(&self) -> Result<reqwest::Url, TransportError> {
        let mut url = reqwest::Url::parse(self.base_url.trim())
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        if url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(format!(
                "{}: not a base URL",
                self.base_url
            )));
        }

        let base_path = url.path().trim_end_matches('/').to_owned();
        let event_path = self.event_path.trim_start_matches('/');
        url.set_path(&format!("{base_path}/{event_path}"));
        Ok(url)
    }
}
