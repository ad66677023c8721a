//! Dispatcher endpoint records.

use serde::{Deserialize, Serialize};

use super::schedule::Schedule;
use crate::errors::ConfigError;

/// Basic-auth credentials for a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAuth {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

fn default_enabled() -> bool {
    true
}

/// One dispatcher a processor talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherEndpoint {
    /// Base URL, e.g. `http://localhost:8080`.
    pub url: String,
    /// Disabled endpoints are never selected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Informational priority.
    #[serde(default)]
    pub priority: i32,
    /// Credentials sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<EndpointAuth>,
    /// Where input variables are downloaded from; defaults to `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_manager_url: Option<String>,
    /// Activity window, see [`Schedule`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
}

impl DispatcherEndpoint {
    /// Creates an enabled endpoint with no auth and no schedule.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            priority: 0,
            auth: None,
            asset_manager_url: None,
            schedule: String::new(),
        }
    }

    /// Sets basic-auth credentials.
    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(EndpointAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Sets the asset-manager URL.
    #[must_use]
    pub fn with_asset_manager(mut self, url: impl Into<String>) -> Self {
        self.asset_manager_url = Some(url.into());
        self
    }

    /// Sets the schedule window.
    #[must_use]
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    /// Disables the endpoint.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// URL used for variable downloads.
    #[must_use]
    pub fn asset_url(&self) -> &str {
        self.asset_manager_url.as_deref().unwrap_or(&self.url)
    }

    /// Parses the schedule window.
    pub fn parsed_schedule(&self) -> Result<Schedule, ConfigError> {
        Schedule::parse(&self.schedule)
    }
}
