//! Connection profiles and client settings
//!
//! Settings are read from JSON files. The global file lives at
//! `$HOME/.gizmo/config.json` and a project-local file at `./.gizmo/config.json`;
//! local entries override global ones by connection name.
//!
//! ```json
//! {
//!   "connections": {
//!     "default": {
//!       "document_endpoint": "https://localhost:8081",
//!       "graph_endpoint": "localhost",
//!       "graph_port": 443,
//!       "auth_key": "secret",
//!       "database_id": "db",
//!       "graph_id": "graph",
//!       "partition_key": "/pk"
//!     }
//!   },
//!   "retry": { "max_retries": 5, "wait_base_secs": 5.0, "max_wait_secs": 60 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GizmoError, GizmoResult};
use crate::retry::RetryOptions;

/// A named remote endpoint. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionProfile {
    /// HTTP base URL of the document store (document back end)
    #[serde(default)]
    pub document_endpoint: String,

    /// Host of the graph protocol server (graph back end)
    #[serde(default)]
    pub graph_endpoint: String,

    /// Port of the graph protocol server
    #[serde(default = "default_graph_port")]
    pub graph_port: u16,

    #[serde(default)]
    pub auth_key: String,

    #[serde(default)]
    pub database_id: String,

    #[serde(default)]
    pub graph_id: String,

    #[serde(default)]
    pub partition_key: Option<String>,

    /// Side-effect-free query used to verify connectivity
    #[serde(default = "default_probe_query")]
    pub probe_query: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_graph_port() -> u16 {
    443
}

fn default_probe_query() -> String {
    "RETURN 1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            document_endpoint: String::new(),
            graph_endpoint: String::new(),
            graph_port: default_graph_port(),
            auth_key: String::new(),
            database_id: String::new(),
            graph_id: String::new(),
            partition_key: None,
            probe_query: default_probe_query(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ConnectionProfile {
    /// Collection path used both as resource link and graph-server user name
    pub fn resource_path(&self) -> String {
        format!("/dbs/{}/colls/{}", self.database_id, self.graph_id)
    }

    /// Copy of the profile with the credential masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth_key.is_empty() {
            copy.auth_key = "********".to_string();
        }
        copy
    }
}

/// Full client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GizmoConfig {
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionProfile>,

    #[serde(default)]
    pub retry: Option<RetryOptions>,
}

impl GizmoConfig {
    /// Path of the per-user configuration file
    pub fn global_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".gizmo").join("config.json"))
    }

    /// Path of the working-directory configuration file
    pub fn local_path() -> PathBuf {
        PathBuf::from(".gizmo").join("config.json")
    }

    /// Load a single file. A missing file yields an empty configuration.
    pub fn load(path: impl AsRef<Path>) -> GizmoResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No configuration at {}", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            GizmoError::Configuration(format!("Invalid configuration {}: {}", path.display(), e))
        })
    }

    /// Load global then local settings, local overriding global
    pub fn load_layered(global: Option<&Path>, local: &Path) -> GizmoResult<Self> {
        let mut merged = match global {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        merged.merge(Self::load(local)?);
        Ok(merged)
    }

    /// Load from the default global and local locations
    pub fn load_default() -> GizmoResult<Self> {
        let global = Self::global_path();
        Self::load_layered(global.as_deref(), &Self::local_path())
    }

    /// Overlay `other` on top of this configuration
    pub fn merge(&mut self, other: GizmoConfig) {
        self.connections.extend(other.connections);
        if other.retry.is_some() {
            self.retry = other.retry;
        }
    }

    /// Look up a profile; unknown names are a configuration error
    pub fn profile(&self, name: &str) -> GizmoResult<&ConnectionProfile> {
        self.connections
            .get(name)
            .ok_or_else(|| GizmoError::Configuration(format!("Connection '{}' does not exist", name)))
    }

    /// Retry settings, falling back to defaults
    pub fn retry_options(&self) -> RetryOptions {
        self.retry.clone().unwrap_or_default()
    }

    /// First configured connection name, used as the CLI default
    pub fn default_connection(&self) -> Option<&str> {
        if self.connections.contains_key("default") {
            return Some("default");
        }
        self.connections.keys().next().map(String::as_str)
    }
}
