//! QueryExecutor: the unified interface over both back ends
//!
//! Implemented by:
//! - `DocumentExecutor`: HTTP graph traversal endpoint of a document store
//! - `GraphExecutor`: dedicated graph protocol server over TCP (RESP framing)
//!
//! The variant is chosen once, from an `ExecutorKind`, when the executor is
//! built. Nothing else in the crate inspects which variant is active.

pub mod document;
pub mod graph;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConnectionProfile;
use crate::error::GizmoResult;
use crate::result::ResultAggregate;
use crate::retry::RetryPolicy;

pub use document::DocumentExecutor;
pub use graph::GraphExecutor;

/// Which back end an executor talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Document store graph traversal endpoint (HTTP)
    #[default]
    Document,
    /// Graph protocol server (TCP)
    Graph,
}

impl ExecutorKind {
    /// The other variant
    pub fn toggled(self) -> Self {
        match self {
            ExecutorKind::Document => ExecutorKind::Graph,
            ExecutorKind::Graph => ExecutorKind::Document,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::Document => "document",
            ExecutorKind::Graph => "graph",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "doc" => Ok(ExecutorKind::Document),
            "graph" => Ok(ExecutorKind::Graph),
            other => Err(format!("unknown executor kind '{}'", other)),
        }
    }
}

/// Opens a session to one back end and runs queries against it
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run the profile's probe query. Never errors: failures are logged and
    /// reported as `false`, and the executor stays usable for another attempt.
    async fn test_connection(&self, cancel: &CancellationToken) -> bool;

    /// Send `query` verbatim, drain every result page and time the round trip
    /// (retries included)
    async fn execute_query(&self, query: &str, cancel: &CancellationToken) -> GizmoResult<ResultAggregate>;

    /// Human-readable description of the active endpoint, for banners
    fn remote_message(&self) -> String;

    fn kind(&self) -> ExecutorKind;

    /// Release the transport session. Idempotent.
    async fn close(&self);
}

/// Shared tail of `test_connection`: log the cause and collapse to a bool
pub(crate) fn probe_outcome(remote: &str, outcome: GizmoResult<ResultAggregate>) -> bool {
    match outcome {
        Ok(_) => true,
        Err(e) if e.is_cancelled() => {
            debug!("Connection test cancelled for {}", remote);
            false
        }
        Err(e) => {
            warn!(
                "Unable to connect to {}. Please check your connection settings: {}",
                remote, e
            );
            false
        }
    }
}

/// Builds executors for a profile. The seam the connection manager is tested through.
pub trait ExecutorFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        profile: &ConnectionProfile,
        kind: ExecutorKind,
    ) -> GizmoResult<Arc<dyn QueryExecutor>>;
}

/// Factory for the real network executors
#[derive(Debug, Clone, Default)]
pub struct RemoteExecutorFactory {
    retry: RetryPolicy,
}

impl RemoteExecutorFactory {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

impl ExecutorFactory for RemoteExecutorFactory {
    fn create(
        &self,
        name: &str,
        profile: &ConnectionProfile,
        kind: ExecutorKind,
    ) -> GizmoResult<Arc<dyn QueryExecutor>> {
        debug!("Creating {} executor for connection '{}'", kind, name);
        let executor: Arc<dyn QueryExecutor> = match kind {
            ExecutorKind::Document => Arc::new(DocumentExecutor::new(profile.clone(), self.retry.clone())?),
            ExecutorKind::Graph => Arc::new(GraphExecutor::new(profile.clone(), self.retry.clone())?),
        };
        Ok(executor)
    }
}
