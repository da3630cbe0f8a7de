//! Gizmo: graph query client core
//!
//! Runs queries against a remote graph database through one of two back ends:
//!
//! - **`DocumentExecutor`**: HTTP traversal endpoint of a document store,
//!   paged results and request-unit accounting.
//! - **`GraphExecutor`**: dedicated graph protocol server over TCP (RESP framing).
//!
//! Both implement the `QueryExecutor` trait. Around them:
//!
//! - **`RetryPolicy`**: throttling-aware bounded backoff
//! - **`ConnectionManager`**: owns the active executor, verify-before-replace
//! - **`BulkLoadEngine`**: line-per-query file loads with bounded parallelism
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gizmo::{ConnectionManager, ExecutorKind, GizmoConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::with_remote(GizmoConfig::load_default()?);
//!     let cancel = CancellationToken::new();
//!
//!     let executor = manager.open("default", ExecutorKind::Document, &cancel).await?;
//!     let result = executor.execute_query("g.V().count()", &cancel).await?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod report;
pub mod result;
pub mod retry;

// ============================================================
// Core types
// ============================================================

pub use config::{ConnectionProfile, GizmoConfig};
pub use connection::ConnectionManager;
pub use error::{GizmoError, GizmoResult};
pub use executor::{
    DocumentExecutor, ExecutorFactory, ExecutorKind, GraphExecutor, QueryExecutor, RemoteExecutorFactory,
};
pub use result::{BulkContext, BulkResult, CommandResult, ErrorResult, OperationResult, ResultAggregate};
pub use retry::{Retried, RetryOptions, RetryPolicy};

// ============================================================
// Bulk loading
// ============================================================

pub use bulk::{BulkItem, BulkLoadEngine, BulkOptions, BulkSummary, QueryLine};
pub use report::{ConsoleSink, MemorySink, ProgressSink};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
