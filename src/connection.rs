//! ConnectionManager: owns the single active executor
//!
//! Two states: `Idle` (nothing open) and `Bound` (one executor, tagged by
//! connection name and variant). Every transition runs under one async lock,
//! so shell commands and bulk loads never observe a half-swapped executor.
//!
//! Opening or switching follows verify-before-replace: the new executor is
//! probed first and the previous one is only disposed once the probe passed.
//! A failed probe leaves the prior binding untouched.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConnectionProfile, GizmoConfig};
use crate::error::{GizmoError, GizmoResult};
use crate::executor::{ExecutorFactory, ExecutorKind, QueryExecutor, RemoteExecutorFactory};
use crate::retry::RetryPolicy;

/// Active executor and the key it was opened for
#[derive(Clone)]
struct Binding {
    name: String,
    kind: ExecutorKind,
    executor: Arc<dyn QueryExecutor>,
}

enum ManagerState {
    Idle,
    Bound(Binding),
}

pub struct ConnectionManager {
    config: GizmoConfig,
    factory: Arc<dyn ExecutorFactory>,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(config: GizmoConfig, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            config,
            factory,
            state: Mutex::new(ManagerState::Idle),
        }
    }

    /// Manager backed by the real network executors, using the configured retry settings
    pub fn with_remote(config: GizmoConfig) -> Self {
        let factory = RemoteExecutorFactory::new(RetryPolicy::new(config.retry_options()));
        Self::new(config, Arc::new(factory))
    }

    pub fn config(&self) -> &GizmoConfig {
        &self.config
    }

    /// Return an executor for `(name, kind)`.
    ///
    /// The bound executor is reused without a new probe when the key matches.
    /// Otherwise a fresh executor is built and probed; only on success is the
    /// previous one closed and replaced.
    pub async fn open(
        &self,
        name: &str,
        kind: ExecutorKind,
        cancel: &CancellationToken,
    ) -> GizmoResult<Arc<dyn QueryExecutor>> {
        let profile = self.config.profile(name)?;
        let mut state = self.state.lock().await;

        if let ManagerState::Bound(binding) = &*state {
            if binding.name == name && binding.kind == kind {
                debug!("Reusing {} executor for '{}'", kind, name);
                return Ok(binding.executor.clone());
            }
        }

        let executor = self.connect(name, profile, kind, cancel).await?;
        self.bind(&mut state, name, kind, executor.clone()).await;
        Ok(executor)
    }

    /// Toggle the back-end variant of the current connection
    pub async fn switch_kind(&self, cancel: &CancellationToken) -> GizmoResult<Arc<dyn QueryExecutor>> {
        let mut state = self.state.lock().await;

        let (name, kind) = match &*state {
            ManagerState::Bound(binding) => (binding.name.clone(), binding.kind.toggled()),
            ManagerState::Idle => {
                return Err(GizmoError::Connection(
                    "No active connection to switch".to_string(),
                ))
            }
        };

        let profile = self.config.profile(&name)?;
        let executor = self.connect(&name, profile, kind, cancel).await?;
        self.bind(&mut state, &name, kind, executor.clone()).await;
        Ok(executor)
    }

    /// Close the current executor, if any, and go back to idle
    pub async fn reset(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, ManagerState::Idle);
        if let ManagerState::Bound(binding) = previous {
            info!("Disconnected from '{}' ({})", binding.name, binding.kind);
            binding.executor.close().await;
        }
    }

    /// Name and variant of the bound executor
    pub async fn current(&self) -> Option<(String, ExecutorKind)> {
        match &*self.state.lock().await {
            ManagerState::Bound(binding) => Some((binding.name.clone(), binding.kind)),
            ManagerState::Idle => None,
        }
    }

    pub async fn executor(&self) -> Option<Arc<dyn QueryExecutor>> {
        match &*self.state.lock().await {
            ManagerState::Bound(binding) => Some(binding.executor.clone()),
            ManagerState::Idle => None,
        }
    }

    async fn connect(
        &self,
        name: &str,
        profile: &ConnectionProfile,
        kind: ExecutorKind,
        cancel: &CancellationToken,
    ) -> GizmoResult<Arc<dyn QueryExecutor>> {
        let executor = self.factory.create(name, profile, kind)?;
        if executor.test_connection(cancel).await {
            return Ok(executor);
        }

        executor.close().await;
        if cancel.is_cancelled() {
            return Err(GizmoError::Cancelled);
        }
        Err(GizmoError::Connection(format!(
            "Unable to connect to '{}' ({}) at {}",
            name,
            kind,
            executor.remote_message()
        )))
    }

    async fn bind(
        &self,
        state: &mut ManagerState,
        name: &str,
        kind: ExecutorKind,
        executor: Arc<dyn QueryExecutor>,
    ) {
        info!("Connected to '{}': {}", name, executor.remote_message());
        let previous = std::mem::replace(
            state,
            ManagerState::Bound(Binding {
                name: name.to_string(),
                kind,
                executor,
            }),
        );
        if let ManagerState::Bound(old) = previous {
            debug!("Closing previous executor for '{}' ({})", old.name, old.kind);
            old.executor.close().await;
        }
    }
}
