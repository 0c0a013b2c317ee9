//! Error types returned by supervisor operations.
//!
//! Single-service operations return one [`SupervisorError`]. Bulk operations
//! (`Target::All`) never stop at the first failure; they collect every
//! per-service failure into an [`AggregateError`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// `set_spawn_timeout` was never called.
    #[error("spawn timeout not set, please set it before a process is spawned")]
    TimeoutNotSet,

    /// Log buffers need room for at least one line.
    #[error("log buffer capacity must be positive, got {capacity}")]
    InvalidLogCapacity { capacity: usize },

    #[error("service `{name}` is not registered")]
    UnknownService { name: String },

    #[error("can't start `{name}` because it's already running")]
    AlreadyRunning { name: String },

    #[error("service `{name}` is not running")]
    NotRunning { name: String },

    /// Pipes could not be wired or the process could not be started.
    #[error("failed to spawn `{name}`: {reason}")]
    Spawn { name: String, reason: String },

    #[error("process `{name}` exited within {grace:?} of starting ({status}), check the logs for errors")]
    EarlyExit {
        name: String,
        grace: Duration,
        status: String,
    },

    #[error("couldn't kill `{name}`: {reason}")]
    Signal { name: String, reason: String },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl SupervisorError {
    /// Short stable label for structured logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::TimeoutNotSet => "timeout_not_set",
            SupervisorError::InvalidLogCapacity { .. } => "invalid_log_capacity",
            SupervisorError::UnknownService { .. } => "unknown_service",
            SupervisorError::AlreadyRunning { .. } => "already_running",
            SupervisorError::NotRunning { .. } => "not_running",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::EarlyExit { .. } => "early_exit",
            SupervisorError::Signal { .. } => "signal_failed",
            SupervisorError::Aggregate(_) => "aggregate",
        }
    }

    /// True for configuration problems (as opposed to per-service state).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SupervisorError::TimeoutNotSet | SupervisorError::InvalidLogCapacity { .. }
        )
    }
}

/// Failures collected from a bulk start/stop, in the order they were attempted.
#[derive(Debug, Default)]
pub struct AggregateError {
    failures: Vec<(String, SupervisorError)>,
}

impl AggregateError {
    pub fn push(&mut self, service: impl Into<String>, err: SupervisorError) {
        self.failures.push((service.into(), err));
    }

    pub fn failures(&self) -> &[(String, SupervisorError)] {
        &self.failures
    }

    /// The failure recorded for `service`, if any.
    pub fn get(&self, service: &str) -> Option<&SupervisorError> {
        self.failures
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, err)| err)
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} service(s) failed:", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, "\n\t* {}: {}", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
