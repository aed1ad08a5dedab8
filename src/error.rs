//! Error taxonomy for route generation, supervision, invocation and settings

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building the route table
#[derive(Debug, Error)]
pub enum RouteError {
    /// Endpoint files normalize to the same route id; one entry per id
    #[error("{}", join_collisions(.0))]
    DuplicateRouteIds(Vec<RouteCollision>),

    /// The hooks file could not be serialized or written
    #[error("failed to write hooks file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Every endpoint file claiming one route id, sorted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCollision {
    pub id: String,
    pub paths: Vec<String>,
}

impl fmt::Display for RouteCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplicate route id '{}' for endpoint files: {}", self.id, self.paths.join(", "))
    }
}

fn join_collisions(collisions: &[RouteCollision]) -> String {
    collisions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the dispatcher supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The dispatcher exited before the liveness check
    #[error("dispatcher exited during startup ({}): {output}", exit_label(*code))]
    StartupFailure { code: Option<i32>, output: String },

    /// Route table generation failed; nothing was started
    #[error(transparent)]
    RouteTable(#[from] RouteError),

    /// The dispatcher executable could not be launched
    #[error("failed to spawn dispatcher '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Per-invocation failures inside the launcher
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("endpoint '{relative_path}' not found at {}", path.display())]
    EndpointNotFound { relative_path: String, path: PathBuf },

    #[error("payload unavailable: {0}")]
    PayloadUnavailable(String),

    #[error("failed to execute '{command}': {reason}")]
    ExecutionError { command: String, reason: String },
}

impl LaunchError {
    /// Machine-readable error code, printed ahead of the message on stderr
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::EndpointNotFound { .. } => "ENDPOINT_NOT_FOUND",
            LaunchError::PayloadUnavailable(_) => "PAYLOAD_UNAVAILABLE",
            LaunchError::ExecutionError { .. } => "EXECUTION_ERROR",
        }
    }
}

/// Errors raised while persisting settings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A value failed validation; nothing was changed
    #[error("invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write settings file: {0}")]
    Io(#[from] std::io::Error),
}
