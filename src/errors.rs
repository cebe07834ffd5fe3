//! Error types for the miniboss crate.
//!
//! One error enum covers the whole surface: registry loading, service
//! definitions, context interpolation, engine calls, container startup,
//! readiness polling, and agent contract violations.

use thiserror::Error;

/// Result type for miniboss operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for all miniboss operations
#[derive(Error, Debug)]
pub enum Error {
    /// Registry could not be assembled: duplicate names, unknown
    /// dependencies, cycles, missing services, or invalid exclusions
    #[error("service load error: {message}")]
    ServiceLoad {
        /// What went wrong, naming the offending service
        message: String,
    },

    /// A service definition is malformed
    #[error("invalid service definition: {message}")]
    ServiceDefinition {
        /// What is malformed, naming the offending field and service
        message: String,
    },

    /// Placeholder interpolation against the context failed
    #[error("context error: {message}")]
    Context {
        /// Interpolation failure details, including available keys where
        /// relevant
        message: String,
    },

    /// A container-engine operation failed
    #[error("engine error: {message}")]
    Engine {
        /// Details reported by the engine
        message: String,
    },

    /// A created or restarted container left the running state before it
    /// became ready
    #[error("container {container_name} did not stay running; logs:\n{logs}")]
    ContainerStart {
        /// Name of the container that failed
        container_name: String,
        /// Logs captured from the failed container
        logs: String,
    },

    /// The readiness deadline elapsed while polling a service's ping
    #[error("service {service} did not become ready within {timeout_seconds} seconds")]
    ReadinessTimeout {
        /// The service that never became ready
        service: String,
        /// The deadline that elapsed, in seconds
        timeout_seconds: u64,
    },

    /// An agent was run without an assigned action
    #[error("agent contract violation: {message}")]
    AgentContract {
        /// Description of the misuse
        message: String,
    },

    /// IO error from the filesystem port
    #[error("IO error: {message}")]
    Io {
        /// Error message describing the IO failure
        message: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing or serialization error
    #[error("JSON error: {message}")]
    Json {
        /// Error message describing the JSON failure
        message: String,
        /// The underlying JSON error
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a new service load error
    pub fn service_load(message: impl Into<String>) -> Self {
        Self::ServiceLoad {
            message: message.into(),
        }
    }

    /// Create a new service definition error
    pub fn definition(message: impl Into<String>) -> Self {
        Self::ServiceDefinition {
            message: message.into(),
        }
    }

    /// Create a new context error
    pub fn context(message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
        }
    }

    /// Create a new engine error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Create a new container start error
    pub fn container_start(container_name: impl Into<String>, logs: impl Into<String>) -> Self {
        Self::ContainerStart {
            container_name: container_name.into(),
            logs: logs.into(),
        }
    }

    /// Create a new readiness timeout error
    pub fn readiness_timeout(service: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::ReadinessTimeout {
            service: service.into(),
            timeout_seconds,
        }
    }

    /// Create a new agent contract error
    pub fn agent_contract(message: impl Into<String>) -> Self {
        Self::AgentContract {
            message: message.into(),
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ServiceLoad { .. } => "load",
            Self::ServiceDefinition { .. } => "definition",
            Self::Context { .. } => "context",
            Self::Engine { .. } | Self::ContainerStart { .. } => "engine",
            Self::ReadinessTimeout { .. } => "readiness",
            Self::AgentContract { .. } => "agent",
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
            source: err,
        }
    }
}
