//! Container-engine port.
//!
//! The orchestration core talks to the container runtime exclusively
//! through the [`ContainerEngine`] trait. The production implementation is
//! [`crate::DockerCli`]; tests substitute a recording fake.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::service::ServiceSpec;
use crate::types::Network;

/// Engine-reported state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but never started
    Created,
    /// Running
    Running,
    /// Paused
    Paused,
    /// Restarting
    Restarting,
    /// Being removed
    Removing,
    /// Exited
    Exited,
    /// Dead
    Dead,
}

impl FromStr for ContainerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "restarting" => Ok(Self::Restarting),
            "removing" => Ok(Self::Removing),
            "exited" => Ok(Self::Exited),
            "dead" => Ok(Self::Dead),
            other => Err(Error::engine(format!("unknown container state: {other}"))),
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// A container the engine reports on the target network
#[derive(Debug, Clone)]
pub struct ExistingContainer {
    /// Engine-assigned container id
    pub id: String,
    /// Container name
    pub name: String,
    /// Current state
    pub state: ContainerState,
    /// Tags of the image the container was created from
    pub image_tags: Vec<String>,
    /// Environment the container was created with
    pub env: HashMap<String, String>,
}

/// Operations the lifecycle engine requires from a container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Ensure a bridge network named `name` exists; return its handle.
    /// Idempotent by name.
    async fn create_network(&self, name: &str) -> Result<Network>;

    /// Remove the network named `name`; absent networks are a no-op
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// List containers on `network` whose names begin with `prefix`
    async fn existing_on_network(
        &self,
        prefix: &str,
        network: &Network,
    ) -> Result<Vec<ExistingContainer>>;

    /// Ensure `tag` exists locally, pulling it if necessary
    async fn check_image(&self, tag: &str) -> Result<()>;

    /// Build `build_dir` with `dockerfile` and tag the result `tag`
    async fn build_image(&self, build_dir: &Path, dockerfile: &str, tag: &str) -> Result<()>;

    /// Create and start a container for `spec` on `network`, named
    /// `prefix` plus a random four-digit suffix, with the service name as
    /// network alias. Verifies the container reaches `running`; returns
    /// its name.
    async fn run_service_on_network(
        &self,
        prefix: &str,
        spec: &ServiceSpec,
        network: &Network,
    ) -> Result<String>;

    /// Start an existing container and verify it reaches `running`
    async fn run_container(&self, id: &str) -> Result<()>;

    /// Stop a container, allowing `timeout` for graceful shutdown
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Remove a stopped container
    async fn remove_container(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_parsing() {
        assert_eq!(
            "running".parse::<ContainerState>().unwrap(),
            ContainerState::Running
        );
        assert_eq!(
            "exited".parse::<ContainerState>().unwrap(),
            ContainerState::Exited
        );
        assert!("warp-drive".parse::<ContainerState>().is_err());
    }

    #[test]
    fn test_container_state_round_trip() {
        for state in [
            ContainerState::Created,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Restarting,
            ContainerState::Removing,
            ContainerState::Exited,
            ContainerState::Dead,
        ] {
            assert_eq!(state.to_string().parse::<ContainerState>().unwrap(), state);
        }
    }
}
