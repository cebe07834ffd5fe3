//! Core types for orchestration runs.
//!
//! This module provides the shared option record handed to every agent,
//! the network handle, the group-name newtype used to namespace containers
//! and networks, and the closed enumerations describing agent progress.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Error, Result};

/// A user network the stack runs on.
///
/// The `id` starts empty and is filled by the orchestrator once the engine
/// has reported or created the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Network name
    pub name: String,
    /// Engine-assigned network id; empty until resolved
    pub id: String,
}

impl Network {
    /// Create a network handle with an unresolved id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
        }
    }
}

/// Options for a single orchestrator run.
///
/// Immutable once the orchestrator has filled the network id; agents only
/// ever see the record behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Options {
    /// The user network to attach containers to
    pub network: Network,
    /// Deadline for readiness polling and container stop
    pub timeout: Duration,
    /// Remove containers (and, on stop, the network) after stopping
    pub remove: bool,
    /// Base directory for relative build contexts and context persistence
    pub run_dir: PathBuf,
    /// Names of services whose images must be rebuilt this run
    pub build: Vec<String>,
}

/// Process-wide identifier prefixed to container and default network names.
///
/// Either set explicitly or derived from the base name of the run
/// directory. The stored form is a URL-safe slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupName(String);

impl GroupName {
    /// Create a group name from an explicit identifier
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let slug = slugify(&name.into());
        if slug.is_empty() {
            return Err(Error::service_load(
                "group name must contain at least one alphanumeric character",
            ));
        }
        Ok(Self(slug))
    }

    /// Derive a group name from the base name of a run directory
    pub fn from_run_dir(run_dir: &Path) -> Result<Self> {
        let base = run_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::new(base).map_err(|_| {
            Error::service_load(format!(
                "could not derive a group name from run directory {}",
                run_dir.display()
            ))
        })
    }

    /// Get the group name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Signal sent to a container on stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    /// Interrupt signal
    Sigint,
    /// Termination signal (the default)
    #[default]
    Sigterm,
    /// Kill signal
    Sigkill,
    /// Quit signal
    Sigquit,
}

impl StopSignal {
    /// Get the signal name as the engine expects it
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sigint => "SIGINT",
            Self::Sigterm => "SIGTERM",
            Self::Sigkill => "SIGKILL",
            Self::Sigquit => "SIGQUIT",
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a service agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Not yet claimed by the driver
    Null,
    /// Claimed and executing
    InProgress,
    /// Terminal: the service started successfully
    Started,
    /// Terminal: the action failed or was cascaded onto this agent
    Failed,
    /// Terminal: the service was stopped
    Stopped,
}

impl AgentStatus {
    /// Whether this status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Started | Self::Failed | Self::Stopped)
    }
}

/// The action assigned to an agent before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    /// Start the service
    Start,
    /// Stop the service
    Stop,
}

/// An action recorded in a START run's trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// An image was built for this run
    BuildImage,
    /// The pre-start hook was invoked
    PreStart,
    /// A container was created or restarted
    Start,
    /// The post-start hook was invoked
    PostStart,
    /// The readiness ping succeeded
    Ping,
}

/// The state a START run has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing has happened yet
    Null,
    /// A container was started but readiness is unconfirmed
    Started,
    /// The container is up: already running, or successfully pinged
    Running,
    /// The run failed
    Failed,
}

/// Append-only trace of a START action: which steps ran, and the derived
/// state.
#[derive(Debug, Clone)]
pub struct RunCondition {
    actions: Vec<RunAction>,
    state: RunState,
}

impl RunCondition {
    /// Create an empty trace
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            state: RunState::Null,
        }
    }

    /// A matching container was found running; nothing else to do
    pub fn already_running(&mut self) {
        self.state = RunState::Running;
    }

    /// The readiness ping succeeded
    pub fn pinged(&mut self) {
        self.actions.push(RunAction::Ping);
        self.state = RunState::Running;
    }

    /// The pre-start hook completed
    pub fn pre_started(&mut self) {
        self.actions.push(RunAction::PreStart);
    }

    /// The post-start hook completed
    pub fn post_started(&mut self) {
        self.actions.push(RunAction::PostStart);
    }

    /// An image was built for this run
    pub fn image_built(&mut self) {
        self.actions.push(RunAction::BuildImage);
    }

    /// A container was created or restarted
    pub fn started(&mut self) {
        self.actions.push(RunAction::Start);
        self.state = RunState::Started;
    }

    /// The run failed
    pub fn fail(&mut self) {
        self.state = RunState::Failed;
    }

    /// The state the run has reached
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The actions recorded so far, in order
    pub fn actions(&self) -> &[RunAction] {
        &self.actions
    }

    /// Whether a given action was recorded
    pub fn contains(&self, action: RunAction) -> bool {
        self.actions.contains(&action)
    }
}

impl Default for RunCondition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_slug() {
        assert_eq!(
            GroupName::new("Readme Demo").unwrap().as_str(),
            "readme-demo"
        );
        assert_eq!(GroupName::new("my_app 2").unwrap().as_str(), "my-app-2");
        assert_eq!(GroupName::new("trailing---").unwrap().as_str(), "trailing");
        assert!(GroupName::new("***").is_err());
    }

    #[test]
    fn test_group_name_from_run_dir() {
        let group = GroupName::from_run_dir(Path::new("/home/dev/My Stack")).unwrap();
        assert_eq!(group.as_str(), "my-stack");
        assert!(GroupName::from_run_dir(Path::new("/")).is_err());
    }

    #[test]
    fn test_stop_signal_names() {
        assert_eq!(StopSignal::Sigint.as_str(), "SIGINT");
        assert_eq!(StopSignal::default(), StopSignal::Sigterm);
    }

    #[test]
    fn test_agent_status_terminal() {
        assert!(!AgentStatus::Null.is_terminal());
        assert!(!AgentStatus::InProgress.is_terminal());
        assert!(AgentStatus::Started.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(AgentStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_run_condition_create_path() {
        let mut cond = RunCondition::new();
        assert_eq!(cond.state(), RunState::Null);
        cond.pre_started();
        cond.started();
        assert_eq!(cond.state(), RunState::Started);
        cond.pinged();
        cond.post_started();
        assert_eq!(cond.state(), RunState::Running);
        assert_eq!(
            cond.actions(),
            &[
                RunAction::PreStart,
                RunAction::Start,
                RunAction::Ping,
                RunAction::PostStart,
            ]
        );
    }

    #[test]
    fn test_run_condition_reuse_path() {
        let mut cond = RunCondition::new();
        cond.already_running();
        assert_eq!(cond.state(), RunState::Running);
        assert!(cond.actions().is_empty());
        assert!(!cond.contains(RunAction::Start));
    }

    #[test]
    fn test_run_condition_failure_keeps_trace() {
        let mut cond = RunCondition::new();
        cond.started();
        cond.fail();
        assert_eq!(cond.state(), RunState::Failed);
        assert!(cond.contains(RunAction::Start));
    }
}
