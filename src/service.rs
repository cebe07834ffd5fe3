//! Service definitions.
//!
//! A [`ServiceSpec`] describes one containerized service: its image, port
//! and volume mappings, environment, dependencies and build inputs. The
//! [`Service`] trait couples a spec with the service's lifecycle hooks;
//! implementors override `ping` (readiness), `pre_start` and `post_start`
//! as needed.
//!
//! # Example
//!
//! ```
//! use miniboss::{Service, ServiceSpec, StopSignal};
//!
//! struct Database;
//!
//! impl Service for Database {
//!     fn spec(&self) -> &ServiceSpec {
//!         static SPEC: std::sync::OnceLock<ServiceSpec> = std::sync::OnceLock::new();
//!         SPEC.get_or_init(|| {
//!             ServiceSpec::new("appdb", "postgres:16.3")
//!                 .port(5432, 5433)
//!                 .env("POSTGRES_PASSWORD", "dbpwd")
//!                 .stop_signal(StopSignal::Sigint)
//!         })
//!     }
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::SharedContext;
use crate::errors::{Error, Result};
use crate::types::StopSignal;

/// Default dockerfile name used when a build directory is set
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// A command or entrypoint override: either a single string or an argv list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A single string, passed through as one argument
    Shell(String),
    /// An explicit argument vector
    Argv(Vec<String>),
}

impl CommandLine {
    /// Flatten into an argument vector
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::Shell(s) => vec![s.clone()],
            Self::Argv(args) => args.clone(),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        Self::Shell(s.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(s: String) -> Self {
        Self::Shell(s)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(args: Vec<String>) -> Self {
        Self::Argv(args)
    }
}

/// A volume bind target inside a mapping-style volume definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    /// Target path in the container
    pub bind: String,
    /// Mount mode, e.g. `ro` or `rw`
    pub mode: Option<String>,
}

/// Volume specification: either bind strings or a host-path mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Volumes {
    /// `host:container[:mode]` strings
    Binds(Vec<String>),
    /// Host path mapped to its bind target
    Map(HashMap<String, VolumeBind>),
}

impl Volumes {
    /// Whether no volumes are defined
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Binds(binds) => binds.is_empty(),
            Self::Map(map) => map.is_empty(),
        }
    }

    /// Flatten into `host:container[:mode]` bind strings, sorted for
    /// deterministic argument order
    pub fn to_binds(&self) -> Vec<String> {
        match self {
            Self::Binds(binds) => binds.clone(),
            Self::Map(map) => {
                let mut binds: Vec<String> = map
                    .iter()
                    .map(|(host, target)| match &target.mode {
                        Some(mode) => format!("{host}:{}:{mode}", target.bind),
                        None => format!("{host}:{}", target.bind),
                    })
                    .collect();
                binds.sort_unstable();
                binds
            }
        }
    }
}

impl Default for Volumes {
    fn default() -> Self {
        Self::Binds(Vec::new())
    }
}

/// Declarative description of one containerized service.
///
/// Built with a consuming builder; validated when registered with the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service name; also the network alias of its container
    pub name: String,
    /// Container image reference
    pub image: String,
    /// Names of services this service depends on
    pub dependencies: Vec<String>,
    /// Port mappings, container port to host port
    pub ports: HashMap<u16, u16>,
    /// Environment variables; string values may carry `{placeholder}` tokens
    pub env: HashMap<String, Value>,
    /// Never reuse or restart an existing container
    pub always_start_new: bool,
    /// Signal used to stop the container
    pub stop_signal: StopSignal,
    /// Build-context directory, relative to the run directory
    pub build_from: Option<String>,
    /// Dockerfile name within the build context
    pub dockerfile: String,
    /// Entrypoint override
    pub entrypoint: Option<CommandLine>,
    /// Command override
    pub cmd: Option<CommandLine>,
    /// User the container process runs as
    pub user: Option<String>,
    /// Volume mounts
    pub volumes: Volumes,
}

impl ServiceSpec {
    /// Create a spec for `name` running `image`
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            dependencies: Vec::new(),
            ports: HashMap::new(),
            env: HashMap::new(),
            always_start_new: false,
            stop_signal: StopSignal::default(),
            build_from: None,
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
            entrypoint: None,
            cmd: None,
            user: None,
            volumes: Volumes::default(),
        }
    }

    /// Add a dependency on another service
    #[must_use]
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Add multiple dependencies
    #[must_use]
    pub fn dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    /// Map a container port to a host port
    #[must_use]
    pub fn port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.insert(container_port, host_port);
        self
    }

    /// Add an environment variable; integers and strings are accepted
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Always create a fresh container, never reuse or restart
    #[must_use]
    pub fn always_start_new(mut self) -> Self {
        self.always_start_new = true;
        self
    }

    /// Set the stop signal
    #[must_use]
    pub fn stop_signal(mut self, signal: StopSignal) -> Self {
        self.stop_signal = signal;
        self
    }

    /// Set the build-context directory, relative to the run directory
    #[must_use]
    pub fn build_from(mut self, dir: impl Into<String>) -> Self {
        self.build_from = Some(dir.into());
        self
    }

    /// Set the dockerfile name within the build context
    #[must_use]
    pub fn dockerfile(mut self, name: impl Into<String>) -> Self {
        self.dockerfile = name.into();
        self
    }

    /// Override the container entrypoint
    #[must_use]
    pub fn entrypoint(mut self, entrypoint: impl Into<CommandLine>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    /// Override the container command
    #[must_use]
    pub fn cmd(mut self, cmd: impl Into<CommandLine>) -> Self {
        self.cmd = Some(cmd.into());
        self
    }

    /// Set the user the container process runs as
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add a `host:container[:mode]` bind string
    #[must_use]
    pub fn volume(mut self, bind: impl Into<String>) -> Self {
        let mut binds = self.volumes.to_binds();
        binds.push(bind.into());
        self.volumes = Volumes::Binds(binds);
        self
    }

    /// Set the full volume specification
    #[must_use]
    pub fn volumes(mut self, volumes: Volumes) -> Self {
        self.volumes = volumes;
        self
    }

    /// Validate the definition, reporting the offending field and service
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::definition(
                "field 'name' of a service must be a non-empty string",
            ));
        }
        if self.image.is_empty() {
            return Err(Error::definition(format!(
                "field 'image' of service '{}' must be a non-empty string",
                self.name
            )));
        }
        if let Some(build_from) = &self.build_from {
            if build_from.is_empty() {
                return Err(Error::definition(format!(
                    "field 'build_from' of service '{}' must be a non-empty string",
                    self.name
                )));
            }
        }
        if self.dockerfile.is_empty() {
            return Err(Error::definition(format!(
                "field 'dockerfile' of service '{}' must be a non-empty string",
                self.name
            )));
        }
        for (key, value) in &self.env {
            let acceptable = match value {
                Value::String(_) => true,
                Value::Number(n) => n.is_i64() || n.is_u64(),
                _ => false,
            };
            if !acceptable {
                return Err(Error::definition(format!(
                    "env value '{key}' of service '{}' must be a string or an integer",
                    self.name
                )));
            }
        }
        match &self.volumes {
            Volumes::Binds(binds) => {
                for bind in binds {
                    if bind.splitn(3, ':').count() < 2 {
                        return Err(Error::definition(format!(
                            "volume '{bind}' of service '{}' must be host:container[:mode]",
                            self.name
                        )));
                    }
                }
            }
            Volumes::Map(map) => {
                for (host, target) in map {
                    if target.bind.is_empty() {
                        return Err(Error::definition(format!(
                            "volume '{host}' of service '{}' must specify a 'bind' target",
                            self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A registered service: its spec plus overridable lifecycle hooks.
///
/// `ping` is polled during readiness; returning `Ok(false)` keeps polling,
/// `Ok(true)` completes it, and any error fails the service. `pre_start`
/// and `post_start` bracket fresh container creation and may read or write
/// the shared context.
#[async_trait]
pub trait Service: Send + Sync {
    /// The service definition
    fn spec(&self) -> &ServiceSpec;

    /// Readiness probe; the default reports ready immediately
    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }

    /// Invoked before a fresh container is created
    async fn pre_start(&self, _context: &SharedContext) -> Result<()> {
        Ok(())
    }

    /// Invoked after a freshly created container passes readiness
    async fn post_start(&self, _context: &SharedContext) -> Result<()> {
        Ok(())
    }
}

/// Coerce an env value to the string form the engine receives.
///
/// Also the form used when diffing against an existing container's
/// engine-reported environment.
pub(crate) fn env_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A service defined by its spec alone, with default hooks.
///
/// Convenient for images that need no readiness probe or start hooks.
pub struct PlainService {
    spec: ServiceSpec,
}

impl PlainService {
    /// Wrap a spec with default lifecycle hooks
    pub fn new(spec: ServiceSpec) -> Self {
        Self { spec }
    }
}

impl Service for PlainService {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }
}
