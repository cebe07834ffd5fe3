//! Docker CLI adapter for the container-engine port.
//!
//! Implements [`ContainerEngine`] by driving the `docker` binary with
//! `tokio::process`, parsing `inspect` JSON with serde. Every non-zero
//! exit is surfaced as an [`Error::Engine`], except the
//! create-start-verify path, which raises [`Error::ContainerStart`] with
//! the container's captured logs when a started container does not stay
//! running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::engine::{ContainerEngine, ContainerState, ExistingContainer};
use crate::errors::{Error, Result};
use crate::service::{env_value_string, ServiceSpec};
use crate::types::Network;

/// How long a started container gets to settle before its state is
/// verified; the engine does not report `running` immediately
const START_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Container engine backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker_path: PathBuf,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    success: bool,
}

impl CommandOutput {
    fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Deserialize)]
struct ContainerInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: StateInspect,
    #[serde(rename = "Config")]
    config: ConfigInspect,
    #[serde(rename = "Image")]
    image: String,
}

#[derive(Deserialize)]
struct StateInspect {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize)]
struct ConfigInspect {
    #[serde(rename = "Env")]
    env: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ImageInspect {
    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
}

impl DockerCli {
    /// Locate the `docker` binary and create the adapter
    pub fn new() -> Result<Self> {
        let docker_path = which::which("docker")
            .map_err(|_| Error::engine("docker binary not found in PATH"))?;
        Ok(Self { docker_path })
    }

    /// Run a docker command, capturing output without judging the exit code
    async fn exec_raw(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!(command = %args.join(" "), "invoking docker");
        let output = Command::new(&self.docker_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                Error::engine(format!(
                    "failed to execute docker {}: {err}",
                    args.join(" ")
                ))
            })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            success: output.status.success(),
        })
    }

    /// Run a docker command, turning a non-zero exit into an engine error
    async fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.exec_raw(args).await?;
        if !output.success {
            return Err(Error::engine(format!(
                "docker {} failed with exit code {}: {}",
                args.join(" "),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ExistingContainer> {
        let output = self.exec(&["inspect", id_or_name]).await?;
        let mut parsed: Vec<ContainerInspect> = serde_json::from_str(&output.stdout)?;
        let inspect = parsed
            .pop()
            .ok_or_else(|| Error::engine(format!("container not found: {id_or_name}")))?;

        let image_output = self.exec(&["image", "inspect", &inspect.image]).await?;
        let mut images: Vec<ImageInspect> = serde_json::from_str(&image_output.stdout)?;
        let image_tags = images
            .pop()
            .and_then(|image| image.repo_tags)
            .unwrap_or_default();

        let env = inspect
            .config
            .env
            .unwrap_or_default()
            .iter()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<String, String>>();

        Ok(ExistingContainer {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            state: inspect.state.status.parse()?,
            image_tags,
            env,
        })
    }

    async fn container_logs(&self, id: &str) -> String {
        match self.exec_raw(&["logs", id]).await {
            Ok(output) => output.combined(),
            Err(_) => String::new(),
        }
    }
}

/// Build the `docker create` argument vector for a service container
fn create_args(container_name: &str, spec: &ServiceSpec, network: &Network) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        container_name.into(),
        "--network".into(),
        network.name.clone(),
        "--network-alias".into(),
        spec.name.clone(),
        "--stop-signal".into(),
        spec.stop_signal.as_str().into(),
    ];

    let mut ports: Vec<(&u16, &u16)> = spec.ports.iter().collect();
    ports.sort_unstable();
    for (container_port, host_port) in ports {
        args.push("--publish".into());
        args.push(format!("{host_port}:{container_port}"));
    }

    let mut env: Vec<(&String, String)> = spec
        .env
        .iter()
        .map(|(key, value)| (key, env_value_string(value)))
        .collect();
    env.sort_unstable();
    for (key, value) in env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }

    for bind in spec.volumes.to_binds() {
        args.push("--volume".into());
        args.push(bind);
    }

    if let Some(user) = &spec.user {
        args.push("--user".into());
        args.push(user.clone());
    }

    // docker's --entrypoint takes a single binary; extra entrypoint
    // arguments lead the command
    let mut leading: Vec<String> = Vec::new();
    if let Some(entrypoint) = &spec.entrypoint {
        let mut entry_args = entrypoint.to_args();
        if !entry_args.is_empty() {
            args.push("--entrypoint".into());
            args.push(entry_args.remove(0));
            leading = entry_args;
        }
    }

    args.push(spec.image.clone());
    args.extend(leading);
    if let Some(cmd) = &spec.cmd {
        args.extend(cmd.to_args());
    }
    args
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create_network(&self, name: &str) -> Result<Network> {
        let inspected = self
            .exec_raw(&["network", "inspect", "--format", "{{.Id}}", name])
            .await?;
        if inspected.success {
            return Ok(Network {
                name: name.to_string(),
                id: inspected.stdout.trim().to_string(),
            });
        }
        let created = self
            .exec(&["network", "create", "--driver", "bridge", name])
            .await?;
        info!(network = %name, "created network");
        Ok(Network {
            name: name.to_string(),
            id: created.stdout.trim().to_string(),
        })
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let inspected = self
            .exec_raw(&["network", "inspect", "--format", "{{.Id}}", name])
            .await?;
        if !inspected.success {
            debug!(network = %name, "network not present, nothing to remove");
            return Ok(());
        }
        self.exec(&["network", "rm", name]).await?;
        info!(network = %name, "removed network");
        Ok(())
    }

    async fn existing_on_network(
        &self,
        prefix: &str,
        network: &Network,
    ) -> Result<Vec<ExistingContainer>> {
        let network_filter = format!(
            "network={}",
            if network.id.is_empty() {
                &network.name
            } else {
                &network.id
            }
        );
        let name_filter = format!("name={prefix}");
        let listed = self
            .exec(&[
                "ps",
                "--all",
                "--filter",
                &network_filter,
                "--filter",
                &name_filter,
                "--format",
                "{{.Names}}",
            ])
            .await?;
        let mut containers = Vec::new();
        for name in listed.stdout.lines().map(str::trim) {
            // the name filter matches substrings; enforce the prefix
            if name.is_empty() || !name.starts_with(prefix) {
                continue;
            }
            containers.push(self.inspect_container(name).await?);
        }
        Ok(containers)
    }

    async fn check_image(&self, tag: &str) -> Result<()> {
        let inspected = self.exec_raw(&["image", "inspect", tag]).await?;
        if inspected.success {
            return Ok(());
        }
        info!(image = %tag, "image does not exist, will pull it");
        self.exec(&["pull", tag]).await.map_err(|err| {
            Error::engine(format!("could not pull image {tag}: {err}"))
        })?;
        Ok(())
    }

    async fn build_image(&self, build_dir: &Path, dockerfile: &str, tag: &str) -> Result<()> {
        let dockerfile_path = build_dir.join(dockerfile).to_string_lossy().to_string();
        let build_dir = build_dir.to_string_lossy().to_string();
        self.exec(&[
            "build",
            "--tag",
            tag,
            "--file",
            &dockerfile_path,
            &build_dir,
        ])
        .await
        .map_err(|err| Error::engine(format!("error building image {tag}: {err}")))?;
        Ok(())
    }

    async fn run_service_on_network(
        &self,
        prefix: &str,
        spec: &ServiceSpec,
        network: &Network,
    ) -> Result<String> {
        self.check_image(&spec.image).await?;
        let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
        let container_name = format!("{prefix}-{suffix:04}");
        let args = create_args(&container_name, spec, network);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let created = self.exec_raw(&arg_refs).await?;
        if !created.success {
            let stderr = created.stderr.trim();
            if stderr.contains("No such image") {
                return Err(Error::engine(format!(
                    "image {} could not be found; please make sure it exists",
                    spec.image
                )));
            }
            return Err(Error::engine(format!(
                "error creating container for service {}: {stderr}",
                spec.name
            )));
        }
        let id = created.stdout.trim().to_string();
        self.run_container(&id).await?;
        info!(
            container = %container_name,
            service = %spec.name,
            "started container"
        );
        Ok(container_name)
    }

    async fn run_container(&self, id: &str) -> Result<()> {
        self.exec(&["start", id])
            .await
            .map_err(|err| Error::engine(format!("error starting container {id}: {err}")))?;
        tokio::time::sleep(START_SETTLE_DELAY).await;
        let container = self.inspect_container(id).await?;
        if container.state != ContainerState::Running {
            let logs = self.container_logs(id).await;
            return Err(Error::container_start(container.name, logs));
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let timeout = timeout.as_secs().to_string();
        self.exec(&["stop", "--time", &timeout, id]).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.exec(&["rm", id]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Volumes, VolumeBind};
    use crate::types::StopSignal;

    fn network() -> Network {
        Network {
            name: "miniboss-demo".to_string(),
            id: "abc123".to_string(),
        }
    }

    #[test]
    fn test_create_args_basic() {
        let spec = ServiceSpec::new("appdb", "postgres:16.3")
            .port(5432, 5433)
            .env("POSTGRES_PASSWORD", "dbpwd")
            .stop_signal(StopSignal::Sigint);
        let args = create_args("appdb-demo-0007", &spec, &network());
        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w == ["--name", "appdb-demo-0007"]));
        assert!(args.windows(2).any(|w| w == ["--network", "miniboss-demo"]));
        assert!(args.windows(2).any(|w| w == ["--network-alias", "appdb"]));
        assert!(args.windows(2).any(|w| w == ["--stop-signal", "SIGINT"]));
        assert!(args.windows(2).any(|w| w == ["--publish", "5433:5432"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--env", "POSTGRES_PASSWORD=dbpwd"]));
        assert_eq!(args.last().unwrap(), "postgres:16.3");
    }

    #[test]
    fn test_create_args_integer_env_coerced() {
        let spec = ServiceSpec::new("svc", "img").env("PORT", 8080);
        let args = create_args("svc-demo-0001", &spec, &network());
        assert!(args.windows(2).any(|w| w == ["--env", "PORT=8080"]));
    }

    #[test]
    fn test_create_args_volumes_and_user() {
        let mut map = HashMap::new();
        map.insert(
            "/host/data".to_string(),
            VolumeBind {
                bind: "/var/lib/data".to_string(),
                mode: Some("ro".to_string()),
            },
        );
        let spec = ServiceSpec::new("svc", "img")
            .volumes(Volumes::Map(map))
            .user("postgres");
        let args = create_args("svc-demo-0001", &spec, &network());
        assert!(args
            .windows(2)
            .any(|w| w == ["--volume", "/host/data:/var/lib/data:ro"]));
        assert!(args.windows(2).any(|w| w == ["--user", "postgres"]));
    }

    #[test]
    fn test_create_args_entrypoint_and_cmd() {
        let spec = ServiceSpec::new("svc", "img")
            .entrypoint(vec!["tini".to_string(), "--".to_string()])
            .cmd("redis-server");
        let args = create_args("svc-demo-0001", &spec, &network());
        assert!(args.windows(2).any(|w| w == ["--entrypoint", "tini"]));
        let image_at = args.iter().position(|a| a == "img").unwrap();
        assert_eq!(&args[image_at + 1..], &["--", "redis-server"]);
    }
}
