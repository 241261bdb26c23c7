//! `docker` CLI backend.
//!
//! Each method runs one `docker` command. Registry credentials, TLS settings
//! and `DOCKER_HOST` are picked up by the CLI itself.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ContainerRuntime, CreateOptions, DaemonEvent, EventStatus, EventStream, HostOptions,
    RestartPolicy,
};
use crate::container::{Container, Image};
use crate::error::RuntimeError;
use crate::image::ImageRef;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

struct CmdOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        // a dropped future (e.g. a stop past its watchdog) must not leave the CLI behind
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[String]) -> Result<CmdOutput, RuntimeError> {
        debug!(args = ?args, "running docker");
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                bin: self.bin.display().to_string(),
                source,
            })?;
        Ok(CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_ok(&self, op: &'static str, args: &[String]) -> Result<String, RuntimeError> {
        let out = self.run(args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(RuntimeError::Docker {
                op,
                message: out.stderr,
            })
        }
    }

    /// Run an inspect; a "no such object" failure becomes `Ok(None)`.
    async fn inspect<T: DeserializeOwned>(
        &self,
        op: &'static str,
        args: &[String],
    ) -> Result<Option<T>, RuntimeError> {
        let out = self.run(args).await?;
        if !out.success {
            if is_missing(&out.stderr) {
                return Ok(None);
            }
            return Err(RuntimeError::Docker {
                op,
                message: out.stderr,
            });
        }
        let mut items: Vec<T> = serde_json::from_str(&out.stdout)
            .map_err(|source| RuntimeError::Decode { op, source })?;
        Ok(if items.is_empty() {
            None
        } else {
            Some(items.remove(0))
        })
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container")
        || stderr.contains("No such image")
        || stderr.contains("No such object")
}

fn is_pull_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found")
        || lower.contains("manifest unknown")
        || lower.contains("does not exist")
        || lower.contains("404")
}

fn lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Arguments for `docker create`.
pub(crate) fn create_args(opts: &CreateOptions) -> Vec<String> {
    let mut out = args(["create", "--name"]);
    out.push(opts.name.clone());
    for entry in &opts.env {
        out.push("--env".into());
        out.push(entry.clone());
    }
    if let Some(memory) = opts.memory {
        out.push(format!("--memory={memory}"));
    }
    if let Some(shares) = opts.cpu_shares {
        out.push(format!("--cpu-shares={shares}"));
    }
    out.extend(host_args(&opts.host));
    out.push(opts.image.clone());
    out
}

fn host_args(host: &HostOptions) -> Vec<String> {
    let mut out = Vec::new();
    if host.publish_all_ports {
        out.push("--publish-all".to_string());
    }
    if host.restart != RestartPolicy::No {
        out.push(format!("--restart={}", host.restart.as_flag()));
    }
    if !host.log.driver.is_empty() {
        out.push(format!("--log-driver={}", host.log.driver));
        for (key, value) in &host.log.options {
            out.push(format!("--log-opt={key}={value}"));
        }
    }
    for dns in &host.dns {
        out.push(format!("--dns={dns}"));
    }
    out
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    status: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
}

#[derive(Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
}

/// Decode one `docker events --format '{{json .}}'` line.
pub(crate) fn parse_event_line(line: &str) -> Option<DaemonEvent> {
    let raw: RawEvent = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "undecodable docker event");
            return None;
        }
    };
    let status = if raw.status.is_empty() { raw.action } else { raw.status };
    let id = match raw.actor {
        Some(actor) if raw.id.is_empty() => actor.id,
        _ => raw.id,
    };
    if id.is_empty() {
        return None;
    }
    Some(DaemonEvent {
        status: EventStatus::parse(&status),
        id,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.run_ok("ping", &args(["version", "--format", "{{.Server.Version}}"]))
            .await
            .map(|_| ())
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<Image>, RuntimeError> {
        self.inspect("image inspect", &args(["image", "inspect", name]))
            .await
    }

    async fn list_images(&self) -> Result<Vec<Image>, RuntimeError> {
        let stdout = self
            .run_ok("image ls", &args(["image", "ls", "-a", "-q", "--no-trunc"]))
            .await?;
        let mut ids = lines(&stdout);
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["image", "inspect"]);
        cmd.extend(ids);
        let stdout = self.run_ok("image inspect", &cmd).await?;
        serde_json::from_str(&stdout).map_err(|source| RuntimeError::Decode {
            op: "image inspect",
            source,
        })
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        let reference = image.pull_reference();
        let out = self.run(&args(["pull", "--quiet", reference.as_str()])).await?;
        if out.success {
            return Ok(());
        }
        if is_pull_not_found(&out.stderr) {
            return Err(RuntimeError::ImageNotFound(reference));
        }
        Err(RuntimeError::Docker {
            op: "pull",
            message: out.stderr,
        })
    }

    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let stdout = self
            .run_ok("ps", &args(["ps", "-a", "-q", "--no-trunc"]))
            .await?;
        Ok(lines(&stdout))
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<Container>, RuntimeError> {
        self.inspect("inspect", &args(["inspect", "--type", "container", id]))
            .await
    }

    async fn create_container(&self, opts: &CreateOptions) -> Result<Container, RuntimeError> {
        let stdout = self.run_ok("create", &create_args(opts)).await?;
        let id = stdout.trim();
        self.inspect_container(id)
            .await?
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))
    }

    async fn start_container(&self, id: &str, host: &HostOptions) -> Result<(), RuntimeError> {
        // an existing container keeps its create-time policy unless updated
        if host.restart != RestartPolicy::No {
            let flag = format!("--restart={}", host.restart.as_flag());
            self.run_ok("update", &args(["update", flag.as_str(), id])).await?;
        }
        self.run_ok("start", &args(["start", id])).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().to_string();
        self.run_ok("stop", &args(["stop", "--time", secs.as_str(), id]))
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run_ok("rm", &args(["rm", id])).await.map(|_| ())
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let mut child = self
            .command()
            .args(args([
                "events",
                "--filter",
                "type=container",
                "--format",
                "{{json .}}",
            ]))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                bin: self.bin.display().to_string(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| RuntimeError::Docker {
            op: "events",
            message: "event stream has no stdout".into(),
        })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Some(event) = parse_event_line(&line) else { continue };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "docker event stream read failed");
                            break;
                        }
                    },
                }
            }
            let _ = child.kill().await;
            debug!("docker event stream closed");
        });
        Ok(rx)
    }

    async fn bridge_ip(&self) -> Result<Option<String>, RuntimeError> {
        let stdout = self
            .run_ok(
                "network inspect",
                &args([
                    "network",
                    "inspect",
                    "bridge",
                    "--format",
                    "{{range .IPAM.Config}}{{.Gateway}}{{end}}",
                ]),
            )
            .await?;
        let ip = stdout.trim();
        Ok((!ip.is_empty()).then(|| ip.to_string()))
    }
}
