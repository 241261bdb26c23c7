//! The seam between the reconciler and the local container runtime.
//!
//! [`ContainerRuntime`] is one round trip per method. `docker` is the
//! production backend; `mock` is an in-memory runtime for tests.

pub mod docker;
pub mod mock;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::container::{Container, Image};
use crate::error::RuntimeError;
use crate::image::ImageRef;

/// Live subscription to the runtime's container events. Dropping the receiver
/// tears the subscription down.
pub type EventStream = mpsc::Receiver<DaemonEvent>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// `Ok(None)` when no local image matches `name` (a reference or an id).
    async fn inspect_image(&self, name: &str) -> Result<Option<Image>, RuntimeError>;

    async fn list_images(&self) -> Result<Vec<Image>, RuntimeError>;

    /// Fails with [`RuntimeError::ImageNotFound`] when the registry does not
    /// have the image.
    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError>;

    /// Ids of all containers, running or not.
    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError>;

    /// `Ok(None)` when no container has this id or name.
    async fn inspect_container(&self, id: &str) -> Result<Option<Container>, RuntimeError>;

    async fn create_container(&self, opts: &CreateOptions) -> Result<Container, RuntimeError>;

    async fn start_container(&self, id: &str, host: &HostOptions) -> Result<(), RuntimeError>;

    /// Ask the runtime to stop `id`, killing it after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn events(&self) -> Result<EventStream, RuntimeError>;

    /// Gateway address of the default bridge network, if the runtime has one.
    async fn bridge_ip(&self) -> Result<Option<String>, RuntimeError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    /// Memory limit in bytes.
    pub memory: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub host: HostOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOptions {
    pub publish_all_ports: bool,
    pub restart: RestartPolicy,
    pub log: LogConfig,
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure { max_retries: u32 },
}

impl RestartPolicy {
    /// Value for the runtime's `--restart` flag.
    pub fn as_flag(&self) -> String {
        match self {
            RestartPolicy::No => "no".to_string(),
            RestartPolicy::OnFailure { max_retries } => format!("on-failure:{max_retries}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Empty keeps the runtime default.
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

/// Container lifecycle transitions the reconciler reacts to. Everything else
/// the runtime reports lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Start,
    Stop,
    Die,
    Other(String),
}

impl EventStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "start" => EventStatus::Start,
            "stop" => EventStatus::Stop,
            "die" => EventStatus::Die,
            other => EventStatus::Other(other.to_string()),
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, EventStatus::Other(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventStatus::Start => "start",
            EventStatus::Stop => "stop",
            EventStatus::Die => "die",
            EventStatus::Other(other) => other,
        }
    }
}

/// Raw event from the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEvent {
    pub status: EventStatus,
    /// Container id.
    pub id: String,
}
