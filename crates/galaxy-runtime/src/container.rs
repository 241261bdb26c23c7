//! Container and image records as reported by the runtime.
//!
//! Field names follow the runtime's inspect output so records decode straight
//! from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Application name; the marker that makes a container "ours".
pub const GALAXY_APP: &str = "GALAXY_APP";
/// Numeric release id of the descriptor the container was started from.
pub const GALAXY_VERSION: &str = "GALAXY_VERSION";
/// Instance slot.
pub const GALAXY_INSTANCE: &str = "GALAXY_INSTANCE";
pub const HOST_IP: &str = "HOST_IP";
pub const PUBLIC_HOSTNAME: &str = "PUBLIC_HOSTNAME";
pub const ENV: &str = "ENV";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    pub id: String,
    /// Runtime name, usually with a leading `/`.
    #[serde(default)]
    pub name: String,
    /// Content id of the image the container was created from.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub state: ContainerState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// Image reference the container was created with.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub restarting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Stopped,
    Removed,
    Blacklisted,
}

impl Container {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn display_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Identity environment as a key/value view. Entries without `=` map to
    /// an empty value.
    pub fn env(&self) -> BTreeMap<String, String> {
        self.config
            .env
            .iter()
            .flatten()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item.clone(), String::new()),
            })
            .collect()
    }

    pub fn env_var(&self, key: &str) -> Option<String> {
        self.env().remove(key).filter(|v| !v.is_empty())
    }

    /// Application name from the identity environment.
    pub fn app_name(&self) -> Option<String> {
        self.env_var(GALAXY_APP)
    }

    /// Whether the runtime still considers the container live.
    pub fn is_active(&self) -> bool {
        self.state.running || self.state.restarting || self.state.paused
    }

    /// Status as reported by the runtime. Blacklisting is tracked by the
    /// reconciler, see [`ServiceRuntime::status_of`](crate::ServiceRuntime::status_of).
    pub fn status(&self) -> ContainerStatus {
        if self.state.restarting {
            ContainerStatus::Restarting
        } else if self.state.paused {
            ContainerStatus::Paused
        } else if self.state.running {
            ContainerStatus::Running
        } else {
            match self.state.status.as_str() {
                "created" => ContainerStatus::Created,
                "removing" => ContainerStatus::Removed,
                _ => ContainerStatus::Stopped,
            }
        }
    }
}

pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
}

impl Image {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.repo_tags.iter().flatten().any(|t| t == tag)
    }
}
