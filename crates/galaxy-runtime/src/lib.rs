//! Container lifecycle reconciler for the host agent.
//!
//! [`ServiceRuntime`] turns application descriptors into running containers on
//! the local host and reports lifecycle changes back out through
//! [`ContainerEvent`]s. All state is re-derived from the container runtime on
//! every call; the only state the reconciler keeps is the blacklist of
//! containers whose stop never completed.

pub mod blacklist;
pub mod client;
pub mod config;
pub mod container;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod host_facts;
pub mod image;
pub mod registry;
pub mod runtime;
pub mod slot;

pub use blacklist::{BlacklistStore, MemBlacklist};
pub use client::docker::DockerCli;
pub use client::mock::{MockRuntime, PullOutcome};
pub use client::{ContainerRuntime, DaemonEvent, EventStatus};
pub use config::RuntimeConfig;
pub use container::{Container, ContainerStatus, Image};
pub use error::RuntimeError;
pub use events::ContainerEvent;
pub use registry::{MemRegistry, Registry, ServiceRegistration};
pub use runtime::{ServiceRuntime, StopOutcome};
