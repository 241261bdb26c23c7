//! In-memory container runtime for tests.
//!
//! `MockRuntime` keeps containers and images in a map and lets tests script
//! the awkward cases: transient and not-found pull failures, stops that never
//! return, an unreachable daemon, and injected daemon events.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ContainerRuntime, CreateOptions, DaemonEvent, EventStream, HostOptions};
use crate::container::{Container, ContainerConfig, ContainerState, Image};
use crate::error::RuntimeError;
use crate::image::ImageRef;

/// Scripted outcome for the next pull attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Transient(String),
    NotFound,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, Container>,
    /// Local images by reference.
    images: BTreeMap<String, Image>,
    /// What a successful pull of a reference yields.
    remote: BTreeMap<String, Image>,
    pull_script: VecDeque<PullOutcome>,
    pull_attempts: u32,
    hung_stops: HashSet<String>,
    stop_calls: Vec<String>,
    removed: Vec<String>,
    created: Vec<CreateOptions>,
    started: Vec<(String, HostOptions)>,
    daemon_down: bool,
    subscriptions: u32,
    event_tx: Option<mpsc::Sender<DaemonEvent>>,
    bridge_ip: Option<String>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `reference` available locally with content id `id`.
    pub fn add_local_image(&self, reference: &str, id: &str) {
        self.state()
            .images
            .insert(reference.to_string(), image(reference, id));
    }

    /// Make `reference` pullable; a pull replaces the local copy.
    pub fn publish_image(&self, reference: &str, id: &str) {
        self.state()
            .remote
            .insert(reference.to_string(), image(reference, id));
    }

    pub fn script_pulls(&self, outcomes: impl IntoIterator<Item = PullOutcome>) {
        self.state().pull_script.extend(outcomes);
    }

    pub fn pull_attempts(&self) -> u32 {
        self.state().pull_attempts
    }

    /// Add a running container built from `image_id` with the given
    /// environment. Returns its id.
    pub fn run_container(&self, name: &str, image_id: &str, env: &[(&str, &str)]) -> String {
        let mut state = self.state();
        let id = next_id(&mut state);
        let container = Container {
            id: id.clone(),
            name: format!("/{name}"),
            image: image_id.to_string(),
            created: String::new(),
            config: ContainerConfig {
                image: image_id.to_string(),
                env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            },
            state: running_state(),
        };
        state.containers.insert(id.clone(), container);
        id
    }

    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(c) = self.state().containers.get_mut(id) {
            c.state = state;
        }
    }

    /// Stops of `id` never complete.
    pub fn hang_stop(&self, id: &str) {
        self.state().hung_stops.insert(id.to_string());
    }

    pub fn container(&self, id: &str) -> Option<Container> {
        self.state().containers.get(id).cloned()
    }

    pub fn containers(&self) -> Vec<Container> {
        self.state().containers.values().cloned().collect()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.state().stop_calls.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn created(&self) -> Vec<CreateOptions> {
        self.state().created.clone()
    }

    pub fn started(&self) -> Vec<(String, HostOptions)> {
        self.state().started.clone()
    }

    pub fn set_daemon_down(&self, down: bool) {
        let mut state = self.state();
        state.daemon_down = down;
        if down {
            // the daemon going away ends any open event stream
            state.event_tx = None;
        }
    }

    pub fn subscriptions(&self) -> u32 {
        self.state().subscriptions
    }

    pub fn set_bridge_ip(&self, ip: &str) {
        self.state().bridge_ip = Some(ip.to_string());
    }

    /// Push an event to the open subscription. Returns false when nobody is
    /// subscribed.
    pub fn emit(&self, event: DaemonEvent) -> bool {
        let tx = self.state().event_tx.clone();
        match tx {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    fn check_daemon(&self, op: &'static str) -> Result<(), RuntimeError> {
        if self.state().daemon_down {
            return Err(RuntimeError::Docker {
                op,
                message: "Cannot connect to the Docker daemon".into(),
            });
        }
        Ok(())
    }
}

fn image(reference: &str, id: &str) -> Image {
    Image {
        id: id.to_string(),
        repo_tags: Some(vec![reference.to_string()]),
    }
}

fn running_state() -> ContainerState {
    ContainerState {
        status: "running".into(),
        running: true,
        paused: false,
        restarting: false,
    }
}

fn next_id(state: &mut MockState) -> String {
    state.next_id += 1;
    format!("{:064x}", state.next_id)
}

fn find_container<'a>(state: &'a mut MockState, id: &str) -> Option<&'a mut Container> {
    let key = state
        .containers
        .values()
        .find(|c| c.id == id || c.display_name() == id)
        .map(|c| c.id.clone())?;
    state.containers.get_mut(&key)
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_daemon("ping")
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<Image>, RuntimeError> {
        self.check_daemon("image inspect")?;
        let state = self.state();
        Ok(state
            .images
            .get(name)
            .or_else(|| state.images.values().find(|i| i.id == name))
            .cloned())
    }

    async fn list_images(&self) -> Result<Vec<Image>, RuntimeError> {
        self.check_daemon("image ls")?;
        Ok(self.state().images.values().cloned().collect())
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        self.check_daemon("pull")?;
        let reference = image.pull_reference();
        let mut state = self.state();
        state.pull_attempts += 1;
        match state.pull_script.pop_front() {
            Some(PullOutcome::Transient(message)) => {
                return Err(RuntimeError::Docker { op: "pull", message });
            }
            Some(PullOutcome::NotFound) => return Err(RuntimeError::ImageNotFound(reference)),
            None => {}
        }
        let Some(found) = state.remote.get(&reference).cloned() else {
            return Err(RuntimeError::ImageNotFound(reference));
        };
        // local images are keyed by the reference the caller used, which may
        // omit the default tag
        let tagless = reference.strip_suffix(":latest").map(str::to_string);
        if let Some(tagless) = tagless {
            state.images.insert(tagless, found.clone());
        }
        state.images.insert(reference, found);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
        self.check_daemon("ps")?;
        Ok(self.state().containers.keys().cloned().collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<Container>, RuntimeError> {
        self.check_daemon("inspect")?;
        Ok(find_container(&mut self.state(), id).map(|c| c.clone()))
    }

    async fn create_container(&self, opts: &CreateOptions) -> Result<Container, RuntimeError> {
        self.check_daemon("create")?;
        let mut state = self.state();
        if state
            .containers
            .values()
            .any(|c| c.display_name() == opts.name)
        {
            return Err(RuntimeError::Docker {
                op: "create",
                message: format!("Conflict. The container name \"/{}\" is already in use", opts.name),
            });
        }
        let image_id = state
            .images
            .get(&opts.image)
            .map(|i| i.id.clone())
            .unwrap_or_else(|| opts.image.clone());
        let id = next_id(&mut state);
        let container = Container {
            id: id.clone(),
            name: format!("/{}", opts.name),
            image: image_id,
            created: String::new(),
            config: ContainerConfig {
                image: opts.image.clone(),
                env: Some(opts.env.clone()),
            },
            state: ContainerState {
                status: "created".into(),
                ..ContainerState::default()
            },
        };
        state.created.push(opts.clone());
        state.containers.insert(id, container.clone());
        Ok(container)
    }

    async fn start_container(&self, id: &str, host: &HostOptions) -> Result<(), RuntimeError> {
        self.check_daemon("start")?;
        let mut state = self.state();
        let container = find_container(&mut state, id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        container.state = running_state();
        let id = container.id.clone();
        state.started.push((id, host.clone()));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.check_daemon("stop")?;
        let hung = {
            let mut state = self.state();
            state.stop_calls.push(id.to_string());
            state.hung_stops.contains(id)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        let container = find_container(&mut state, id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        container.state = ContainerState {
            status: "exited".into(),
            ..ContainerState::default()
        };
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_daemon("rm")?;
        let mut state = self.state();
        let container = find_container(&mut state, id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        if container.is_active() {
            return Err(RuntimeError::Docker {
                op: "rm",
                message: "You cannot remove a running container".into(),
            });
        }
        let id = container.id.clone();
        state.containers.remove(&id);
        state.removed.push(id);
        Ok(())
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        self.check_daemon("events")?;
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state();
        state.subscriptions += 1;
        state.event_tx = Some(tx);
        Ok(rx)
    }

    async fn bridge_ip(&self) -> Result<Option<String>, RuntimeError> {
        self.check_daemon("network inspect")?;
        Ok(self.state().bridge_ip.clone())
    }
}
