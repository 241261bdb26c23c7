//! The reconciler: turns application descriptors into running containers.
//!
//! Nothing here is cached. Every decision starts from a fresh listing of the
//! runtime's containers, and a container belongs to us exactly when its
//! environment carries a [`GALAXY_APP`] tag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use galaxy_config::AppConfig;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::blacklist::{BlacklistStore, MemBlacklist};
use crate::client::{ContainerRuntime, CreateOptions, HostOptions, LogConfig, RestartPolicy};
use crate::config::RuntimeConfig;
use crate::container::{
    Container, ContainerStatus, ENV, GALAXY_APP, GALAXY_INSTANCE, GALAXY_VERSION, HOST_IP, Image,
    PUBLIC_HOSTNAME,
};
use crate::error::RuntimeError;
use crate::image::{parse_memory, split_docker_image};
use crate::registry::{Registry, ServiceRegistration};
use crate::slot::next_slot;

/// What a single stop request ended as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Already blacklisted; no request was sent.
    Skipped,
    /// The watchdog fired first and the container is now blacklisted.
    Blacklisted,
}

#[derive(Clone)]
pub struct ServiceRuntime {
    client: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn Registry>,
    blacklist: Arc<dyn BlacklistStore>,
    config: Arc<RuntimeConfig>,
    /// One lock per application name; held for the whole of `start`.
    start_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ServiceRuntime {
    pub fn new(
        client: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn Registry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            client,
            registry,
            blacklist: Arc::new(MemBlacklist::new()),
            config: Arc::new(config),
            start_locks: Arc::default(),
        }
    }

    /// Share a blacklist between reconcilers, or inspect it from tests.
    pub fn with_blacklist(mut self, blacklist: Arc<dyn BlacklistStore>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &dyn ContainerRuntime {
        self.client.as_ref()
    }

    pub(crate) fn registry(&self) -> &dyn Registry {
        self.registry.as_ref()
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.client.ping().await
    }

    pub async fn inspect_image(&self, name: &str) -> Result<Option<Image>, RuntimeError> {
        self.client.inspect_image(name).await
    }

    pub async fn inspect_container(&self, id: &str) -> Result<Option<Container>, RuntimeError> {
        self.client.inspect_container(id).await
    }

    /// Local image carrying exactly the tag `name`.
    pub async fn get_image_by_name(&self, name: &str) -> Result<Option<Image>, RuntimeError> {
        let images = self.client.list_images().await?;
        Ok(images.into_iter().find(|image| image.has_tag(name)))
    }

    /// Make sure `version` resolves locally to content id `id`, pulling it if
    /// it does not.
    ///
    /// A registry that does not have the image is not an error: the previous
    /// local image (possibly none) is returned. Other pull failures are
    /// retried immediately `pull_retries` times before being returned.
    pub async fn pull_image(&self, version: &str, id: &str) -> Result<Option<Image>, RuntimeError> {
        let local = self.client.inspect_image(version).await?;
        if local.as_ref().is_some_and(|image| image.id == id) {
            return Ok(local);
        }

        let reference = split_docker_image(version);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.client.pull_image(&reference).await {
                Ok(()) => break,
                Err(RuntimeError::ImageNotFound(_)) => {
                    warn!(image = %reference, "image not found in registry");
                    return Ok(local);
                }
                Err(err) if attempt > self.config.pull_retries => return Err(err),
                Err(err) => {
                    error!(image = %reference, attempt, %err, "error pulling image");
                }
            }
        }

        self.client.inspect_image(version).await
    }

    /// Converge the next free instance slot of `app` onto its desired image
    /// and start it.
    pub async fn start(
        &self,
        env: &str,
        pool: &str,
        app: &dyn AppConfig,
    ) -> Result<Container, RuntimeError> {
        let lock = self.start_lock(app.name());
        let _guard = lock.lock().await;

        let version = app.version();
        let id_ref = if app.version_id().is_empty() {
            version
        } else {
            app.version_id()
        };
        let image = self
            .pull_image(version, id_ref)
            .await?
            .ok_or_else(|| RuntimeError::ImageUnavailable(version.to_string()))?;

        let release = app.id().to_string();
        let mut occupied = self.occupied_slots(app.name(), &release).await?;
        let (slot, name, existing) = loop {
            let slot = next_slot(&occupied);
            let name = format!("{}.{slot}", app.container_name());
            let mut existing = self.client.inspect_container(&name).await?;
            let Some(stale) = existing.take_if(|c| c.image != image.id || is_other_release(c, &release))
            else {
                break (slot, name, existing);
            };
            if stale.is_active() {
                info!(app = app.name(), version, container = stale.short_id(), "stopping stale container");
                if self.stop_container(&stale).await? != StopOutcome::Stopped {
                    // a zombie keeps its name, so leave the slot to it
                    warn!(app = app.name(), container = stale.short_id(), slot, "slot held by blacklisted container");
                    occupied.push(slot);
                    continue;
                }
            }
            info!(app = app.name(), version, container = stale.short_id(), "removing stale container");
            self.client.remove_container(&stale.id).await?;
            break (slot, name, None);
        };

        let host = self.host_options(&name);
        let container = match existing {
            Some(container) => container,
            None => {
                let opts = CreateOptions {
                    name: name.clone(),
                    image: version.to_string(),
                    env: self.container_env(env, app, slot),
                    memory: app.memory(pool).map(|m| parse_memory(&m)).transpose()?,
                    cpu_shares: app.cpu_shares(pool).and_then(|cpu| match cpu.parse() {
                        Ok(shares) => Some(shares),
                        Err(_) => {
                            warn!(app = app.name(), pool, %cpu, "ignoring invalid cpu shares");
                            None
                        }
                    }),
                    host: host.clone(),
                };
                info!(app = app.name(), version, "creating container");
                self.client.create_container(&opts).await?
            }
        };

        info!(app = app.name(), version, container = container.short_id(), "starting container");
        self.client.start_container(&container.id, &host).await?;
        Ok(container)
    }

    /// Stop the container running exactly this release of `app`.
    pub async fn stop(&self, app: &dyn AppConfig) -> Result<(), RuntimeError> {
        let release = app.id().to_string();
        for container in self.managed_containers().await? {
            let env = container.env();
            if env.get(GALAXY_APP).map(String::as_str) == Some(app.name())
                && env.get(GALAXY_VERSION) == Some(&release)
                && container.image == app.version_id()
            {
                self.stop_container(&container).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Stop every container of application `name`. Returns the number of
    /// stop requests issued.
    pub async fn stop_all_matching(&self, name: &str) -> Result<usize, RuntimeError> {
        let containers = self.managed_containers().await?;
        let matching = containers
            .iter()
            .filter(|c| c.app_name().as_deref() == Some(name));
        Ok(self.stop_each(matching).await)
    }

    /// Stop at most `limit` containers of `app` that run another image or
    /// release. Returns the number stopped.
    pub async fn stop_old_version(
        &self,
        app: &dyn AppConfig,
        limit: usize,
    ) -> Result<usize, RuntimeError> {
        self.stop_stale(app, Some(limit)).await
    }

    /// Stop every container of `app` that runs another image or release.
    pub async fn stop_all_but_current_version(
        &self,
        app: &dyn AppConfig,
    ) -> Result<usize, RuntimeError> {
        self.stop_stale(app, None).await
    }

    /// Stop managed containers whose application is not assigned to
    /// `env`/`pool`.
    pub async fn stop_unassigned(&self, env: &str, pool: &str) -> Result<usize, RuntimeError> {
        let mut unassigned = Vec::new();
        for container in self.managed_containers().await? {
            let Some(name) = container.app_name() else {
                continue;
            };
            match self.registry.list_assigned_pools(env, &name).await {
                Ok(pools) if pools.iter().any(|p| p == pool) => {}
                Ok(_) => {
                    warn!(container = container.display_name(), env, pool, "container not assigned here");
                    unassigned.push(container);
                }
                Err(err) => {
                    error!(container = container.display_name(), %err, "unable to list pool assignments");
                }
            }
        }
        Ok(self.stop_each(unassigned.iter()).await)
    }

    pub async fn stop_all(&self) -> Result<usize, RuntimeError> {
        let containers = self.managed_containers().await?;
        Ok(self.stop_each(containers.iter()).await)
    }

    /// Register every managed container, after stopping the ones that no
    /// longer belong to this pool. Containers that fail to register are
    /// logged and skipped.
    pub async fn register_all(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
    ) -> Result<Vec<ServiceRegistration>, RuntimeError> {
        if let Err(err) = self.stop_unassigned(env, pool).await {
            error!(%err, "unable to stop unassigned containers");
        }

        let mut registrations = Vec::new();
        for container in self.managed_containers().await? {
            match self.registry.register_service(env, pool, host_ip, &container).await {
                Ok(registration) => registrations.push(registration),
                Err(err) => {
                    error!(app = %container.app_name().unwrap_or_default(), %err, "could not register");
                }
            }
        }
        Ok(registrations)
    }

    /// Unregister every managed container. Stops at the first failure.
    pub async fn unregister_all(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
    ) -> Result<Vec<Container>, RuntimeError> {
        let mut removed = Vec::new();
        for container in self.managed_containers().await? {
            let name = container.app_name().unwrap_or_default();
            if let Err(err) = self
                .registry
                .unregister_service(env, pool, host_ip, &container)
                .await
            {
                error!(app = %name, %err, "could not unregister");
                return Err(err);
            }
            info!(container = container.short_id(), app = %name, "unregistered");
            removed.push(container);
        }
        Ok(removed)
    }

    /// Tagged containers that are running or restarting.
    pub async fn managed_containers(&self) -> Result<Vec<Container>, RuntimeError> {
        let mut managed = Vec::new();
        for id in self.client.list_containers().await? {
            let container = match self.client.inspect_container(&id).await {
                Ok(Some(container)) => container,
                Ok(None) => continue,
                Err(err) => {
                    error!(container = %id, %err, "unable to inspect container");
                    continue;
                }
            };
            if container.app_name().is_some() && (container.state.running || container.state.restarting) {
                managed.push(container);
            }
        }
        Ok(managed)
    }

    /// Occupied instance slots of `app`, restricted to release `version`
    /// unless it is empty.
    pub async fn instance_ids(&self, app: &str, version: &str) -> Result<Vec<u32>, RuntimeError> {
        let mut slots = Vec::new();
        for container in self.managed_containers().await? {
            let env = container.env();
            if env.get(GALAXY_APP).map(String::as_str) != Some(app) {
                continue;
            }
            let Some(slot) = instance_slot(&container) else {
                continue;
            };
            if !version.is_empty() && env.get(GALAXY_VERSION).map(String::as_str) != Some(version) {
                continue;
            }
            slots.push(slot);
        }
        Ok(slots)
    }

    pub async fn instance_count(&self, app: &str, version: &str) -> Result<usize, RuntimeError> {
        Ok(self.instance_ids(app, version).await?.len())
    }

    pub async fn next_instance_slot(&self, app: &str, version: &str) -> Result<u32, RuntimeError> {
        Ok(next_slot(&self.instance_ids(app, version).await?))
    }

    pub fn is_blacklisted(&self, container_id: &str) -> bool {
        self.blacklist.contains(container_id)
    }

    /// Runtime status, overridden by the blacklist.
    pub fn status_of(&self, container: &Container) -> ContainerStatus {
        if self.is_blacklisted(&container.id) {
            ContainerStatus::Blacklisted
        } else {
            container.status()
        }
    }

    /// Slots `start` must not hand out for `release` of `app`: the release's
    /// own instances plus any slot a blacklisted container of `app` still
    /// holds.
    async fn occupied_slots(&self, app: &str, release: &str) -> Result<Vec<u32>, RuntimeError> {
        let mut slots = Vec::new();
        for container in self.managed_containers().await? {
            if container.app_name().as_deref() != Some(app) {
                continue;
            }
            let ours = container.env_var(GALAXY_VERSION).as_deref() == Some(release);
            if !ours && !self.is_blacklisted(&container.id) {
                continue;
            }
            if let Some(slot) = instance_slot(&container) {
                slots.push(slot);
            }
        }
        Ok(slots)
    }

    /// Stop one container, giving up after the watchdog deadline. A stop the
    /// watchdog gives up on blacklists the container and still counts as
    /// success.
    pub async fn stop_container(&self, container: &Container) -> Result<StopOutcome, RuntimeError> {
        if self.is_blacklisted(&container.id) {
            info!(container = container.short_id(), "container blacklisted, won't try to stop");
            return Ok(StopOutcome::Skipped);
        }

        info!(name = container.display_name(), container = container.short_id(), "stopping container");
        let stop = self.client.stop_container(&container.id, self.config.stop_grace);
        match timeout(self.config.stop_watchdog, stop).await {
            Ok(Ok(())) => {
                info!(name = container.display_name(), container = container.short_id(), "stopped container");
                Ok(StopOutcome::Stopped)
            }
            Ok(Err(err)) => {
                error!(container = %container.id, %err, "unable to stop container");
                Err(err)
            }
            Err(_) => {
                self.blacklist.insert(&container.id);
                error!(container = %container.id, "timed out stopping container, blacklisting");
                Ok(StopOutcome::Blacklisted)
            }
        }
    }

    async fn stop_stale(
        &self,
        app: &dyn AppConfig,
        limit: Option<usize>,
    ) -> Result<usize, RuntimeError> {
        let release = app.id().to_string();
        let mut stopped = 0;
        for container in self.managed_containers().await? {
            if limit.is_some_and(|limit| stopped >= limit) {
                break;
            }
            if container.app_name().as_deref() != Some(app.name()) {
                continue;
            }
            // blacklisted containers never count toward the limit
            if self.is_blacklisted(&container.id) {
                continue;
            }

            let image = match self.client.inspect_image(&container.image).await {
                Ok(Some(image)) => image,
                Ok(None) => {
                    error!(container = container.short_id(), "image for container does not exist");
                    continue;
                }
                Err(err) => {
                    error!(image = %container.image, %err, "unable to inspect image");
                    continue;
                }
            };

            let image_differs = !app.version_id().is_empty() && image.id != app.version_id();
            if !(image_differs || is_other_release(&container, &release)) {
                continue;
            }

            if let Err(err) = self.stop_container(&container).await {
                debug!(container = container.short_id(), %err, "continuing after failed stop");
            }
            stopped += 1;
        }
        Ok(stopped)
    }

    /// Stop each container in turn, logging failures. Returns how many stop
    /// requests were issued.
    async fn stop_each<'a>(&self, containers: impl Iterator<Item = &'a Container>) -> usize {
        let mut issued = 0;
        for container in containers {
            match self.stop_container(container).await {
                Ok(StopOutcome::Skipped) => {}
                Ok(_) => issued += 1,
                Err(err) => {
                    debug!(container = container.short_id(), %err, "continuing after failed stop");
                    issued += 1;
                }
            }
        }
        issued
    }

    fn start_lock(&self, app: &str) -> Arc<Mutex<()>> {
        let mut locks = self.start_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(app.to_string()).or_default().clone()
    }

    /// `KEY=value` entries for a new container of `app` in `slot`.
    fn container_env(&self, env: &str, app: &dyn AppConfig, slot: u32) -> Vec<String> {
        let mut vars = vec![format!("{ENV}={env}")];
        for (key, value) in app.env() {
            let key = key.to_uppercase();
            if key == ENV {
                continue;
            }
            vars.push(format!("{key}={}", self.config.substitute_placeholders(&value)));
        }
        vars.push(format!("{HOST_IP}={}", self.config.host_ip));
        vars.push(format!("{GALAXY_APP}={}", app.name()));
        vars.push(format!("{GALAXY_VERSION}={}", app.id()));
        vars.push(format!("{GALAXY_INSTANCE}={slot}"));
        vars.push(format!("{PUBLIC_HOSTNAME}={}", self.config.public_hostname));
        vars
    }

    fn host_options(&self, container_name: &str) -> HostOptions {
        let mut log = LogConfig {
            driver: self.config.log_driver.clone(),
            ..LogConfig::default()
        };
        if !log.driver.is_empty() {
            log.options
                .insert(format!("{}-tag", log.driver), container_name.to_string());
        }
        HostOptions {
            publish_all_ports: true,
            restart: RestartPolicy::OnFailure {
                max_retries: self.config.restart_max_retries,
            },
            log,
            dns: self.config.dns.iter().cloned().collect(),
        }
    }
}

/// Instance slot a container is tagged with. Malformed tags are logged and
/// treated as absent.
fn instance_slot(container: &Container) -> Option<u32> {
    let instance = container.env_var(GALAXY_INSTANCE).filter(|i| !i.is_empty())?;
    match instance.parse() {
        Ok(slot) => Some(slot),
        Err(_) => {
            warn!(container = container.short_id(), %instance, "invalid instance number, ignoring");
            None
        }
    }
}

/// True when `container` is tagged with a release other than `release`.
fn is_other_release(container: &Container, release: &str) -> bool {
    container
        .env_var(GALAXY_VERSION)
        .is_some_and(|running| running != release)
}
