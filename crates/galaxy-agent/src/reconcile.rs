//! The agent loop: periodic reconcile passes plus event-driven registration.

use std::sync::Arc;

use anyhow::{Context, Result};
use galaxy_config::{AppConfig, ConfigSnapshot};
use galaxy_runtime::{
    ContainerEvent, ContainerRuntime, DockerCli, EventStatus, MemRegistry, Registry, ServiceRuntime,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::opts::AgentOpts;

/// What one reconcile pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Container names started this pass.
    pub started: Vec<String>,
    /// Apps whose start failed.
    pub failed: Vec<String>,
    pub stopped: usize,
    pub registered: usize,
    /// Config records pruned from the snapshot.
    pub expired: usize,
}

pub struct Agent {
    opts: AgentOpts,
    runtime: ServiceRuntime,
    registry: Arc<MemRegistry>,
}

impl Agent {
    pub fn new(opts: AgentOpts, runtime: ServiceRuntime, registry: Arc<MemRegistry>) -> Self {
        Self {
            opts,
            runtime,
            registry,
        }
    }

    /// Agent backed by the local docker daemon.
    pub async fn connect(opts: AgentOpts) -> Result<Self> {
        let client = Arc::new(DockerCli::new(&opts.docker_bin));
        client
            .ping()
            .await
            .with_context(|| format!("docker daemon unreachable via {}", opts.docker_bin.display()))?;
        let config = opts.runtime_config(client.as_ref()).await?;
        info!(
            env = %opts.env,
            pool = %opts.pool,
            host_ip = %config.host_ip,
            docker_ip = %config.docker_ip,
            public_hostname = %config.public_hostname,
            "agent configured"
        );
        let registry = Arc::new(MemRegistry::new());
        let runtime = ServiceRuntime::new(client, registry.clone(), config);
        Ok(Self::new(opts, runtime, registry))
    }

    /// Converge this host onto the snapshot once.
    pub async fn pass(&self) -> Result<PassReport> {
        let (env, pool) = (self.opts.env.as_str(), self.opts.pool.as_str());
        let mut snapshot = ConfigSnapshot::load(&self.opts.config)
            .with_context(|| format!("loading {}", self.opts.config.display()))?;
        self.registry.replace_assignments(env, &snapshot.pools);

        let mut report = PassReport::default();
        for name in snapshot.assigned_apps(pool).to_vec() {
            let app = match snapshot.app(&name) {
                Ok(Some(app)) => app,
                Ok(None) => {
                    warn!(app = %name, pool, "assigned app has no config");
                    continue;
                }
                Err(err) => {
                    error!(app = %name, %err, "unable to decode app config");
                    report.failed.push(name);
                    continue;
                }
            };
            if app.version().is_empty() {
                warn!(app = %name, "app has no version, skipping");
                continue;
            }

            let release = app.id().to_string();
            if self.runtime.instance_count(app.name(), &release).await? == 0 {
                match self.runtime.start(env, pool, &app).await {
                    Ok(container) => report.started.push(container.display_name().to_string()),
                    Err(err) => {
                        error!(app = %name, %err, "unable to start");
                        report.failed.push(name);
                        continue;
                    }
                }
            }

            match self.runtime.stop_all_but_current_version(&app).await {
                Ok(stopped) => report.stopped += stopped,
                Err(err) => error!(app = %name, %err, "unable to stop old versions"),
            }
        }

        report.registered = self
            .runtime
            .register_all(env, pool, &self.opts.host_ip)
            .await?
            .len();

        if let Some(age) = self.opts.shared_expire_age {
            report.expired = self.expire(&mut snapshot, age)?;
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            stopped = report.stopped,
            registered = report.registered,
            "reconcile pass done"
        );
        Ok(report)
    }

    /// Prune records `age` versions behind their key and write the snapshot
    /// back when anything went.
    fn expire(&self, snapshot: &mut ConfigSnapshot, age: u64) -> Result<usize> {
        let mut removed = 0;
        for (app, records) in snapshot.expired(age)? {
            removed += snapshot.remove_records(&app, &records);
        }
        if removed > 0 {
            snapshot.save(&self.opts.config)?;
            info!(removed, age, "pruned expired config records");
        }
        Ok(removed)
    }

    /// Reflect one lifecycle event in the registry.
    pub async fn apply_event(&self, event: &ContainerEvent) {
        let (env, pool, host_ip) = (
            self.opts.env.as_str(),
            self.opts.pool.as_str(),
            self.opts.host_ip.as_str(),
        );
        let container = &event.container;
        match event.status {
            EventStatus::Start => {
                match self.registry.register_service(env, pool, host_ip, container).await {
                    Ok(registration) => {
                        info!(app = %registration.name, container = container.short_id(), "registered")
                    }
                    Err(err) => error!(container = container.short_id(), %err, "could not register"),
                }
            }
            EventStatus::Stop | EventStatus::Die => {
                match self.registry.unregister_service(env, pool, host_ip, container).await {
                    Ok(Some(registration)) => {
                        info!(app = %registration.name, container = container.short_id(), "unregistered")
                    }
                    Ok(None) => {}
                    Err(err) => error!(container = container.short_id(), %err, "could not unregister"),
                }
            }
            EventStatus::Other(_) => {}
        }
    }

    /// Reconcile on an interval and follow container events until `shutdown`
    /// fires.
    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let (event_tx, mut events) = mpsc::channel(64);
        let watcher = self.runtime.register_events(
            &self.opts.env,
            &self.opts.pool,
            &self.opts.host_ip,
            event_tx,
            shutdown.subscribe(),
        );

        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.opts.interval());
        info!(interval = ?self.opts.interval(), "agent started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.pass().await {
                        error!("reconcile pass failed: {err:#}");
                    }
                }
                Some(event) = events.recv() => self.apply_event(&event).await,
            }
        }

        if let Err(err) = watcher.await {
            error!(%err, "event watcher panicked");
        }
        info!("agent stopped");
        Ok(())
    }

    /// Unregister and stop everything this agent manages.
    pub async fn drain(&self) -> Result<()> {
        let removed = self
            .runtime
            .unregister_all(&self.opts.env, &self.opts.pool, &self.opts.host_ip)
            .await?;
        let stopped = self.runtime.stop_all().await?;
        info!(unregistered = removed.len(), stopped, "drained host");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use galaxy_config::ServiceConfig;
    use galaxy_runtime::{MockRuntime, RuntimeConfig};
    use tempfile::TempDir;

    use super::*;

    const IMAGE: &str = "sha256:7e57a9e000000000000000000000000000000000000000000000000000000001";
    const NEXT_IMAGE: &str = "sha256:8f68b0f000000000000000000000000000000000000000000000000000000002";

    fn opts(config: &Path) -> AgentOpts {
        AgentOpts {
            env: "prod".into(),
            pool: "web".into(),
            host_ip: "10.0.0.5".into(),
            dns: None,
            config: config.to_path_buf(),
            docker_bin: "docker".into(),
            interval_secs: 1,
            shared_expire_age: None,
            no_metadata: true,
        }
    }

    fn agent(opts: AgentOpts) -> (Agent, Arc<MockRuntime>, Arc<MemRegistry>) {
        let mock = Arc::new(MockRuntime::new());
        let registry = Arc::new(MemRegistry::new());
        let runtime = ServiceRuntime::new(mock.clone(), registry.clone(), RuntimeConfig::default());
        (Agent::new(opts, runtime, registry.clone()), mock, registry)
    }

    fn write_snapshot(dir: &TempDir, app: &ServiceConfig) -> std::path::PathBuf {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.put_app(app).unwrap();
        snapshot.assign("web", app.name());
        let path = dir.path().join("galaxy.json");
        snapshot.save(&path).unwrap();
        path
    }

    fn running(mock: &MockRuntime) -> Vec<galaxy_runtime::Container> {
        mock.containers()
            .into_iter()
            .filter(|c| c.state.running)
            .collect()
    }

    fn api() -> ServiceConfig {
        let mut app = ServiceConfig::new("api", "api:7");
        app.set_version_id(IMAGE).unwrap();
        app
    }

    #[tokio::test]
    async fn pass_starts_once_and_registers() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &api());
        let (agent, mock, registry) = agent(opts(&path));
        mock.add_local_image("api:7", IMAGE);

        let first = agent.pass().await.unwrap();
        assert_eq!(first.started, ["api.0"]);
        assert!(first.failed.is_empty());
        assert_eq!(first.registered, 1);
        assert_eq!(registry.registrations()[0].container_name, "api.0");

        let second = agent.pass().await.unwrap();
        assert!(second.started.is_empty());
        assert_eq!(second.registered, 1);
        assert_eq!(mock.created().len(), 1);
    }

    #[tokio::test]
    async fn pass_rolls_out_a_new_image() {
        let dir = TempDir::new().unwrap();
        let mut app = api();
        for value in ["1", "2", "3"] {
            app.env_set("A", value).unwrap();
        }
        let path = write_snapshot(&dir, &app);
        let (agent, mock, _registry) = agent(opts(&path));
        mock.add_local_image("api:7", IMAGE);
        mock.add_local_image("api:8", NEXT_IMAGE);

        assert_eq!(agent.pass().await.unwrap().started, ["api.0"]);

        let before = app.id();
        app.set_version("api:8").unwrap();
        app.set_version_id(NEXT_IMAGE).unwrap();
        assert!(app.id() > before);
        write_snapshot(&dir, &app);

        let report = agent.pass().await.unwrap();
        assert_eq!(report.started, ["api.0"]);
        let live = running(&mock);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].config.image, "api:8");
        assert_eq!(live[0].image, NEXT_IMAGE);
        assert_eq!(live[0].env_var("GALAXY_VERSION"), Some(app.id().to_string()));
    }

    #[tokio::test]
    async fn pass_redeploys_on_env_change() {
        let dir = TempDir::new().unwrap();
        let mut app = api();
        let path = write_snapshot(&dir, &app);
        let (agent, mock, _registry) = agent(opts(&path));
        mock.add_local_image("api:7", IMAGE);
        agent.pass().await.unwrap();

        app.env_set("MODE", "green").unwrap();
        write_snapshot(&dir, &app);

        assert_eq!(agent.pass().await.unwrap().started, ["api.0"]);
        let live = running(&mock);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].env_var("MODE").as_deref(), Some("green"));
        assert_eq!(mock.stop_calls().len(), 1);

        // converged: nothing more to do
        let settled = agent.pass().await.unwrap();
        assert!(settled.started.is_empty());
        assert_eq!(settled.stopped, 0);
        assert_eq!(mock.created().len(), 2);
    }

    #[tokio::test]
    async fn pass_reports_apps_without_images() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &api());
        let (agent, _mock, _registry) = agent(opts(&path));

        let report = agent.pass().await.unwrap();
        assert_eq!(report.failed, ["api"]);
        assert_eq!(report.registered, 0);
    }

    #[tokio::test]
    async fn pass_prunes_superseded_records() {
        let dir = TempDir::new().unwrap();
        let mut app = api();
        app.set_version("api:8").unwrap();
        app.set_version("api:9").unwrap();
        let path = write_snapshot(&dir, &app);
        let mut options = opts(&path);
        options.shared_expire_age = Some(1);
        let (agent, mock, _registry) = agent(options);
        mock.add_local_image("api:9", IMAGE);

        let report = agent.pass().await.unwrap();
        assert_eq!(report.expired, 1);

        let reloaded = ConfigSnapshot::load(&path).unwrap();
        assert!(!reloaded.apps["api"].contains_key("version:s:1"));
        assert_eq!(reloaded.app("api").unwrap().unwrap().version(), "api:9");
    }

    #[tokio::test]
    async fn events_drive_registration() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &api());
        let (agent, mock, registry) = agent(opts(&path));
        let id = mock.run_container("api.0", IMAGE, &[("GALAXY_APP", "api")]);
        let container = mock.container(&id).unwrap();

        let event = |status| ContainerEvent {
            status,
            container: container.clone(),
            registration: None,
        };
        agent.apply_event(&event(EventStatus::Start)).await;
        assert_eq!(registry.registrations().len(), 1);
        agent.apply_event(&event(EventStatus::Other("pause".into()))).await;
        assert_eq!(registry.registrations().len(), 1);
        agent.apply_event(&event(EventStatus::Die)).await;
        assert!(registry.registrations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &api());
        let (agent, mock, registry) = agent(opts(&path));
        mock.add_local_image("api:7", IMAGE);

        let (shutdown, _) = broadcast::channel(1);
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = trigger.send(());
        });
        agent.run(shutdown).await.unwrap();

        assert_eq!(mock.created().len(), 1);
        assert_eq!(registry.registrations().len(), 1);
    }

    #[tokio::test]
    async fn drain_unregisters_and_stops() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &api());
        let (agent, mock, registry) = agent(opts(&path));
        mock.add_local_image("api:7", IMAGE);
        agent.pass().await.unwrap();

        agent.drain().await.unwrap();
        assert!(registry.registrations().is_empty());
        assert_eq!(mock.stop_calls().len(), 1);
    }
}
