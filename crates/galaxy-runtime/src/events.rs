//! Lifecycle events for the registration collaborator.
//!
//! The watcher keeps one subscription to the runtime's event stream while the
//! daemon answers pings, and drops it as soon as it does not. It runs until
//! its shutdown channel fires or the consumer goes away.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::client::{DaemonEvent, EventStatus, EventStream};
use crate::container::{Container, short_id};
use crate::registry::ServiceRegistration;
use crate::runtime::ServiceRuntime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub status: EventStatus,
    pub container: Container,
    /// `None` only for `start` events of containers not registered yet.
    pub registration: Option<ServiceRegistration>,
}

impl ServiceRuntime {
    /// Spawn the event watcher for this host. Events land on `listener`; the
    /// task ends when `shutdown` fires (or its sender is dropped) or when
    /// `listener` is closed.
    pub fn register_events(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
        listener: mpsc::Sender<ContainerEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let watcher = EventWatcher {
            runtime: self.clone(),
            env: env.to_string(),
            pool: pool.to_string(),
            host_ip: host_ip.to_string(),
            listener,
            poll_interval: self.config().event_poll_interval,
            reconnect_interval: self.config().reconnect_interval,
        };
        tokio::spawn(watcher.run(shutdown))
    }
}

struct EventWatcher {
    runtime: ServiceRuntime,
    env: String,
    pool: String,
    host_ip: String,
    listener: mpsc::Sender<ContainerEvent>,
    poll_interval: Duration,
    reconnect_interval: Duration,
}

enum Wake {
    Shutdown,
    Event(DaemonEvent),
    StreamClosed,
    Silent,
}

impl EventWatcher {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(env = %self.env, pool = %self.pool, "event watcher started");
        let mut stream: Option<EventStream> = None;

        loop {
            if let Err(err) = self.runtime.ping().await {
                error!(%err, "unable to ping docker daemon");
                // the old subscription is dead with the daemon
                stream = None;
                if self.pause(&mut shutdown).await {
                    break;
                }
                continue;
            }

            if stream.is_none() {
                match self.runtime.client().events().await {
                    Ok(events) => {
                        debug!("subscribed to docker events");
                        stream = Some(events);
                    }
                    Err(err) => {
                        error!(%err, "error registering docker event listener");
                        if self.pause(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(events) = stream.as_mut() else {
                continue;
            };

            let wake = tokio::select! {
                _ = shutdown.recv() => Wake::Shutdown,
                event = events.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::StreamClosed,
                },
                // silence only means it is time to check the daemon again
                _ = sleep(self.poll_interval) => Wake::Silent,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Event(event) => {
                    if !self.handle(event).await {
                        info!("event listener closed");
                        break;
                    }
                }
                Wake::StreamClosed => {
                    warn!("docker event stream closed");
                    stream = None;
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                }
                Wake::Silent => {}
            }
        }

        info!("event watcher stopped");
    }

    /// Wait out the reconnect interval. True when shutdown fired meanwhile.
    async fn pause(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = shutdown.recv() => true,
            _ = sleep(self.reconnect_interval) => false,
        }
    }

    /// Forward one daemon event if it concerns a managed container. False
    /// once the listener is gone.
    async fn handle(&self, event: DaemonEvent) -> bool {
        if !event.status.is_lifecycle() {
            return true;
        }

        let container = match self.runtime.inspect_container(&event.id).await {
            Ok(Some(container)) => container,
            Ok(None) => {
                warn!(container = short_id(&event.id), "no container returned for event");
                return true;
            }
            Err(err) => {
                error!(container = short_id(&event.id), %err, "error inspecting container");
                return true;
            }
        };

        let Some(name) = container.app_name() else {
            return true;
        };

        let registration = match self
            .runtime
            .registry()
            .get_service_registration(&self.env, &self.pool, &self.host_ip, &container)
            .await
        {
            Ok(registration) => registration,
            Err(err) => {
                warn!(app = %name, container = container.short_id(), %err, "could not find service registration");
                return true;
            }
        };

        if registration.is_none() && event.status != EventStatus::Start {
            return true;
        }
        // re-registering on every restart would make the app flap
        if container.state.restarting {
            return true;
        }

        debug!(app = %name, container = container.short_id(), status = event.status.as_str(), "container event");
        self.listener
            .send(ContainerEvent {
                status: event.status,
                container,
                registration,
            })
            .await
            .is_ok()
    }
}
