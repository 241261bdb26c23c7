use std::time::Duration;

/// Tunables for [`ServiceRuntime`](crate::ServiceRuntime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// DNS server handed to every container, if any.
    pub dns: Option<String>,
    /// Address of this host; substituted for `$HOST_IP` and injected as `HOST_IP`.
    pub host_ip: String,
    /// Docker bridge address; substituted for `$DOCKER_IP`.
    pub docker_ip: String,
    /// Injected as `PUBLIC_HOSTNAME`.
    pub public_hostname: String,
    /// Grace period the runtime gives a container before killing it.
    pub stop_grace: Duration,
    /// Outer deadline on a stop request. A stop that outlives it gets the
    /// container blacklisted.
    pub stop_watchdog: Duration,
    /// Immediate retries after a failed pull (not counting the first attempt).
    pub pull_retries: u32,
    /// Maximum restarts for the `on-failure` restart policy.
    pub restart_max_retries: u32,
    /// Log driver for started containers; tagged with the container name.
    pub log_driver: String,
    /// How long the event watcher waits on a silent stream before re-checking
    /// daemon liveness.
    pub event_poll_interval: Duration,
    /// Delay before retrying after the daemon is unreachable.
    pub reconnect_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dns: None,
            host_ip: "127.0.0.1".into(),
            docker_ip: "127.0.0.1".into(),
            public_hostname: "127.0.0.1".into(),
            stop_grace: Duration::from_secs(10),
            stop_watchdog: Duration::from_secs(20),
            pull_retries: 3,
            restart_max_retries: 16,
            log_driver: "syslog".into(),
            event_poll_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Replace `$HOST_IP` and `$DOCKER_IP` placeholders in a user-supplied
    /// environment value.
    pub fn substitute_placeholders(&self, value: &str) -> String {
        value
            .replace("$HOST_IP", &self.host_ip)
            .replace("$DOCKER_IP", &self.docker_ip)
    }
}
