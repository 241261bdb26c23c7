//! Agent options and host fact discovery.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use galaxy_runtime::endpoint::DockerEndpoint;
use galaxy_runtime::host_facts::public_hostname_or_loopback;
use galaxy_runtime::{ContainerRuntime, RuntimeConfig};
use tracing::warn;

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Options shared by every agent command. All of them can be set via env vars.
#[derive(Args, Debug, Clone)]
pub struct AgentOpts {
    /// Environment this host belongs to (env: GALAXY_ENV)
    #[arg(long, global = true, env = "GALAXY_ENV", default_value = "dev")]
    pub env: String,

    /// Pool this host serves (env: GALAXY_POOL)
    #[arg(long, global = true, env = "GALAXY_POOL", default_value = "web")]
    pub pool: String,

    /// Address of this host, injected into containers (env: HOST_IP)
    #[arg(long = "host-ip", global = true, env = "HOST_IP", default_value = "127.0.0.1")]
    pub host_ip: String,

    /// DNS server for started containers (env: GALAXY_DNS)
    #[arg(long, global = true, env = "GALAXY_DNS")]
    pub dns: Option<String>,

    /// Desired-state snapshot file (env: GALAXY_CONFIG)
    #[arg(long, global = true, env = "GALAXY_CONFIG", default_value = "galaxy.json")]
    pub config: PathBuf,

    /// Docker CLI binary (env: DOCKER_BIN)
    #[arg(long = "docker-bin", global = true, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: PathBuf,

    /// Seconds between reconcile passes (env: GALAXY_RECONCILE_INTERVAL_SECS)
    #[arg(
        long = "interval-secs",
        global = true,
        env = "GALAXY_RECONCILE_INTERVAL_SECS",
        default_value_t = 30
    )]
    pub interval_secs: u64,

    /// Prune config records this many versions behind their key's latest
    /// (env: GALAXY_SHARED_EXPIRE_AGE)
    #[arg(long = "shared-expire-age", global = true, env = "GALAXY_SHARED_EXPIRE_AGE")]
    pub shared_expire_age: Option<u64>,

    /// Skip the EC2 metadata lookup for the public hostname
    #[arg(long = "no-metadata", global = true)]
    pub no_metadata: bool,
}

impl AgentOpts {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Build the reconciler config, asking the environment and the runtime
    /// for the addresses containers need.
    pub async fn runtime_config(&self, client: &dyn ContainerRuntime) -> Result<RuntimeConfig> {
        let defaults = RuntimeConfig::default();
        let endpoint = DockerEndpoint::from_env().context("invalid DOCKER_HOST")?;
        let docker_ip = match endpoint.bridge_ip() {
            Some(ip) => ip.to_string(),
            None => match client.bridge_ip().await {
                Ok(Some(ip)) => ip,
                Ok(None) => {
                    warn!("docker bridge has no gateway, using {}", defaults.docker_ip);
                    defaults.docker_ip.clone()
                }
                Err(err) => {
                    warn!(%err, "unable to find docker bridge address, using {}", defaults.docker_ip);
                    defaults.docker_ip.clone()
                }
            },
        };

        let public_hostname = if self.no_metadata {
            defaults.public_hostname.clone()
        } else {
            public_hostname_or_loopback(METADATA_TIMEOUT).await
        };

        Ok(RuntimeConfig {
            dns: self.dns.clone().filter(|dns| !dns.is_empty()),
            host_ip: self.host_ip.clone(),
            docker_ip,
            public_hostname,
            ..defaults
        })
    }
}
