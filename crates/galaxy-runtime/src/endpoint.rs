//! `DOCKER_HOST` parsing.

use std::path::PathBuf;

use crate::error::RuntimeError;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
    Fd(String),
}

impl DockerEndpoint {
    /// Endpoint from `DOCKER_HOST`, defaulting to the local unix socket.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::parse(&std::env::var("DOCKER_HOST").unwrap_or_default())
    }

    pub fn parse(addr: &str) -> Result<Self, RuntimeError> {
        let invalid = || RuntimeError::InvalidEndpoint(addr.to_string());
        let addr = addr.trim();

        if addr.is_empty() {
            return Ok(DockerEndpoint::Unix(DEFAULT_SOCKET.into()));
        }
        if let Some(path) = addr.strip_prefix("unix://") {
            let path = if path.is_empty() { DEFAULT_SOCKET } else { path };
            return Ok(DockerEndpoint::Unix(path.into()));
        }
        if let Some(fd) = addr.strip_prefix("fd://") {
            return Ok(DockerEndpoint::Fd(fd.to_string()));
        }
        let hostport = match addr.strip_prefix("tcp://") {
            Some(rest) => rest,
            None if addr.contains("://") => return Err(invalid()),
            None => addr,
        };

        let Some((host, port)) = hostport.split_once(':') else {
            return Err(invalid());
        };
        if port.contains(':') {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        Ok(DockerEndpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Address containers can reach the daemon's host on, when the endpoint
    /// itself names one.
    pub fn bridge_ip(&self) -> Option<&str> {
        match self {
            DockerEndpoint::Tcp { host, .. } => Some(host),
            _ => None,
        }
    }
}
