//! Application descriptors.
//!
//! [`AppConfig`] is the accessor contract the reconciler consumes.
//! [`ServiceConfig`] implements it on top of a single [`VersionedMap`], so a
//! descriptor replicates and merges exactly like any other map.

use std::collections::BTreeMap;

use galaxy_vmap::{VersionedMap, VmapError, WireMap};

use crate::error::ConfigError;

const VERSION_KEY: &str = "version";
const VERSION_ID_KEY: &str = "versionId";
const ENV_PREFIX: &str = "env.";
const RUNTIME_PREFIX: &str = "runtime.";
const PORTS_PREFIX: &str = "ports.";

/// Read-only view of one application's desired state.
pub trait AppConfig: Send + Sync {
    fn name(&self) -> &str;

    /// Numeric release id: the highest version written to any field. Every
    /// field change moves it forward. Injected into containers as
    /// `GALAXY_VERSION`.
    fn id(&self) -> i64;

    /// Image reference, e.g. `registry.example.com/team/app:1.4`.
    fn version(&self) -> &str;

    /// Content id of the image the reference must resolve to. Empty when the
    /// reference alone is authoritative.
    fn version_id(&self) -> &str;

    fn env(&self) -> BTreeMap<String, String>;

    /// Memory limit for containers in `pool`, in `docker -m` syntax.
    fn memory(&self, pool: &str) -> Option<String>;

    fn cpu_shares(&self, pool: &str) -> Option<String>;

    /// Base container name; instances append `.<slot>`.
    fn container_name(&self) -> String {
        self.name().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    name: String,
    vmap: VersionedMap,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, version: &str) -> Self {
        let mut vmap = VersionedMap::new();
        if !version.is_empty() {
            vmap.set_version(VERSION_KEY, version, 1);
        }
        Self {
            name: name.into(),
            vmap,
        }
    }

    /// Decode a descriptor from the records stored for `name`.
    pub fn from_records(name: impl Into<String>, records: &WireMap) -> Result<Self, ConfigError> {
        let name = name.into();
        let vmap = VersionedMap::from_wire(records).map_err(|source| ConfigError::Records {
            app: name.clone(),
            source,
        })?;
        Ok(Self { name, vmap })
    }

    pub fn set_version(&mut self, version: &str) -> Result<(), ConfigError> {
        self.write(VERSION_KEY, version)
    }

    pub fn set_version_id(&mut self, version_id: &str) -> Result<(), ConfigError> {
        self.write(VERSION_ID_KEY, version_id)
    }

    pub fn env_set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.write(&format!("{ENV_PREFIX}{key}"), value)
    }

    pub fn env_get(&self, key: &str) -> &str {
        self.vmap.get(&format!("{ENV_PREFIX}{key}"))
    }

    pub fn env_unset(&mut self, key: &str) -> Result<(), ConfigError> {
        self.env_set(key, "")
    }

    /// Expose `port` with protocol `proto` (`tcp` or `udp`).
    pub fn add_port(&mut self, port: &str, proto: &str) -> Result<(), ConfigError> {
        self.write(&format!("{PORTS_PREFIX}{port}"), proto)
    }

    /// Exposed ports and their protocols.
    pub fn ports(&self) -> BTreeMap<String, String> {
        self.prefixed(PORTS_PREFIX)
    }

    pub fn clear_ports(&mut self) -> Result<(), ConfigError> {
        for port in self.ports().into_keys() {
            self.write(&format!("{PORTS_PREFIX}{port}"), "")?;
        }
        Ok(())
    }

    pub fn set_memory(&mut self, pool: &str, memory: &str) -> Result<(), ConfigError> {
        self.write(&memory_key(pool), memory)
    }

    pub fn set_cpu_shares(&mut self, pool: &str, shares: &str) -> Result<(), ConfigError> {
        self.write(&cpu_key(pool), shares)
    }

    /// Merge another replica's copy of the same application.
    pub fn merge(&mut self, other: &ServiceConfig) -> Result<(), ConfigError> {
        if other.name != self.name {
            return Err(ConfigError::NameMismatch {
                ours: self.name.clone(),
                theirs: other.name.clone(),
            });
        }
        self.vmap.merge(&other.vmap);
        Ok(())
    }

    pub fn marshal(&self) -> WireMap {
        self.vmap.marshal_map()
    }

    /// Records superseded by more than `age` newer versions of their key.
    pub fn expired_records(&self, age: u64) -> WireMap {
        self.vmap.marshal_expired_map(age)
    }

    pub fn vmap(&self) -> &VersionedMap {
        &self.vmap
    }

    /// Write `key` one past the highest version of any field, so the release
    /// id advances with every change. An empty value unsets.
    fn write(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let latest = self.vmap.latest_version();
        let version = latest.checked_add(1).ok_or_else(|| ConfigError::Records {
            app: self.name.clone(),
            source: VmapError::VersionOverflow {
                key: key.to_string(),
                version: latest,
            },
        })?;
        if value.is_empty() {
            self.vmap.unset_version(key, version);
        } else {
            self.vmap.set_version(key, value, version);
        }
        Ok(())
    }

    fn prefixed(&self, prefix: &str) -> BTreeMap<String, String> {
        self.vmap
            .keys()
            .filter_map(|key| {
                let name = key.strip_prefix(prefix)?;
                let value = self.vmap.get(key);
                (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
            })
            .collect()
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match self.vmap.get(key) {
            "" => None,
            value => Some(value.to_string()),
        }
    }
}

fn memory_key(pool: &str) -> String {
    format!("{RUNTIME_PREFIX}{pool}.mem")
}

fn cpu_key(pool: &str) -> String {
    format!("{RUNTIME_PREFIX}{pool}.cpu")
}

impl AppConfig for ServiceConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> i64 {
        self.vmap.latest_version()
    }

    fn version(&self) -> &str {
        self.vmap.get(VERSION_KEY)
    }

    fn version_id(&self) -> &str {
        self.vmap.get(VERSION_ID_KEY)
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.prefixed(ENV_PREFIX)
    }

    fn memory(&self, pool: &str) -> Option<String> {
        self.lookup(&memory_key(pool))
    }

    fn cpu_shares(&self, pool: &str) -> Option<String> {
        self.lookup(&cpu_key(pool))
    }
}
