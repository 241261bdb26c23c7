//! File-backed desired-state document.
//!
//! A snapshot is the read-back of the replicated store for one environment:
//! the wire records of every application plus the pool assignments. Deploy
//! tooling writes it; the agent re-reads it on every reconcile pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use galaxy_vmap::WireMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::{AppConfig, ServiceConfig};
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Wire records per application name.
    #[serde(default)]
    pub apps: BTreeMap<String, WireMap>,
    /// Application names assigned to each pool.
    #[serde(default)]
    pub pools: BTreeMap<String, Vec<String>>,
}

impl ConfigSnapshot {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: Self = serde_json::from_slice(&bytes)?;
        debug!(
            path = %path.display(),
            apps = snapshot.apps.len(),
            pools = snapshot.pools.len(),
            "loaded config snapshot"
        );
        Ok(snapshot)
    }

    /// Write the snapshot next to `path` and rename it into place.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn app(&self, name: &str) -> Result<Option<ServiceConfig>, ConfigError> {
        self.apps
            .get(name)
            .map(|records| ServiceConfig::from_records(name, records))
            .transpose()
    }

    pub fn app_configs(&self) -> Result<Vec<ServiceConfig>, ConfigError> {
        self.apps
            .iter()
            .map(|(name, records)| ServiceConfig::from_records(name.clone(), records))
            .collect()
    }

    /// Merge `app` into the stored records for its name.
    pub fn put_app(&mut self, app: &ServiceConfig) -> Result<(), ConfigError> {
        let merged = match self.app(app.name())? {
            Some(mut existing) => {
                existing.merge(app)?;
                existing
            }
            None => app.clone(),
        };
        self.apps.insert(app.name().to_string(), merged.marshal());
        Ok(())
    }

    pub fn assign(&mut self, pool: &str, app: &str) {
        let apps = self.pools.entry(pool.to_string()).or_default();
        if !apps.iter().any(|a| a == app) {
            apps.push(app.to_string());
            apps.sort();
        }
    }

    pub fn unassign(&mut self, pool: &str, app: &str) {
        if let Some(apps) = self.pools.get_mut(pool) {
            apps.retain(|a| a != app);
        }
    }

    /// Pools `app` is assigned to, sorted.
    pub fn assigned_pools(&self, app: &str) -> Vec<String> {
        self.pools
            .iter()
            .filter(|(_, apps)| apps.iter().any(|a| a == app))
            .map(|(pool, _)| pool.clone())
            .collect()
    }

    pub fn assigned_apps(&self, pool: &str) -> &[String] {
        self.pools.get(pool).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Merge another replica's snapshot: application records merge as
    /// versioned maps, pool assignments are unioned.
    pub fn merge(&mut self, other: &ConfigSnapshot) -> Result<(), ConfigError> {
        for app in other.app_configs()? {
            self.put_app(&app)?;
        }
        for (pool, apps) in &other.pools {
            for app in apps {
                self.assign(pool, app);
            }
        }
        Ok(())
    }

    /// Expired records per application, for removal from the backing store.
    pub fn expired(&self, age: u64) -> Result<BTreeMap<String, WireMap>, ConfigError> {
        let mut out = BTreeMap::new();
        for app in self.app_configs()? {
            let expired = app.expired_records(age);
            if !expired.is_empty() {
                out.insert(app.name().to_string(), expired);
            }
        }
        Ok(out)
    }

    /// Drop the given records for `app`. Returns how many were present.
    pub fn remove_records(&mut self, app: &str, records: &WireMap) -> usize {
        let Some(stored) = self.apps.get_mut(app) else {
            return 0;
        };
        records
            .keys()
            .filter(|key| stored.remove(key.as_str()).is_some())
            .count()
    }
}
