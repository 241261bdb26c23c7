//! Service registration collaborator.
//!
//! The reconciler only forwards containers here; where traffic is routed is
//! decided by whoever implements [`Registry`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::container::{Container, GALAXY_APP, GALAXY_INSTANCE, GALAXY_VERSION};
use crate::error::RuntimeError;

/// What a registry records for one running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub env: String,
    pub pool: String,
    pub host_ip: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub instance: String,
}

impl ServiceRegistration {
    /// Build a registration from a container's identity environment. `None`
    /// for containers without an application tag.
    pub fn for_container(env: &str, pool: &str, host_ip: &str, container: &Container) -> Option<Self> {
        let vars = container.env();
        let name = vars.get(GALAXY_APP).filter(|n| !n.is_empty())?.clone();
        Some(Self {
            name,
            env: env.to_string(),
            pool: pool.to_string(),
            host_ip: host_ip.to_string(),
            container_id: container.id.clone(),
            container_name: container.display_name().to_string(),
            image: container.config.image.clone(),
            version: vars.get(GALAXY_VERSION).cloned().unwrap_or_default(),
            instance: vars.get(GALAXY_INSTANCE).cloned().unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register_service(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
        container: &Container,
    ) -> Result<ServiceRegistration, RuntimeError>;

    /// Returns the registration that was removed, if there was one.
    async fn unregister_service(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
        container: &Container,
    ) -> Result<Option<ServiceRegistration>, RuntimeError>;

    async fn get_service_registration(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
        container: &Container,
    ) -> Result<Option<ServiceRegistration>, RuntimeError>;

    /// Pools `app` is assigned to in `env`.
    async fn list_assigned_pools(&self, env: &str, app: &str) -> Result<Vec<String>, RuntimeError>;
}

type RegistrationKey = (String, String, String);

/// Registry kept in process memory.
#[derive(Debug, Default)]
pub struct MemRegistry {
    /// `(env, app)` -> pools.
    assignments: RwLock<BTreeMap<(String, String), BTreeSet<String>>>,
    /// `(env, pool, container id)` -> registration.
    registrations: RwLock<BTreeMap<RegistrationKey, ServiceRegistration>>,
    /// Apps whose register/unregister calls fail.
    rejected: RwLock<BTreeSet<String>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, env: &str, pool: &str, app: &str) {
        self.assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((env.to_string(), app.to_string()))
            .or_default()
            .insert(pool.to_string());
    }

    /// Replace every assignment in `env` with `pools` (pool -> apps).
    pub fn replace_assignments(&self, env: &str, pools: &BTreeMap<String, Vec<String>>) {
        let mut assignments = self.assignments.write().unwrap_or_else(PoisonError::into_inner);
        assignments.retain(|(e, _), _| e != env);
        for (pool, apps) in pools {
            for app in apps {
                assignments
                    .entry((env.to_string(), app.clone()))
                    .or_default()
                    .insert(pool.clone());
            }
        }
    }

    /// Make every registry write for `app` fail.
    pub fn reject(&self, app: &str) {
        self.rejected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app.to_string());
    }

    pub fn registrations(&self) -> Vec<ServiceRegistration> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn check_writable(&self, app: &str) -> Result<(), RuntimeError> {
        if self
            .rejected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(app)
        {
            return Err(RuntimeError::Registry(format!("writes for {app} are rejected")));
        }
        Ok(())
    }
}

fn key(env: &str, pool: &str, container: &Container) -> RegistrationKey {
    (env.to_string(), pool.to_string(), container.id.clone())
}

fn untagged(container: &Container) -> RuntimeError {
    RuntimeError::Registry(format!("container {} has no {GALAXY_APP}", container.short_id()))
}

#[async_trait]
impl Registry for MemRegistry {
    async fn register_service(
        &self,
        env: &str,
        pool: &str,
        host_ip: &str,
        container: &Container,
    ) -> Result<ServiceRegistration, RuntimeError> {
        let registration = ServiceRegistration::for_container(env, pool, host_ip, container)
            .ok_or_else(|| untagged(container))?;
        self.check_writable(&registration.name)?;
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(env, pool, container), registration.clone());
        Ok(registration)
    }

    async fn unregister_service(
        &self,
        env: &str,
        pool: &str,
        _host_ip: &str,
        container: &Container,
    ) -> Result<Option<ServiceRegistration>, RuntimeError> {
        let app = container.app_name().ok_or_else(|| untagged(container))?;
        self.check_writable(&app)?;
        Ok(self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(env, pool, container)))
    }

    async fn get_service_registration(
        &self,
        env: &str,
        pool: &str,
        _host_ip: &str,
        container: &Container,
    ) -> Result<Option<ServiceRegistration>, RuntimeError> {
        Ok(self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(env, pool, container))
            .cloned())
    }

    async fn list_assigned_pools(&self, env: &str, app: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(env.to_string(), app.to_string()))
            .map(|pools| pools.iter().cloned().collect())
            .unwrap_or_default())
    }
}
