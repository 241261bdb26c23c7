//! Shared fixtures for the reconciler integration tests.
//!
//! Each test file compiles this module separately, so some helpers look
//! unused from any single file.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use galaxy_config::{AppConfig, ServiceConfig};
use galaxy_runtime::{MemBlacklist, MemRegistry, MockRuntime, RuntimeConfig, ServiceRuntime};

pub const OLD_IMAGE: &str = "sha256:6a0c31d2e5f4000000000000000000000000000000000000000000000000006";
pub const NEW_IMAGE: &str = "sha256:7e57a9e000000000000000000000000000000000000000000000000000000001";

pub struct Fixture {
    pub mock: Arc<MockRuntime>,
    pub registry: Arc<MemRegistry>,
    pub blacklist: Arc<MemBlacklist>,
    pub runtime: ServiceRuntime,
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        host_ip: "10.0.0.5".into(),
        docker_ip: "172.17.0.1".into(),
        public_hostname: "127.0.0.1".into(),
        event_poll_interval: Duration::from_millis(50),
        reconnect_interval: Duration::from_millis(100),
        ..RuntimeConfig::default()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(test_config())
}

pub fn fixture_with(config: RuntimeConfig) -> Fixture {
    let mock = Arc::new(MockRuntime::new());
    let registry = Arc::new(MemRegistry::new());
    let blacklist = Arc::new(MemBlacklist::new());
    let runtime = ServiceRuntime::new(mock.clone(), registry.clone(), config)
        .with_blacklist(blacklist.clone());
    Fixture {
        mock,
        registry,
        blacklist,
        runtime,
    }
}

/// `api` at image `api:7`, pinned to [`NEW_IMAGE`].
pub fn api_app() -> ServiceConfig {
    let mut app = ServiceConfig::new("api", "api:7");
    app.set_version_id(NEW_IMAGE).unwrap();
    app
}

/// Run a container tagged as instance `slot` of `app` at `release`.
pub fn run_tagged(mock: &MockRuntime, app: &str, slot: u32, release: &str, image_id: &str) -> String {
    let instance = slot.to_string();
    mock.run_container(
        &format!("{app}.{slot}"),
        image_id,
        &[
            ("GALAXY_APP", app),
            ("GALAXY_VERSION", release),
            ("GALAXY_INSTANCE", instance.as_str()),
        ],
    )
}

/// Run a container of the current release of `app`.
pub fn run_current(mock: &MockRuntime, app: &ServiceConfig, slot: u32) -> String {
    run_tagged(mock, app.name(), slot, &app.id().to_string(), app.version_id())
}

/// Poll `cond` until it holds, letting other tasks run in between.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
