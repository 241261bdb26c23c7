mod helpers;

use galaxy_config::{AppConfig, ServiceConfig};
use galaxy_runtime::container::ContainerState;
use galaxy_runtime::{BlacklistStore, ContainerStatus, PullOutcome, RuntimeError, StopOutcome};
use helpers::{NEW_IMAGE, OLD_IMAGE, api_app, fixture, run_current, run_tagged};

#[tokio::test]
async fn pull_is_skipped_when_local_image_matches() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);

    let image = fx.runtime.pull_image("api:7", NEW_IMAGE).await.unwrap().unwrap();
    assert_eq!(image.id, NEW_IMAGE);
    assert_eq!(fx.mock.pull_attempts(), 0);
}

#[tokio::test]
async fn pull_retries_transient_failures() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", OLD_IMAGE);
    fx.mock.publish_image("api:7", NEW_IMAGE);
    fx.mock.script_pulls([
        PullOutcome::Transient("connection reset".into()),
        PullOutcome::Transient("TLS handshake timeout".into()),
    ]);

    let image = fx.runtime.pull_image("api:7", NEW_IMAGE).await.unwrap().unwrap();
    assert_eq!(image.id, NEW_IMAGE);
    assert_eq!(fx.mock.pull_attempts(), 3);
}

#[tokio::test]
async fn pull_gives_up_after_retries() {
    let fx = fixture();
    fx.mock.publish_image("api:7", NEW_IMAGE);
    fx.mock
        .script_pulls((0..10).map(|i| PullOutcome::Transient(format!("attempt {i}"))));

    let err = fx.runtime.pull_image("api:7", NEW_IMAGE).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Docker { op: "pull", .. }), "{err}");
    // one attempt plus three retries
    assert_eq!(fx.mock.pull_attempts(), 4);
}

#[tokio::test]
async fn missing_image_is_not_an_error() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", OLD_IMAGE);
    fx.mock.script_pulls([PullOutcome::NotFound]);

    let image = fx.runtime.pull_image("api:7", NEW_IMAGE).await.unwrap();
    assert_eq!(image.map(|i| i.id).as_deref(), Some(OLD_IMAGE));
    assert_eq!(fx.mock.pull_attempts(), 1);

    let fresh = fixture();
    assert_eq!(fresh.runtime.pull_image("ghost:1", NEW_IMAGE).await.unwrap(), None);
}

#[tokio::test]
async fn start_fails_without_any_image() {
    let fx = fixture();
    let err = fx.runtime.start("prod", "web", &api_app()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ImageUnavailable(ref v) if v == "api:7"), "{err}");
    assert!(fx.mock.created().is_empty());
}

#[tokio::test]
async fn start_creates_first_instance() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let mut app = api_app();
    app.env_set("redis_url", "redis://$DOCKER_IP:6379").unwrap();
    app.set_memory("web", "512m").unwrap();
    app.set_cpu_shares("web", "256").unwrap();

    let container = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(container.display_name(), "api.0");

    let created = fx.mock.created();
    assert_eq!(created.len(), 1);
    let opts = &created[0];
    assert_eq!(opts.image, "api:7");
    assert_eq!(opts.memory, Some(512 * 1024 * 1024));
    assert_eq!(opts.cpu_shares, Some(256));
    assert!(opts.env.contains(&"REDIS_URL=redis://172.17.0.1:6379".to_string()));
    assert!(opts.env.contains(&"GALAXY_INSTANCE=0".to_string()));
    assert!(opts.env.contains(&format!("GALAXY_VERSION={}", app.id())));

    let started = fx.mock.started();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, container.id);
    assert_eq!(started[0].1.log.options["syslog-tag"], "api.0");

    let live = fx.mock.container(&container.id).unwrap();
    assert_eq!(fx.runtime.status_of(&live), ContainerStatus::Running);
}

#[tokio::test]
async fn start_takes_the_first_free_slot() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let app = api_app();
    for slot in [0, 1, 3] {
        run_current(&fx.mock, &app, slot);
    }
    // another release's instances do not occupy slots
    run_tagged(&fx.mock, "api", 2, "0", OLD_IMAGE);

    assert_eq!(fx.runtime.instance_count("api", &app.id().to_string()).await.unwrap(), 3);
    assert_eq!(fx.runtime.instance_count("api", "").await.unwrap(), 4);

    let container = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(container.display_name(), "api.2");
}

#[tokio::test]
async fn start_replaces_container_on_a_different_image() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let app = api_app();
    let stale = run_tagged(&fx.mock, "api", 0, "0", OLD_IMAGE);

    let container = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(container.display_name(), "api.0");
    assert_ne!(container.id, stale);
    assert_eq!(fx.mock.stop_calls(), [stale.clone()]);
    assert_eq!(fx.mock.removed(), [stale]);
    assert_eq!(fx.mock.created().len(), 1);
}

#[tokio::test]
async fn start_reuses_a_stopped_container_on_the_same_image() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let app = api_app();
    let id = run_current(&fx.mock, &app, 0);
    fx.mock.set_state(
        &id,
        ContainerState {
            status: "exited".into(),
            ..ContainerState::default()
        },
    );

    let container = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(container.id, id);
    assert!(fx.mock.created().is_empty());
    assert!(fx.mock.stop_calls().is_empty());
    assert!(fx.mock.container(&id).unwrap().state.running);
}

#[tokio::test]
async fn start_rejects_bad_memory_limit() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let mut app = api_app();
    app.set_memory("web", "lots").unwrap();

    let err = fx.runtime.start("prod", "web", &app).await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidMemory(_)), "{err}");
    // limits only apply to the pool they were set for
    fx.runtime.start("prod", "batch", &app).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hung_stop_blacklists_without_error() {
    let fx = fixture();
    let app = api_app();
    let id = run_current(&fx.mock, &app, 0);
    fx.mock.hang_stop(&id);

    let container = fx.mock.container(&id).unwrap();
    let outcome = fx.runtime.stop_container(&container).await.unwrap();
    assert_eq!(outcome, StopOutcome::Blacklisted);
    assert!(fx.blacklist.contains(&id));
    assert_eq!(fx.runtime.status_of(&container), ContainerStatus::Blacklisted);

    // later stops skip it without asking the runtime again
    assert_eq!(fx.runtime.stop_all_matching("api").await.unwrap(), 0);
    assert_eq!(fx.runtime.stop_all().await.unwrap(), 0);
    fx.runtime.stop(&app).await.unwrap();
    assert_eq!(fx.mock.stop_calls(), [id]);
}

#[tokio::test]
async fn stop_targets_the_exact_release() {
    let fx = fixture();
    let app = api_app();
    let old = run_tagged(&fx.mock, "api", 0, "0", OLD_IMAGE);
    let current = run_current(&fx.mock, &app, 1);

    fx.runtime.stop(&app).await.unwrap();
    assert_eq!(fx.mock.stop_calls(), [current]);
    assert!(fx.mock.container(&old).unwrap().state.running);
}

#[tokio::test]
async fn stop_old_version_respects_limit() {
    let fx = fixture();
    fx.mock.add_local_image("api:6", OLD_IMAGE);
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let app = api_app();
    let old: Vec<String> = (0..3)
        .map(|slot| run_tagged(&fx.mock, "api", slot, "0", OLD_IMAGE))
        .collect();
    let current = run_current(&fx.mock, &app, 3);
    let other_app = run_tagged(&fx.mock, "worker", 0, "0", OLD_IMAGE);

    assert_eq!(fx.runtime.stop_old_version(&app, 2).await.unwrap(), 2);
    let running_old = old
        .iter()
        .filter(|id| fx.mock.container(id).unwrap().state.running)
        .count();
    assert_eq!(running_old, 1);

    assert_eq!(fx.runtime.stop_all_but_current_version(&app).await.unwrap(), 1);
    assert!(old.iter().all(|id| !fx.mock.container(id).unwrap().state.running));
    assert!(fx.mock.container(&current).unwrap().state.running);
    assert!(fx.mock.container(&other_app).unwrap().state.running);
}

#[tokio::test]
async fn stale_sweep_skips_containers_without_image() {
    let fx = fixture();
    let app = api_app();
    // OLD_IMAGE is not known locally
    let orphan = run_tagged(&fx.mock, "api", 0, "0", OLD_IMAGE);

    assert_eq!(fx.runtime.stop_all_but_current_version(&app).await.unwrap(), 0);
    assert!(fx.mock.container(&orphan).unwrap().state.running);
}

#[tokio::test]
async fn stale_sweep_stops_older_release_on_the_same_image() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let app = api_app();
    let previous = run_tagged(&fx.mock, "api", 0, &(app.id() - 1).to_string(), NEW_IMAGE);
    let current = run_current(&fx.mock, &app, 1);

    assert_eq!(fx.runtime.stop_old_version(&app, 5).await.unwrap(), 1);
    assert_eq!(fx.mock.stop_calls(), [previous]);
    assert!(fx.mock.container(&current).unwrap().state.running);
}

#[tokio::test]
async fn release_alone_decides_without_a_content_id() {
    let fx = fixture();
    fx.mock.add_local_image("api:6", OLD_IMAGE);
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let mut app = ServiceConfig::new("api", "api:7");
    let previous = run_tagged(&fx.mock, "api", 0, &app.id().to_string(), NEW_IMAGE);

    app.env_set("MODE", "green").unwrap();
    let release = app.id().to_string();
    let current = run_tagged(&fx.mock, "api", 1, &release, NEW_IMAGE);
    // nothing pins the image, so another image under this release is current too
    let current_elsewhere = run_tagged(&fx.mock, "api", 2, &release, OLD_IMAGE);

    assert_eq!(fx.runtime.stop_all_but_current_version(&app).await.unwrap(), 1);
    assert_eq!(fx.mock.stop_calls(), [previous]);
    assert!(fx.mock.container(&current).unwrap().state.running);
    assert!(fx.mock.container(&current_elsewhere).unwrap().state.running);
}

#[tokio::test]
async fn start_replaces_an_older_release_on_the_same_image() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let mut app = api_app();
    let previous = run_current(&fx.mock, &app, 0);
    app.env_set("MODE", "green").unwrap();

    let container = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(container.display_name(), "api.0");
    assert_ne!(container.id, previous);
    assert_eq!(fx.mock.stop_calls(), [previous.clone()]);
    assert_eq!(fx.mock.removed(), [previous]);
    assert!(fx.mock.created()[0].env.contains(&"MODE=green".to_string()));
}

#[tokio::test(start_paused = true)]
async fn start_leaves_a_zombie_its_slot() {
    let fx = fixture();
    fx.mock.add_local_image("api:7", NEW_IMAGE);
    let app = api_app();
    let zombie = run_tagged(&fx.mock, "api", 0, "0", OLD_IMAGE);
    fx.mock.hang_stop(&zombie);

    let container = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(container.display_name(), "api.1");
    assert!(fx.blacklist.contains(&zombie));
    assert!(fx.mock.removed().is_empty());
    assert!(fx.mock.container(&zombie).unwrap().state.running);

    // the blacklisted slot stays taken without another stop attempt
    let again = fx.runtime.start("prod", "web", &app).await.unwrap();
    assert_eq!(again.display_name(), "api.2");
    assert_eq!(fx.mock.stop_calls(), [zombie]);
}

#[tokio::test]
async fn managed_containers_ignore_untagged_and_stopped() {
    let fx = fixture();
    let app = api_app();
    let tagged = run_current(&fx.mock, &app, 0);
    fx.mock.run_container("postgres", OLD_IMAGE, &[("POSTGRES_DB", "app")]);
    let stopped = run_current(&fx.mock, &app, 1);
    fx.mock.set_state(&stopped, ContainerState::default());
    let restarting = run_current(&fx.mock, &app, 2);
    fx.mock.set_state(
        &restarting,
        ContainerState {
            status: "restarting".into(),
            restarting: true,
            ..ContainerState::default()
        },
    );
    let bad_slot = fx
        .mock
        .run_container("api.x", NEW_IMAGE, &[("GALAXY_APP", "api"), ("GALAXY_INSTANCE", "x")]);

    let managed: Vec<String> = fx
        .runtime
        .managed_containers()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(managed, [tagged, restarting, bad_slot]);

    let mut slots = fx.runtime.instance_ids("api", "").await.unwrap();
    slots.sort_unstable();
    assert_eq!(slots, [0, 2]);
    assert_eq!(fx.runtime.next_instance_slot("api", "").await.unwrap(), 1);
}

#[tokio::test]
async fn register_all_stops_unassigned_first() {
    let fx = fixture();
    fx.registry.assign("prod", "web", "api");
    fx.registry.assign("prod", "batch", "worker");
    let api = run_current(&fx.mock, &api_app(), 0);
    let worker = run_tagged(&fx.mock, "worker", 0, "3", OLD_IMAGE);

    let registrations = fx.runtime.register_all("prod", "web", "10.0.0.5").await.unwrap();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].container_id, api);
    assert_eq!(registrations[0].pool, "web");
    assert_eq!(fx.mock.stop_calls(), [worker]);
    assert_eq!(fx.registry.registrations().len(), 1);
}

#[tokio::test]
async fn stop_unassigned_counts_stops() {
    let fx = fixture();
    fx.registry.assign("prod", "web", "api");
    run_current(&fx.mock, &api_app(), 0);
    run_tagged(&fx.mock, "worker", 0, "3", OLD_IMAGE);
    run_tagged(&fx.mock, "cron", 0, "1", OLD_IMAGE);

    assert_eq!(fx.runtime.stop_unassigned("prod", "web").await.unwrap(), 2);
    assert_eq!(fx.runtime.stop_unassigned("prod", "web").await.unwrap(), 0);
}

#[tokio::test]
async fn unregister_all_stops_at_first_failure() {
    let fx = fixture();
    fx.registry.assign("prod", "web", "api");
    fx.registry.assign("prod", "web", "worker");
    let api = run_current(&fx.mock, &api_app(), 0);
    run_tagged(&fx.mock, "worker", 0, "3", OLD_IMAGE);
    fx.runtime.register_all("prod", "web", "10.0.0.5").await.unwrap();
    assert_eq!(fx.registry.registrations().len(), 2);

    let removed = fx.runtime.unregister_all("prod", "web", "10.0.0.5").await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(fx.registry.registrations().is_empty());

    fx.runtime.register_all("prod", "web", "10.0.0.5").await.unwrap();
    fx.registry.reject("worker");
    let err = fx
        .runtime
        .unregister_all("prod", "web", "10.0.0.5")
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Registry(_)), "{err}");
    // api was unregistered before the failure
    let left = fx.registry.registrations();
    assert_eq!(left.len(), 1);
    assert_ne!(left[0].container_id, api);
}

#[tokio::test]
async fn image_lookup_by_tag() {
    let fx = fixture();
    fx.mock.add_local_image("registry.local/api:7", NEW_IMAGE);

    let image = fx
        .runtime
        .get_image_by_name("registry.local/api:7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(image.id, NEW_IMAGE);
    assert!(fx.runtime.get_image_by_name("api:7").await.unwrap().is_none());
    assert!(fx.runtime.inspect_image(NEW_IMAGE).await.unwrap().is_some());
}

#[tokio::test]
async fn daemon_failures_surface_to_the_caller() {
    let fx = fixture();
    fx.mock.set_daemon_down(true);
    assert!(fx.runtime.ping().await.is_err());
    assert!(fx.runtime.managed_containers().await.is_err());

    let app = ServiceConfig::new("api", "api:7");
    assert!(fx.runtime.start("prod", "web", &app).await.is_err());
}
