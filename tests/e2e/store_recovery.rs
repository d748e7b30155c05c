//! Restarts, failed launches, roll-backs and cleanup.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{publish, publish_with_metadata, HarnessOptions, Published, TestHarness};
use expo_updates::kv::LAUNCHER_CONTEXT_KEY;
use expo_updates::launcher::UpdatesModule;
use expo_updates::statemachine::CheckResult;
use expo_updates::store::{sha256_hex, RetentionPolicy, UpdateStatus};
use expo_updates::{Error, UpdatesState};
use serde_json::json;

/// Check, download and relaunch into `update`.
async fn install(h: &TestHarness, update: &Published) {
    h.release(update);
    let machine = h.updates.state_machine();
    assert!(matches!(
        machine.check().await.unwrap(),
        CheckResult::UpdateAvailable(_)
    ));
    machine.fetch().await.unwrap();
    machine.restart_app_async().await.unwrap();
}

/// Check and download `update` without relaunching.
async fn download(h: &TestHarness, update: &Published) {
    h.release(update);
    let machine = h.updates.state_machine();
    machine.check().await.unwrap();
    machine.fetch().await.unwrap();
}

/// Test 1: A pending download survives a restart and is launched next.
#[tokio::test]
async fn test_pending_update_survives_restart() {
    let mut h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", &[b"v2", b"a"]);
    download(&h, &update).await;

    h.reopen();
    let machine = h.updates.state_machine();
    assert_eq!(machine.state(), UpdatesState::Idle);
    let context = machine.context();
    assert!(context.is_update_pending);
    assert!(!context.is_downloading);
    assert_eq!(context.downloaded_manifest.unwrap().id, update.id());

    let spec = h.updates.launch().unwrap();
    assert_eq!(spec.update.id, update.id());
    assert!(!h.updates.state_machine().context().is_update_pending);
    assert_eq!(
        std::fs::read(spec.launch_asset.unwrap()).unwrap(),
        b"v2".to_vec()
    );
}

/// Test 2: An update that crashes on its first launch is abandoned for
/// the embedded update.
#[tokio::test]
async fn test_failed_launch_rolls_back() {
    let mut h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", &[b"crashes", b"a"]);
    download(&h, &update).await;

    h.reopen();
    assert_eq!(h.updates.launch().unwrap().update.id, update.id());
    h.updates.launcher().mark_launch_failed().unwrap();

    h.reopen();
    let spec = h.updates.launch().unwrap();
    assert!(spec.is_embedded());
    assert_eq!(spec.update.id, h.embedded().id);

    let stored = h.updates.state_machine().store().get(update.id()).unwrap();
    assert_eq!(stored.status, UpdateStatus::Failed);
    assert!(stored.is_flagged_bad());

    // The server keeps offering the bad update; it is not taken again.
    let check = h.updates.launcher().check_for_update_async().await.unwrap();
    assert!(!check.is_available);
    assert!(h.updates.launcher().fetch_update_async().await.is_err());
    h.reopen();
    assert!(h.updates.launch().unwrap().is_embedded());
}

/// Test 3: A crashed update that is still served is never downloaded or
/// relaunched again in the same session.
#[tokio::test]
async fn test_failed_update_not_relaunched() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();
    let good = publish("2024-02-01T00:00:00Z", &[b"good", b"a"]);
    install(&h, &good).await;
    h.updates.launcher().mark_launch_succeeded().unwrap();

    let bad = publish("2024-03-01T00:00:00Z", &[b"crashes", b"a"]);
    install(&h, &bad).await;
    h.updates.launcher().mark_launch_failed().unwrap();
    h.updates.state_machine().reload().await.unwrap();
    assert_eq!(
        h.host.relaunched_ids(),
        vec![good.id(), bad.id(), good.id()]
    );

    let machine = h.updates.state_machine();
    assert!(matches!(
        machine.check().await.unwrap(),
        CheckResult::NoUpdateAvailable
    ));
    assert_eq!(machine.state(), UpdatesState::Idle);
    assert!(matches!(
        machine.fetch().await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        machine.restart_app_async().await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert_eq!(h.host.relaunched_ids().len(), 3);
    assert_eq!(machine.store().launched_id(), Some(good.id()));
}

/// Test 4: An update that launched fine once keeps being launched.
#[tokio::test]
async fn test_successful_launch_is_kept() {
    let mut h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", &[b"works", b"a"]);
    download(&h, &update).await;

    h.reopen();
    h.updates.launch().unwrap();
    h.updates.launcher().mark_launch_succeeded().unwrap();
    h.updates.launcher().mark_launch_failed().unwrap();

    h.reopen();
    let spec = h.updates.launch().unwrap();
    assert_eq!(spec.update.id, update.id());
    let stored = h.updates.state_machine().store().get(update.id()).unwrap();
    assert_eq!(stored.successful_launch_count, 1);
    assert_eq!(stored.failed_launch_count, 1);
    assert!(!stored.is_flagged_bad());
}

/// Test 5: A roll-back directive newer than the running update returns
/// the app to its embedded update.
#[tokio::test]
async fn test_rollback_directive() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", &[b"v2", b"a"]);
    install(&h, &update).await;
    h.updates.launcher().mark_launch_succeeded().unwrap();

    // Older than the running update: ignored.
    h.server.serve_rollback_directive("2024-02-01T00:00:00Z", false);
    let check = h.updates.launcher().check_for_update_async().await.unwrap();
    assert!(!check.is_available);

    h.server.serve_rollback_directive("2024-04-01T00:00:00Z", false);
    let check = h.updates.launcher().check_for_update_async().await.unwrap();
    assert!(check.is_available);
    assert!(check.is_rollback_to_embedded);
    assert!(check.manifest.is_none());
    let context = h.updates.state_machine().context();
    assert!(context.is_rollback);
    assert!(context.rollback_commit_time.is_some());

    let fetched = h.updates.launcher().fetch_update_async().await.unwrap();
    assert!(fetched.is_rollback_to_embedded);
    assert_eq!(h.updates.state_machine().state(), UpdatesState::Ready);

    h.updates.state_machine().restart_app_async().await.unwrap();
    assert_eq!(
        h.host.relaunched_ids(),
        vec![update.id(), h.embedded().id]
    );
    let relaunch = h.host.relaunches().pop().unwrap();
    assert!(relaunch.is_embedded());
    assert!(relaunch.launch_asset.is_none());
    assert_eq!(
        h.updates.state_machine().store().launched_id(),
        Some(h.embedded().id)
    );
    assert!(!h.updates.state_machine().context().is_rollback);
}

/// Test 6: Garbage collection keeps the running update and one rollback
/// target and deletes the rest.
#[tokio::test]
async fn test_garbage_collection() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();
    let a = publish("2024-01-01T00:00:00Z", &[b"a-bundle", b"a-image"]);
    let b = publish("2024-02-01T00:00:00Z", &[b"b-bundle", b"b-image"]);
    let c = publish("2024-03-01T00:00:00Z", &[b"c-bundle", b"shared"]);
    install(&h, &a).await;
    install(&h, &b).await;
    install(&h, &c).await;

    let store = h.updates.state_machine().store();
    let report = h
        .updates
        .launcher()
        .garbage_collect(&RetentionPolicy::default())
        .unwrap();
    assert_eq!(report.removed_updates, vec![a.id()]);
    assert_eq!(report.removed_assets, 2);
    assert_eq!(report.retained_updates, 2);

    assert!(!store.has_asset(&sha256_hex(b"a-bundle")));
    assert!(!store.has_asset(&sha256_hex(b"a-image")));
    assert!(store.has_asset(&sha256_hex(b"b-bundle")));
    assert!(store.has_asset(&sha256_hex(b"c-bundle")));
    assert!(store.get(b.id()).is_ok());
    assert!(store.get(c.id()).is_ok());

    // A second pass finds nothing to do.
    let again = h
        .updates
        .launcher()
        .garbage_collect(&RetentionPolicy::default())
        .unwrap();
    assert!(again.removed_updates.is_empty());
    assert_eq!(again.removed_assets, 0);
}

/// Test 7: Pinned updates survive garbage collection.
#[tokio::test]
async fn test_pinned_update_survives_gc() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();
    let a = publish("2024-01-01T00:00:00Z", &[b"a-bundle"]);
    let b = publish("2024-02-01T00:00:00Z", &[b"b-bundle"]);
    let c = publish("2024-03-01T00:00:00Z", &[b"c-bundle"]);
    install(&h, &a).await;
    install(&h, &b).await;
    install(&h, &c).await;

    let store = h.updates.state_machine().store();
    store.pin(a.id()).unwrap();
    let report = h
        .updates
        .launcher()
        .garbage_collect(&RetentionPolicy::default())
        .unwrap();
    assert!(report.removed_updates.is_empty());
    assert!(store.has_asset(&sha256_hex(b"a-bundle")));

    store.unpin(a.id()).unwrap();
    let report = h
        .updates
        .launcher()
        .garbage_collect(&RetentionPolicy::default())
        .unwrap();
    assert_eq!(report.removed_updates, vec![a.id()]);
}

/// Test 8: An update whose files vanished is skipped at launch.
#[tokio::test]
async fn test_missing_asset_falls_back_to_embedded() {
    let mut h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", &[b"v2", b"a"]);
    download(&h, &update).await;

    let bundle = {
        let lease = h
            .updates
            .state_machine()
            .store()
            .resolve_assets(update.id())
            .unwrap();
        lease.launch_asset_path().unwrap().to_path_buf()
    };
    std::fs::remove_file(&bundle).unwrap();

    h.reopen();
    let spec = h.updates.launch().unwrap();
    assert!(spec.is_embedded());
}

/// Test 9: A corrupt persisted context is replaced by a fresh one.
#[tokio::test]
async fn test_corrupt_context_is_reset() {
    let mut h = TestHarness::setup();
    let update = publish("2024-03-01T00:00:00Z", &[b"v2"]);
    download(&h, &update).await;
    assert!(h.updates.state_machine().context().is_update_pending);

    let path = h.root().join("data").join("state").join(LAUNCHER_CONTEXT_KEY);
    std::fs::write(&path, b"{ not json").unwrap();

    h.reopen();
    let machine = h.updates.state_machine();
    assert_eq!(machine.state(), UpdatesState::Idle);
    assert!(!machine.context().is_update_pending);
    // The downloaded update itself is still in the store.
    assert!(machine.store().get(update.id()).is_ok());
}

/// Test 10: Staged rollout hides updates outside the device's bucket.
#[tokio::test]
async fn test_staged_rollout() {
    let h = TestHarness::setup_with(HarnessOptions {
        device_id: Some("device-under-test".to_string()),
        ..HarnessOptions::default()
    });

    let held_back = publish_with_metadata(
        "2024-03-01T00:00:00Z",
        &[b"v2"],
        json!({ "rolloutPercentage": 0 }),
    );
    h.release(&held_back);
    let check = h.updates.launcher().check_for_update_async().await.unwrap();
    assert!(!check.is_available);

    let everyone = publish_with_metadata(
        "2024-03-02T00:00:00Z",
        &[b"v3"],
        json!({ "rolloutPercentage": 100 }),
    );
    h.release(&everyone);
    let check = h.updates.launcher().check_for_update_async().await.unwrap();
    assert!(check.is_available);
    assert_eq!(check.manifest.unwrap().id, everyone.id());
}
