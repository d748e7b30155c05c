//! Check, download and relaunch through the public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{publish, TestHarness};
use expo_updates::launcher::UpdatesModule;
use expo_updates::remote::RawManifestResponse;
use expo_updates::statemachine::CheckResult;
use expo_updates::{Error, ErrorKind, UpdatesEvent, UpdatesState};
use std::time::Duration;
use tokio::sync::mpsc;

const CONTENTS: &[&[u8]] = &[b"console.log('v2')", b"icon", b"splash"];

/// Test 1: A published update is checked, downloaded and relaunched into.
#[tokio::test]
async fn test_check_fetch_relaunch() {
    let h = TestHarness::setup();
    let launched = h.updates.launch().unwrap();
    assert!(launched.is_embedded());
    assert_eq!(launched.update.id, h.embedded().id);

    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);
    let launcher = h.updates.launcher();

    let check = launcher.check_for_update_async().await.unwrap();
    assert!(check.is_available);
    assert!(!check.is_rollback_to_embedded);
    assert_eq!(check.manifest.unwrap().id, update.id());
    assert_eq!(h.updates.state_machine().state(), UpdatesState::UpdateAvailable);

    let fetched = launcher.fetch_update_async().await.unwrap();
    assert!(fetched.is_new);
    assert_eq!(fetched.manifest.unwrap().id, update.id());
    assert_eq!(h.updates.state_machine().state(), UpdatesState::Ready);

    let context = launcher.get_native_state_machine_context_async().await;
    assert!(context.is_update_pending);
    assert_eq!(context.downloaded_manifest.unwrap().id, update.id());

    let mut requested = h.server.asset_requests();
    requested.sort();
    let mut expected = update.urls();
    expected.sort();
    assert_eq!(requested, expected);

    h.updates.state_machine().restart_app_async().await.unwrap();
    assert_eq!(h.host.relaunched_ids(), vec![update.id()]);
    assert_eq!(h.updates.state_machine().state(), UpdatesState::Idle);
    assert_eq!(h.updates.state_machine().running_update_id(), Some(update.id()));

    let spec = &h.host.relaunches()[0];
    let bundle = std::fs::read(spec.launch_asset.as_ref().unwrap()).unwrap();
    assert_eq!(bundle, CONTENTS[0]);
    assert_eq!(spec.assets.len(), CONTENTS.len());

    let context = h.updates.state_machine().context();
    assert!(!context.is_update_pending);
    assert!(context.downloaded_manifest.is_none());
    assert!(context.last_checked_at.is_some());
}

/// Test 2: One failed asset out of three leaves no ready update behind.
#[tokio::test]
async fn test_partial_download_leaves_no_ready_update() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);
    h.server.fail_asset(&update.urls()[2]);

    let machine = h.updates.state_machine();
    machine.check().await.unwrap();
    let err = machine.fetch().await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));

    assert_eq!(machine.state(), UpdatesState::Idle);
    let context = machine.context();
    assert!(!context.is_update_pending);
    assert!(!context.is_downloading);
    assert_eq!(context.last_download_error.unwrap().kind, ErrorKind::Network);
    assert!(machine.store().all_updates().is_empty());
    assert!(machine.store().get(update.id()).is_err());

    // Recovers on the next attempt.
    h.server.heal();
    machine.check().await.unwrap();
    machine.fetch().await.unwrap();
    assert_eq!(machine.state(), UpdatesState::Ready);
    assert!(machine.context().last_download_error.is_none());
    assert_eq!(machine.store().all_updates().len(), 1);
}

/// Test 3: A 204 response is "no update" and is not an error.
#[tokio::test]
async fn test_no_content_is_no_update() {
    let h = TestHarness::setup();
    h.server.respond(RawManifestResponse::no_content());

    let machine = h.updates.state_machine();
    let check = machine.check().await.unwrap();
    assert!(matches!(check, CheckResult::NoUpdateAvailable));
    assert_eq!(machine.state(), UpdatesState::Idle);
    assert!(machine.context().last_check_error.is_none());
    assert!(machine.context().last_checked_at.is_some());
}

/// Test 4: An update older than the running one is not offered.
#[tokio::test]
async fn test_older_update_not_offered() {
    let h = TestHarness::setup();
    let stale = publish("2022-01-01T00:00:00Z", CONTENTS);
    h.release(&stale);

    let check = h.updates.launcher().check_for_update_async().await.unwrap();
    assert!(!check.is_available);
    assert!(h.server.asset_requests().is_empty());
}

/// Test 5: Manifest requests name the running and embedded updates.
#[tokio::test]
async fn test_requests_identify_running_update() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();
    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);

    let machine = h.updates.state_machine();
    machine.check().await.unwrap();
    machine.fetch().await.unwrap();
    machine.restart_app_async().await.unwrap();
    machine.check().await.unwrap();

    let requests = h.server.manifest_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].current_update_id, Some(h.embedded().id));
    assert_eq!(requests[1].current_update_id, Some(update.id()));
    assert!(requests
        .iter()
        .all(|r| r.embedded_update_id == Some(h.embedded().id)));
    assert!(requests.iter().all(|r| r.expect_signature.is_none()));
}

/// Test 6: Every transition is published, in order, with a rising
/// sequence number.
#[tokio::test]
async fn test_transitions_are_published_in_order() {
    let h = TestHarness::setup();
    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);
    let mut events = h.updates.subscribe_events();

    let machine = h.updates.state_machine();
    machine.check().await.unwrap();
    machine.fetch().await.unwrap();

    let mut states = Vec::new();
    let mut sequence = Vec::new();
    let mut downloaded = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            UpdatesEvent::StateChanged { state, context } => {
                states.push(state);
                sequence.push(context.sequence_number);
            }
            UpdatesEvent::AssetDownloaded { total, .. } => {
                assert_eq!(total, CONTENTS.len());
                downloaded += 1;
            }
            other => unreachable!("unexpected event {other:?}"),
        }
    }

    assert_eq!(
        states,
        vec![
            UpdatesState::Checking,
            UpdatesState::UpdateAvailable,
            UpdatesState::Downloading,
            UpdatesState::Ready,
        ]
    );
    assert!(sequence.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(downloaded, CONTENTS.len());
}

/// Test 7: A failed check is recorded, published and then the machine
/// rests.
#[tokio::test]
async fn test_failed_check_is_recorded() {
    let h = TestHarness::setup();
    h.server
        .respond(RawManifestResponse::with_body(b"not json".to_vec()));
    let mut events = h.updates.subscribe_events();

    let machine = h.updates.state_machine();
    let err = machine.check().await.unwrap_err();
    assert!(matches!(err, Error::ManifestParse(_)));
    assert_eq!(machine.state(), UpdatesState::Idle);
    assert_eq!(
        machine.context().last_check_error.unwrap().kind,
        ErrorKind::ManifestParse
    );

    let mut states = Vec::new();
    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        match event {
            UpdatesEvent::StateChanged { state, .. } => states.push(state),
            UpdatesEvent::Error { .. } => saw_error = true,
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            UpdatesState::Checking,
            UpdatesState::NoUpdateAvailable,
            UpdatesState::Idle,
        ]
    );
    assert!(saw_error);
}

/// Test 8: Cancelling a download returns to `UpdateAvailable` and stores
/// nothing.
#[tokio::test]
async fn test_cancel_download() {
    let h = TestHarness::setup();
    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);
    h.server.set_asset_delay(Duration::from_secs(10));

    let machine = h.updates.state_machine().clone();
    machine.check().await.unwrap();

    let fetching = machine.clone();
    let fetch = tokio::spawn(async move { fetching.fetch().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(machine.state(), UpdatesState::Downloading);
    machine.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), fetch)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(machine.state(), UpdatesState::UpdateAvailable);
    assert!(!machine.context().is_downloading);
    assert!(machine.store().all_updates().is_empty());

    // The cancelled token does not poison later operations.
    h.server.set_asset_delay(Duration::ZERO);
    machine.fetch().await.unwrap();
    assert_eq!(machine.state(), UpdatesState::Ready);
}

/// Test 9: A refused relaunch leaves the update ready for a retry.
#[tokio::test]
async fn test_failed_relaunch_stays_ready() {
    let h = TestHarness::setup();
    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);

    let machine = h.updates.state_machine();
    machine.check().await.unwrap();
    machine.fetch().await.unwrap();

    h.host.set_failing(true);
    let err = machine.restart_app_async().await.unwrap_err();
    assert!(matches!(err, Error::Host(_)));
    assert_eq!(machine.state(), UpdatesState::Ready);
    assert!(machine.context().is_update_pending);
    assert!(!machine.context().is_restarting);

    h.host.set_failing(false);
    machine.restart_app_async().await.unwrap();
    assert_eq!(h.host.relaunched_ids(), vec![update.id()]);
}

/// Test 10: Operations outside their legal states are rejected without a
/// transition.
#[tokio::test]
async fn test_illegal_operations_rejected() {
    let h = TestHarness::setup();
    let machine = h.updates.state_machine();
    let mut events = h.updates.subscribe_events();

    assert!(matches!(
        machine.fetch().await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        machine.restart_app_async().await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert_eq!(machine.state(), UpdatesState::Idle);
    assert!(events.try_recv().is_err());
}

/// Test 11: `reload` relaunches on the best stored update from `Idle`.
#[tokio::test]
async fn test_reload_from_idle() {
    let h = TestHarness::setup();
    h.updates.launch().unwrap();

    h.updates.launcher().reload().await.unwrap();
    assert_eq!(h.host.relaunched_ids(), vec![h.embedded().id]);
    assert_eq!(h.updates.state_machine().state(), UpdatesState::Idle);
}

/// Test 12: Listeners added through the module see events until removed.
#[tokio::test]
async fn test_module_listener() {
    let h = TestHarness::setup();
    let update = publish("2024-03-01T00:00:00Z", CONTENTS);
    h.release(&update);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = h.updates.launcher().add_listener(Box::new(move |event| {
        if let UpdatesEvent::StateChanged { state, .. } = event {
            let _ = tx.send(state);
        }
    }));
    tokio::task::yield_now().await;

    h.updates.state_machine().check().await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, UpdatesState::Checking);

    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, UpdatesState::UpdateAvailable);

    subscription.remove();
    h.updates.state_machine().check().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}
