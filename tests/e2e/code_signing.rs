//! Code-signed update endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{publish, signing_key, HarnessOptions, TestHarness};
use expo_updates::code_signing::{sign, DEFAULT_KEY_ID};
use expo_updates::remote::RawManifestResponse;
use expo_updates::statemachine::CheckResult;
use expo_updates::{Error, ErrorKind, UpdatesState};

const CONTENTS: &[&[u8]] = &[b"console.log('signed')", b"logo"];

fn signed_harness() -> TestHarness {
    TestHarness::setup_with(HarnessOptions {
        code_signing: true,
        ..HarnessOptions::default()
    })
}

/// Test 1: A correctly signed update is offered and downloads.
#[tokio::test]
async fn test_signed_update_accepted() {
    let h = signed_harness();
    let update = publish("2024-05-01T00:00:00Z", CONTENTS);
    h.release(&update);

    let machine = h.updates.state_machine();
    let check = machine.check().await.unwrap();
    let CheckResult::UpdateAvailable(manifest) = check else {
        unreachable!("expected an update, got {check:?}");
    };
    assert_eq!(manifest.id, update.id());
    assert!(manifest.signature.is_some());

    let fetched = machine.fetch().await.unwrap();
    assert_eq!(fetched.update.id, update.id());
    assert!(fetched.update.manifest.signature.is_some());
}

/// Test 2: Requests announce the expected key.
#[tokio::test]
async fn test_expect_signature_header_sent() {
    let h = signed_harness();
    h.server.respond(RawManifestResponse::no_content());
    h.updates.state_machine().check().await.unwrap();

    let requests = h.server.manifest_requests();
    let expect = requests[0].expect_signature.as_deref().unwrap();
    assert!(expect.contains("keyid=\"root\""));
    assert!(expect.contains("alg=\"rsa-v1_5-sha256\""));
}

/// Test 3: A tampered body is rejected before anything is downloaded or
/// stored.
#[tokio::test]
async fn test_tampered_manifest_rejected() {
    let h = signed_harness();
    let genuine = publish("2024-05-01T00:00:00Z", CONTENTS);
    let forged = publish("2024-05-02T00:00:00Z", &[b"evil()", b"logo"]);

    let genuine_body = genuine.manifest.to_vec().unwrap();
    let signature = sign(&genuine_body, signing_key(), DEFAULT_KEY_ID).unwrap();
    h.server.host_assets(&forged.assets);
    h.server.respond(RawManifestResponse {
        body: Some(forged.manifest.to_vec().unwrap().into()),
        signature: Some(signature.to_header()),
        manifest_filters: None,
    });

    let machine = h.updates.state_machine();
    let err = machine.check().await.unwrap_err();
    assert!(matches!(err, Error::InvalidSignature(_)));

    assert_eq!(machine.state(), UpdatesState::Idle);
    let context = machine.context();
    assert!(!context.is_update_available);
    assert!(context.latest_manifest.is_none());
    assert_eq!(
        context.last_check_error.unwrap().kind,
        ErrorKind::InvalidSignature
    );
    assert!(h.server.asset_requests().is_empty());
    assert!(machine.store().all_updates().is_empty());
    assert!(matches!(
        machine.fetch().await,
        Err(Error::InvalidStateTransition { .. })
    ));
}

/// Test 4: An unsigned response is rejected when signing is configured.
#[tokio::test]
async fn test_missing_signature_rejected() {
    let h = signed_harness();
    let update = publish("2024-05-01T00:00:00Z", CONTENTS);
    h.server.host_assets(&update.assets);
    h.server.serve_manifest(&update.manifest);

    let err = h.updates.state_machine().check().await.unwrap_err();
    assert!(matches!(err, Error::InvalidSignature(_)));
    assert!(err.is_verification_failure());
}

/// Test 5: A signature under another key id is a key mismatch.
#[tokio::test]
async fn test_wrong_key_id_rejected() {
    let h = signed_harness();
    let update = publish("2024-05-01T00:00:00Z", CONTENTS);
    h.server.serve_signed_manifest(&update.manifest, "staging");

    let machine = h.updates.state_machine();
    let err = machine.check().await.unwrap_err();
    assert!(matches!(err, Error::KeyMismatch { .. }));
    assert_eq!(
        machine.context().last_check_error.unwrap().kind,
        ErrorKind::KeyMismatch
    );
}

/// Test 6: A good check after a rejected one clears the recorded error.
#[tokio::test]
async fn test_recovery_after_rejection() {
    let h = signed_harness();
    let update = publish("2024-05-01T00:00:00Z", CONTENTS);
    h.server.serve_manifest(&update.manifest);
    assert!(h.updates.state_machine().check().await.is_err());

    h.release(&update);
    let machine = h.updates.state_machine();
    assert!(matches!(
        machine.check().await.unwrap(),
        CheckResult::UpdateAvailable(_)
    ));
    assert!(machine.context().last_check_error.is_none());
}

/// Test 7: Unsigned directives are rejected too.
#[tokio::test]
async fn test_unsigned_directive_rejected() {
    let h = signed_harness();
    h.server
        .serve_rollback_directive("2030-01-01T00:00:00Z", false);

    let err = h.updates.state_machine().check().await.unwrap_err();
    assert!(matches!(err, Error::InvalidSignature(_)));
    assert!(!h.updates.state_machine().context().is_rollback);
}
