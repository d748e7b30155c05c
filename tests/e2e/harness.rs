//! Test harness that runs the updates core against an in-process update
//! server and a recording host.
//!
//! The `TestHarness` owns a temporary root directory so a test can drop
//! the core and reopen it on the same data, the way an app restarts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use expo_updates::code_signing::{sign, DEFAULT_KEY_ID};
use expo_updates::config::{CheckOnLaunch, CodeSigningConfig};
use expo_updates::manifest::{encode_hash, AssetDescriptor};
use expo_updates::remote::{AssetSource, ManifestRequest, ManifestSource, RawManifestResponse};
use expo_updates::{
    Error, LaunchSpec, LauncherHost, Manifest, Result, RunningUpdates, UpdatesBuilder,
    UpdatesConfig,
};
use parking_lot::Mutex;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Scope every harness app runs under.
pub const SCOPE: &str = "https://u.expo.dev/e2e";

/// Runtime version of the harness app binary.
pub const RUNTIME_VERSION: &str = "1";

/// Creation time of the embedded update.
pub const EMBEDDED_CREATED_AT: &str = "2023-06-01T00:00:00Z";

/// Signing key shared by every test in the process.
pub fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
}

/// In-process update server: one current manifest response plus a CDN of
/// assets keyed by URL.
#[derive(Default)]
pub struct TestServer {
    response: Mutex<RawManifestResponse>,
    assets: Mutex<HashMap<String, Bytes>>,
    failing: Mutex<HashSet<String>>,
    asset_delay: Mutex<Duration>,
    manifest_requests: Mutex<Vec<ManifestRequest>>,
    asset_requests: Mutex<Vec<String>>,
}

impl TestServer {
    /// Serve `response` to manifest requests.
    pub fn respond(&self, response: RawManifestResponse) {
        *self.response.lock() = response;
    }

    /// Serve an unsigned manifest body.
    pub fn serve_manifest(&self, manifest: &Manifest) {
        self.respond(RawManifestResponse::with_body(manifest_body(manifest)));
    }

    /// Serve a manifest body signed with [`signing_key`] under `key_id`.
    pub fn serve_signed_manifest(&self, manifest: &Manifest, key_id: &str) {
        let body = manifest_body(manifest);
        let signature = sign(&body, signing_key(), key_id).unwrap();
        self.respond(RawManifestResponse {
            body: Some(body.into()),
            signature: Some(signature.to_header()),
            manifest_filters: None,
        });
    }

    /// Serve a signed `rollBackToEmbedded` directive.
    pub fn serve_rollback_directive(&self, commit_time: &str, signed: bool) {
        let body = serde_json::to_vec(&json!({
            "type": "rollBackToEmbedded",
            "parameters": { "commitTime": commit_time }
        }))
        .unwrap();
        let signature = signed.then(|| sign(&body, signing_key(), DEFAULT_KEY_ID).unwrap().to_header());
        self.respond(RawManifestResponse {
            body: Some(body.into()),
            signature,
            manifest_filters: None,
        });
    }

    /// Put assets on the CDN.
    pub fn host_assets(&self, assets: &HashMap<String, Bytes>) {
        self.assets
            .lock()
            .extend(assets.iter().map(|(url, bytes)| (url.clone(), bytes.clone())));
    }

    /// Make requests for `url` fail with a network error.
    pub fn fail_asset(&self, url: &str) {
        self.failing.lock().insert(url.to_string());
    }

    /// Stop failing all assets.
    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    /// Delay every asset response.
    pub fn set_asset_delay(&self, delay: Duration) {
        *self.asset_delay.lock() = delay;
    }

    /// Manifest requests received so far.
    pub fn manifest_requests(&self) -> Vec<ManifestRequest> {
        self.manifest_requests.lock().clone()
    }

    /// Asset URLs requested so far.
    pub fn asset_requests(&self) -> Vec<String> {
        self.asset_requests.lock().clone()
    }
}

#[async_trait]
impl ManifestSource for TestServer {
    async fn fetch_manifest(&self, request: &ManifestRequest) -> Result<RawManifestResponse> {
        self.manifest_requests.lock().push(request.clone());
        Ok(self.response.lock().clone())
    }
}

#[async_trait]
impl AssetSource for TestServer {
    async fn fetch_asset(&self, asset: &AssetDescriptor) -> Result<Bytes> {
        let url = asset
            .url
            .as_ref()
            .map(ToString::to_string)
            .ok_or_else(|| Error::Network(format!("asset {} has no url", asset.key)))?;
        self.asset_requests.lock().push(url.clone());

        let delay = *self.asset_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&url) {
            return Err(Error::Network(format!("connection reset fetching {url}")));
        }
        self.assets
            .lock()
            .get(&url)
            .cloned()
            .ok_or_else(|| Error::Network(format!("404 for {url}")))
    }
}

/// Host that records relaunches instead of performing them.
#[derive(Default)]
pub struct RecordingHost {
    embedded: Option<Manifest>,
    relaunches: Mutex<Vec<LaunchSpec>>,
    fail: AtomicBool,
}

impl RecordingHost {
    /// Make relaunches fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Update ids relaunched into, in order.
    pub fn relaunched_ids(&self) -> Vec<Uuid> {
        self.relaunches.lock().iter().map(|s| s.update.id).collect()
    }

    /// Launch specs handed to the host, in order.
    pub fn relaunches(&self) -> Vec<LaunchSpec> {
        self.relaunches.lock().clone()
    }
}

#[async_trait]
impl LauncherHost for RecordingHost {
    async fn relaunch(&self, spec: &LaunchSpec) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Host("relaunch refused by test host".to_string()));
        }
        self.relaunches.lock().push(spec.clone());
        Ok(())
    }

    fn embedded_manifest(&self) -> Option<Manifest> {
        self.embedded.clone()
    }
}

/// A published update: its manifest and the CDN content behind it.
pub struct Published {
    /// Manifest served to clients.
    pub manifest: Manifest,
    /// Asset bytes keyed by URL.
    pub assets: HashMap<String, Bytes>,
}

impl Published {
    /// Update id.
    pub fn id(&self) -> Uuid {
        self.manifest.id
    }

    /// URL of every asset, launch asset first.
    pub fn urls(&self) -> Vec<String> {
        self.manifest
            .all_assets()
            .filter_map(|a| a.url.as_ref().map(ToString::to_string))
            .collect()
    }
}

/// Build an update whose launch asset has `contents[0]` and whose extra
/// assets have the rest.
pub fn publish(created_at: &str, contents: &[&[u8]]) -> Published {
    publish_with_metadata(created_at, contents, json!({}))
}

/// [`publish`] with manifest metadata.
pub fn publish_with_metadata(created_at: &str, contents: &[&[u8]], metadata: Value) -> Published {
    let id = Uuid::new_v4();
    let url = |i: usize| format!("https://cdn.test/{id}/{i}");
    let hash = |c: &[u8]| encode_hash(&Sha256::digest(c));

    let extra: Vec<Value> = contents[1..]
        .iter()
        .enumerate()
        .map(|(i, c)| {
            json!({
                "key": format!("asset-{i}"),
                "url": url(i + 1),
                "hash": hash(c),
                "contentType": "image/png",
                "fileExtension": ".png"
            })
        })
        .collect();

    let manifest = Manifest::from_json(&json!({
        "id": id.to_string(),
        "createdAt": created_at,
        "runtimeVersion": RUNTIME_VERSION,
        "launchAsset": {
            "key": "bundle",
            "url": url(0),
            "hash": hash(contents[0]),
            "contentType": "application/javascript"
        },
        "assets": extra,
        "metadata": metadata
    }))
    .unwrap();

    let assets = contents
        .iter()
        .enumerate()
        .map(|(i, c)| (url(i), Bytes::copy_from_slice(c)))
        .collect();
    Published { manifest, assets }
}

/// Build the update shipped inside the app binary.
pub fn embedded_manifest() -> Manifest {
    Manifest::from_json(&json!({
        "id": Uuid::new_v4().to_string(),
        "createdAt": EMBEDDED_CREATED_AT,
        "runtimeVersion": RUNTIME_VERSION,
        "launchAsset": { "key": "bundle" },
        "assets": [],
        "metadata": {}
    }))
    .unwrap()
}

fn manifest_body(manifest: &Manifest) -> Vec<u8> {
    manifest.to_vec().unwrap()
}

/// How to set up a harness.
#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    /// Require signed manifests.
    pub code_signing: bool,
    /// Staged rollout device id.
    pub device_id: Option<String>,
}

/// A running updates core wired to a [`TestServer`] and a
/// [`RecordingHost`].
pub struct TestHarness {
    dir: TempDir,
    options: HarnessOptions,
    embedded: Manifest,
    /// Update server.
    pub server: Arc<TestServer>,
    /// Host binding.
    pub host: Arc<RecordingHost>,
    /// The core under test.
    pub updates: RunningUpdates,
}

impl TestHarness {
    /// Unsigned harness.
    pub fn setup() -> Self {
        Self::setup_with(HarnessOptions::default())
    }

    /// Harness with options.
    pub fn setup_with(options: HarnessOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(TestServer::default());
        let embedded = embedded_manifest();
        let host = Arc::new(RecordingHost {
            embedded: Some(embedded.clone()),
            ..RecordingHost::default()
        });
        let updates = build(&dir, &options, &server, &host);
        Self {
            dir,
            options,
            embedded,
            server,
            host,
            updates,
        }
    }

    /// Drop the core and open it again on the same data, as after an app
    /// restart. The server and host survive.
    pub fn reopen(&mut self) {
        self.updates = build(&self.dir, &self.options, &self.server, &self.host);
    }

    /// The embedded manifest.
    pub fn embedded(&self) -> &Manifest {
        &self.embedded
    }

    /// Root data directory.
    pub fn root(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Publish an update: host its assets and serve its manifest (signed
    /// when the harness requires signatures).
    pub fn release(&self, published: &Published) {
        self.server.host_assets(&published.assets);
        if self.options.code_signing {
            self.server
                .serve_signed_manifest(&published.manifest, DEFAULT_KEY_ID);
        } else {
            self.server.serve_manifest(&published.manifest);
        }
    }
}

fn build(
    dir: &TempDir,
    options: &HarnessOptions,
    server: &Arc<TestServer>,
    host: &Arc<RecordingHost>,
) -> RunningUpdates {
    let mut config = UpdatesConfig {
        root_dir: dir.path().join("data"),
        scope_key: Some(SCOPE.to_string()),
        runtime_version: RUNTIME_VERSION.to_string(),
        check_on_launch: CheckOnLaunch::Never,
        ..UpdatesConfig::default()
    };
    config.rollout.device_id.clone_from(&options.device_id);

    if options.code_signing {
        let pem = signing_key()
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let path = dir.path().join("public.pem");
        std::fs::write(&path, pem).unwrap();
        config.code_signing = Some(CodeSigningConfig {
            algorithm: None,
            key_id: None,
            public_key_path: path,
        });
    }

    UpdatesBuilder::new(config, host.clone())
        .with_manifest_source(server.clone())
        .with_asset_source(server.clone())
        .build()
        .unwrap()
}
