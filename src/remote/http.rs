//! HTTP transport for the update endpoint.

use super::{AssetSource, ManifestRequest, ManifestSource, RawManifestResponse, MANIFEST_FILTERS_HEADER};
use crate::code_signing::{EXPECT_SIGNATURE_HEADER, SIGNATURE_HEADER};
use crate::error::{Error, Result};
use crate::manifest::AssetDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Update protocol version spoken by this client.
pub const PROTOCOL_VERSION: &str = "1";

const USER_AGENT_STRING: &str = concat!("expo-updates/", env!("CARGO_PKG_VERSION"));
const MANIFEST_ACCEPT: &str = "application/expo+json;q=0.9, application/json;q=0.8";

/// Settings for [`HttpRemote`].
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// Manifest endpoint.
    pub update_url: Url,
    /// Runtime version of the running binary.
    pub runtime_version: String,
    /// Platform name (`ios`, `android`, ...).
    pub platform: String,
    /// Channel to request updates from.
    pub channel: Option<String>,
    /// Extra headers sent with every manifest request.
    pub request_headers: BTreeMap<String, String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// reqwest-backed manifest and asset source.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    config: HttpRemoteConfig,
    headers: HeaderMap,
}

impl HttpRemote {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a configured header is invalid or the
    /// client cannot be constructed.
    pub fn new(config: HttpRemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT_STRING)
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(30)))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, ACCEPT.as_str(), MANIFEST_ACCEPT)?;
        insert_header(&mut headers, "expo-protocol-version", PROTOCOL_VERSION)?;
        insert_header(&mut headers, "expo-api-version", PROTOCOL_VERSION)?;
        insert_header(&mut headers, "expo-platform", &config.platform)?;
        insert_header(&mut headers, "expo-runtime-version", &config.runtime_version)?;
        if let Some(channel) = &config.channel {
            insert_header(&mut headers, "expo-channel-name", channel)?;
        }
        for (name, value) in &config.request_headers {
            insert_header(&mut headers, name, value)?;
        }

        Ok(Self {
            client,
            config,
            headers,
        })
    }

    /// Manifest endpoint.
    #[must_use]
    pub fn update_url(&self) -> &Url {
        &self.config.update_url
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("invalid header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("invalid value for header '{name}': {e}")))?;
    headers.insert(name, value);
    Ok(())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl ManifestSource for HttpRemote {
    async fn fetch_manifest(&self, request: &ManifestRequest) -> Result<RawManifestResponse> {
        let mut headers = self.headers.clone();
        if let Some(id) = request.current_update_id {
            insert_header(&mut headers, "expo-current-update-id", &id.to_string())?;
        }
        if let Some(id) = request.embedded_update_id {
            insert_header(&mut headers, "expo-embedded-update-id", &id.to_string())?;
        }
        if let Some(expect) = &request.expect_signature {
            insert_header(&mut headers, EXPECT_SIGNATURE_HEADER, expect)?;
        }

        debug!("Requesting manifest from {}", self.config.update_url);
        let response = self
            .client
            .get(self.config.update_url.clone())
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(RawManifestResponse::no_content());
        }
        if !status.is_success() {
            warn!("Manifest request failed with HTTP {status}");
            return Err(Error::Network(format!(
                "manifest request to {} returned {status}",
                self.config.update_url
            )));
        }

        let signature = header_string(response.headers(), SIGNATURE_HEADER);
        let manifest_filters = header_string(response.headers(), MANIFEST_FILTERS_HEADER);
        let body = response.bytes().await?;

        Ok(RawManifestResponse {
            body: Some(body),
            signature,
            manifest_filters,
        })
    }
}

#[async_trait]
impl AssetSource for HttpRemote {
    async fn fetch_asset(&self, asset: &AssetDescriptor) -> Result<Bytes> {
        let url = asset
            .url
            .clone()
            .ok_or_else(|| Error::ManifestParse(format!("asset {} has no url", asset.key)))?;

        debug!("Downloading asset {} from {url}", asset.key);
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("asset download from {url} returned {status}")));
        }
        Ok(response.bytes().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> HttpRemoteConfig {
        HttpRemoteConfig {
            update_url: Url::parse("https://u.expo.dev/project").unwrap(),
            runtime_version: "1.0".to_string(),
            platform: "ios".to_string(),
            channel: Some("production".to_string()),
            request_headers: BTreeMap::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_default_headers() {
        let remote = HttpRemote::new(config()).unwrap();
        assert_eq!(remote.headers["expo-protocol-version"], "1");
        assert_eq!(remote.headers["expo-platform"], "ios");
        assert_eq!(remote.headers["expo-runtime-version"], "1.0");
        assert_eq!(remote.headers["expo-channel-name"], "production");
        assert_eq!(remote.update_url().as_str(), "https://u.expo.dev/project");
    }

    #[test]
    fn test_custom_headers() {
        let mut cfg = config();
        cfg.request_headers
            .insert("expo-channel-name".to_string(), "staging".to_string());
        let remote = HttpRemote::new(cfg).unwrap();
        assert_eq!(remote.headers["expo-channel-name"], "staging");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut cfg = config();
        cfg.request_headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(matches!(HttpRemote::new(cfg), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_asset_without_url() {
        let remote = HttpRemote::new(config()).unwrap();
        let asset = AssetDescriptor {
            key: "bundle".to_string(),
            url: None,
            hash: None,
            content_type: "application/javascript".to_string(),
            file_extension: None,
        };
        assert!(matches!(
            remote.fetch_asset(&asset).await,
            Err(Error::ManifestParse(_))
        ));
    }
}
