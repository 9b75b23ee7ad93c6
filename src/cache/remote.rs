//! Remote (HTTP) tier of the cache (`spec.md` §4.3, §6).
//!
//! A thin `reqwest` client implementing the `GET`/`PUT
//! /v8/artifacts/{fingerprint}` protocol: bearer-token auth, and an
//! optional `x-artifact-tag` header carrying a keyed MAC over the archive
//! bytes when artifact signing is enabled. Network or auth failure on
//! fetch degrades to a miss; failure on put is a non-fatal warning —
//! neither ever fails the caller's operation (`spec.md` §4.3 failure
//! modes, §7 "Remote error").

use std::time::Duration;

use color_eyre::{Result, eyre::Context};
use reqwest::Client;
use tracing::{instrument, warn};

use crate::{fingerprint::Fingerprint, hash::Blake3};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the remote cache tier, resolved from `remoteCache` in
/// the task-configuration file plus environment-provided credentials.
#[derive(Clone, Debug)]
pub struct RemoteCacheConfig {
    pub base_url: url::Url,
    pub team_id: Option<String>,
    pub bearer_token: String,
    /// Present when artifact-tag signing is enabled (`remoteCache.signature`).
    pub signing_key: Option<[u8; 32]>,
}

pub struct RemoteCache {
    client: Client,
    config: RemoteCacheConfig,
}

impl RemoteCache {
    pub fn new(config: RemoteCacheConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("build remote cache HTTP client")?;
        Ok(Self { client, config })
    }

    fn artifact_url(&self, fingerprint: &Fingerprint) -> Result<url::Url> {
        let mut url = self
            .config
            .base_url
            .join(&format!("v8/artifacts/{}", fingerprint.as_str()))
            .context("build artifact URL")?;
        if let Some(team_id) = &self.config.team_id {
            url.query_pairs_mut().append_pair("teamId", team_id);
        }
        Ok(url)
    }

    /// `GET /v8/artifacts/{fingerprint}`. Any failure — network, auth,
    /// non-2xx, MAC mismatch — is surfaced as `Ok(None)`, never an error.
    #[instrument(skip(self))]
    pub async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>> {
        let url = self.artifact_url(fingerprint)?;
        let response = match self
            .client
            .get(url)
            .bearer_auth(&self.config.bearer_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%fingerprint, error = ?err, "remote cache fetch request failed; treating as miss");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            warn!(%fingerprint, status = %response.status(), "remote cache fetch returned non-2xx; treating as miss");
            return Ok(None);
        }

        let tag = response
            .headers()
            .get("x-artifact-tag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                warn!(%fingerprint, error = ?err, "failed to read remote cache response body; treating as miss");
                return Ok(None);
            }
        };

        if let Some(signing_key) = &self.config.signing_key {
            let expected = Blake3::keyed_mac(signing_key, &bytes);
            if tag.as_deref() != Some(expected.as_str()) {
                warn!(%fingerprint, "remote cache artifact failed MAC verification; treating as miss");
                return Ok(None);
            }
        }

        Ok(Some(bytes))
    }

    /// `PUT /v8/artifacts/{fingerprint}`. Failure is logged and swallowed —
    /// the caller's local `put` has already succeeded.
    #[instrument(skip(self, bytes))]
    pub async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<()> {
        let url = self.artifact_url(fingerprint)?;
        let mut request = self
            .client
            .put(url)
            .bearer_auth(&self.config.bearer_token)
            .body(bytes.to_vec());
        if let Some(signing_key) = &self.config.signing_key {
            let tag = Blake3::keyed_mac(signing_key, bytes);
            request = request.header("x-artifact-tag", tag.as_str());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                warn!(%fingerprint, status = %response.status(), "remote cache upload returned non-2xx");
                Ok(())
            }
            Err(err) => {
                warn!(%fingerprint, error = ?err, "remote cache upload request failed");
                Ok(())
            }
        }
    }

    /// Best-effort flush of pending uploads within a bounded deadline. This
    /// client issues uploads synchronously with no background queue, so
    /// there is nothing to drain; kept to satisfy the cache's lifecycle
    /// contract (`spec.md` §4.3 `shutdown`).
    pub async fn shutdown(&self) {}
}
