//! HTTP(S) client for the central directory: peer names, addresses and
//! long-term keys.

use std::sync::Mutex;
use std::time::Duration;

use p256::ecdsa::VerifyingKey;
use reqwest::StatusCode;
use tracing::debug;

use crate::crypto::{self, PUBLIC_KEY_LEN};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory answered {0}")]
    Status(StatusCode),
    #[error("directory returned a bad public key")]
    BadKey,
}

/// Thin wrapper over the directory's REST surface. The peer list supports
/// ETag-based change detection.
pub struct DirectoryClient {
    http: reqwest::Client,
    base: String,
    peers_etag: Mutex<Option<String>>,
}

impl DirectoryClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: base_url.trim_end_matches('/').to_owned(),
            peers_etag: Mutex::new(None),
        }
    }

    /// `GET /peers/`: every registered peer name.
    pub async fn peer_list(&self) -> Result<Vec<String>, DirectoryError> {
        let url = format!("{}/peers/", self.base);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status()));
        }
        Ok(split_lines(&resp.text().await?))
    }

    /// `GET /peers/` with `If-None-Match`. `None` means unchanged since the
    /// previous call.
    pub async fn peer_list_if_changed(&self) -> Result<Option<Vec<String>>, DirectoryError> {
        let url = format!("{}/peers/", self.base);
        let mut req = self.http.get(&url);
        if let Some(etag) = self.peers_etag.lock().expect("etag lock").clone() {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            debug!("peer list unchanged (304)");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status()));
        }
        if let Some(etag) = resp.headers().get(reqwest::header::ETAG) {
            if let Ok(value) = etag.to_str() {
                *self.peers_etag.lock().expect("etag lock") = Some(value.to_owned());
            }
        }
        Ok(Some(split_lines(&resp.text().await?)))
    }

    /// `GET /peers/{name}/addresses`: candidate `host:port` strings.
    pub async fn peer_addresses(&self, name: &str) -> Result<Vec<String>, DirectoryError> {
        let url = format!("{}/peers/{}/addresses", self.base, name);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status()));
        }
        Ok(split_lines(&resp.text().await?))
    }

    /// `GET /peers/{name}/key`: the peer's raw 64-byte public key.
    pub async fn peer_key(&self, name: &str) -> Result<VerifyingKey, DirectoryError> {
        let url = format!("{}/peers/{}/key", self.base, name);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status()));
        }
        let raw = resp.bytes().await?;
        crypto::parse_public(&raw).map_err(|_| DirectoryError::BadKey)
    }

    /// `PUT /peers/{name}/key`: register our public key.
    pub async fn register_key(
        &self,
        name: &str,
        key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<(), DirectoryError> {
        let url = format!("{}/peers/{}/key", self.base, name);
        let resp = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(key.to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status()));
        }
        Ok(())
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}
