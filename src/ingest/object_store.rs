// =============================================================================
// Object store client — anonymous HTTPS HEAD/GET against NOAA public buckets
// =============================================================================

use std::path::Path;

use tracing::debug;

use crate::error::{EngineError, Result};

/// HEAD timeout.
const HEAD_TIMEOUT_SECS: u64 = 2;

/// Outcome of a HEAD probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadResult {
    /// Object exists; content length when the bucket reports one.
    Found { content_length: Option<u64> },
    NotFound,
}

/// Anonymous read-only S3 client. Public NOAA buckets need no signing, so
/// this is plain HTTPS with virtual-hosted-style URLs.
pub struct ObjectStore {
    client: reqwest::Client,
    /// `None` = virtual-hosted S3; tests inject a local base URL.
    base_url: Option<String>,
}

impl ObjectStore {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: None,
        }
    }

    /// Point every request at `base`/{bucket}/{key} instead of S3.
    pub fn with_base_url(base: impl Into<String>) -> Self {
        let mut s = Self::new();
        s.base_url = Some(base.into());
        s
    }

    fn url_for(&self, bucket: &str, key: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{bucket}/{key}"),
            None => format!("https://{bucket}.s3.amazonaws.com/{key}"),
        }
    }

    /// Probe for object existence. 404 is a normal outcome, not an error.
    pub async fn head(&self, bucket: &str, key: &str) -> Result<HeadResult> {
        let url = self.url_for(bucket, key);
        let resp = self
            .client
            .head(&url)
            .timeout(std::time::Duration::from_secs(HEAD_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout {
                        operation: "s3-head",
                        ms: HEAD_TIMEOUT_SECS * 1000,
                    }
                } else {
                    EngineError::Http(e)
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            let content_length = resp.content_length();
            debug!(%url, ?content_length, "HEAD 200");
            return Ok(HeadResult::Found { content_length });
        }
        if status.as_u16() == 404 || status.as_u16() == 403 {
            // Public buckets answer 403 for keys that do not exist yet.
            return Ok(HeadResult::NotFound);
        }
        Err(EngineError::from_response_status("object-store", status))
    }

    /// Download an object to `dest`. Returns the byte count.
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        timeout_ms: u64,
    ) -> Result<u64> {
        let url = self.url_for(bucket, key);
        let resp = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout {
                        operation: "s3-get",
                        ms: timeout_ms,
                    }
                } else {
                    EngineError::Http(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::from_response_status("object-store", status));
        }

        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    operation: "s3-get-body",
                    ms: timeout_ms,
                }
            } else {
                EngineError::Http(e)
            }
        })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        debug!(%url, bytes = bytes.len(), dest = %dest.display(), "object downloaded");
        Ok(bytes.len() as u64)
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}
