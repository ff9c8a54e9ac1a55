//! Swift object store client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use tokio_util::io::ReaderStream;

use crate::config::SwiftConfig;
use crate::errors::PersistError;

const AUTH_HEADER: &str = "X-Auth-Token";

/// Body of a (possibly ranged) object download.
pub struct RangeBody {
    /// Offset the body starts at; 0 when the server ignored the range.
    pub start: u64,
    pub stream: BoxStream<'static, Result<Vec<u8>, PersistError>>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn ensure_container(&self, container: &str) -> Result<(), PersistError>;

    /// Upload a local file as `container/object`, streaming its contents.
    async fn upload(&self, container: &str, object: &str, src: &Path) -> Result<(), PersistError>;

    /// Open `container/object` from byte `offset`.
    async fn open_range(
        &self,
        container: &str,
        object: &str,
        offset: u64,
    ) -> Result<RangeBody, PersistError>;

    /// Delete an object; a missing object is not an error.
    async fn delete(&self, container: &str, object: &str) -> Result<(), PersistError>;

    /// Signed GET URL valid for `ttl`.
    fn temp_url(&self, container: &str, object: &str, ttl: Duration)
    -> Result<String, PersistError>;
}

pub struct SwiftClient {
    client: reqwest::Client,
    /// Whole-request bound for container and delete calls. Transfers are
    /// bounded per read instead, so large objects are limited by stalls only.
    control_timeout: Duration,
    base: reqwest::Url,
    token: Option<String>,
    temp_url_key: Option<String>,
}

impl SwiftClient {
    pub fn new(config: &SwiftConfig) -> Result<Self, PersistError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| PersistError::blob("connect", "storage.swift.url is not set"))?;
        let base = reqwest::Url::parse(url.trim_end_matches('/'))
            .map_err(|e| PersistError::blob("connect", format!("invalid url {}: {}", url, e)))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| PersistError::blob("connect", e))?;
        Ok(Self {
            client,
            control_timeout: timeout,
            base,
            token: config.auth_token.clone(),
            temp_url_key: config.temp_url_key.clone(),
        })
    }

    fn object_url(&self, container: &str, object: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.base.as_str().trim_end_matches('/'), container);
        if let Some(object) = object {
            url.push('/');
            url.push_str(object);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.header(AUTH_HEADER, token),
            None => req,
        }
    }
}

fn check(op: &'static str, resp: &reqwest::Response) -> Result<(), PersistError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(PersistError::blob(op, format!("HTTP {}", resp.status())))
    }
}

#[async_trait]
impl BlobStore for SwiftClient {
    async fn ensure_container(&self, container: &str) -> Result<(), PersistError> {
        let resp = self
            .request(reqwest::Method::PUT, &self.object_url(container, None))
            .timeout(self.control_timeout)
            .send()
            .await
            .map_err(|e| PersistError::blob("create container", e))?;
        check("create container", &resp)
    }

    async fn upload(&self, container: &str, object: &str, src: &Path) -> Result<(), PersistError> {
        let file = tokio::fs::File::open(src)
            .await
            .map_err(|source| PersistError::Io {
                path: src.to_path_buf(),
                source,
            })?;
        let len = file
            .metadata()
            .await
            .map_err(|source| PersistError::Io {
                path: src.to_path_buf(),
                source,
            })?
            .len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let resp = self
            .request(reqwest::Method::PUT, &self.object_url(container, Some(object)))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| PersistError::blob("upload", e))?;
        check("upload", &resp)?;
        tracing::debug!(container, object, bytes = len, "uploaded object");
        Ok(())
    }

    async fn open_range(
        &self,
        container: &str,
        object: &str,
        offset: u64,
    ) -> Result<RangeBody, PersistError> {
        let mut req = self.request(reqwest::Method::GET, &self.object_url(container, Some(object)));
        if offset > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PersistError::blob("download", e))?;
        check("download", &resp)?;
        let start = if resp.status() == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        let stream = resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| PersistError::blob("download", e))
            })
            .boxed();
        Ok(RangeBody { start, stream })
    }

    async fn delete(&self, container: &str, object: &str) -> Result<(), PersistError> {
        let resp = self
            .request(reqwest::Method::DELETE, &self.object_url(container, Some(object)))
            .timeout(self.control_timeout)
            .send()
            .await
            .map_err(|e| PersistError::blob("delete", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check("delete", &resp)
    }

    fn temp_url(
        &self,
        container: &str,
        object: &str,
        ttl: Duration,
    ) -> Result<String, PersistError> {
        let key = self
            .temp_url_key
            .as_deref()
            .ok_or_else(|| PersistError::blob("temp url", "storage.swift.temp_url_key is not set"))?;
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let path = format!(
            "{}/{}/{}",
            self.base.path().trim_end_matches('/'),
            container,
            object
        );
        let sig = temp_url_signature(key, "GET", expires, &path)?;
        Ok(format!(
            "{}?temp_url_sig={}&temp_url_expires={}",
            self.object_url(container, Some(object)),
            sig,
            expires
        ))
    }
}

/// HMAC-SHA256 over `METHOD\nEXPIRES\nPATH`, hex-encoded.
pub fn temp_url_signature(
    key: &str,
    method: &str,
    expires: i64,
    path: &str,
) -> Result<String, PersistError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .map_err(|e| PersistError::blob("temp url", e))?;
    mac.update(format!("{}\n{}\n{}", method, expires, path).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
