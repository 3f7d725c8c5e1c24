use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use axum::{
    extract::{Extension, Path as UrlPath, Query},
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde::Deserialize;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::jobs::GenerationJob;

type HmacSha256 = Hmac<Sha256>;

/// key: object-storage -> store(bytes, key) / url(key, ttl)
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Persist `bytes` under `key` and return the key.
    async fn store(&self, bytes: Bytes, key: &str) -> anyhow::Result<String>;

    /// Time-limited URL for a previously stored key.
    async fn url(&self, key: &str, ttl: Duration) -> anyhow::Result<String>;
}

/// Filesystem-backed storage. URLs carry an expiry and an HMAC over
/// `key:expires`, checked by [`LocalObjectStorage::verify_url`].
#[derive(Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    public_url: String,
    signing_secret: String,
}

impl LocalObjectStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        public_url: impl Into<String>,
        signing_secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into(),
            signing_secret: signing_secret.into(),
        }
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            bail!("invalid storage key `{key}`");
        }
        Ok(self.root.join(relative))
    }

    fn signature(&self, key: &str, expires: i64) -> anyhow::Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|err| anyhow!("invalid storage signing secret: {err}"))?;
        mac.update(key.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Check a signed URL's query parameters against the key.
    pub fn verify_url(&self, key: &str, expires: i64, signature: &str, now_unix: i64) -> bool {
        if expires < now_unix {
            return false;
        }
        let Ok(candidate) = hex::decode(signature) else {
            return false;
        };
        self.signature(key, expires)
            .map(|mac| mac.verify_slice(&candidate).is_ok())
            .unwrap_or(false)
    }

    pub async fn read(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn store(&self, bytes: Bytes, key: &str) -> anyhow::Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.flush().await?;
        Ok(key.to_string())
    }

    async fn url(&self, key: &str, ttl: Duration) -> anyhow::Result<String> {
        self.path_for(key)?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = hex::encode(self.signature(key, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.public_url.trim_end_matches('/'),
            key,
            expires,
            signature
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct SignedUrlQuery {
    pub expires: i64,
    pub signature: String,
}

/// Serves objects from [`LocalObjectStorage`] behind its signed URLs.
pub async fn serve_media(
    UrlPath(key): UrlPath<String>,
    Query(query): Query<SignedUrlQuery>,
    Extension(storage): Extension<Arc<LocalObjectStorage>>,
) -> AppResult<impl IntoResponse> {
    let key = key.trim_start_matches('/');
    if !storage.verify_url(key, query.expires, &query.signature, Utc::now().timestamp()) {
        return Err(AppError::Unauthorized);
    }
    let data = storage.read(key).await.map_err(|err| {
        tracing::warn!(key, ?err, "media read failed");
        AppError::NotFound("media".to_string())
    })?;
    let mut headers = HeaderMap::new();
    let content_type = if key.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    };
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok((headers, data))
}

pub fn output_key(owner_id: Uuid, job_id: Uuid) -> String {
    format!("generations/{owner_id}/{job_id}.mp4")
}

/// key: output-retrieval -> copy provider output into our storage
#[async_trait]
pub trait OutputArchiver: Send + Sync {
    /// Fetch `source_url` and store it for `job`, returning the storage key.
    async fn archive(&self, job: &GenerationJob, source_url: &str) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct HttpOutputArchiver {
    client: reqwest::Client,
    storage: Arc<dyn ObjectStorage>,
}

impl HttpOutputArchiver {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("failed to build download client")?;
        Ok(Self { client, storage })
    }
}

#[async_trait]
impl OutputArchiver for HttpOutputArchiver {
    async fn archive(&self, job: &GenerationJob, source_url: &str) -> anyhow::Result<String> {
        let url = url::Url::parse(source_url)
            .with_context(|| format!("invalid output url `{source_url}`"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("unsupported output url scheme `{}`", url.scheme());
        }
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .context("output download failed")?
            .error_for_status()
            .context("output download rejected")?
            .bytes()
            .await
            .context("output download interrupted")?;
        if bytes.is_empty() {
            bail!("provider output is empty");
        }
        tracing::info!(
            target: "generation.output",
            job_id = %job.id,
            size = bytes.len(),
            "archiving provider output"
        );
        self.storage
            .store(bytes, &output_key(job.owner_id, job.id))
            .await
    }
}
