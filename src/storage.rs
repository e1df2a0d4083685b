//! Object storage for reference and generated images.

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use chrono::Utc;
use image::ImageFormat;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Reads an object by its stored path.
    async fn download(&self, path: &str) -> Result<Vec<u8>, Error>;

    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), Error>;

    fn public_url(&self, path: &str) -> String;

    /// Reads an arbitrary URL.
    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, Error>;
}

/// Older rows store bare `upload-…` names that actually live under
/// `uploads/`.
pub fn resolve_path(path: &str) -> String {
    if path.starts_with("upload-") {
        format!("uploads/{path}")
    } else {
        path.to_string()
    }
}

/// An image ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub extension: &'static str,
}

/// Re-encodes generated output as lossless WebP, keeping the original
/// bytes as PNG when that is not possible.
pub fn encode_for_upload(bytes: Vec<u8>) -> EncodedImage {
    let webp = image::load_from_memory(&bytes).and_then(|img| {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::WebP)?;
        Ok(out.into_inner())
    });
    match webp {
        Ok(webp) => EncodedImage {
            bytes: webp,
            mime_type: "image/webp",
            extension: "webp",
        },
        Err(err) => {
            warn!(error = %err, "WebP conversion failed, storing PNG");
            EncodedImage {
                bytes,
                mime_type: "image/png",
                extension: "png",
            }
        }
    }
}

pub fn generated_path(user_id: &str, extension: &str) -> String {
    format!(
        "generated-images/user-{}/generated_{}_{}.{}",
        user_id,
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        extension
    )
}

/// Supabase-style storage: authenticated uploads to
/// `{base}/storage/v1/object/{bucket}/{path}`, public reads from
/// `{public_base}{path}`.
pub struct SupabaseStorage {
    http: reqwest::Client,
    base_url: String,
    public_base_url: String,
    bucket: String,
    service_key: String,
}

impl SupabaseStorage {
    pub fn new(
        base_url: &str,
        public_base_url: Option<&str>,
        bucket: &str,
        service_key: &str,
    ) -> Result<Self, Error> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let public_base_url = match public_base_url {
            Some(url) if !url.is_empty() => {
                format!("{}/", url.trim_end_matches('/'))
            }
            _ => format!("{base_url}/storage/v1/object/public/{bucket}/"),
        };
        let http = reqwest::Client::builder()
            .build()
            .context("building storage http client")?;
        Ok(SupabaseStorage {
            http,
            base_url,
            public_base_url,
            bucket: bucket.to_string(),
            service_key: service_key.to_string(),
        })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("downloading {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("download of {url} failed with {status}: {body}"));
        }
        let bytes = response.bytes().await?;
        debug!(url, size = bytes.len(), "Downloaded object");
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    #[instrument(name = "storage.download", skip(self))]
    async fn download(&self, path: &str) -> Result<Vec<u8>, Error> {
        let url = self.public_url(&resolve_path(path));
        self.get(&url).await
    }

    #[instrument(name = "storage.upload", skip(self, bytes), fields(size = bytes.len()))]
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), Error> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.service_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("uploading {path}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("upload of {path} failed with {status}: {body}"));
        }
        info!(path, "Uploaded object");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url, path.trim_start_matches('/'))
    }

    #[instrument(name = "storage.fetch_url", skip(self))]
    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, Error> {
        self.get(url).await
    }
}
