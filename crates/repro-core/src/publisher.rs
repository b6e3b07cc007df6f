//! Result publishing to S3-compatible object storage.
//!
//! Uploads are signed with AWS Signature Version 4 and made public-read so
//! the dashboard can link to them. Publishing never changes a run's
//! classification unless uploads are strict.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::domain::{ComparisonResult, Stage};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_REGION: &str = "us-east-1";

/// Errors raised while archiving or uploading results.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("AWS_S3_BUCKET_NAME is not set")]
    MissingBucket,

    #[error("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set")]
    MissingCredentials,

    #[error("Failed to upload '{key}': HTTP {status}: {body}")]
    Rejected {
        key: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A place results can be uploaded to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` and return its public URL.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str)
        -> Result<String, PublishError>;
}

/// S3 settings, read from the standard AWS environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        S3Config {
            bucket: var("AWS_S3_BUCKET_NAME"),
            region: var("AWS_DEFAULT_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            session_token: var("AWS_SESSION_TOKEN"),
        }
    }
}

impl S3Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(bucket: &str, region: &str) -> Self {
        S3Config {
            bucket: Some(bucket.to_string()),
            region: region.to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }

    pub fn with_credentials(mut self, access_key_id: &str, secret_access_key: &str) -> Self {
        self.access_key_id = Some(access_key_id.to_string());
        self.secret_access_key = Some(secret_access_key.to_string());
        self
    }

    /// Virtual-hosted-style host for the bucket.
    pub fn host(&self, bucket: &str) -> String {
        if self.region == DEFAULT_REGION {
            format!("{bucket}.s3.amazonaws.com")
        } else {
            format!("{bucket}.s3.{}.amazonaws.com", self.region)
        }
    }

    pub fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("https://{}/{}", self.host(bucket), uri_encode(key, false))
    }
}

/// [`ObjectStore`] backed by an S3 bucket.
pub struct S3Store {
    config: S3Config,
    bucket: String,
    access_key_id: String,
    secret_access_key: String,
    http_client: reqwest::Client,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self, PublishError> {
        let bucket = config.bucket.clone().ok_or(PublishError::MissingBucket)?;
        let (Some(access_key_id), Some(secret_access_key)) =
            (config.access_key_id.clone(), config.secret_access_key.clone())
        else {
            return Err(PublishError::MissingCredentials);
        };

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("flathub-repro-checker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(S3Store {
            config,
            bucket,
            access_key_id,
            secret_access_key,
            http_client,
        })
    }

    pub fn from_env() -> Result<Self, PublishError> {
        Self::new(S3Config::from_env())
    }

    fn sign_put(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, PublishError> {
        let host = self.config.host(&self.bucket);
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(body));

        let mut headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("host".to_string(), host),
            ("x-amz-acl".to_string(), "public-read".to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.config.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "PUT\n/{}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            uri_encode(key, false)
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key_bytes = signing_key(&self.secret_access_key, &date, &self.config.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&key_bytes, string_to_sign.as_bytes())?);

        headers.push((
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key_id
            ),
        ));
        Ok(headers)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PublishError> {
        let url = self.config.public_url(&self.bucket, key);
        let headers = self.sign_put(key, &body, content_type, Utc::now())?;

        let mut request = self.http_client.put(&url);
        for (name, value) in headers.into_iter().filter(|(name, _)| name != "host") {
            request = request.header(name, value);
        }

        debug!("PUT {url}");
        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                key: key.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        info!("Uploaded {url}");
        Ok(url)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, PublishError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| PublishError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 signing key for one day, region and service.
pub fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, PublishError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode per the SigV4 rules. `/` is kept unless `encode_slash`.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Zip `dir` into `<dest_dir>/<dir name>.zip` with paths relative to `dir`.
pub fn zip_directory(dir: &Path, dest_dir: &Path) -> Result<PathBuf, PublishError> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result".to_string());
    let zip_path = dest_dir.join(format!("{name}.zip"));
    let archive_err = |source| PublishError::Archive {
        path: dir.to_path_buf(),
        source,
    };

    let mut zip = ZipWriter::new(File::create(&zip_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");
        if entry.file_type().is_dir() {
            zip.add_directory(rel, options).map_err(archive_err)?;
        } else if entry.file_type().is_file() {
            zip.start_file(rel, options).map_err(archive_err)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut zip)?;
        }
    }

    zip.finish().map_err(archive_err)?;
    Ok(zip_path)
}

/// URLs of what was published; errors are kept so the caller can decide
/// whether they matter.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub result_url: Option<String>,
    pub log_url: Option<String>,
    pub errors: Vec<PublishError>,
}

impl PublishOutcome {
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Uploads the diff report and build log of a finished run.
pub struct Publisher<'a> {
    store: &'a dyn ObjectStore,
    scratch_dir: &'a Path,
}

impl<'a> Publisher<'a> {
    /// `scratch_dir` holds the zip archive while it is uploaded.
    pub fn new(store: &'a dyn ObjectStore, scratch_dir: &'a Path) -> Self {
        Self { store, scratch_dir }
    }

    pub async fn publish(
        &self,
        app_id: &str,
        run_id: &str,
        result: &ComparisonResult,
        build_log: Option<&Path>,
    ) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        if let Some(report) = result.diff_report() {
            match self.upload_report(report.dir()).await {
                Ok(url) => outcome.result_url = Some(url),
                Err(e) => {
                    warn!("Failed to upload diffoscope result: {e}");
                    outcome.errors.push(e);
                }
            }
        }

        let wants_log = !matches!(result, ComparisonResult::Reproducible);
        if let Some(log) = build_log.filter(|p| wants_log && p.is_file()) {
            let key = format!("build_log-{app_id}-{run_id}.log");
            let uploaded = match tokio::fs::read(log).await {
                Ok(body) => self.store.put(&key, body, "text/plain").await,
                Err(e) => Err(e.into()),
            };
            match uploaded {
                Ok(url) => outcome.log_url = Some(url),
                Err(e) => {
                    warn!("Failed to upload build log: {e}");
                    outcome.errors.push(e);
                }
            }
        }

        outcome
    }

    async fn upload_report(&self, dir: &Path) -> Result<String, PublishError> {
        let dir = dir.to_path_buf();
        let dest = self.scratch_dir.to_path_buf();
        let zip_path = tokio::task::spawn_blocking(move || zip_directory(&dir, &dest))
            .await
            .map_err(|e| PublishError::Io(io::Error::other(e)))??;

        let key = zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let body = tokio::fs::read(&zip_path).await?;
        let url = self.store.put(&key, body, "application/zip").await;
        if let Err(e) = tokio::fs::remove_file(&zip_path).await {
            debug!("Failed to remove {}: {e}", zip_path.display());
        }
        url
    }
}

/// Apply the strict-upload rule: a publish failure only changes the result
/// when uploads are strict.
pub fn apply_upload_policy(
    result: ComparisonResult,
    outcome: &PublishOutcome,
    strict: bool,
) -> ComparisonResult {
    if strict && outcome.failed() && result.failed_stage().is_none() {
        return ComparisonResult::failed(
            Stage::Upload,
            crate::domain::FailureCause::UploadFailure(outcome.error_summary()),
        );
    }
    result
}
