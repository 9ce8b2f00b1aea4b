//! Object transfer to and from network volumes over their S3-compatible API.
//!
//! Each volume is exposed as a bucket named after the volume id, served from
//! a region-specific endpoint. Requests must be signed for that region; a
//! mismatch surfaces as a redirect failure, so callers resolve the volume's
//! real data centre before transferring anything.

use std::env;

use camino::Utf8Path;
use futures::StreamExt;
use opendal::{Operator, services};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::backend::BackendFuture;

/// Access key variable for the object store.
pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
/// Secret key variable for the object store.
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
/// Path at which workers see the volume's contents.
pub const VOLUME_MOUNT: &str = "/runpod-volume";

const TRANSFER_CHUNK: usize = 8 * 1024 * 1024;

/// Errors raised while moving objects.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ObjectStoreError {
    /// Raised when the object-store credentials are absent.
    #[error(
        "object store credentials missing: set {ACCESS_KEY_ENV} and {SECRET_KEY_ENV} \
         (these are separate from the compute API key)"
    )]
    MissingCredentials,
    /// Raised when the storage client cannot be configured.
    #[error("failed to configure object store for {bucket}: {message}")]
    Configure {
        /// Target bucket.
        bucket: String,
        /// Client error.
        message: String,
    },
    /// Raised when a local file cannot be read or written.
    #[error("local file error for {path}: {message}")]
    Io {
        /// Local path.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// Raised when an upload fails.
    #[error("failed to upload {key}: {message}")]
    Upload {
        /// Object key.
        key: String,
        /// Store error.
        message: String,
    },
    /// Raised when a download fails.
    #[error("failed to download {key}: {message}")]
    Download {
        /// Object key.
        key: String,
        /// Store error.
        message: String,
    },
}

/// Credentials for the object store, distinct from the compute API key.
#[derive(Clone, Eq, PartialEq)]
pub struct ObjectStoreCredentials {
    access_key_id: String,
    secret_access_key: String,
}

impl std::fmt::Debug for ObjectStoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl ObjectStoreCredentials {
    /// Creates credentials from explicit values.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::MissingCredentials`] when either value is
    /// blank.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Result<Self, ObjectStoreError> {
        let access = access_key_id.into().trim().to_owned();
        let secret = secret_access_key.into().trim().to_owned();
        if access.is_empty() || secret.is_empty() {
            return Err(ObjectStoreError::MissingCredentials);
        }
        Ok(Self {
            access_key_id: access,
            secret_access_key: secret,
        })
    }

    /// Reads [`ACCESS_KEY_ENV`] and [`SECRET_KEY_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::MissingCredentials`] when either variable
    /// is unset or blank.
    pub fn from_env() -> Result<Self, ObjectStoreError> {
        let access = env::var(ACCESS_KEY_ENV).unwrap_or_default();
        let secret = env::var(SECRET_KEY_ENV).unwrap_or_default();
        Self::new(access, secret)
    }
}

/// Where a volume's objects live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreLocation {
    /// Data centre of the volume, as reported by the provider.
    pub data_center_id: String,
    /// Bucket name; the volume id.
    pub bucket: String,
}

impl StoreLocation {
    /// Creates a location for `bucket` in `data_center_id`.
    #[must_use]
    pub fn new(data_center_id: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            data_center_id: data_center_id.into(),
            bucket: bucket.into(),
        }
    }

    /// Signing region: the data centre lower-cased with `_` replaced by `-`.
    #[must_use]
    pub fn region(&self) -> String {
        self.data_center_id.trim().to_ascii_lowercase().replace('_', "-")
    }

    /// Region-specific endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("https://s3api-{}.runpod.io/", self.region())
    }
}

/// Path a worker sees for `key` on the mounted volume.
#[must_use]
pub fn mounted_path(key: &str) -> String {
    format!("{VOLUME_MOUNT}/{key}")
}

/// Converts a worker-side path back into an object key.
#[must_use]
pub fn key_from_mounted(path: &str) -> String {
    path.strip_prefix(VOLUME_MOUNT)
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_owned()
}

/// Moves files between the local disk and a volume bucket.
pub trait ObjectTransfer: Send + Sync {
    /// Streams `local` to `key`, returning the bytes sent.
    fn upload<'a>(
        &'a self,
        location: &'a StoreLocation,
        local: &'a Utf8Path,
        key: &'a str,
    ) -> BackendFuture<'a, u64, ObjectStoreError>;

    /// Streams `key` into `local`, returning the bytes received. A partial
    /// local file is removed when the transfer fails.
    fn download<'a>(
        &'a self,
        location: &'a StoreLocation,
        key: &'a str,
        local: &'a Utf8Path,
    ) -> BackendFuture<'a, u64, ObjectStoreError>;
}

/// Transfer client for the provider's S3-compatible volume API.
#[derive(Clone, Debug)]
pub struct S3Transfer {
    credentials: ObjectStoreCredentials,
}

impl S3Transfer {
    /// Creates a client using `credentials`.
    #[must_use]
    pub const fn new(credentials: ObjectStoreCredentials) -> Self {
        Self { credentials }
    }

    /// Creates a client from the ambient environment.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::MissingCredentials`] when the variables are
    /// absent.
    pub fn from_env() -> Result<Self, ObjectStoreError> {
        Ok(Self::new(ObjectStoreCredentials::from_env()?))
    }

    fn operator(&self, location: &StoreLocation) -> Result<Operator, ObjectStoreError> {
        let builder = services::S3::default()
            .bucket(&location.bucket)
            .region(&location.region())
            .endpoint(&location.endpoint_url())
            .access_key_id(&self.credentials.access_key_id)
            .secret_access_key(&self.credentials.secret_access_key);
        Operator::new(builder)
            .map(|operator| operator.finish())
            .map_err(|err| ObjectStoreError::Configure {
                bucket: location.bucket.clone(),
                message: err.to_string(),
            })
    }
}

impl ObjectTransfer for S3Transfer {
    fn upload<'a>(
        &'a self,
        location: &'a StoreLocation,
        local: &'a Utf8Path,
        key: &'a str,
    ) -> BackendFuture<'a, u64, ObjectStoreError> {
        Box::pin(async move {
            let operator = self.operator(location)?;
            info!(bucket = %location.bucket, key, "uploading to volume");
            upload_file(&operator, local, key).await
        })
    }

    fn download<'a>(
        &'a self,
        location: &'a StoreLocation,
        key: &'a str,
        local: &'a Utf8Path,
    ) -> BackendFuture<'a, u64, ObjectStoreError> {
        Box::pin(async move {
            let operator = self.operator(location)?;
            info!(bucket = %location.bucket, key, "downloading from volume");
            download_file(&operator, key, local).await
        })
    }
}

fn io_error(path: &Utf8Path) -> impl Fn(std::io::Error) -> ObjectStoreError + '_ {
    move |err| ObjectStoreError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Streams a local file into `key` on `operator` in fixed-size chunks.
///
/// # Errors
///
/// Returns [`ObjectStoreError::Io`] when the file cannot be read and
/// [`ObjectStoreError::Upload`] when the store rejects a write.
pub async fn upload_file(
    operator: &Operator,
    local: &Utf8Path,
    key: &str,
) -> Result<u64, ObjectStoreError> {
    let upload_error = |err: opendal::Error| ObjectStoreError::Upload {
        key: key.to_owned(),
        message: err.to_string(),
    };
    let mut file = File::open(local).await.map_err(io_error(local))?;
    let mut writer = operator.writer(key).await.map_err(upload_error)?;
    let mut buffer = vec![0_u8; TRANSFER_CHUNK];
    let mut sent: u64 = 0;
    loop {
        let read = file.read(&mut buffer).await.map_err(io_error(local))?;
        let Some(chunk) = buffer.get(..read).filter(|chunk| !chunk.is_empty()) else {
            break;
        };
        writer.write(chunk.to_vec()).await.map_err(upload_error)?;
        sent = sent.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
    }
    writer.close().await.map_err(upload_error)?;
    debug!(key, bytes = sent, "upload finished");
    Ok(sent)
}

/// Streams `key` from `operator` into a local file, removing the file if the
/// transfer fails part way.
///
/// # Errors
///
/// Returns [`ObjectStoreError::Download`] when the object cannot be read and
/// [`ObjectStoreError::Io`] when the local file cannot be written.
pub async fn download_file(
    operator: &Operator,
    key: &str,
    local: &Utf8Path,
) -> Result<u64, ObjectStoreError> {
    let download_error = |err: opendal::Error| ObjectStoreError::Download {
        key: key.to_owned(),
        message: err.to_string(),
    };
    let reader = operator.reader(key).await.map_err(download_error)?;
    let stream = reader
        .into_bytes_stream(..)
        .await
        .map_err(download_error)?;
    if let Some(parent) = local.parent().filter(|parent| !parent.as_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let result = write_stream(stream, key, local).await;
    if result.is_err() {
        discard_partial(local).await;
    }
    result
}

/// Removes whatever a failed or cancelled transfer left at `local`.
///
/// Call this outside any cancellable wait: a cancelled future is dropped
/// before its own cleanup can run.
pub async fn discard_partial(local: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(local).await {
        debug!(path = %local, error = %err, "no partial output to remove");
    }
}

async fn write_stream(
    mut stream: opendal::FuturesBytesStream,
    key: &str,
    local: &Utf8Path,
) -> Result<u64, ObjectStoreError> {
    let mut file = File::create(local).await.map_err(io_error(local))?;
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|err| ObjectStoreError::Download {
            key: key.to_owned(),
            message: err.to_string(),
        })?;
        file.write_all(&bytes).await.map_err(io_error(local))?;
        received = received.saturating_add(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
    }
    file.flush().await.map_err(io_error(local))?;
    debug!(key, bytes = received, "download finished");
    Ok(received)
}
