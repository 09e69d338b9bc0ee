use std::path::PathBuf;

/// A version string that is not a dotted list of integers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// Failure at the HTTP boundary, before any status code is known.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// Raised by `HttpClient` implementations that are not backed by reqwest
    #[error("{0}")]
    Other(String),
}

/// The release descriptor could not be retrieved.
#[derive(thiserror::Error, Debug)]
pub enum MetadataFetchError {
    #[error("failed to reach update server: {0}")]
    Transport(#[from] TransportError),
    #[error("update server returned HTTP {0}")]
    Status(u16),
    #[error("failed to read release descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed release descriptor: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The bundle or its signature could not be downloaded.
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("download of {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("download of {url} failed: HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download cancelled")]
    Cancelled,
}

/// Reasons a signature check rejects a bundle. Never escapes
/// [`verify`](super::signature::verify); it is folded into a
/// [`VerificationResult`](super::signature::VerificationResult).
#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("public key expired at {0}")]
    KeyExpired(String),
    #[error("signature made by untrusted key {found} (expected {expected})")]
    UntrustedKey { expected: String, found: String },
    #[error("signature does not match bundle")]
    BadSignature,
}

/// Malformed ASCII armor.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ArmorError {
    #[error("missing '-----BEGIN {0}-----' line")]
    MissingBegin(String),
    #[error("missing '-----END {0}-----' line")]
    MissingEnd(String),
    #[error("malformed header line '{0}'")]
    BadHeader(String),
    #[error("invalid base64 body: {0}")]
    Base64(String),
}

/// Backing up or extracting the bundle failed.
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("failed to open bundle: {0}")]
    Open(#[source] std::io::Error),
    #[error("unsupported bundle format")]
    UnsupportedFormat,
    #[error("corrupt zip bundle: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("corrupt tar bundle: {0}")]
    Tar(#[source] std::io::Error),
    #[error("bundle entry escapes the application directory: {0}")]
    UnsafeEntry(String),
    #[error("failed to back up {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Extract {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no backup found at {}", .0.display())]
    NoBackup(PathBuf),
}

/// Errors from the background worker itself, as opposed to a run's outcome.
#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("an update is already in progress")]
    Busy,
    #[error("failed to start update worker: {0}")]
    Spawn(#[source] std::io::Error),
}
