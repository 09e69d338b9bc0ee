use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::error::DownloadError;
use super::transport::HttpClient;
use super::AppLayout;

const CHUNK_SIZE: usize = 4096;

/// Download progress, reported after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Total size known from Content-Length
    Percent(u8),
    /// Total size unknown; bytes received so far
    Bytes(u64),
}

/// Shared flag used to stop a running download
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bundle and detached signature as they sit on disk after a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub bundle_path: PathBuf,
    pub signature_path: PathBuf,
    pub size_bytes: u64,
}

/// Stream `url` into `dest`, returning the number of bytes written.
///
/// A partially written `dest` is left behind on error; removing it is up to
/// the caller.
pub fn download(
    http: &dyn HttpClient,
    url: &str,
    dest: &Path,
    timeout: Duration,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(Progress),
) -> Result<u64, DownloadError> {
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let mut response = http
        .get(url, timeout)
        .map_err(|source| DownloadError::Transport {
            url: url.to_string(),
            source,
        })?;

    if response.status != 200 {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status: response.status,
        });
    }

    let io_err = |source| DownloadError::Io {
        path: dest.to_path_buf(),
        source,
    };

    let total_size = response.content_length.filter(|&n| n > 0);
    let mut file = File::create(dest).map_err(io_err)?;
    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        if cancel.is_cancelled() {
            debug!(url, downloaded, "download cancelled");
            return Err(DownloadError::Cancelled);
        }

        let bytes_read = response.body.read(&mut buffer).map_err(io_err)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read]).map_err(io_err)?;
        downloaded += bytes_read as u64;

        match total_size {
            Some(total) => {
                let percent = (downloaded.saturating_mul(100) / total).min(100) as u8;
                progress(Progress::Percent(percent));
            }
            None => progress(Progress::Bytes(downloaded)),
        }
    }

    file.flush().map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(downloaded)
}

/// Download the bundle and its `.sig` companion into the layout's temp paths
pub fn download_artifact(
    http: &dyn HttpClient,
    bundle_url: &str,
    layout: &AppLayout,
    timeout: Duration,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(Progress),
) -> Result<DownloadedArtifact, DownloadError> {
    let bundle_path = layout.temp_bundle();
    let signature_path = layout.temp_signature();

    info!(url = bundle_url, "downloading update bundle");
    let size_bytes = download(http, bundle_url, &bundle_path, timeout, cancel, progress)?;

    let signature_url = format!("{}.sig", bundle_url);
    download(
        http,
        &signature_url,
        &signature_path,
        timeout,
        cancel,
        &mut |_| {},
    )?;
    info!(size_bytes, "bundle and signature downloaded");

    Ok(DownloadedArtifact {
        bundle_path,
        signature_path,
        size_bytes,
    })
}
