//! Fakes and fixtures shared by the update tests.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};

use super::download::Progress;
use super::error::TransportError;
use super::pipeline::{Endpoints, Observer, PipelineState, UpdatePipeline};
use super::signature::{public_key_armor, signature_armor};
use super::transport::{HttpClient, HttpResponse};
use super::AppLayout;

pub const VERSION_URL: &str = "https://updates.example/version.json";
pub const BUNDLE_URL: &str = "https://updates.example/update_temp.zip";

type BodyFactory = Box<dyn Fn() -> Box<dyn Read + Send> + Send + Sync>;

enum Body {
    Bytes(Vec<u8>),
    Stream(BodyFactory),
}

struct Route {
    status: u16,
    body: Body,
    content_length: Option<u64>,
}

/// In-memory HTTP server. Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct FakeHttp {
    routes: HashMap<String, Route>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, url: &str, status: u16, body: Vec<u8>) -> Self {
        let content_length = Some(body.len() as u64);
        self.routes.insert(
            url.to_string(),
            Route {
                status,
                body: Body::Bytes(body),
                content_length,
            },
        );
        self
    }

    pub fn route_without_length(mut self, url: &str, status: u16, body: Vec<u8>) -> Self {
        self.routes.insert(
            url.to_string(),
            Route {
                status,
                body: Body::Bytes(body),
                content_length: None,
            },
        );
        self
    }

    /// Serve a body that arrives `chunk` bytes at a time with `delay` before
    /// each read, `total` bytes in all.
    pub fn route_slow(mut self, url: &str, total: u64, chunk: usize, delay: Duration) -> Self {
        let factory: BodyFactory = Box::new(move || {
            Box::new(SlowBody {
                remaining: total,
                chunk,
                delay,
            })
        });
        self.routes.insert(
            url.to_string(),
            Route {
                status: 200,
                body: Body::Stream(factory),
                content_length: Some(total),
            },
        );
        self
    }
}

struct SlowBody {
    remaining: u64,
    chunk: usize,
    delay: Duration,
}

impl Read for SlowBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        thread::sleep(self.delay);
        let n = buf.len().min(self.chunk).min(self.remaining as usize);
        buf[..n].fill(0);
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl HttpClient for FakeHttp {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, TransportError> {
        let route = self
            .routes
            .get(url)
            .ok_or_else(|| TransportError::Other(format!("connection refused: {}", url)))?;
        let body: Box<dyn Read + Send> = match &route.body {
            Body::Bytes(bytes) => Box::new(Cursor::new(bytes.clone())),
            Body::Stream(factory) => factory(),
        };
        Ok(HttpResponse {
            status: route.status,
            content_length: route.content_length,
            body,
        })
    }
}

/// Records everything the pipeline reports
#[derive(Debug, Default)]
pub struct Recorder {
    pub states: Vec<PipelineState>,
    pub progress: Vec<Progress>,
}

impl Observer for Recorder {
    fn on_state(&mut self, state: &PipelineState) {
        self.states.push(state.clone());
    }

    fn on_progress(&mut self, progress: Progress) {
        self.progress.push(progress);
    }
}

pub fn pipeline_for(app_dir: &Path, http: FakeHttp, current_version: &str) -> UpdatePipeline {
    UpdatePipeline::new(
        Box::new(http),
        AppLayout::new(app_dir),
        Endpoints {
            version_url: VERSION_URL.to_string(),
            bundle_url: BUNDLE_URL.to_string(),
        },
        current_version,
    )
}

pub fn test_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

/// Write the public half of `key` where the updater expects it
pub fn install_public_key(
    app_dir: &Path,
    key: &SigningKey,
    expires: Option<DateTime<Utc>>,
) -> PathBuf {
    let layout = AppLayout::new(app_dir);
    let armor = public_key_armor(&key.verifying_key(), expires);
    fs::write(layout.public_key(), armor.render()).unwrap();
    layout.public_key()
}

pub fn sign_bytes(key: &SigningKey, data: &[u8]) -> String {
    signature_armor(&key.sign(data), &key.verifying_key()).render()
}

/// Sign `path` and write `<path>.sig` next to it
pub fn sign_file(key: &SigningKey, path: &Path) -> PathBuf {
    let data = fs::read(path).unwrap();
    let mut sig_path = path.as_os_str().to_owned();
    sig_path.push(".sig");
    let sig_path = PathBuf::from(sig_path);
    fs::write(&sig_path, sign_bytes(key, &data)).unwrap();
    sig_path
}

pub fn build_zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn build_zip(path: &Path, entries: &[(&str, &str)]) {
    fs::write(path, build_zip_bytes(entries)).unwrap();
}

pub fn build_tar_gz(path: &Path, entries: &[(&str, &str)]) {
    let file = File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
