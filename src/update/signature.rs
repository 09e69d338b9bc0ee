//! Detached Ed25519 signatures over update bundles.
//!
//! Keys and signatures travel as ASCII-armored text blocks so they can be
//! shipped next to the application and published next to the bundle. The
//! public key may carry an `Expires` header; signatures may carry the
//! `Key-Id` of the key that made them.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::error::{ArmorError, VerificationError};

pub const PUBLIC_KEY_LABEL: &str = "OCR UPDATE PUBLIC KEY";
pub const SIGNATURE_LABEL: &str = "OCR UPDATE SIGNATURE";
pub const MISSING_KEY_REASON: &str = "missing public key";

const EXPIRES_HEADER: &str = "Expires";
const KEY_ID_HEADER: &str = "Key-Id";
const LINE_WIDTH: usize = 64;

/// Outcome of a signature check. Never an error: every failure is a
/// `valid = false` with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl VerificationResult {
    pub fn trusted() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// A BEGIN/END delimited base64 block with optional `Name: value` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Armor {
    pub label: String,
    pub headers: Vec<(String, String)>,
    pub data: Vec<u8>,
}

impl Armor {
    pub fn new(label: &str, data: Vec<u8>) -> Self {
        Self {
            label: label.to_string(),
            headers: Vec::new(),
            data,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn parse(text: &str, label: &str) -> Result<Self, ArmorError> {
        let begin = format!("-----BEGIN {}-----", label);
        let end = format!("-----END {}-----", label);

        let mut lines = text.lines().map(str::trim);
        if !lines.by_ref().any(|line| line == begin) {
            return Err(ArmorError::MissingBegin(label.to_string()));
        }

        let mut headers = Vec::new();
        let mut encoded = String::new();
        let mut in_headers = true;
        let mut closed = false;

        for line in lines {
            if line == end {
                closed = true;
                break;
            }
            if in_headers {
                if line.is_empty() {
                    in_headers = false;
                    continue;
                }
                // base64 never contains ':'
                if let Some((name, value)) = line.split_once(':') {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(ArmorError::BadHeader(line.to_string()));
                    }
                    headers.push((name.to_string(), value.trim().to_string()));
                    continue;
                }
                in_headers = false;
            }
            encoded.push_str(line);
        }

        if !closed {
            return Err(ArmorError::MissingEnd(label.to_string()));
        }

        let data = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| ArmorError::Base64(e.to_string()))?;

        Ok(Self {
            label: label.to_string(),
            headers,
            data,
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!("-----BEGIN {}-----\n", self.label);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\n", name, value));
        }
        if !self.headers.is_empty() {
            out.push('\n');
        }
        let encoded = general_purpose::STANDARD.encode(&self.data);
        for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push('\n');
        }
        out.push_str(&format!("-----END {}-----\n", self.label));
        out
    }
}

/// Short fingerprint of a public key: hex of the first 8 bytes of its SHA-256
pub fn key_id(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Armor for a public key, optionally with an expiry
pub fn public_key_armor(key: &VerifyingKey, expires: Option<DateTime<Utc>>) -> Armor {
    let armor = Armor::new(PUBLIC_KEY_LABEL, key.to_bytes().to_vec());
    match expires {
        Some(at) => armor.with_header(EXPIRES_HEADER, at.to_rfc3339()),
        None => armor,
    }
}

/// Armor for a detached signature made with `key`
pub fn signature_armor(signature: &Signature, key: &VerifyingKey) -> Armor {
    Armor::new(SIGNATURE_LABEL, signature.to_bytes().to_vec()).with_header(KEY_ID_HEADER, key_id(key))
}

/// Parse an armored public key and reject it if it expired before `now`
pub fn parse_public_key(text: &str, now: DateTime<Utc>) -> Result<VerifyingKey, VerificationError> {
    let armor = Armor::parse(text, PUBLIC_KEY_LABEL)
        .map_err(|e| VerificationError::MalformedKey(e.to_string()))?;

    if let Some(expires) = armor.header(EXPIRES_HEADER) {
        let expires_at = DateTime::parse_from_rfc3339(expires)
            .map_err(|e| VerificationError::MalformedKey(format!("bad Expires header: {}", e)))?;
        if expires_at.with_timezone(&Utc) <= now {
            return Err(VerificationError::KeyExpired(expires.to_string()));
        }
    }

    let bytes: [u8; 32] = armor.data.as_slice().try_into().map_err(|_| {
        VerificationError::MalformedKey(format!("expected 32 key bytes, got {}", armor.data.len()))
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| VerificationError::MalformedKey(e.to_string()))
}

/// Check `signature_path` against the exact bytes of `bundle_path` using the
/// key stored at `public_key_path`.
pub fn verify(bundle_path: &Path, signature_path: &Path, public_key_path: &Path) -> VerificationResult {
    if !public_key_path.is_file() {
        warn!(path = %public_key_path.display(), "public key not found");
        return VerificationResult::rejected(MISSING_KEY_REASON);
    }

    match check_signature(bundle_path, signature_path, public_key_path, Utc::now()) {
        Ok(()) => {
            info!(bundle = %bundle_path.display(), "bundle signature verified");
            VerificationResult::trusted()
        }
        Err(e) => {
            warn!(bundle = %bundle_path.display(), "bundle rejected: {}", e);
            VerificationResult::rejected(e.to_string())
        }
    }
}

fn read_text(path: &Path) -> Result<String, VerificationError> {
    fs::read_to_string(path).map_err(|source| VerificationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn check_signature(
    bundle_path: &Path,
    signature_path: &Path,
    public_key_path: &Path,
    now: DateTime<Utc>,
) -> Result<(), VerificationError> {
    let public_key = parse_public_key(&read_text(public_key_path)?, now)?;

    let armor = Armor::parse(&read_text(signature_path)?, SIGNATURE_LABEL)
        .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;

    let expected = key_id(&public_key);
    if let Some(found) = armor.header(KEY_ID_HEADER) {
        if !found.eq_ignore_ascii_case(&expected) {
            return Err(VerificationError::UntrustedKey {
                expected,
                found: found.to_string(),
            });
        }
    }

    let bytes: [u8; 64] = armor.data.as_slice().try_into().map_err(|_| {
        VerificationError::MalformedSignature(format!(
            "expected 64 signature bytes, got {}",
            armor.data.len()
        ))
    })?;
    let signature = Signature::from_bytes(&bytes);

    let bundle = fs::read(bundle_path).map_err(|source| VerificationError::Io {
        path: bundle_path.to_path_buf(),
        source,
    })?;

    public_key
        .verify_strict(&bundle, &signature)
        .map_err(|_| VerificationError::BadSignature)
}
