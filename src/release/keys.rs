use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::update::signature::{key_id, public_key_armor, signature_armor, Armor};
use crate::update::PUBLIC_KEY_NAME;

pub const SECRET_KEY_LABEL: &str = "OCR UPDATE SECRET KEY";
pub const SECRET_KEY_NAME: &str = "update_secret_key.asc";

/// Paths written by [`generate_keypair`]
#[derive(Debug)]
pub struct KeyPairFiles {
    pub public_key: PathBuf,
    pub secret_key: PathBuf,
    pub key_id: String,
}

/// Generate a fresh signing key and write both halves into `out_dir`
pub fn generate_keypair(out_dir: &Path, expires_in_days: Option<i64>) -> Result<KeyPairFiles> {
    let expires = expires_in_days.map(|days| Utc::now() + Duration::days(days));
    let signing_key = SigningKey::generate(&mut OsRng);
    write_keypair(&signing_key, out_dir, expires)
}

fn write_keypair(
    signing_key: &SigningKey,
    out_dir: &Path,
    expires: Option<DateTime<Utc>>,
) -> Result<KeyPairFiles> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let public_key = out_dir.join(PUBLIC_KEY_NAME);
    let secret_key = out_dir.join(SECRET_KEY_NAME);
    if secret_key.exists() {
        bail!("Refusing to overwrite existing secret key {}", secret_key.display());
    }

    let verifying_key = signing_key.verifying_key();
    fs::write(&public_key, public_key_armor(&verifying_key, expires).render())
        .context("Failed to write public key")?;

    let secret = Armor::new(SECRET_KEY_LABEL, signing_key.to_bytes().to_vec()).render();
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(&secret_key)
        .and_then(|mut file| file.write_all(secret.as_bytes()))
        .context("Failed to write secret key")?;

    Ok(KeyPairFiles {
        public_key,
        secret_key,
        key_id: key_id(&verifying_key),
    })
}

/// Load an armored secret key written by [`generate_keypair`]
pub fn load_secret_key(path: &Path) -> Result<SigningKey> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read secret key {}", path.display()))?;
    let armor = Armor::parse(&text, SECRET_KEY_LABEL).context("Malformed secret key")?;
    let bytes: [u8; 32] = armor
        .data
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Secret key must be 32 bytes, got {}", armor.data.len()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Sign `bundle` and write the detached signature (default: `<bundle>.sig`)
pub fn sign_bundle(bundle: &Path, secret_key: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let signing_key = load_secret_key(secret_key)?;
    let data = fs::read(bundle).with_context(|| format!("Failed to read {}", bundle.display()))?;
    let signature = signing_key.sign(&data);

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let mut path = bundle.as_os_str().to_owned();
            path.push(".sig");
            PathBuf::from(path)
        }
    };

    let armor = signature_armor(&signature, &signing_key.verifying_key());
    fs::write(&output, armor.render())
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(output)
}
