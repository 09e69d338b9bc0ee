pub mod keys;
pub mod pack;

use anyhow::Result;
use colored::Colorize;
use std::path::{Path, PathBuf};

pub use keys::{generate_keypair, load_secret_key, sign_bundle, KeyPairFiles};
pub use pack::pack_bundle;

/// Generate a signing key pair for publishing updates
pub fn create_keypair(out_dir: &Path, expires_in_days: Option<i64>) -> Result<()> {
    let files = generate_keypair(out_dir, expires_in_days)?;

    println!("\n{} Key pair created (id {})", "✓".green(), files.key_id.cyan());
    println!("  public: {}", files.public_key.display());
    println!("  secret: {}", files.secret_key.display());
    println!(
        "\n{} Ship the public key with the application and keep the secret key private.",
        "→".yellow()
    );

    Ok(())
}

/// Build update_temp.zip from the given files
pub fn create_bundle(inputs: &[PathBuf], excludes: &[String], output: &Path) -> Result<()> {
    println!("{}", "Packing bundle...".cyan());
    let count = pack_bundle(inputs, excludes, output)?;
    println!(
        "{} Wrote {} ({} files)",
        "✓".green(),
        output.display().to_string().green(),
        count
    );
    Ok(())
}

/// Write the detached signature for a bundle
pub fn create_signature(bundle: &Path, secret_key: &Path, output: Option<&Path>) -> Result<()> {
    let sig = sign_bundle(bundle, secret_key, output)?;
    println!("{} Signature written to {}", "✓".green(), sig.display().to_string().green());
    println!(
        "\n{} Publish it next to the bundle as <bundle-url>.sig",
        "→".yellow()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::installer::apply_bundle;
    use crate::update::signature::verify;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_published_bundle_installs() {
        let publisher = tempdir().unwrap();
        let app = tempdir().unwrap();

        let keys = generate_keypair(publisher.path(), None).unwrap();
        fs::copy(&keys.public_key, app.path().join("update_public_key.asc")).unwrap();

        let staged = publisher.path().join("staged");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("ocr_logic.py"), "v2").unwrap();
        let bundle = publisher.path().join("update_temp.zip");
        pack_bundle(&[staged], &[], &bundle).unwrap();
        let sig = sign_bundle(&bundle, &keys.secret_key, None).unwrap();

        fs::write(app.path().join("ocr_logic.py"), "v1").unwrap();
        assert!(verify(&bundle, &sig, &app.path().join("update_public_key.asc")).valid);
        apply_bundle(&bundle, app.path(), &app.path().join("backup_before_update")).unwrap();

        assert_eq!(fs::read_to_string(app.path().join("ocr_logic.py")).unwrap(), "v2");
        assert_eq!(
            fs::read_to_string(app.path().join("backup_before_update/ocr_logic.py")).unwrap(),
            "v1"
        );
    }
}
