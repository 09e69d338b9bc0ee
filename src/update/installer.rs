use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::ApplyError;

const ATTEMPT_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const PARTIAL_SUFFIX: &str = ".update-partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleFormat {
    Zip,
    TarGz,
}

/// Files touched while applying a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupManifest {
    /// (path relative to the app dir, backup copy)
    pub backed_up: Vec<(PathBuf, PathBuf)>,
    /// Relative paths that did not exist before the update
    pub created: Vec<PathBuf>,
}

impl BackupManifest {
    pub fn len(&self) -> usize {
        self.backed_up.len() + self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract `bundle_path` over `target_dir`, copying every file it replaces
/// into `backup_dir` first.
///
/// Entries are handled one at a time: backup, then overwrite. If this fails
/// part-way, every file touched so far has a backup and every later file is
/// still the original. Backups are never removed here.
pub fn apply_bundle(
    bundle_path: &Path,
    target_dir: &Path,
    backup_dir: &Path,
) -> Result<BackupManifest, ApplyError> {
    let mut manifest = BackupManifest::default();

    match detect_format(bundle_path)? {
        BundleFormat::Zip => apply_zip(bundle_path, target_dir, backup_dir, &mut manifest)?,
        BundleFormat::TarGz => apply_tar_gz(bundle_path, target_dir, backup_dir, &mut manifest)?,
    }

    info!(
        replaced = manifest.backed_up.len(),
        created = manifest.created.len(),
        "bundle applied"
    );
    Ok(manifest)
}

fn detect_format(bundle_path: &Path) -> Result<BundleFormat, ApplyError> {
    let mut file = File::open(bundle_path).map_err(ApplyError::Open)?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..]).map_err(ApplyError::Open)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled >= 4 && magic == ZIP_MAGIC {
        Ok(BundleFormat::Zip)
    } else if filled >= 2 && magic[..2] == GZIP_MAGIC {
        Ok(BundleFormat::TarGz)
    } else {
        Err(ApplyError::UnsupportedFormat)
    }
}

fn apply_zip(
    bundle_path: &Path,
    target_dir: &Path,
    backup_dir: &Path,
    manifest: &mut BackupManifest,
) -> Result<(), ApplyError> {
    let file = File::open(bundle_path).map_err(ApplyError::Open)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = safe_relative_path(entry.name())?;

        if entry.is_dir() {
            create_dir(&target_dir.join(&rel))?;
            continue;
        }

        let mode = entry.unix_mode();
        install_entry(&rel, &mut entry, mode, target_dir, backup_dir, manifest)?;
    }

    Ok(())
}

fn apply_tar_gz(
    bundle_path: &Path,
    target_dir: &Path,
    backup_dir: &Path,
    manifest: &mut BackupManifest,
) -> Result<(), ApplyError> {
    use flate2::read::GzDecoder;

    let file = File::open(bundle_path).map_err(ApplyError::Open)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries().map_err(ApplyError::Tar)? {
        let mut entry = entry.map_err(ApplyError::Tar)?;
        let name = entry
            .path()
            .map_err(ApplyError::Tar)?
            .to_string_lossy()
            .into_owned();
        let rel = safe_relative_path(&name)?;
        let kind = entry.header().entry_type();

        if kind.is_dir() {
            create_dir(&target_dir.join(&rel))?;
        } else if kind.is_file() {
            let mode = entry.header().mode().ok();
            install_entry(&rel, &mut entry, mode, target_dir, backup_dir, manifest)?;
        } else {
            warn!(entry = %name, "skipping unsupported tar entry");
        }
    }

    Ok(())
}

/// Reduce an archive entry name to a path that stays inside the target dir
fn safe_relative_path(name: &str) -> Result<PathBuf, ApplyError> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ApplyError::UnsafeEntry(name.to_string()))
            }
        }
    }
    Ok(rel)
}

fn create_dir(path: &Path) -> Result<(), ApplyError> {
    fs::create_dir_all(path).map_err(|source| ApplyError::Extract {
        path: path.to_path_buf(),
        source,
    })
}

fn install_entry(
    rel: &Path,
    reader: &mut dyn Read,
    mode: Option<u32>,
    target_dir: &Path,
    backup_dir: &Path,
    manifest: &mut BackupManifest,
) -> Result<(), ApplyError> {
    if rel.as_os_str().is_empty() {
        return Err(ApplyError::UnsafeEntry(rel.display().to_string()));
    }

    let dest = target_dir.join(rel);

    // A repeated entry must not back up what an earlier entry just wrote.
    let seen = manifest.backed_up.iter().any(|(path, _)| path == rel)
        || manifest.created.iter().any(|path| path == rel);

    if seen {
        warn!(file = %rel.display(), "bundle repeats entry; keeping first backup");
    } else if dest.is_file() {
        let backup_path = backup_dir.join(rel);
        copy_preserving(&dest, &backup_path).map_err(|source| ApplyError::Backup {
            path: dest.clone(),
            source,
        })?;
        debug!(file = %rel.display(), backup = %backup_path.display(), "backed up");
        manifest.backed_up.push((rel.to_path_buf(), backup_path));
    } else {
        manifest.created.push(rel.to_path_buf());
    }

    write_replacing(&dest, reader, mode).map_err(|source| ApplyError::Extract {
        path: dest.clone(),
        source,
    })?;
    debug!(file = %rel.display(), "extracted");
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}

/// Write into a sibling temp file, then rename it over `dest`
fn write_replacing(dest: &Path, reader: &mut dyn Read, mode: Option<u32>) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = partial_path(dest);
    let result = (|| {
        let mut out = File::create(&partial)?;
        io::copy(reader, &mut out)?;
        out.flush()?;
        out.sync_all()?;
        drop(out);
        set_mode(&partial, mode)?;
        fs::rename(&partial, dest)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

/// Copy `src` to `dst` keeping permissions and modification time
fn copy_preserving(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    let modified = fs::metadata(src)?.modified()?;
    File::options().write(true).open(dst)?.set_modified(modified)?;
    Ok(())
}

/// Fresh backup folder for one update attempt under `backup_root`.
///
/// Names are UTC timestamps so they sort oldest first. The folder is not
/// created here; `apply_bundle` creates it once something needs backing up.
pub fn attempt_backup_dir(backup_root: &Path, started: DateTime<Utc>) -> PathBuf {
    let stamp = started.format(ATTEMPT_FORMAT).to_string();
    let mut dir = backup_root.join(&stamp);
    let mut n = 1;
    while dir.exists() {
        dir = backup_root.join(format!("{}-{}", stamp, n));
        n += 1;
    }
    dir
}

/// Attempt folders under `backup_root`, oldest first
pub fn backup_attempts(backup_root: &Path) -> Result<Vec<PathBuf>, ApplyError> {
    if !backup_root.is_dir() {
        return Ok(Vec::new());
    }

    let read_err = |source| ApplyError::Backup {
        path: backup_root.to_path_buf(),
        source,
    };
    let mut attempts = Vec::new();
    for entry in fs::read_dir(backup_root).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        if entry.file_type().map_err(read_err)?.is_dir() {
            attempts.push(entry.path());
        }
    }
    attempts.sort();
    Ok(attempts)
}

/// Most recent attempt folder, or `NoBackup` if there is none
pub fn latest_backup(backup_root: &Path) -> Result<PathBuf, ApplyError> {
    backup_attempts(backup_root)?
        .pop()
        .ok_or_else(|| ApplyError::NoBackup(backup_root.to_path_buf()))
}

/// Copy everything under `backup_dir` back over `target_dir`.
/// Returns the number of files restored.
pub fn restore_backup(backup_dir: &Path, target_dir: &Path) -> Result<usize, ApplyError> {
    if !backup_dir.is_dir() {
        return Err(ApplyError::NoBackup(backup_dir.to_path_buf()));
    }

    let mut restored = 0;
    for entry in WalkDir::new(backup_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ApplyError::Backup {
            path: e.path().unwrap_or(backup_dir).to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = match entry.path().strip_prefix(backup_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let dest = target_dir.join(rel);
        let mut source = File::open(entry.path()).map_err(|source| ApplyError::Backup {
            path: entry.path().to_path_buf(),
            source,
        })?;
        write_replacing(&dest, &mut source, None).map_err(|source| ApplyError::Extract {
            path: dest.clone(),
            source,
        })?;
        info!(file = %rel.display(), "restored from backup");
        restored += 1;
    }

    Ok(restored)
}
