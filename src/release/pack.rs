use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid exclude pattern '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// Zip entry name: '/'-separated, no leading './'
fn archive_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Build a zip bundle from files and directories.
///
/// A file is stored under its own name; a directory contributes its
/// contents relative to itself. Returns the number of files written.
pub fn pack_bundle(inputs: &[PathBuf], excludes: &[String], output: &Path) -> Result<usize> {
    let exclude = build_excludes(excludes)?;

    for input in inputs {
        if !input.exists() {
            bail!("File not found: {}", input.display());
        }
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let output_abs = output.canonicalize()?;
    let mut writer = zip::ZipWriter::new(file);
    let base_options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut seen = HashSet::new();
    let mut count = 0;

    for input in inputs {
        let base = if input.is_dir() {
            input.as_path()
        } else {
            input.parent().unwrap_or_else(|| Path::new(""))
        };

        for entry in WalkDir::new(input).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().canonicalize().ok().as_deref() == Some(output_abs.as_path()) {
                continue;
            }

            let rel = entry.path().strip_prefix(base).unwrap_or(entry.path());
            let name = archive_name(rel);
            if exclude.is_match(&name) {
                debug!(entry = %name, "excluded from bundle");
                continue;
            }
            if !seen.insert(name.clone()) {
                bail!("Duplicate entry '{}' in bundle", name);
            }

            #[allow(unused_mut)]
            let mut options = base_options;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                options = options.unix_permissions(entry.metadata()?.permissions().mode());
            }

            writer.start_file(name.as_str(), options)?;
            let mut source = File::open(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            io::copy(&mut source, &mut writer)?;
            count += 1;
        }
    }

    writer.finish()?;

    if count == 0 {
        fs::remove_file(output).ok();
        bail!("No files selected for the bundle");
    }
    Ok(count)
}
