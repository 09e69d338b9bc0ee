pub mod console;
pub mod download;
pub mod error;
pub mod installer;
pub mod metadata;
pub mod pipeline;
pub mod signature;
pub mod transport;
pub mod version;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::config::Config;

pub use download::{CancelToken, DownloadedArtifact, Progress};
pub use error::{ApplyError, DownloadError, MetadataFetchError, UpdateError, VersionParseError};
pub use installer::BackupManifest;
pub use metadata::ReleaseDescriptor;
pub use pipeline::{Outcome, PipelineState, Stage, Trigger, UpdatePipeline};
pub use signature::VerificationResult;
pub use version::CURRENT_VERSION;
pub use worker::{UpdateService, UpdateTask};

pub const TEMP_BUNDLE_NAME: &str = "update_temp.zip";
pub const TEMP_SIGNATURE_NAME: &str = "update_temp.zip.sig";
pub const PUBLIC_KEY_NAME: &str = "update_public_key.asc";
pub const BACKUP_DIR_NAME: &str = "backup_before_update";
pub const REPORT_LOG_NAME: &str = "update_reports.log";

/// Fixed file locations inside the application directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    app_dir: PathBuf,
}

impl AppLayout {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn temp_bundle(&self) -> PathBuf {
        self.app_dir.join(TEMP_BUNDLE_NAME)
    }

    pub fn temp_signature(&self) -> PathBuf {
        self.app_dir.join(TEMP_SIGNATURE_NAME)
    }

    pub fn public_key(&self) -> PathBuf {
        self.app_dir.join(PUBLIC_KEY_NAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.app_dir.join(BACKUP_DIR_NAME)
    }

    pub fn report_log(&self) -> PathBuf {
        self.app_dir.join(REPORT_LOG_NAME)
    }
}

/// Check for updates and return release info if a newer one is published
pub fn check_for_update(config: &Config) -> Result<Option<ReleaseDescriptor>> {
    let pipeline = UpdatePipeline::from_config(config).context("Failed to create HTTP client")?;
    pipeline
        .check()
        .context("Failed to fetch release information")
}

/// Build the background service the CLI uses, printing outcomes and
/// optionally logging them to the report file.
pub fn console_service(config: &Config, assume_yes: bool) -> Result<UpdateService> {
    let pipeline = UpdatePipeline::from_config(config).context("Failed to create HTTP client")?;
    let report_log = config
        .send_reports
        .then(|| pipeline.layout().report_log());

    let consent = move |changelog: &str| assume_yes || console::prompt_consent(changelog);
    let notifier = move |success: bool, message: &str| {
        console::print_notification(success, message);
        if let Some(path) = &report_log {
            console::append_report(path, success, message);
        }
    };

    Ok(UpdateService::new(pipeline, consent, notifier))
}

/// Perform the update process
pub fn perform_update(config: &Config, assume_yes: bool) -> Result<Outcome> {
    println!("{}", "Checking for updates...".cyan());

    let service = console_service(config, assume_yes)?;
    let task = service.start(Trigger::Manual, Box::new(console::ConsoleObserver::new()))?;
    let outcome = task.wait();

    match &outcome {
        Outcome::CheckFailed { reason } => {
            println!(
                "{} Update server unavailable, skipping this check ({})",
                "!".yellow(),
                reason.dimmed()
            );
        }
        Outcome::Declined => println!("{}", "Update postponed".dimmed()),
        _ => {}
    }

    Ok(outcome)
}

/// Backup folders left by earlier update attempts, oldest first
pub fn list_backups(config: &Config) -> Result<Vec<PathBuf>> {
    let layout = AppLayout::new(config.app_dir());
    installer::backup_attempts(&layout.backup_dir()).context("Failed to list backups")
}

/// Copy the files saved by one update attempt back into the application
/// directory. Without `attempt` the most recent one is used.
///
/// Returns the attempt folder and the number of files restored.
pub fn restore_from_backup(config: &Config, attempt: Option<&str>) -> Result<(PathBuf, usize)> {
    let layout = AppLayout::new(config.app_dir());
    let backup_root = layout.backup_dir();

    let source = match attempt {
        Some(name) => {
            let mut parts = Path::new(name).components();
            match (parts.next(), parts.next()) {
                (Some(Component::Normal(_)), None) => backup_root.join(name),
                _ => bail!("Invalid backup name '{}'", name),
            }
        }
        None => installer::latest_backup(&backup_root).context("No backup to restore")?,
    };

    let restored = installer::restore_backup(&source, layout.app_dir())
        .context("Failed to restore from backup")?;
    Ok((source, restored))
}
