use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::download::{self, CancelToken, Progress};
use super::error::{DownloadError, MetadataFetchError, TransportError};
use super::installer::{self, BackupManifest};
use super::metadata;
use super::signature;
use super::transport::{HttpClient, ReqwestClient};
use super::version;
use super::AppLayout;
use crate::config::{Config, Settings};

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Periodic,
}

/// Step at which a visible failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Verify,
    Apply,
    Worker,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Verify => "signature verification",
            Stage::Apply => "install",
            Stage::Worker => "update worker",
        };
        f.write_str(name)
    }
}

/// Terminal result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Updated {
        version: String,
        manifest: BackupManifest,
    },
    UpToDate,
    Declined,
    /// Periodic check while automatic updates are switched off
    Skipped,
    /// Update server unreachable or descriptor unusable; never shown to the user
    CheckFailed {
        reason: String,
    },
    Failed {
        stage: Stage,
        reason: String,
    },
    Cancelled,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    CheckingVersion,
    AwaitingConsent,
    Downloading,
    Verifying,
    Applying,
    Done(Outcome),
}

/// Asks the user whether to install, given the changelog
pub trait ConsentPrompt: Send + Sync {
    fn confirm(&self, changelog: &str) -> bool;
}

impl<F> ConsentPrompt for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, changelog: &str) -> bool {
        self(changelog)
    }
}

/// Receives the final, user-visible result of a run
pub trait Notifier: Send + Sync {
    fn notify(&self, success: bool, message: &str);
}

impl<F> Notifier for F
where
    F: Fn(bool, &str) + Send + Sync,
{
    fn notify(&self, success: bool, message: &str) {
        self(success, message)
    }
}

/// State changes and download progress, kept apart from the result
pub trait Observer: Send {
    fn on_state(&mut self, _state: &PipelineState) {}
    fn on_progress(&mut self, _progress: Progress) {}
}

impl Observer for () {}

/// Collaborators for a single run
pub struct Hooks<'a> {
    pub consent: &'a dyn ConsentPrompt,
    pub notifier: &'a dyn Notifier,
    pub observer: &'a mut dyn Observer,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub version_url: String,
    pub bundle_url: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub metadata: Duration,
    pub download: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(10),
            download: Duration::from_secs(600),
        }
    }
}

/// Fetch → compare → consent → download → verify → apply, once.
pub struct UpdatePipeline {
    http: Box<dyn HttpClient>,
    layout: AppLayout,
    endpoints: Endpoints,
    current_version: String,
    timeouts: Timeouts,
    settings: Box<dyn Settings>,
}

impl UpdatePipeline {
    pub fn new(
        http: Box<dyn HttpClient>,
        layout: AppLayout,
        endpoints: Endpoints,
        current_version: impl Into<String>,
    ) -> Self {
        Self {
            http,
            layout,
            endpoints,
            current_version: current_version.into(),
            timeouts: Timeouts::default(),
            settings: Box::new(Config::default()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let http = ReqwestClient::new(Duration::from_secs(config.connect_timeout_secs))?;
        let endpoints = Endpoints {
            version_url: config.version_url.clone(),
            bundle_url: config.bundle_url.clone(),
        };
        Ok(Self::new(
            Box::new(http),
            AppLayout::new(config.app_dir()),
            endpoints,
            config.current_version(),
        )
        .with_timeouts(Timeouts {
            metadata: Duration::from_secs(config.metadata_timeout_secs),
            download: Duration::from_secs(config.download_timeout_secs),
        })
        .with_settings(Box::new(config.clone())))
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_settings(mut self, settings: Box<dyn Settings>) -> Self {
        self.settings = settings;
        self
    }

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Only fetch and compare. `Ok(None)` when the remote is not newer.
    pub fn check(&self) -> Result<Option<metadata::ReleaseDescriptor>, MetadataFetchError> {
        let release = metadata::fetch_latest(
            self.http.as_ref(),
            &self.endpoints.version_url,
            self.timeouts.metadata,
        )?;
        if self.remote_is_newer(&release.version) {
            Ok(Some(release))
        } else {
            Ok(None)
        }
    }

    /// Run the whole cycle. Never panics on I/O or network failure; every
    /// error ends up in the returned [`Outcome`].
    pub fn run(&self, trigger: Trigger, hooks: &mut Hooks<'_>) -> Outcome {
        let temp = TempArtifacts::new(&self.layout);
        let outcome = self.drive(trigger, hooks);
        drop(temp);

        debug!(?outcome, "update run finished");
        hooks.observer.on_state(&PipelineState::Done(outcome.clone()));
        self.notify(trigger, &outcome, hooks.notifier);
        outcome
    }

    fn enter(&self, hooks: &mut Hooks<'_>, state: PipelineState) {
        debug!(?state, "update pipeline transition");
        hooks.observer.on_state(&state);
    }

    fn remote_is_newer(&self, remote: &str) -> bool {
        match version::is_newer(remote, &self.current_version) {
            Ok(newer) => newer,
            Err(e) => {
                warn!("{}; treating remote as not newer", e);
                false
            }
        }
    }

    fn drive(&self, trigger: Trigger, hooks: &mut Hooks<'_>) -> Outcome {
        if trigger == Trigger::Periodic && !self.settings.get_bool("auto_update") {
            debug!("automatic updates disabled; skipping periodic check");
            return Outcome::Skipped;
        }

        self.enter(hooks, PipelineState::CheckingVersion);
        let release = match metadata::fetch_latest(
            self.http.as_ref(),
            &self.endpoints.version_url,
            self.timeouts.metadata,
        ) {
            Ok(release) => release,
            Err(e) => {
                warn!("update check failed: {}", e);
                return Outcome::CheckFailed {
                    reason: e.to_string(),
                };
            }
        };

        if !self.remote_is_newer(&release.version) {
            info!(
                remote = %release.version,
                local = %self.current_version,
                "no newer version available"
            );
            return Outcome::UpToDate;
        }

        self.enter(hooks, PipelineState::AwaitingConsent);
        if !hooks.consent.confirm(&release.changelog) {
            info!(version = %release.version, "update declined");
            return Outcome::Declined;
        }

        self.enter(hooks, PipelineState::Downloading);
        let artifact = {
            let observer = &mut *hooks.observer;
            let mut on_progress = |p: Progress| observer.on_progress(p);
            download::download_artifact(
                self.http.as_ref(),
                &self.endpoints.bundle_url,
                &self.layout,
                self.timeouts.download,
                hooks.cancel,
                &mut on_progress,
            )
        };
        let artifact = match artifact {
            Ok(artifact) => artifact,
            Err(DownloadError::Cancelled) => return Outcome::Cancelled,
            Err(e) => {
                error!("update download failed: {}", e);
                return Outcome::Failed {
                    stage: Stage::Download,
                    reason: e.to_string(),
                };
            }
        };
        if hooks.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        self.enter(hooks, PipelineState::Verifying);
        let verification = signature::verify(
            &artifact.bundle_path,
            &artifact.signature_path,
            &self.layout.public_key(),
        );
        if !verification.valid {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature rejected".to_string());
            error!("update rejected: {}", reason);
            return Outcome::Failed {
                stage: Stage::Verify,
                reason,
            };
        }

        self.enter(hooks, PipelineState::Applying);
        let backup_dir = installer::attempt_backup_dir(&self.layout.backup_dir(), Utc::now());
        match installer::apply_bundle(&artifact.bundle_path, self.layout.app_dir(), &backup_dir) {
            Ok(manifest) => {
                info!(version = %release.version, files = manifest.len(), "update installed");
                Outcome::Updated {
                    version: release.version,
                    manifest,
                }
            }
            Err(e) => {
                error!("update install failed: {}", e);
                Outcome::Failed {
                    stage: Stage::Apply,
                    reason: format!(
                        "{}. Replaced files were saved to {}",
                        e,
                        backup_dir.display()
                    ),
                }
            }
        }
    }

    fn notify(&self, trigger: Trigger, outcome: &Outcome, notifier: &dyn Notifier) {
        match outcome {
            Outcome::Updated { version, .. } => notifier.notify(
                true,
                &format!("Updated to version {}. Restart the application to finish.", version),
            ),
            Outcome::Failed { stage, reason } => {
                notifier.notify(false, &format!("Update failed during {}: {}", stage, reason))
            }
            Outcome::Cancelled => notifier.notify(false, "Update cancelled"),
            Outcome::UpToDate if trigger == Trigger::Manual => notifier.notify(
                true,
                &format!("Already running the latest version ({})", self.current_version),
            ),
            _ => {}
        }
    }
}

/// Removes the downloaded bundle and signature when dropped
struct TempArtifacts {
    paths: [PathBuf; 2],
}

impl TempArtifacts {
    fn new(layout: &AppLayout) -> Self {
        Self {
            paths: [layout.temp_bundle(), layout.temp_signature()],
        }
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed temporary update file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to remove temporary file: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::testing::{
        build_zip_bytes, install_public_key, pipeline_for, sign_bytes, test_signing_key, FakeHttp,
        Recorder, BUNDLE_URL, VERSION_URL,
    };
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    type Notes = Arc<Mutex<Vec<(bool, String)>>>;

    fn notes_sink(notes: &Notes) -> impl Notifier {
        let notes = Arc::clone(notes);
        move |ok: bool, msg: &str| notes.lock().unwrap().push((ok, msg.to_string()))
    }

    fn run(pipeline: &UpdatePipeline, trigger: Trigger, accept: bool) -> (Outcome, Recorder, Notes) {
        let notes: Notes = Arc::default();
        let notifier = notes_sink(&notes);
        let consent = move |_: &str| accept;
        let mut recorder = Recorder::default();
        let cancel = CancelToken::new();
        let mut hooks = Hooks {
            consent: &consent,
            notifier: &notifier,
            observer: &mut recorder,
            cancel: &cancel,
        };
        let outcome = pipeline.run(trigger, &mut hooks);
        (outcome, recorder, notes)
    }

    fn descriptor(version: &str) -> Vec<u8> {
        format!(r#"{{"version": "{}", "changelog": "Better Arabic OCR"}}"#, version).into_bytes()
    }

    fn no_temp_files(layout: &AppLayout) -> bool {
        !layout.temp_bundle().exists() && !layout.temp_signature().exists()
    }

    #[test]
    fn test_declined_update_is_noop() {
        let dir = tempdir().unwrap();
        let http = FakeHttp::new().route(VERSION_URL, 200, descriptor("1.2.0"));
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");

        let (outcome, recorder, notes) = run(&pipeline, Trigger::Manual, false);

        assert_eq!(outcome, Outcome::Declined);
        assert!(recorder.states.contains(&PipelineState::AwaitingConsent));
        assert!(!recorder.states.contains(&PipelineState::Downloading));
        assert_eq!(recorder.states.last(), Some(&PipelineState::Done(Outcome::Declined)));
        assert!(notes.lock().unwrap().is_empty());
        assert!(no_temp_files(pipeline.layout()));
    }

    #[test]
    fn test_full_update() {
        let dir = tempdir().unwrap();
        let key = test_signing_key();
        install_public_key(dir.path(), &key, None);
        fs::write(dir.path().join("config.json"), r#"{"engine": "Tesseract"}"#).unwrap();

        let bundle = build_zip_bytes(&[
            ("readme.txt", "OCR 1.2.0"),
            ("config.json", r#"{"engine": "EasyOCR"}"#),
        ]);
        let http = FakeHttp::new()
            .route(VERSION_URL, 200, descriptor("1.2.0"))
            .route(BUNDLE_URL, 200, bundle.clone())
            .route(&format!("{}.sig", BUNDLE_URL), 200, sign_bytes(&key, &bundle).into_bytes());
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");

        let (outcome, recorder, notes) = run(&pipeline, Trigger::Manual, true);

        let manifest = match &outcome {
            Outcome::Updated { version, manifest } if version == "1.2.0" => manifest,
            other => panic!("unexpected outcome {:?}", other),
        };
        let attempt = installer::latest_backup(&dir.path().join("backup_before_update")).unwrap();
        assert_eq!(
            manifest.backed_up,
            vec![(PathBuf::from("config.json"), attempt.join("config.json"))]
        );
        assert_eq!(
            fs::read_to_string(attempt.join("config.json")).unwrap(),
            r#"{"engine": "Tesseract"}"#
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("config.json")).unwrap(),
            r#"{"engine": "EasyOCR"}"#
        );
        assert_eq!(fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "OCR 1.2.0");
        assert!(no_temp_files(pipeline.layout()));

        assert_eq!(
            &recorder.states[..6],
            &[
                PipelineState::CheckingVersion,
                PipelineState::AwaitingConsent,
                PipelineState::Downloading,
                PipelineState::Verifying,
                PipelineState::Applying,
                PipelineState::Done(outcome.clone()),
            ]
        );
        assert_eq!(recorder.progress.last(), Some(&Progress::Percent(100)));
        let notes = notes.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].0);
    }

    #[test]
    fn test_bad_signature_leaves_app_untouched() {
        let dir = tempdir().unwrap();
        let key = test_signing_key();
        install_public_key(dir.path(), &key, None);
        fs::write(dir.path().join("config.json"), "original").unwrap();

        let bundle = build_zip_bytes(&[("config.json", "tampered")]);
        let signed_for = build_zip_bytes(&[("config.json", "genuine")]);
        let http = FakeHttp::new()
            .route(VERSION_URL, 200, descriptor("1.2.0"))
            .route(BUNDLE_URL, 200, bundle)
            .route(&format!("{}.sig", BUNDLE_URL), 200, sign_bytes(&key, &signed_for).into_bytes());
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");

        let (outcome, recorder, notes) = run(&pipeline, Trigger::Manual, true);

        assert_eq!(
            outcome,
            Outcome::Failed {
                stage: Stage::Verify,
                reason: "signature does not match bundle".to_string(),
            }
        );
        assert!(!recorder.states.contains(&PipelineState::Applying));
        assert_eq!(fs::read_to_string(dir.path().join("config.json")).unwrap(), "original");
        assert!(!dir.path().join("backup_before_update").exists());
        assert!(no_temp_files(pipeline.layout()));
        let notes = notes.lock().unwrap();
        assert!(!notes[0].0);
        assert!(notes[0].1.contains("signature does not match bundle"));
    }

    #[test]
    fn test_missing_public_key_reported() {
        let dir = tempdir().unwrap();
        let key = test_signing_key();
        let bundle = build_zip_bytes(&[("a.txt", "a")]);
        let http = FakeHttp::new()
            .route(VERSION_URL, 200, descriptor("1.2.0"))
            .route(BUNDLE_URL, 200, bundle.clone())
            .route(&format!("{}.sig", BUNDLE_URL), 200, sign_bytes(&key, &bundle).into_bytes());
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");

        let (outcome, _, notes) = run(&pipeline, Trigger::Manual, true);

        assert_eq!(
            outcome,
            Outcome::Failed {
                stage: Stage::Verify,
                reason: "missing public key".to_string(),
            }
        );
        assert!(!dir.path().join("a.txt").exists());
        assert!(notes.lock().unwrap()[0].1.contains("missing public key"));
    }

    #[test]
    fn test_unreachable_server_is_silent() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_for(dir.path(), FakeHttp::new(), "1.1.0");

        let (outcome, _, notes) = run(&pipeline, Trigger::Manual, true);

        assert!(matches!(
            outcome,
            Outcome::CheckFailed { ref reason } if reason.contains("connection refused")
        ));
        assert!(notes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_up_to_date_and_bad_versions() {
        let dir = tempdir().unwrap();
        let http = FakeHttp::new().route(VERSION_URL, 200, descriptor("1.1.0"));
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");
        let (outcome, _, notes) = run(&pipeline, Trigger::Manual, true);
        assert_eq!(outcome, Outcome::UpToDate);
        assert_eq!(notes.lock().unwrap().len(), 1);

        let (outcome, _, notes) = run(&pipeline, Trigger::Periodic, true);
        assert_eq!(outcome, Outcome::UpToDate);
        assert!(notes.lock().unwrap().is_empty());

        let http = FakeHttp::new().route(VERSION_URL, 200, descriptor("latest"));
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");
        let (outcome, recorder, _) = run(&pipeline, Trigger::Manual, true);
        assert_eq!(outcome, Outcome::UpToDate);
        assert!(!recorder.states.contains(&PipelineState::AwaitingConsent));
    }

    #[test]
    fn test_download_failure_cleans_up() {
        let dir = tempdir().unwrap();
        let http = FakeHttp::new()
            .route(VERSION_URL, 200, descriptor("2.0.0"))
            .route(BUNDLE_URL, 200, b"partial bundle".to_vec())
            .route(&format!("{}.sig", BUNDLE_URL), 404, Vec::new());
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");

        let (outcome, _, _) = run(&pipeline, Trigger::Manual, true);

        assert!(matches!(outcome, Outcome::Failed { stage: Stage::Download, .. }));
        assert!(no_temp_files(pipeline.layout()));
    }

    #[test]
    fn test_cancel_during_download() {
        struct CancelOnProgress(CancelToken);
        impl Observer for CancelOnProgress {
            fn on_progress(&mut self, _progress: Progress) {
                self.0.cancel();
            }
        }

        let dir = tempdir().unwrap();
        let http = FakeHttp::new()
            .route(VERSION_URL, 200, descriptor("2.0.0"))
            .route(BUNDLE_URL, 200, vec![0u8; 64 * 1024]);
        let pipeline = pipeline_for(dir.path(), http, "1.1.0");

        let cancel = CancelToken::new();
        let mut observer = CancelOnProgress(cancel.clone());
        let consent = |_: &str| true;
        let notes: Notes = Arc::default();
        let notifier = notes_sink(&notes);
        let mut hooks = Hooks {
            consent: &consent,
            notifier: &notifier,
            observer: &mut observer,
            cancel: &cancel,
        };

        assert_eq!(pipeline.run(Trigger::Manual, &mut hooks), Outcome::Cancelled);
        assert!(no_temp_files(pipeline.layout()));
        assert_eq!(notes.lock().unwrap()[0], (false, "Update cancelled".to_string()));
    }

    #[test]
    fn test_periodic_respects_auto_update_setting() {
        let dir = tempdir().unwrap();
        let http = FakeHttp::new().route(VERSION_URL, 200, descriptor("9.0.0"));
        let config = Config {
            auto_update: false,
            ..Config::default()
        };
        let pipeline = pipeline_for(dir.path(), http, "1.1.0").with_settings(Box::new(config));

        let (outcome, recorder, _) = run(&pipeline, Trigger::Periodic, true);

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(recorder.states, vec![PipelineState::Done(Outcome::Skipped)]);
    }
}
