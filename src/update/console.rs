use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use super::download::Progress;
use super::pipeline::{Observer, PipelineState};

/// Prints stage messages and drives a progress bar during download
#[derive(Default)]
pub struct ConsoleObserver {
    bar: Option<ProgressBar>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_bar(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn bar_for(&mut self, progress: Progress) -> &ProgressBar {
        self.bar.get_or_insert_with(|| match progress {
            Progress::Percent(_) => {
                let bar = ProgressBar::new(100);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}%")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                bar
            }
            Progress::Bytes(_) => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} {bytes} received")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        })
    }
}

impl Observer for ConsoleObserver {
    fn on_state(&mut self, state: &PipelineState) {
        match state {
            PipelineState::Downloading => println!("{}", "Downloading update...".cyan()),
            PipelineState::Verifying => {
                self.finish_bar();
                println!("{}", "Verifying signature...".cyan());
            }
            PipelineState::Applying => println!("{}", "Installing...".cyan()),
            PipelineState::Done(_) => self.finish_bar(),
            _ => {}
        }
    }

    fn on_progress(&mut self, progress: Progress) {
        let position = match progress {
            Progress::Percent(p) => u64::from(p),
            Progress::Bytes(n) => n,
        };
        self.bar_for(progress).set_position(position);
    }
}

/// Show the changelog and ask for a yes/no answer on stdin.
/// Anything but an explicit yes, including a read error, declines.
pub fn prompt_consent(changelog: &str) -> bool {
    println!("{} New version available", "↑".yellow());
    if !changelog.trim().is_empty() {
        println!("\n{}", "Release notes:".cyan());
        println!("{}\n", changelog.dimmed());
    }

    print!("{} Install this update? [y/N]: ", "?".yellow().bold());
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    match io::stdin().read_line(&mut input) {
        Ok(_) => matches!(input.trim().to_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

/// Print an outcome message the way the rest of the CLI does
pub fn print_notification(success: bool, message: &str) {
    if success {
        println!("{} {}", "✓".green(), message);
    } else {
        println!("{} {}", "✗".red(), message.red());
    }
}

/// Append one line to the local report log
pub fn append_report(path: &Path, success: bool, message: &str) {
    let line = format!(
        "{} [{}] {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        if success { "OK" } else { "FAILED" },
        message
    );
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), "failed to write update report: {}", e);
    }
}
