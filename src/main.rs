use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ocr_update::config::Config;

#[derive(Parser, Debug)]
#[command(name = "ocr-update")]
#[command(about = "Signed self-update for the OCR desktop utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Application directory to update (defaults to config, then current directory)
    #[arg(long, value_name = "PATH", global = true)]
    app_dir: Option<PathBuf>,

    /// Config file (defaults to ~/.config/ocr-update/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether a newer version is published
    Check,

    /// Download, verify and install the latest version
    Update {
        /// Install without asking for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Keep checking for updates in the background until interrupted
    Watch {
        /// Seconds between checks (defaults to check_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Copy files saved by an earlier update back into place
    Restore {
        /// Backup folder name to restore (defaults to the most recent)
        #[arg(long, value_name = "NAME")]
        from: Option<String>,

        /// List backup folders instead of restoring
        #[arg(long, conflicts_with = "from")]
        list: bool,
    },

    /// Generate a key pair for signing bundles
    Keygen {
        /// Directory for update_public_key.asc and update_secret_key.asc
        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Make the public key expire after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,
    },

    /// Build an update bundle from files and directories
    Pack {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Glob of entries to leave out (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        #[arg(short, long, default_value = "update_temp.zip")]
        output: PathBuf,
    },

    /// Write a detached signature for a bundle
    Sign {
        bundle: PathBuf,

        /// Secret key produced by `keygen`
        #[arg(long)]
        key: PathBuf,

        /// Signature path (defaults to <bundle>.sig)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.app_dir.clone() {
        config.app_dir = Some(dir);
    }

    match cli.command {
        Command::Check => run_check_command(&config),
        Command::Update { yes } => run_update_command(&config, yes),
        Command::Watch { interval } => run_watch_command(&config, interval),
        Command::Restore { from, list } => run_restore_command(&config, from.as_deref(), list),
        Command::Keygen {
            out,
            expires_in_days,
        } => ocr_update::release::create_keypair(&out, expires_in_days),
        Command::Pack {
            files,
            exclude,
            output,
        } => ocr_update::release::create_bundle(&files, &exclude, &output),
        Command::Sign {
            bundle,
            key,
            output,
        } => ocr_update::release::create_signature(&bundle, &key, output.as_deref()),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_check_command(config: &Config) -> Result<()> {
    use colored::Colorize;
    use ocr_update::update;

    let current = config.current_version();
    match update::check_for_update(config)? {
        Some(release) => {
            println!(
                "{} New version available: {} → {}",
                "↑".yellow(),
                current.dimmed(),
                release.version.green()
            );
            if !release.changelog.trim().is_empty() {
                println!("\n{}", "Release notes:".cyan());
                println!("{}\n", release.changelog.dimmed());
            }
            println!("  Run `ocr-update update` to install");
        }
        None => {
            println!(
                "{} You're running the latest version ({})",
                "✓".green(),
                current
            );
        }
    }
    Ok(())
}

fn run_update_command(config: &Config, assume_yes: bool) -> Result<()> {
    let outcome = ocr_update::update::perform_update(config, assume_yes)?;
    if outcome.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_watch_command(config: &Config, interval: Option<u64>) -> Result<()> {
    use colored::Colorize;
    use std::sync::Arc;
    use std::time::Duration;

    let secs = interval.unwrap_or(config.check_interval_secs).max(1);
    let service = Arc::new(ocr_update::update::console_service(config, false)?);
    let timer = service.spawn_periodic(Duration::from_secs(secs))?;

    println!(
        "{} Checking for updates every {}s (Ctrl-C to stop)",
        "→".yellow(),
        secs
    );
    timer.wait();
    Ok(())
}

fn run_restore_command(config: &Config, from: Option<&str>, list: bool) -> Result<()> {
    use colored::Colorize;
    use ocr_update::update;

    if list {
        let attempts = update::list_backups(config)?;
        if attempts.is_empty() {
            println!("{}", "No backups found".dimmed());
        }
        for attempt in attempts.iter().rev() {
            if let Some(name) = attempt.file_name() {
                println!("  {}", name.to_string_lossy());
            }
        }
        return Ok(());
    }

    let (source, restored) = update::restore_from_backup(config, from)?;
    println!(
        "{} Restored {} file(s) from {}",
        "✓".green(),
        restored,
        source.display().to_string().cyan()
    );
    Ok(())
}
