//! Deployment - Main entry point
//!
//! Synchronizes local directories to FTP, SFTP or local targets as described
//! by a TOML configuration file.

mod config;
mod shutdown;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use config::{Config, SectionConfig};
use deploy_engine::deployer::{DeployOutcome, Deployer, ScanCache};
use deploy_engine::filter::CommandFilter;
use deploy_engine::manifest::deployment_file_key;
use deploy_engine::transfer::{format_bytes, format_duration};
use deploy_engine::transport::{self, RetryTransport};
use deploy_engine::utils::logger::{self, Logger, TracingLogger};
use deploy_engine::DeployError;
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "FILE")]
    config: PathBuf,

    /// Show what would change without touching the server
    #[arg(short, long)]
    test: bool,

    /// Deploy only this section
    #[arg(long, value_name = "NAME")]
    section: Option<String>,

    /// Only write the local deployment file
    #[arg(long)]
    generate: bool,

    /// Do not draw progress lines
    #[arg(long)]
    no_progress: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .canonicalize()
        .with_context(|| format!("Missing config file {}", args.config.display()))?;
    let config = Config::from_file(&config_path)?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.global.log_level);
    logger::init(
        log_level,
        Some(&config.global.log_file(&config_path)),
        config.global.colors(),
    )?;

    let _lock = lock(&config_path)?;

    let task = tokio::task::spawn_blocking(move || run(&args, &config, &config_path));

    tokio::select! {
        result = task => result.context("Deployment task panicked")?,
        signal = shutdown::wait_for_signal() => {
            warn!(
                "Received {}, terminating. The remote .running file may be left behind.",
                signal
            );
            std::process::exit(shutdown::INTERRUPTED_EXIT_CODE);
        }
    }
}

/// Hold an exclusive lock on the config file so one deployment runs at a time.
fn lock(config_path: &Path) -> Result<Flock<File>> {
    let file = File::open(config_path)?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| anyhow!("Cannot lock {}: another deployment is in progress ({errno})", config_path.display()))
}

fn run(args: &Args, config: &Config, config_path: &Path) -> Result<()> {
    let started = Instant::now();
    info!("Started at {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!("Config file is {}", config_path.display());

    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new(config.global.progress && !args.no_progress));
    let mut cache = ScanCache::new();

    for (name, section) in config.select(args.section.as_deref())? {
        if !name.is_empty() {
            info!("Deploying section [{}]", name);
        }

        let mut deployer = create_deployer(section, config, config_dir, args.test, &logger)?;
        if args.generate {
            generate(&deployer)?;
            continue;
        }
        if deployer.options().test_mode {
            info!("Test mode");
        }

        let report = deployer
            .deploy(config.global.cache_scan.then_some(&mut cache))
            .map_err(describe)?;
        match report.outcome {
            DeployOutcome::Deployed => info!(
                "Uploaded {} files ({}), deleted {}, purged {}",
                report.uploaded.len(),
                format_bytes(report.bytes),
                report.deleted.len(),
                report.purged.len()
            ),
            DeployOutcome::TestRun => info!(
                "Would upload {} and delete {} entries",
                report.uploaded.len(),
                report.deleted.len()
            ),
            DeployOutcome::AlreadySynchronized => {}
        }
    }

    info!(
        "Finished at {} (in {})",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        format_duration(started.elapsed().as_secs())
    );
    Ok(())
}

fn create_deployer(
    section: &SectionConfig,
    config: &Config,
    config_dir: &Path,
    test_mode: bool,
    logger: &Arc<dyn Logger>,
) -> Result<Deployer> {
    let transport = transport::from_url(&section.remote, &section.transport_options()?)?;
    let transport = RetryTransport::new(transport, Arc::clone(logger));
    let options = section.deploy_options(&config.global, test_mode)?;

    let mut deployer = Deployer::new(
        Box::new(transport),
        section.local_dir(config_dir),
        Arc::clone(logger),
        options,
    )?;
    for (extension, command) in &section.filters {
        deployer.add_filter(extension, Arc::new(CommandFilter::new(command.clone())), true);
    }
    Ok(deployer)
}

/// Write the manifest of the local tree into the local directory.
fn generate(deployer: &Deployer) -> Result<()> {
    let mut manifest = deployer.collect_paths()?;
    let name = &deployer.options().deployment_file;
    manifest.remove(&deployment_file_key(name));

    let dest = deployer.local_root().join(name);
    deployer.write_deployment_file(&manifest, &dest)?;
    info!("Saved {} ({} entries)", dest.display(), manifest.len());
    Ok(())
}

fn describe(error: DeployError) -> anyhow::Error {
    if let DeployError::Transport(e) = &error {
        error!("Error: {} in {}", e, e.location());
    }
    error.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["deployment", "site.toml", "-t", "--section", "production"]).unwrap();
        assert_eq!(args.config, PathBuf::from("site.toml"));
        assert!(args.test);
        assert_eq!(args.section.as_deref(), Some("production"));
        assert!(Args::try_parse_from(["deployment"]).is_err());
    }

    #[test]
    fn test_second_lock_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.toml");
        fs::write(&path, "remote = \"file:///tmp\"").unwrap();

        let _held = lock(&path).unwrap();
        let error = lock(&path).unwrap_err();
        assert!(error.to_string().contains("another deployment is in progress"));
    }

    #[test]
    fn test_generate_writes_manifest() {
        let local = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        fs::write(local.path().join("index.html"), "hi").unwrap();
        let config = Config::parse(&format!(
            "remote = \"file:///nonexistent\"\nlocal = \"{}\"\ntemp_dir = \"{}\"",
            local.path().display(),
            config_dir.path().display()
        ))
        .unwrap();
        let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new(false));

        let deployer = create_deployer(&config.sections[0].1, &config, config_dir.path(), false, &logger).unwrap();
        generate(&deployer).unwrap();

        let written = fs::read(local.path().join(".htdeployment")).unwrap();
        let manifest = deploy_engine::manifest::decode(&written).unwrap();
        assert!(manifest.contains("/index.html"));
        assert_eq!(manifest.len(), 1);
    }
}
