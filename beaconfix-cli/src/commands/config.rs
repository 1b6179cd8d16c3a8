//! Configuration management CLI commands.
//!
//! Provides `config path`, `config show`, `config init` and `config check`.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use beaconfix::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Print the effective configuration as INI
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file
    Check,
}

/// Run a config subcommand against `path`, or the default location.
pub fn run(command: ConfigCommands, path: Option<&Path>) -> Result<(), CliError> {
    let path = resolve_path(path)?;
    match command {
        ConfigCommands::Path => run_path(&path),
        ConfigCommands::Show => run_show(&path),
        ConfigCommands::Init { force } => run_init(&path, force),
        ConfigCommands::Check => run_check(&path),
    }
}

fn resolve_path(path: Option<&Path>) -> Result<PathBuf, CliError> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => config_file_path().ok_or_else(|| {
            CliError::Config(
                "Could not determine the configuration directory. Use --config.".to_string(),
            )
        }),
    }
}

fn load(path: &Path) -> Result<ConfigFile, CliError> {
    if path.exists() {
        Ok(ConfigFile::load_from(path)?)
    } else {
        Ok(ConfigFile::default())
    }
}

fn run_path(path: &Path) -> Result<(), CliError> {
    println!("{}", path.display());
    Ok(())
}

fn run_show(path: &Path) -> Result<(), CliError> {
    let config = load(path)?;
    let mut out = Vec::new();
    config
        .to_ini()
        .write_to(&mut out)
        .map_err(|e| CliError::Config(format!("Failed to render configuration: {}", e)))?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(())
}

fn run_init(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        )));
    }
    ConfigFile::default().save_to(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn run_check(path: &Path) -> Result<(), CliError> {
    let config = load(path)?;
    config.validate()?;
    println!(
        "{}: OK ({} beacons, listening on {})",
        path.display(),
        config.beacons.len(),
        config.broadcast.listen
    );
    Ok(())
}
