//! CLI error type and exit codes.

use std::fmt;

use beaconfix::config::ConfigError;
use beaconfix::logging::LoggingError;
use beaconfix::pipeline::PipelineError;
use beaconfix::trilateration::DegenerateGeometryError;

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Bad arguments or configuration.
    Config(String),
    /// Logging could not be set up.
    Logging(LoggingError),
    /// The async runtime could not be created.
    Runtime(std::io::Error),
    /// The service failed to start or stopped with an error.
    Pipeline(PipelineError),
    /// A one-shot solve had no unique answer.
    Solve(DegenerateGeometryError),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Logging(_) | CliError::Runtime(_) => 1,
            CliError::Pipeline(_) => 3,
            CliError::Solve(_) => 4,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "{}", msg),
            CliError::Logging(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::Pipeline(e) => write!(f, "{}", e),
            CliError::Solve(e) => write!(f, "No position: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(_) => None,
            CliError::Logging(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Pipeline(e) => Some(e),
            CliError::Solve(e) => Some(e),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<PipelineError> for CliError {
    fn from(e: PipelineError) -> Self {
        CliError::Pipeline(e)
    }
}

impl From<DegenerateGeometryError> for CliError {
    fn from(e: DegenerateGeometryError) -> Self {
        CliError::Solve(e)
    }
}
