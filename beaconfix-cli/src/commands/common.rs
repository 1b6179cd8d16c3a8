//! Common helpers shared across CLI commands.

use std::path::PathBuf;

use beaconfix::config::ConfigFile;
use beaconfix::pipeline::PipelineConfig;
use beaconfix::service::ServiceConfig;

use crate::error::CliError;

/// Options every service-running command accepts.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Build the service configuration, letting `listen` override the file.
pub fn service_config(
    config: &ConfigFile,
    pipeline: PipelineConfig,
    listen: Option<String>,
) -> ServiceConfig {
    ServiceConfig {
        pipeline,
        broadcast: config.broadcast_config(),
        listen: listen.unwrap_or_else(|| config.broadcast.listen.clone()),
    }
}

/// Parse a comma-separated pair or triple of numbers, e.g. `2,4` or `0,0,2.5`.
pub fn parse_numbers<const N: usize>(raw: &str) -> Result<[f64; N], CliError> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(CliError::Config(format!(
            "expected {} comma-separated numbers, got '{}'",
            N, raw
        )));
    }

    let mut values = [0.0; N];
    for (slot, part) in values.iter_mut().zip(parts) {
        *slot = part
            .parse()
            .map_err(|_| CliError::Config(format!("'{}' is not a number in '{}'", part, raw)))?;
    }
    Ok(values)
}
