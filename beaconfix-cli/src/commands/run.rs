//! Run command - locate against real beacons and serve positions.

use std::sync::Arc;
use std::time::Duration;

use beaconfix::config::ConfigFile;
use beaconfix::peripheral::PeripheralAdapter;
use beaconfix::quote::{AsyncReqwestClient, HttpReferenceSource, ReferenceSource};

use super::common::{service_config, GlobalArgs};
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the run command.
pub struct RunArgs {
    pub global: GlobalArgs,
    pub listen: Option<String>,
    pub symbol: Option<String>,
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.global.config.as_deref(), args.global.log_level.as_deref())?;
    runner.log_startup("run");
    let config = runner.config();

    let mut pipeline = config.pipeline_config()?;
    if let Some(symbol) = args.symbol {
        pipeline.symbol = symbol;
    }

    println!("beaconfix v{}", beaconfix::VERSION);
    println!("================================");
    println!();
    for beacon in &config.beacons {
        println!("Beacon {:<12} at ({}, {})", beacon.name, beacon.x, beacon.y);
    }
    println!("Reference:  {} ({})", pipeline.symbol, config.reference.url);
    println!();

    let reference = reference_source(config)?;
    let adapter = runner.runtime().block_on(open_adapter())?;

    runner.run_service(service_config(config, pipeline, args.listen), adapter, reference)
}

/// HTTP listings source described by `[reference]`.
fn reference_source(config: &ConfigFile) -> Result<Arc<dyn ReferenceSource>, CliError> {
    let timeout = Duration::from_secs(config.reference.timeout_secs.max(1));
    let client = AsyncReqwestClient::with_timeout(timeout)
        .map_err(|e| CliError::Config(format!("Failed to create HTTP client: {}", e)))?;
    let source = HttpReferenceSource::new(
        client,
        config.reference.url.clone(),
        config.reference.convert.clone(),
    )
    .with_api_key_from_env(&config.reference.api_key_env);
    Ok(Arc::new(source))
}

#[cfg(feature = "bluetooth")]
async fn open_adapter() -> Result<Arc<dyn PeripheralAdapter>, CliError> {
    let adapter = beaconfix::peripheral::BtleAdapter::open()
        .await
        .map_err(|e| beaconfix::pipeline::PipelineError::Configuration(e.to_string()))?;
    Ok(Arc::new(adapter))
}

#[cfg(not(feature = "bluetooth"))]
async fn open_adapter() -> Result<Arc<dyn PeripheralAdapter>, CliError> {
    Err(CliError::Config(
        "This build has no radio support. Rebuild with `--features bluetooth`, \
         or use `beaconfix simulate`."
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_source_from_default_config() {
        let source = reference_source(&ConfigFile::default()).unwrap();
        assert!(!source.name().is_empty());
    }
}
