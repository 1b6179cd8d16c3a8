//! beaconfix CLI - Command-line interface
//!
//! This binary runs the beaconfix pipeline against real or simulated beacons
//! and offers configuration and one-shot solve helpers.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::common::GlobalArgs;
use commands::config::ConfigCommands;
use commands::simulate::{DEFAULT_PROPAGATION_SPEED, DEFAULT_QUOTE};
use error::CliError;

#[derive(Parser)]
#[command(name = "beaconfix")]
#[command(about = "Beacon trilateration with live position broadcasting", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the per-user config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, e.g. debug or beaconfix=trace
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate against real beacons and broadcast positions
    Run {
        /// WebSocket listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,

        /// Reference symbol (overrides config)
        #[arg(long)]
        symbol: Option<String>,
    },

    /// Run the full pipeline against simulated beacons
    Simulate {
        /// WebSocket listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,

        /// Receiver position as x,y in meters
        #[arg(long, default_value = "2,1.5", allow_hyphen_values = true)]
        position: String,

        /// Fixed reference quote
        #[arg(long, default_value_t = DEFAULT_QUOTE)]
        quote: f64,

        /// Propagation speed used by the simulated model
        #[arg(long, default_value_t = DEFAULT_PROPAGATION_SPEED)]
        propagation_speed: f64,

        /// Beacon that refuses its first connection (repeatable)
        #[arg(long)]
        flaky: Vec<String>,
    },

    /// Solve a position from three x,y,d anchors
    Solve {
        /// Anchors as x,y,distance
        #[arg(num_args = 3, required = true, allow_hyphen_values = true)]
        anchors: Vec<String>,

        /// Determinant magnitude treated as collinear
        #[arg(long, default_value_t = beaconfix::trilateration::DEFAULT_DEGENERATE_EPSILON)]
        epsilon: f64,
    },

    /// View or initialize configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    let global = GlobalArgs {
        config: cli.config,
        log_level: cli.log_level,
    };

    match cli.command {
        Commands::Run { listen, symbol } => commands::run::run(commands::run::RunArgs {
            global,
            listen,
            symbol,
        }),
        Commands::Simulate {
            listen,
            position,
            quote,
            propagation_speed,
            flaky,
        } => commands::simulate::run(commands::simulate::SimulateArgs {
            global,
            listen,
            position,
            quote,
            propagation_speed,
            flaky,
        }),
        Commands::Solve { anchors, epsilon } => {
            commands::solve::run(commands::solve::SolveArgs { anchors, epsilon })
        }
        Commands::Config(command) => commands::config::run(command, global.config.as_deref()),
    }
}
