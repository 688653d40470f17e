//! givingctl - operator tooling for the delegated giving core
//!
//! - Plan milestone payouts from an index export
//! - Create and inspect encrypted keystores
//! - Run an in-memory end-to-end simulation of the donation lifecycle
//! - Show the effective configuration

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod error;
mod output;

use commands::{keystore, simulate, withdrawal};
use config::GivingConfig;
use error::CliResult;

/// givingctl application
#[derive(Parser)]
#[command(name = "givingctl")]
#[command(about = "Operator tooling for the delegated giving core", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GIVING_CONFIG")]
    config: Option<String>,

    /// Log level (overrides the configured level)
    #[arg(long, env = "GIVING_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Milestone withdrawal planning
    #[command(alias = "wd")]
    Withdrawal {
        #[command(subcommand)]
        command: withdrawal::WithdrawalCommands,
    },

    /// Keystore management
    Keystore {
        #[command(subcommand)]
        command: keystore::KeystoreCommands,
    },

    /// Run donations through an in-memory ledger and pay them out
    Simulate(simulate::SimulateArgs),

    /// Show the effective configuration
    Config,
}

fn init_tracing(config: &GivingConfig, cli: &Cli) {
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli, config: GivingConfig) -> CliResult<()> {
    match cli.command {
        Commands::Withdrawal { command } => {
            withdrawal::execute(command, config.engine.donation_collect_count_limit, cli.output)
        }
        Commands::Keystore { command } => keystore::execute(command, cli.output),
        Commands::Simulate(args) => simulate::execute(args, &config.engine, cli.output).await,
        Commands::Config => output::print_json(&config),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match GivingConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            output::print_error(&format!("Failed to load configuration: {}", e));
            std::process::exit(2);
        }
    };
    init_tracing(&config, &cli);

    if let Err(e) = run(cli, config).await {
        output::print_error(&e.to_string());
        std::process::exit(1);
    }
}
