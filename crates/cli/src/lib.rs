pub mod commands;

use clap::{Parser, Subcommand};
use purchasekit_core::config::{AppConfig, LoadOptions, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;

use commands::simulate::SimulateArgs;

#[derive(Debug, Parser)]
#[command(
    name = "purchasekit",
    about = "Purchasekit operator CLI",
    long_about = "Inspect configuration, manage the local ownership cache, and run purchase flows against a sandbox store.",
    after_help = "Examples:\n  purchasekit config\n  purchasekit cache show --json\n  purchasekit simulate --purchase remove_ads --consume coins_100"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file to load instead of purchasekit.toml")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Inspect or remove the persisted product ownership cache")]
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    #[command(about = "Run the purchase manager against an in-process sandbox store")]
    Simulate(SimulateArgs),
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    #[command(about = "Decode the cache file and list cached products")]
    Show {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Delete the cache file")]
    Clear,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = commands::load_options(cli.config.as_deref());
    init_logging(&options);

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Cache { action: CacheCommand::Show { json } } => {
            commands::cache::show(&options, json)
        }
        Command::Cache { action: CacheCommand::Clear } => commands::cache::clear(&options),
        Command::Simulate(args) => commands::simulate::run(&options, &args),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

// Commands report configuration errors themselves; logging just stays at the
// defaults when the config does not load.
fn init_logging(options: &LoadOptions) {
    use tracing::Level;

    let config = AppConfig::load(options.clone()).unwrap_or_default();
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    let subscriber =
        tracing_subscriber::fmt().with_target(false).with_max_level(log_level).with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
