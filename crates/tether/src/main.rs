use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info};

use tether::service::TetherService;
use tether::settings::Settings;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tether - bridge between mobile chat clients and a CLI coding agent.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bridge service.
    Serve,
    /// Print the resolved configuration and exit.
    Config,
    /// Probe agent availability and print a health report.
    Health,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let settings = Settings::load(cli.common.config.as_deref())?;

    match cli.command {
        Command::Serve => run_serve(settings),
        Command::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Health => run_health(settings),
    }
}

fn init_logging(opts: &CommonOpts) {
    let level = if opts.trace {
        LevelFilter::Trace
    } else if opts.quiet {
        LevelFilter::Error
    } else {
        match opts.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

#[tokio::main]
async fn run_serve(settings: Settings) -> Result<()> {
    let service = TetherService::new(settings);
    service.startup_cleanup().await;
    service.start();
    info!("Tether service running; press Ctrl-C to stop");

    // The transport layers attach through the service's subscription API.
    // Until one does, mirror the event stream into the log so a bare
    // `serve` is still observable.
    let mut events = service.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!("event: {}", line),
                Err(e) => info!("event (unserializable: {})", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    logger.abort();
    service.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn run_health(settings: Settings) -> Result<()> {
    let service = TetherService::new(settings);
    let report = service.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
