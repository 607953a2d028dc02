use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{debug, LevelFilter};

use bgp_speaker::config::{Config, LogLevel};
use bgp_speaker::error::Error;
use bgp_speaker::netlink;
use bgp_speaker::speaker::Speaker;

#[derive(Debug, Parser)]
#[command(
    name = "bgp-speaker",
    about = "Anycast BGP speaker with health-gated advertisement and kernel FIB sync"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the speaker daemon
    Run {
        /// Path to the YAML config file
        #[arg(short = 'c', long = "config", default_value = "config.yaml")]
        config: PathBuf,
        /// Log verbosity
        #[arg(
            short = 'l',
            long = "log-level",
            value_enum,
            default_value_t = LogLevel::Info
        )]
        log_level: LogLevel,
    },
    /// Inspect or edit the kernel routing table
    Fib {
        #[command(subcommand)]
        command: Option<FibCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum FibCommand {
    /// Install or replace the default route
    #[command(name = "set-default-route")]
    SetDefaultRoute {
        /// Gateway address(es), comma separated for multipath
        #[arg(short = 'g', long = "gateway", value_delimiter = ',', required = true)]
        gateway: Vec<Ipv4Addr>,
        /// Route metric
        #[arg(short = 'm', long = "metric", default_value_t = netlink::DEFAULT_CLI_METRIC)]
        metric: u32,
    },
    /// Remove the speaker-managed default route
    #[command(name = "delete-default-route")]
    DeleteDefaultRoute {
        /// Route metric
        #[arg(short = 'm', long = "metric", default_value_t = netlink::DEFAULT_CLI_METRIC)]
        metric: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Exiting: {}", err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Run { config, log_level } => {
            init_logging(log_level);
            let config = Config::from_file(&config)?;
            debug!("using config: {:?}", config);
            Speaker::new(config).run().await
        }
        Command::Fib { command: None } => netlink::print_routes().await,
        Command::Fib {
            command: Some(FibCommand::SetDefaultRoute { gateway, metric }),
        } => netlink::set_default_route(&gateway, metric).await,
        Command::Fib {
            command: Some(FibCommand::DeleteDefaultRoute { metric }),
        } => netlink::delete_default_route(metric).await,
    }
}

fn init_logging(level: LogLevel) {
    let filter = level.to_filter();
    Builder::new()
        .filter(Some("bgp_speaker"), filter)
        .filter(Some("bgp"), filter)
        .filter(None, LevelFilter::Warn)
        .init();
}
