use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use sentinel_crypto::NodeIdentity;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app_config;
mod simulate;
mod version;

use app_config::AppConfig;
use simulate::SimulationOptions;
use version::{git_commit_hash, SENTINEL_VERSION};

fn load_config_with_overrides(matches: &ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<String>("config").map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) {
    if let Some(node_id) = matches.get_one::<String>("node-id") {
        config.node_id = node_id.clone();
    }

    if let Some(region) = matches.get_one::<String>("region") {
        config.region = region.clone();
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if matches.get_flag("dev") {
        config.log_level = "debug".to_string();
        config.log_format = "pretty".to_string();
    }
}

fn cli() -> Command {
    Command::new("sentinel-node")
        .version(SENTINEL_VERSION)
        .about("Sentinel threat-intelligence federation node")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Override the node id")
                .global(true),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .value_name("REGION")
                .help("Override the node region")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override the listen port")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("dev")
                .long("dev")
                .action(ArgAction::SetTrue)
                .help("Debug logging with pretty output")
                .global(true),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run an in-process federation and exercise consensus and signal sharing")
                .arg(
                    Arg::new("nodes")
                        .short('n')
                        .long("nodes")
                        .value_name("N")
                        .value_parser(value_parser!(u16).range(1..=64))
                        .default_value("3")
                        .help("Number of nodes to start"),
                )
                .arg(
                    Arg::new("duration")
                        .short('d')
                        .long("duration")
                        .value_name("SECONDS")
                        .value_parser(value_parser!(u64).range(1..))
                        .default_value("10")
                        .help("Time limit for each simulation phase"),
                ),
        )
        .subcommand(Command::new("config").about("Print the resolved configuration as JSON"))
        .subcommand(
            Command::new("identity")
                .about("Generate a node identity and print its public descriptor"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    match matches.subcommand() {
        Some(("simulate", sub)) => {
            init_logging(&config)?;
            info!(
                version = SENTINEL_VERSION,
                commit = git_commit_hash(),
                config = ?config.config_path,
                "starting sentinel-node simulation"
            );
            let options = SimulationOptions {
                nodes: sub.get_one::<u16>("nodes").copied().unwrap_or(3) as usize,
                duration: Duration::from_secs(sub.get_one::<u64>("duration").copied().unwrap_or(10)),
            };
            let report = simulate::run(&config, options).await?;
            info!(
                meshed = report.meshed,
                proposal = ?report.proposal_status,
                correlated = report.correlated,
                "simulation finished"
            );
            println!("{}", serde_json::to_string_pretty(&report.statuses)?);
        }
        Some(("config", _)) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(("identity", _)) => {
            let identity = NodeIdentity::generate(config.node_id.clone(), config.region.clone());
            println!("{}", serde_json::to_string_pretty(&identity.descriptor())?);
        }
        _ => anyhow::bail!("no subcommand given"),
    }

    Ok(())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}
