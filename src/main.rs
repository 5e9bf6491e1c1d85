use anyhow::{anyhow, bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use pl_link::cli::{handle_subcommands, init_config};
use pl_link::output::formatter_for;
use pl_link::{Config, PlDriver, VERSION};

fn build_cli() -> Command {
    Command::new("pl-link")
        .version(VERSION)
        .about("Talks to a Plasmatronics PL charge controller through a serial-to-network relay")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .global(true),
        )
        .arg(Arg::new("host").long("host").value_name("HOST").help("Relay host").global(true))
        .arg(Arg::new("port").long("port").value_name("PORT").help("Relay TCP port").global(true))
        .arg(
            Arg::new("model")
                .long("model")
                .value_name("MODEL")
                .help("Controller model: PL20, PL40 or PL60")
                .global(true),
        )
        .arg(
            Arg::new("system-voltage")
                .long("system-voltage")
                .value_name("VOLTS")
                .help("Nominal battery voltage: 12, 24 or 48")
                .global(true),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Per-request timeout in milliseconds")
                .global(true),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .value_parser(["console", "json"])
                .default_value("console")
                .help("Output format")
                .global(true),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .action(ArgAction::SetTrue)
                .help("Print link and request statistics afterwards")
                .global(true),
        )
        .subcommand(
            Command::new("read")
                .about("Read a single register")
                .arg(Arg::new("address").required(true).help("Register address, decimal or 0x hex"))
                .arg(
                    Arg::new("eeprom")
                        .long("eeprom")
                        .action(ArgAction::SetTrue)
                        .help("Read from EEPROM instead of RAM"),
                ),
        )
        .subcommand(
            Command::new("batch")
                .about("Read several RAM registers, e.g. 50,53,181")
                .arg(Arg::new("addresses").required(true)),
        )
        .subcommand(Command::new("all").about("Read and decode every known register"))
        .subcommand(Command::new("history").about("Read the 30-day history log"))
        .subcommand(Command::new("test").about("Run the loopback self-test"))
        .subcommand(
            Command::new("monitor")
                .about("Poll all registers until Ctrl-C")
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .value_name("SECONDS")
                        .help("Seconds between polls"),
                ),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(Arg::new("path").required(true)),
        )
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn run(matches: &ArgMatches, config: Config) -> Result<()> {
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("console");
    let formatter = formatter_for(format)?;

    let driver = Arc::new(PlDriver::from_config(config.clone()));
    driver.connect();

    let monitoring = matches.subcommand_matches("monitor").is_some();
    let wait = Duration::from_millis(config.timing.connect_timeout_ms)
        + Duration::from_millis(config.timing.retry_interval_ms);
    if !driver.wait_until_connected(wait).await {
        if !monitoring {
            driver.disconnect().await;
            bail!(
                "could not reach {}:{} within {:?}",
                config.device.host,
                config.device.port,
                wait
            );
        }
        warn!("📵 Relay not reachable yet, the monitor will keep retrying");
    }

    let outcome = handle_subcommands(matches, driver.clone(), formatter)
        .await
        .map_err(|e| anyhow!("{}", e));

    if matches.get_flag("stats") {
        println!("{}", formatter_for(format)?.format_stats(&driver.stats())?);
    }
    driver.disconnect().await;

    if !outcome? {
        bail!("no subcommand given, see --help");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    if let Some(sub) = matches.subcommand_matches("init-config") {
        init_logging("info");
        let path = sub
            .get_one::<String>("path")
            .ok_or_else(|| anyhow!("missing path"))?;
        return init_config(path).map_err(|e| anyhow!("{}", e));
    }

    let config = Config::from_matches(&matches)?;
    init_logging(&config.log_level);
    info!(
        "🚀 {} v{} -> {}:{} ({} {})",
        config.driver_name,
        VERSION,
        config.device.host,
        config.device.port,
        config.device.model,
        config.device.system_voltage
    );

    if let Err(e) = run(&matches, config).await {
        error!("❌ {}", e);
        return Err(e);
    }
    Ok(())
}
