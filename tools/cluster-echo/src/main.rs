//
// Copyright 2020 Joyent, Inc.
//

//
// Connects a session to a cluster and prints the hosts it knows about, with
// their states, every few seconds. Requires at least one reachable node.
//
// Stop and start nodes and watch the changes come through!
//
// The -l argument is useful for controlling the amount of log spam. Set it to
// "critical" to see only the host listing.
//

use std::env;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use clap::{crate_name, crate_version, App, Arg};
use slog::{o, Drain, Level, LevelFilter, Logger};

use shoal::config::{ClusterConfig, HostFilter};
use shoal::Session;

const DEFAULT_HOSTS: &str = "127.0.0.1:9042";
const DEFAULT_INTERVAL_SECS: u64 = 5;
const DEFAULT_LOG_LEVEL: Level = Level::Info;
const LOG_LEVEL_ENV_VAR: &str = "SHOAL_LOG_LEVEL";

fn main() {
    let matches = App::new("Cluster Echo CLI")
        .version(crate_version!())
        .about("Echoes the members of a cluster to the command line")
        .arg(
            Arg::with_name("hosts")
                .short("c")
                .long("hosts")
                .takes_value(true)
                .help(
                    format!(
                        "Comma-separated list of seed host[:port] entries\n\
                         (default: {})",
                        DEFAULT_HOSTS
                    )
                    .as_str(),
                ),
        )
        .arg(
            Arg::with_name("datacenter")
                .short("d")
                .long("datacenter")
                .takes_value(true)
                .help("Only use hosts in this datacenter"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .takes_value(true)
                .help(
                    format!(
                        "Seconds between listings (default: {})",
                        DEFAULT_INTERVAL_SECS
                    )
                    .as_str(),
                ),
        )
        .arg(
            Arg::with_name("log level")
                .short("l")
                .long("log-level")
                .takes_value(true)
                .help(
                    format!(
                        "Log level: trace|debug|info|warning|error|critical\n\
                         (uses {} env var if flag not given)\n\
                         (default: {})",
                        LOG_LEVEL_ENV_VAR,
                        format!("{:?}", DEFAULT_LOG_LEVEL).to_lowercase()
                    )
                    .as_str(),
                ),
        )
        .get_matches();

    let hosts: Vec<String> = matches
        .value_of("hosts")
        .unwrap_or(DEFAULT_HOSTS)
        .split(',')
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    let dc = matches.value_of("datacenter").map(String::from);
    let interval = match matches.value_of("interval") {
        Some(s) => s.parse::<u64>().expect("Invalid interval"),
        None => DEFAULT_INTERVAL_SECS,
    };

    //
    // Try to get the log level from the CLI arg and, if that fails, the
    // environment variable. If both fail, just use the default.
    //
    let l = match matches.value_of("log level") {
        Some(level_str) => {
            parse_log_level(level_str).expect("Invalid log level")
        }
        None => log_level_from_env()
            .expect("Invalid log level")
            .unwrap_or(DEFAULT_LOG_LEVEL),
    };

    std::process::exit(match run(hosts, dc, interval, l) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    });
}

fn run(
    hosts: Vec<String>,
    dc: Option<String>,
    interval: u64,
    l: Level,
) -> Result<(), String> {
    let mut cfg = ClusterConfig::new(hosts);
    cfg.log = Some(standard_log(l));
    if let Some(dc) = dc {
        cfg.host_filter = Some(HostFilter::datacenter(dc));
    }

    let session = Session::new(cfg).map_err(|e| e.to_string())?;
    println!("protocol version {}", session.proto_version());

    loop {
        let stats = session.pool_stats();
        println!(
            "{} pools, {} connections",
            stats.host_pools, stats.total_connections
        );
        let mut hosts = session.current_hosts();
        hosts.sort_by_key(|h| h.connect_address());
        for host in hosts {
            println!(
                "  {} {} dc={} rack={}",
                host.connect_address(),
                host.state(),
                host.datacenter().unwrap_or_else(|| String::from("-")),
                host.rack().unwrap_or_else(|| String::from("-")),
            );
        }
        thread::sleep(Duration::from_secs(interval));
    }
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(Level::Trace),
        "debug" => Ok(Level::Debug),
        "info" => Ok(Level::Info),
        "warning" => Ok(Level::Warning),
        "error" => Ok(Level::Error),
        "critical" => Ok(Level::Critical),
        _ => Err(format!("unknown log level {:?}", s)),
    }
}

fn log_level_from_env() -> Result<Option<Level>, String> {
    match env::var(LOG_LEVEL_ENV_VAR) {
        Ok(level_str) => parse_log_level(&level_str).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

fn standard_log(l: Level) -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            l,
        ))
        .fuse(),
        o!("name" => crate_name!(), "build-id" => crate_version!()),
    )
}
