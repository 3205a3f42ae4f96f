use clap::{Arg, ArgAction, ArgMatches, Command, builder::PossibleValuesParser, value_parser};
use easy_error::{Error, ResultExt};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::Config;

const DEFAULT_CONFIG: &str = "config.yaml";
const DEFAULT_LEVEL: &str = "info";

/// Environment variable holding extra tracing directives.
pub const LOG_ENV: &str = "WSGATE_LOG";

#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config_file: String,
    pub check_only: bool,
    pub log_level: String,
    /// Replaces `bind` from the config file.
    pub bind: Option<String>,
}

impl AppArgs {
    pub fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
    }
}

fn command() -> Command {
    Command::new("wsgate")
        .version(crate::VERSION)
        .about("WebSocket tunnel gateway with SOCKS5, NAT64 and relay fallback")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Gateway config (YAML)")
                .default_value(DEFAULT_CONFIG)
                .value_parser(value_parser!(String)),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Tunnel listen address, overrides `bind` in the config")
                .value_parser(value_parser!(String)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .visible_alias("log")
                .value_name("LEVEL")
                .help(format!("Default log level, {} adds directives", LOG_ENV))
                .default_value(DEFAULT_LEVEL)
                .value_parser(PossibleValuesParser::new([
                    "error", "warn", "info", "debug", "trace",
                ])),
        )
        .arg(
            Arg::new("check")
                .short('t')
                .long("check")
                .visible_alias("test")
                .help("Validate the config and exit without listening")
                .action(ArgAction::SetTrue),
        )
}

fn from_matches(args: &ArgMatches) -> AppArgs {
    let string = |id: &str, default: &str| {
        args.get_one::<String>(id)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    AppArgs {
        config_file: string("config", DEFAULT_CONFIG),
        check_only: args.get_flag("check"),
        log_level: string("log-level", DEFAULT_LEVEL),
        bind: args.get_one::<String>("bind").cloned(),
    }
}

pub fn parse_args() -> Result<AppArgs, Error> {
    let args = from_matches(&command().get_matches());
    init_logging(&args.log_level)?;
    Ok(args)
}

fn log_filter(log_level: &str) -> Result<EnvFilter, Error> {
    EnvFilter::builder()
        .with_default_directive(log_level.parse().context("parse log level")?)
        .with_env_var(LOG_ENV)
        .from_env()
        .with_context(|| format!("parse {}", LOG_ENV))
}

pub fn init_logging(log_level: &str) -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(log_filter(log_level)?)
        .init();
    Ok(())
}
