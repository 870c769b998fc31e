//! vtlaunch - graphical session launcher
//!
//! Entry point for the launcher binary.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vtlaunch::config::{self, Config};
use vtlaunch::session::{self, TtyCredentialCollector};

/// Command-line arguments for vtlaunch
#[derive(Parser, Debug)]
#[command(name = "vtlaunch")]
#[command(version, about = "Graphical session launcher", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vtlaunch/config.toml")]
    pub config: String,

    /// Display identifier, e.g. ":1" (autodetected when omitted)
    #[arg(short, long, env = "VTLAUNCH_DISPLAY")]
    pub display: Option<String>,

    /// Target user for the session
    #[arg(short, long, env = "VTLAUNCH_USER")]
    pub user: Option<String>,

    /// Display server binary
    #[arg(long)]
    pub server: Option<String>,

    /// Extra server arguments as one string (whitespace-split)
    #[arg(long)]
    pub server_args: Option<String>,

    /// Client binary
    #[arg(long)]
    pub client: Option<String>,

    /// Extra client arguments as one string (whitespace-split)
    #[arg(long)]
    pub client_args: Option<String>,

    /// Detach and run as a daemon
    #[arg(long)]
    pub daemon: bool,

    /// Keep the launcher's own privileges for the client
    #[arg(long)]
    pub no_drop: bool,

    /// Leave the server running when the session ends
    #[arg(long)]
    pub no_kill: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "compact")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration before logging so the config can name the log file
    let config = load_config(&args)?;

    init_logging(&args, &config)?;

    info!("════════════════════════════════════════════════════════");
    info!("  vtlaunch v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {}", env!("BUILD_DATE"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("════════════════════════════════════════════════════════");
    tracing::debug!("Config: {:?}", config);

    let mut collector = TtyCredentialCollector;
    let code = if config.daemon.daemonize {
        session::run_daemon(&config, &mut collector)
    } else {
        session::run_foreground(&config, &mut collector)
    };

    match code {
        Ok(code) => {
            info!("session over, exit code {}", code);
            std::process::exit(code);
        }
        Err(e) => Err(e).context("session failed"),
    }
}

/// Load the config file and fold the CLI overrides in
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };

    if let Some(display) = &args.display {
        config.session.display = Some(display.clone());
    }
    if let Some(user) = &args.user {
        config.session.user = Some(user.clone());
    }
    if let Some(server) = &args.server {
        config.server.program = server.into();
    }
    if let Some(raw) = &args.server_args {
        config.server.args = config::tokenize(raw);
    }
    if let Some(client) = &args.client {
        config.client.program = client.into();
    }
    if let Some(raw) = &args.client_args {
        config.client.args = config::tokenize(raw);
    }
    if args.daemon {
        config.daemon.daemonize = true;
    }
    if args.no_drop {
        config.session.drop_privileges = false;
    }
    if args.no_kill {
        config.session.kill_server_on_exit = false;
    }
    // Very verbose runs turn the server's own logging up too
    if args.verbose >= 2 && !config.server.args.iter().any(|a| a == "-logverbose") {
        config.server.args.push("-logverbose".into());
        config.server.args.push("7".into());
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    use std::fs::OpenOptions;

    let log_level = match args.verbose {
        0 => config.logging.level.as_deref().unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("vtlaunch={log_level},warn")));

    // A daemon loses its terminal; it always logs to a file
    let log_file = args.log_file.clone().or_else(|| {
        let configured = config
            .logging
            .file
            .clone()
            .map(|p| p.to_string_lossy().into_owned());
        if config.daemon.daemonize {
            configured.or_else(|| Some(config::DEFAULT_LOG_FILE.to_string()))
        } else {
            configured
        }
    });

    if let Some(log_file_path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .with_context(|| format!("cannot open log file {log_file_path}"))?;

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", log_file_path);
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
        }
    }

    Ok(())
}
