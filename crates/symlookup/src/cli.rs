//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use symlookup_service::config::Config;
use symlookup_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Symlookup commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Keep the shared symbol cache below its size limit.
    ///
    /// Exactly one eviction process should run per cache directory.
    Evict {
        /// Run a single eviction cycle and exit.
        #[arg(long)]
        once: bool,

        /// Only log what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the health of a running web server.
    Healthcheck {
        /// Address of the server, defaults to the configured `bind` address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(name = "symlookup", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Evict { once, dry_run } => {
            server::evict(config, once, dry_run).context("failed to evict from the cache")?
        }
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let args = ["symlookup", "evict", "--once", "-c", "config.yml"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        assert!(matches!(
            cli.command,
            Command::Evict {
                once: true,
                dry_run: false
            }
        ));

        let cli = Cli::try_parse_from(["symlookup", "healthcheck"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Healthcheck {
                addr: None,
                timeout: 5
            }
        ));

        assert!(Cli::try_parse_from(["symlookup"]).is_err());
    }
}
