//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use url::Url;

use fetchcache_service::caching::{self, BlobStore};
use fetchcache_service::config::Config;
use fetchcache_service::metrics;
use fetchcache_service::{FetchCoordinator, FetchOptions, FetchRequest, HttpTransport};

use crate::logging;

/// Fetchcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a single payload through the caches.
    Fetch {
        /// The URL to fetch.
        url: Url,

        /// Bypass the caches, and do not store the result.
        #[arg(long)]
        no_cache: bool,

        /// Write the payload to this file instead of stdout.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Clean up the file-system cache.
    ///
    /// Removes expired entries, and evicts the oldest entries if the cache exceeds its size limit.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove all entries from the file-system cache.
    Clear,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "fetchcache", version, about)]
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

    let dsn = config
        .sentry_dsn
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("invalid sentry DSN")?;
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn,
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure metrics")?;
    }

    match cli.command {
        Command::Fetch {
            url,
            no_cache,
            output,
        } => fetch(config, url, no_cache, output).context("failed to fetch")?,
        Command::Cleanup { dry_run } => {
            caching::cleanup(&config, dry_run).context("failed to clean up caches")?;
        }
        Command::Clear => clear(&config).context("failed to clear caches")?,
    }

    Ok(())
}

fn fetch(config: Config, url: Url, no_cache: bool, output: Option<PathBuf>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fetchcache")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let transport = HttpTransport::new(&config.fetch).context("failed to create HTTP client")?;
        let coordinator = FetchCoordinator::new(
            &config,
            Arc::new(transport),
            tokio::runtime::Handle::current(),
        )
        .context("failed to set up caches")?;

        let request = FetchRequest::get(url);
        let options = if no_cache {
            FetchOptions::no_cache()
        } else {
            FetchOptions::default()
        };

        let payload = coordinator
            .fetch(request.cache_key(), request, options)
            .await?;
        tracing::info!("Fetched {} bytes", payload.len());

        match output {
            Some(path) => tokio::fs::write(&path, &payload)
                .await
                .with_context(|| format!("failed to write `{}`", path.display()))?,
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&payload).await?;
                stdout.flush().await?;
            }
        }

        Ok(())
    })
}

fn clear(config: &Config) -> Result<()> {
    let store = BlobStore::from_config(config)?
        .context("no caching configured! Did you provide a path to your config file?")?;

    tracing::info!("Clearing cache at `{}`", store.cache_dir().display());
    store.clear()?;
    Ok(())
}
