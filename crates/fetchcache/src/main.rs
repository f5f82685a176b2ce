//! Fetchcache.
//!
//! Fetchcache fetches remote payloads through a two-tier cache. Concurrent requests for the same
//! payload are deduplicated, and transient failures are retried with exponential backoff. This
//! binary fetches single payloads from the command line and maintains the file-system cache.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
