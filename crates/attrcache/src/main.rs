//! attrcache.
//!
//! attrcache is a standalone web service that computes attributes of source documents and keeps
//! both the fetched documents and the computed attributes in memory. Purging a source evicts
//! everything that was derived from it.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

#[cfg(test)]
mod test;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
