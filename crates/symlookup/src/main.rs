//! Symlookup.
//!
//! Symlookup is a web service that resolves addresses in native stack traces to function names.
//! It fetches the symbol files of modules from configured symbol servers, converts them into a
//! fast lookup format and keeps the converted files in a cache directory that is shared by all
//! worker processes of a machine. The `evict` command keeps that directory below its size limit.

#![warn(missing_debug_implementations, clippy::all)]

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
