//! The symbol lookup service.
//!
//! This crate contains everything that runs inside a lookup worker or the eviction process:
//! the shared on-disk cache ([`caching`]), downloading of symbol files ([`download`]), their
//! conversion into lookup tables ([`convert`]), and the batch lookup itself ([`symbolication`]).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod convert;
pub mod download;
pub mod logging;
pub mod symbolication;
pub mod symcaches;
pub mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;
