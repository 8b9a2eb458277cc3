//! Module identities, symbol source configuration and candidate resolution.
//!
//! A module is identified by a [`ModuleKey`]. Every configured [`SourceConfig`] can be asked for the
//! symbol file of a module, and the [`SourceResolver`] turns a key into an ordered list of
//! [`RemoteFile`]s to try.

mod module;
mod remotefile;
mod resolver;
mod sources;

pub use module::*;
pub use remotefile::*;
pub use resolver::*;
pub use sources::*;
