//! Error handling utils.
//!
//! Recoverable failures surface as [`enum@Error`]; violated internal
//! invariants are programming errors and go through
//! [`fatal_assert!`](crate::fatal_assert) instead. The [hook](crate::hook)
//! layer never returns an [`enum@Error`]: it reports through the libc
//! `errno` surface so that wrapped calls keep the exact error-code contract
//! of the OS interface they replace.

use std::io;

/// A specialized [`Result`](std::result::Result) type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Creating the readiness-notification handle failed.
    #[error("epoll_create1: {0}")]
    EpollCreate(#[source] io::Error),

    /// Creating the self-pipe used to wake the reactor failed.
    #[error("self-pipe creation: {0}")]
    SelfPipe(#[source] io::Error),

    /// Registering, modifying or removing an epoll interest failed.
    #[error("epoll_ctl(op={op}, fd={fd}): {source}")]
    EpollCtl {
        op: &'static str,
        fd: i32,
        #[source]
        source: io::Error,
    },

    /// Spawning a worker thread failed.
    #[error("spawning thread {name:?}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A configuration value could not be parsed from YAML.
    #[error("config option {name:?}: {source}")]
    ConfigParse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Reading a configuration file failed.
    #[error("io error: {0}")]
    IO(#[from] io::Error),
}
