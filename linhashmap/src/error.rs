use std::io;
use thiserror::Error;

/// Errors that can occur when working with a linear-hashing region
#[derive(Error, Debug)]
pub enum LinHashError {
    /// IO errors when creating, opening or mapping the region file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A durable write failed; the triggering operation must be treated as
    /// lost and the handle as poisoned
    #[error("Durable write failed: {0}")]
    Durability(#[source] io::Error),

    /// Key not found in the map
    #[error("Key not found")]
    KeyNotFound,

    /// A bucket and its overflow bucket are both full, or the region has no
    /// room left for another bucket
    #[error("Map capacity exceeded")]
    CapacityExceeded,

    /// A persisted region failed validation on open
    #[error("Invalid region layout: {0}")]
    InvalidLayout(String),

    /// Invalid configuration parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, LinHashError>;
