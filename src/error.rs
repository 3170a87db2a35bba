//! Error types shared by the whole pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the sampling, probing and modelling pipeline.
///
/// Per-probe oracle failures are *not* represented here: the probe engine
/// logs and skips them (see [`OracleError`][crate::oracle::OracleError]).
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error, annotated with the path involved.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// JSON (de)serialization error, annotated with the path involved.
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A line of the option catalog could not be parsed.
    #[error("catalog line {line}: {message}")]
    Catalog { line: usize, message: String },

    /// A DIMACS document could not be parsed.
    #[error("DIMACS line {line}: {message}")]
    Dimacs { line: usize, message: String },

    /// The sampler was given no seed states.
    #[error("no seed states available")]
    NoSeeds,

    /// A probe cache entry has an unparseable key or value.
    #[error("malformed probe cache entry {key:?}: {message}")]
    MalformedCache { key: String, message: String },

    /// The model counter gave up.
    #[error("model counting failed: {0}")]
    Counter(String),

    /// A clause references a variable outside of `1..=num_vars`.
    #[error("literal {literal} is out of range for {num_vars} variables")]
    LiteralOutOfRange { literal: i32, num_vars: u32 },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
