//! Error types for the sanitization pipeline.
//!
//! Only [`BootstrapError`] and [`DiscoveryError`] abort a run; everything a
//! stage can produce is a [`StageFailure`] and stays contained to the item
//! being processed.

use std::io;
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error;

/// Custom result type for run-fatal pipeline operations.
pub type Result<T> = StdResult<T, Error>;

/// Top-level error for a pipeline run. Per-item failures never surface here.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Cannot create or read the configuration, or open the run log. Fatal.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BootstrapError {
    #[error("failed to read config file '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write default config file '{path}': {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("failed to open log file '{path}': {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Batch discovery could not produce work items. Fatal.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiscoveryError {
    #[error("invalid file pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("cannot walk input directory '{dir}': {source}")]
    Walk {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("no files matching '{pattern}' under '{dir}'")]
    NoMatches { pattern: String, dir: PathBuf },
}

/// A single stage invocation failed. Contained to the offending item.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StageFailure {
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with status {code:?}: {detail}")]
    Tool {
        tool: &'static str,
        code: Option<i32>,
        detail: String,
    },

    #[error("wrong password or unsupported encryption: {detail}")]
    BadPassword { detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
