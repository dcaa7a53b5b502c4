//! Per-module error types.
//!
//! Each boundary in the pipeline gets its own `thiserror` enum so callers can
//! match on a specific failure mode; `anyhow` is reserved for the binary
//! edge (`main.rs`), matching the split the socket and APRS clients use.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NmeaError {
    #[error("sentence exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    BadChecksum { expected: u8, actual: u8 },
    #[error("sentence type {kind} requires at least {min} fields, got {actual}")]
    TooFewFields {
        kind: &'static str,
        min: usize,
        actual: usize,
    },
    #[error("coordinate out of range: {0}")]
    BadCoordinate(f64),
    #[error("unrecognized sentence type")]
    Unrecognized,
    #[error("malformed field: {0}")]
    BadField(String),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("datagram exceeds {max} characters")]
    TooLong { max: usize },
    #[error("no key=value pairs found in datagram")]
    Empty,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{endpoint}: reconnect attempts exhausted after {attempts}")]
    ReconnectExhausted { endpoint: String, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path} as TOML: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize {
        #[source]
        source: Box<toml::ser::Error>,
    },
}
