use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised while materializing bars before a run starts.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("bar source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode market data snapshot {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to encode market data snapshot {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("unsupported market data snapshot version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("invalid CSV row {row}: {message}")]
    Csv { row: usize, message: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrategyError {
    #[error("insufficient data: need {required} bars, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("invalid parameter {name}: {message}")]
    InvalidParameter { name: String, message: String },

    #[error("indicator computation failed: {0}")]
    Computation(String),
}

/// Reasons a run ends in the FAILED state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid backtest range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("no tickers requested")]
    NoTickers,

    #[error("no data for market reference instrument {instrument}")]
    NoReferenceData { instrument: String },

    #[error("no data for any requested instrument")]
    NoInstrumentData,

    #[error(transparent)]
    DataSource(#[from] DataError),
}
