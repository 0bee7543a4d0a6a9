use thiserror::Error;

use crate::time::{Level, Mode, Phase};

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid count {count} for {mode} {level}: counts must be positive")]
    InvalidCount { mode: Mode, level: Level, count: usize },

    #[error("no stack configured for mode {0}")]
    UnknownStack(Mode),

    #[error("level {level} is not part of the {mode} stack")]
    UnknownLevel { mode: Mode, level: Level },

    #[error("missing series: {path}")]
    MissingSeries { path: String },

    #[error("series {path} exists and is not a {expected} series")]
    SeriesType { path: String, expected: &'static str },

    #[error("seed index {index} exceeds seed table capacity {cap}")]
    SeedExhausted { index: usize, cap: usize },

    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    #[error("stat {stat} failed at {mode} {level} {phase}: {source}")]
    Stat {
        mode: Mode,
        level: Level,
        phase: Phase,
        stat: String,
        #[source]
        source: Box<SimError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub fn missing(path: impl Into<String>) -> Self {
        SimError::MissingSeries { path: path.into() }
    }
}
