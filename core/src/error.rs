//! Error type for the particle-filter crate.
//!
//! The estimation core never fails at run time: degenerate weights and out-of-order timestamps are reported
//! as outcomes instead. Errors here cover start-up concerns (configuration, files, transforms) and the
//! channel plumbing around the filter thread.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not parse covariance `{name}` from {value:?}: expected 6 comma separated numbers")]
    CovarianceParse { name: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Format(String),

    #[error("transform {source_frame} -> {target_frame} unavailable after waiting {waited_s:.1} s")]
    TransformUnavailable {
        target_frame: String,
        source_frame: String,
        waited_s: f64,
    },

    #[error("all particle weights are zero")]
    DegenerateWeights,

    #[error("filter channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, FilterError>;
