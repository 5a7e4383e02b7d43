pub mod builder;
pub mod dampening;
pub mod query;

pub use builder::*;
pub use dampening::*;
pub use query::*;

use thiserror::Error;

/// Rejected host input. Raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no dampening factors supplied")]
    NoFactors,
    #[error("expected 24 or 48 dampening factors, got {0}")]
    WrongFactorCount(usize),
    #[error("dampening factor {0} is outside 0.0..=1.0")]
    FactorOutOfRange(f64),
    #[error("could not parse {0:?} as a number")]
    Unparsable(String),
    #[error("site \"all\" requires 48 half-hourly factors")]
    AllRequiresHalfHourly,
    #[error("unknown site: {0}")]
    UnknownSite(String),
    #[error("hard limit must be a positive number, got {0}")]
    HardLimitNotPositive(f64),
    #[error("{given} hard limits supplied for {credentials} API key(s)")]
    TooManyHardLimits { given: usize, credentials: usize },
    #[error("window start must be before its end")]
    EmptyWindow,
    #[error("unknown estimate field: {0}")]
    UnknownEstimateField(String),
}
