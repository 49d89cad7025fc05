//! Error types shared by the admission controller and the grouping engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// Invalid settings, e.g. a zero rate maximum that would be used as a divisor
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected state inside a component (poisoned lock, broken invariant)
    #[error("internal state error: {0}")]
    InternalState(String),
}

pub type Result<T> = std::result::Result<T, GateError>;

impl<T> From<std::sync::PoisonError<T>> for GateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GateError::InternalState(format!("lock poisoned: {}", err))
    }
}
