use thiserror::Error;

use crate::middleware::SourceType;

pub type Result<T> = std::result::Result<T, EngineError>;

/// A middleware capability call that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("middleware call {operation} failed: {reason}")]
pub struct MiddlewareError {
    pub operation: &'static str,
    pub reason: String,
}

impl MiddlewareError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Logical or physical channel index outside the current list.
    #[error("channel index {index} out of range (list size {count})")]
    OutOfRange { index: usize, count: usize },

    /// No route was resolved at startup for the frontend type carrying
    /// this kind of service.
    #[error("no route for {0:?} services")]
    NoRoute(SourceType),

    #[error("middleware unavailable: {0}")]
    MiddlewareUnavailable(#[from] MiddlewareError),
}
