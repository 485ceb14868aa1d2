//! Balancer error types.

use thiserror::Error;

/// Errors that can occur in the selection engine.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("invalid setting: {0}")]
    InvalidSetting(#[from] steer_core::ConfigError),

    #[error("expected exactly one fallback-origin backend, found {0}")]
    LastResort(usize),

    #[error("session {0} kept changing underneath the request")]
    SessionContended(String),

    #[error("session {0} was reassigned while the request was being served")]
    SessionMoved(String),

    #[error("state store error: {0}")]
    State(#[from] steer_state::StateError),
}

pub type BalancerResult<T> = Result<T, BalancerError>;
