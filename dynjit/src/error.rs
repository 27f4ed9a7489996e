use thiserror::Error;

/// Errors surfaced across the host-facing API.
///
/// Only host-triggerable input validation lands here. Contract violations
/// (re-entrant `run`, a block rejected by the verification pass) panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("General register index out of range: {index}")]
    RegisterOutOfRange { index: usize },
    #[error("Vector register index out of range: {index}")]
    VectorOutOfRange { index: usize },
    #[error("Invalid JIT configuration: {0}")]
    InvalidConfig(&'static str),
}
