//! # Sanity Signal
//!
//! Invariant violations are bugs in this layer, not bad network input. They
//! are logged with context at the point of detection and then propagated to
//! whoever owns the unit of work.

use thiserror::Error;

/// An internal invariant did not hold.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sanity check failed in {context}: {message}")]
pub struct SanityViolation {
    /// Component that detected the violation.
    pub context: &'static str,
    /// What went wrong.
    pub message: String,
}

impl SanityViolation {
    /// Builds the violation and logs it.
    #[must_use]
    pub fn new(context: &'static str, message: impl Into<String>) -> Self {
        let violation = Self {
            context,
            message: message.into(),
        };
        tracing::error!(
            context = violation.context,
            message = %violation.message,
            "sanity check failed"
        );
        violation
    }
}

/// Result type for operations that can only fail on an invariant violation.
pub type SanityResult<T> = Result<T, SanityViolation>;

/// Returns a [`SanityViolation`] unless `condition` holds.
///
/// The message closure only runs on failure.
#[inline]
pub fn ensure<F, M>(condition: bool, context: &'static str, message: F) -> SanityResult<()>
where
    F: FnOnce() -> M,
    M: Into<String>,
{
    if condition {
        Ok(())
    } else {
        Err(SanityViolation::new(context, message()))
    }
}
