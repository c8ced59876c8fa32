//! Result type definition and extension traits.
//!
//! Provides combinators for Result types so recoverable failures can be
//! logged and defaulted without unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type for Baton operations.
///
/// # Examples
///
/// ```ignore
/// fn legs() -> Result<Vec<Leg>> {
///     let legs = initialize_race(start, &runners, &distances)?;
///     Ok(legs)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing safe combinators for Results.
pub trait ResultExt<T> {
    /// Get the value or a default, logging the error as a warning if present.
    fn or_default_logged(self, default: T) -> T;
}

impl<T> ResultExt<T> for Result<T> {
    fn or_default_logged(self, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Operation failed, using default: {}", e);
                default
            }
        }
    }
}
