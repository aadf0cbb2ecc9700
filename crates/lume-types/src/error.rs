//! Unified error interface for lume.
//!
//! Every error type in the workspace implements [`ErrorCode`] so that
//! operators, clients and logs can match on a stable machine-readable
//! code instead of parsing display strings.
//!
//! # Example
//!
//! ```
//! use lume_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum WriteError {
//!     OutOfRange,
//!     Unavailable,
//! }
//!
//! impl ErrorCode for WriteError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::OutOfRange => "WRITE_OUT_OF_RANGE",
//!             Self::Unavailable => "WRITE_UNAVAILABLE",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Unavailable)
//!     }
//! }
//!
//! let err = WriteError::Unavailable;
//! assert_eq!(err.code(), "WRITE_UNAVAILABLE");
//! assert!(err.is_recoverable());
//! ```

/// Machine-readable error code interface.
///
/// # Code Format
///
/// - **UPPER_SNAKE_CASE**, e.g. `"VALIDATION_OUT_OF_RANGE"`
/// - **Prefixed by layer**: `VALIDATION_`, `EVAL_`, `CONFIGURATION_`,
///   `LISTENER_`, `TRANSPORT_`, `CLIENT_`, `CONFIG_`, `SERVER_`
/// - **Stable**: codes are part of the operator-facing contract
///
/// # Recoverability
///
/// An error is recoverable when retrying (possibly after the peer comes
/// back, or with a corrected value) may succeed without a restart or a
/// configuration change.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether retrying may succeed.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code follows the workspace conventions.
///
/// # Panics
///
/// Panics if the code is empty, lacks `expected_prefix`, or is not
/// UPPER_SNAKE_CASE.
///
/// # Example
///
/// ```
/// use lume_types::{assert_error_code, ErrorCode};
///
/// struct Busy;
///
/// impl ErrorCode for Busy {
///     fn code(&self) -> &'static str { "LOOP_BUSY" }
///     fn is_recoverable(&self) -> bool { true }
/// }
///
/// assert_error_code(&Busy, "LOOP_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "Error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );
    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Asserts [`assert_error_code`] for every variant in `errors`.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
