//! Unified error types for dnnconv.
//!
//! This module provides [`ConvError`], the single error type returned by plan
//! construction, layout conversion and the forward/backward entry points. It
//! uses the `thiserror` crate for ergonomic error handling.
//!
//! Every error here is terminal for the operation that raised it: nothing in
//! the crate retries, with the single exception of the backend-to-backend
//! conversion fallback inside
//! [`LayoutDescriptor::get_converted`](crate::LayoutDescriptor::get_converted).
//!
//! # Example
//!
//! ```rust
//! use dnnconv::ConvError;
//!
//! fn check_channels(expected: usize, got: usize) -> Result<(), ConvError> {
//!     if expected != got {
//!         return Err(ConvError::shape_mismatch("input", &[expected], &[got]));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::backend::Status;
use crate::config::ConfigError;

/// Unified error type for dnnconv operations.
#[derive(Error, Debug)]
pub enum ConvError {
    /// The compute backend reported a non-zero status.
    ///
    /// `context` names the primitive, layout or conversion that failed.
    #[error("{context} failed with status {status}")]
    Backend {
        /// What was being created or executed.
        context: String,
        /// Status code returned by the backend.
        status: Status,
    },

    /// A tensor does not have the extents the plan was built for.
    ///
    /// Raised before any primitive executes.
    #[error("Incompatible shape of {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Which tensor or buffer was checked.
        what: String,
        /// Expected extents.
        expected: Vec<usize>,
        /// Actual extents.
        got: Vec<usize>,
    },

    /// Operator configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A layout descriptor was used before both layouts were bound.
    #[error("Layout descriptor '{0}' is not bound")]
    Unbound(String),

    /// A backend/canonical conversion was requested on a pass-through descriptor.
    #[error("Layout descriptor '{0}' has no conversion primitives")]
    MissingConversion(String),

    /// A scratch buffer was borrowed as both input and output of one primitive.
    #[error("Scratch buffer of '{0}' is already in use")]
    BufferInUse(String),

    /// No constructor is registered under the requested layer name.
    #[error("Unknown layer type '{0}'")]
    UnknownLayer(String),
}

/// Result type alias for dnnconv operations.
pub type ConvResult<T> = Result<T, ConvError>;

impl ConvError {
    /// Wraps a backend status with the name of the failing operation.
    pub fn backend<S: Into<String>>(context: S, status: Status) -> Self {
        ConvError::Backend {
            context: context.into(),
            status,
        }
    }

    /// Creates a shape mismatch error.
    pub fn shape_mismatch<S: Into<String>>(what: S, expected: &[usize], got: &[usize]) -> Self {
        ConvError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Creates an unbound descriptor error.
    pub fn unbound<S: Into<String>>(label: S) -> Self {
        ConvError::Unbound(label.into())
    }

    /// Creates a missing conversion error.
    pub fn missing_conversion<S: Into<String>>(label: S) -> Self {
        ConvError::MissingConversion(label.into())
    }

    /// Returns the backend status if this is a backend failure.
    pub fn status(&self) -> Option<Status> {
        match self {
            ConvError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_names_context() {
        let err = ConvError::backend("dnnCreateConvolution(forward)", Status::INCORRECT_INPUT);
        let msg = err.to_string();
        assert!(msg.contains("dnnCreateConvolution(forward)"));
        assert!(msg.contains("-1"));
        assert_eq!(err.status(), Some(Status::INCORRECT_INPUT));
    }

    #[test]
    fn test_shape_mismatch() {
        let err = ConvError::shape_mismatch("bottom", &[2, 3, 8, 8], &[2, 4, 8, 8]);
        let msg = err.to_string();
        assert!(msg.contains("bottom"));
        assert!(msg.contains("[2, 3, 8, 8]"));
        assert!(msg.contains("[2, 4, 8, 8]"));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_config_error_converts() {
        let err: ConvError = ConfigError::InvalidGroup(0).into();
        assert!(err.to_string().contains("Configuration error"));
    }
}
