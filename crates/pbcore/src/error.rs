//! Error types for byte channels, the dispatcher, and the refcounted graph.

use thiserror::Error;

/// Errors surfaced by pbcore operations.
///
/// End-of-stream is deliberately *not* an error; byte sources expose it as a
/// separate flag so that a short read and a finished stream stay
/// distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An underlying transport failed. The text comes verbatim from the
    /// concrete source or sink; callers must not interpret it structurally.
    #[error("i/o error: {0}")]
    Io(String),

    /// Bookkeeping allocation failed while preparing a freeze.
    #[error("out of memory")]
    OutOfMemory,

    /// Freeze traversal exceeded the caller-supplied depth bound.
    #[error("freeze exceeded max depth {max}")]
    MaxDepth {
        /// The bound the caller passed to `freeze`.
        max: u32,
    },

    /// Freeze reached more than 2^31 objects.
    #[error("too many reachable objects")]
    TooManyObjects,

    /// A start-submessage would push past the dispatcher's frame capacity.
    #[error("message nesting exceeds {max} frames")]
    NestingTooDeep {
        /// The dispatcher's compile-time frame capacity.
        max: usize,
    },
}

impl Error {
    /// Returns `true` if the failure originates in the input stream rather
    /// than in resource limits (malformed or hostile input).
    #[inline]
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::NestingTooDeep { .. })
    }

    /// Returns `true` if retrying with a larger bound could succeed.
    #[inline]
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::MaxDepth { .. } | Self::TooManyObjects
        )
    }
}
