//! shardr error types

use numr::dtype::DType;

use crate::handle::HandleState;

/// shardr result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr tensor interop
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid construction-time configuration (wrap policy, groups, config values)
    #[error("configuration error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// Parameters within one group disagree on dtype
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Dtype has no flat buffer representation
    #[error("unsupported dtype for flat buffers: {dtype}")]
    UnsupportedDType {
        /// The offending dtype
        dtype: DType,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Collective failure: timeout, transport error or call mismatch.
    ///
    /// Fatal to the in-flight step. Never retried, since all ranks would need
    /// to re-synchronize from an unknown state.
    #[error("communication failure in {op}: {reason}")]
    Communication {
        /// Collective that failed
        op: &'static str,
        /// Description of what went wrong
        reason: String,
    },

    /// State dict does not match this module; raised before any buffer is mutated
    #[error("state dict error: {reason}")]
    StateDict {
        /// Description of what went wrong
        reason: String,
    },

    /// Illegal unshard/reshard transition
    #[error("group {group} is {actual:?}, expected {expected:?}")]
    InvalidState {
        /// Group index
        group: usize,
        /// State required by the operation
        expected: HandleState,
        /// State the group was in
        actual: HandleState,
    },

    /// Full-size buffers could not be released while unwinding a failed step
    #[error("resource leak: {reason}")]
    ResourceLeak {
        /// Description of what went wrong
        reason: String,
    },

    /// Checkpoint IO or serialization error
    #[error("checkpoint error: {reason}")]
    Checkpoint {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    /// Build a [`Error::Communication`] from any displayable transport error.
    pub(crate) fn comm(op: &'static str, reason: impl std::fmt::Display) -> Self {
        Error::Communication {
            op,
            reason: reason.to_string(),
        }
    }

    /// True for errors raised by the transport rather than by compute or config.
    pub fn is_communication(&self) -> bool {
        matches!(self, Error::Communication { .. })
    }
}
