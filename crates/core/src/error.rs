//! Invocation error model.

use core::fmt;

use thiserror::Error;

/// Result type used across the invocation layer.
pub type InvocationResult<T> = Result<T, InvocationError>;

/// Where a signature check ran.
///
/// A mismatch at `Bind` is an authoring mistake surfaced to the caller building the
/// invocation. A mismatch at `Decode` means the callable's signature changed between
/// enqueue and execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationPhase {
    Bind,
    Decode,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPhase::Bind => f.write_str("bind"),
            ValidationPhase::Decode => f.write_str("decode"),
        }
    }
}

/// Invocation-level error.
///
/// Every variant describes a defect in how an invocation was put together, never a
/// transient runtime condition. Retrying a job that failed with one of these cannot
/// succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// Arguments do not satisfy the callable's declared parameters.
    #[error(
        "deferred invocation arguments don't match the signature of the source function \
         {signature} (at {phase}) (NOTE: named arguments must be passed as the structured \
         named-argument map; trailing maps are never reinterpreted)"
    )]
    SignatureMismatch {
        signature: String,
        phase: ValidationPhase,
    },

    /// The reference does not resolve, or resolves to an instance-bound callable.
    #[error("invalid reference {reference}: {reason}")]
    Reference { reference: String, reason: String },

    /// A serialized invocation is structurally invalid.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl InvocationError {
    pub fn signature_mismatch(signature: impl Into<String>, phase: ValidationPhase) -> Self {
        Self::SignatureMismatch {
            signature: signature.into(),
            phase,
        }
    }

    pub fn reference(reference: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Reference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    /// Short, stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::SignatureMismatch { .. } => "signature_mismatch",
            InvocationError::Reference { .. } => "reference",
            InvocationError::MalformedPayload(_) => "malformed_payload",
        }
    }

    /// The phase of a signature mismatch, if this is one.
    pub fn phase(&self) -> Option<ValidationPhase> {
        match self {
            InvocationError::SignatureMismatch { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
