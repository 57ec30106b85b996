//! `delegate-core`: deferred invocations.
//!
//! A [`DeferredInvocation`] captures "call this registered function with these exact
//! arguments" as a validated, immutable value that can be encoded into a
//! four-field wire record and decoded again in another process.
//!
//! This crate has no queue or batch concerns; see `delegate-jobs` for those.

pub mod call;
pub mod codec;
pub mod error;
pub mod id;
pub mod invocation;
pub mod reference;
pub mod registry;
pub mod signature;

pub use call::{CallArgs, CallContext, NamedArgs};
pub use codec::{SerializedInvocation, decode, decode_value, encode};
pub use error::{InvocationError, InvocationResult, ValidationPhase};
pub use id::{BatchId, JobId, ParseIdError};
pub use invocation::DeferredInvocation;
pub use reference::CallableReference;
pub use registry::{Binding, Handler, Method, Registry};
pub use signature::{ParamKind, Parameter, Signature};

/// Dynamic argument value.
pub use serde_json::Value;
