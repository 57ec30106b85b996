//! Wire form of deferred invocations.
//!
//! The four-field record is the only contract between the enqueuing side and the
//! executing side:
//!
//! ```json
//! { "receiver": "Reports", "name": "rebuild", "args": [42], "named_args": {"force": true} }
//! ```
//!
//! Decoding never trusts the record: the reference is resolved again and the
//! arguments are re-validated against the signature registered *now*.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::call::NamedArgs;
use crate::error::{InvocationError, InvocationResult, ValidationPhase};
use crate::invocation::DeferredInvocation;
use crate::reference::CallableReference;
use crate::registry::Registry;

/// Keys of the wire record, in canonical order.
pub const WIRE_KEYS: [&str; 4] = ["receiver", "name", "args", "named_args"];

/// Flat, transport-safe record of a [`DeferredInvocation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerializedInvocation {
    pub receiver: String,
    pub name: String,
    pub args: Vec<Value>,
    pub named_args: NamedArgs,
}

impl SerializedInvocation {
    pub fn to_value(&self) -> Value {
        let named: Map<String, Value> = self
            .named_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut record = Map::new();
        record.insert("receiver".into(), Value::String(self.receiver.clone()));
        record.insert("name".into(), Value::String(self.name.clone()));
        record.insert("args".into(), Value::Array(self.args.clone()));
        record.insert("named_args".into(), Value::Object(named));
        Value::Object(record)
    }

    pub fn reference(&self) -> CallableReference {
        CallableReference::new(self.receiver.clone(), self.name.clone())
    }
}

impl From<&DeferredInvocation> for SerializedInvocation {
    fn from(invocation: &DeferredInvocation) -> Self {
        encode(invocation)
    }
}

/// Flatten an invocation into its wire record.
pub fn encode(invocation: &DeferredInvocation) -> SerializedInvocation {
    let reference = invocation.reference();
    SerializedInvocation {
        receiver: reference.container().to_string(),
        name: reference.function().to_string(),
        args: invocation.args().to_vec(),
        named_args: invocation.named_args().clone(),
    }
}

/// Rebuild an invocation from its wire record.
///
/// The receiver must name a type-level callable, and the arguments must still satisfy
/// its signature; a mismatch is reported with [`ValidationPhase::Decode`].
pub fn decode(
    registry: &Registry,
    serialized: SerializedInvocation,
) -> InvocationResult<DeferredInvocation> {
    let reference = serialized.reference();
    registry
        .type_method(&reference)?
        .bind_at(serialized.args, serialized.named_args, ValidationPhase::Decode)
}

/// Decode a raw job payload.
///
/// Anything other than a JSON object holding exactly the four wire keys, with the
/// right shapes, is a [`InvocationError::MalformedPayload`].
pub fn decode_value(registry: &Registry, payload: &Value) -> InvocationResult<DeferredInvocation> {
    let Some(record) = payload.as_object() else {
        return Err(InvocationError::malformed(
            "enqueued delegate must be a structured mapping",
        ));
    };

    if let Some(missing) = WIRE_KEYS.iter().find(|key| !record.contains_key(**key)) {
        return Err(InvocationError::malformed(format!("missing key `{missing}`")));
    }
    if let Some(extra) = record.keys().find(|key| !WIRE_KEYS.contains(&key.as_str())) {
        return Err(InvocationError::malformed(format!("unexpected key `{extra}`")));
    }

    let serialized: SerializedInvocation = serde_json::from_value(payload.clone())
        .map_err(|e| InvocationError::malformed(e.to_string()))?;
    decode(registry, serialized)
}
