//! Call shapes and the explicit call context handed to every callable.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::id::BatchId;

/// Named arguments, keyed by parameter name.
pub type NamedArgs = BTreeMap<String, Value>;

/// The arguments a callable receives, in the shape it was called with.
///
/// The three shapes are not interchangeable: a callable may accept named arguments
/// alone but reject an empty positional list next to them, or the reverse.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgs {
    Positional(Vec<Value>),
    Named(NamedArgs),
    Both { args: Vec<Value>, named: NamedArgs },
}

impl CallArgs {
    pub fn positional(&self) -> &[Value] {
        match self {
            CallArgs::Positional(args) | CallArgs::Both { args, .. } => args,
            CallArgs::Named(_) => &[],
        }
    }

    pub fn named(&self) -> Option<&NamedArgs> {
        match self {
            CallArgs::Named(named) | CallArgs::Both { named, .. } => Some(named),
            CallArgs::Positional(_) => None,
        }
    }

    /// Positional argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional().get(index)
    }

    /// Named argument `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named().and_then(|named| named.get(name))
    }
}

/// Context a callable runs in.
///
/// Carries the active batch explicitly. Anything a callable enqueues through this
/// context joins that batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    batch: Option<BatchId>,
}

impl CallContext {
    /// No active batch.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn in_batch(batch: BatchId) -> Self {
        Self { batch: Some(batch) }
    }

    pub fn batch(&self) -> Option<BatchId> {
        self.batch
    }
}
