//! Callable registry: the symbol table and signature inspector.
//!
//! Every function that may be the target of a deferred invocation is registered
//! once (usually at startup) with its [`Signature`] and a handler. Workers resolve
//! references against the same registrations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::call::{CallArgs, CallContext, NamedArgs};
use crate::error::{InvocationError, InvocationResult, ValidationPhase};
use crate::invocation::DeferredInvocation;
use crate::reference::CallableReference;
use crate::signature::Signature;

/// Handler invoked for a registered callable.
pub type Handler = Arc<dyn Fn(CallArgs, &CallContext) -> anyhow::Result<Value> + Send + Sync>;

/// What a callable is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Type-level (static) function; addressable from any process.
    Type,
    /// Bound to one specific receiver; cannot be re-derived elsewhere.
    Instance,
}

struct Entry {
    reference: CallableReference,
    binding: Binding,
    signature: Signature,
    handler: Handler,
}

/// A resolved, invokable callable.
#[derive(Clone)]
pub struct Method {
    entry: Arc<Entry>,
}

impl Method {
    pub fn reference(&self) -> &CallableReference {
        &self.entry.reference
    }

    pub fn binding(&self) -> Binding {
        self.entry.binding
    }

    pub fn signature(&self) -> &Signature {
        &self.entry.signature
    }

    pub fn is_type_level(&self) -> bool {
        self.entry.binding == Binding::Type
    }

    /// Human-readable signature, e.g. `Reports.rebuild(id, [force:])`.
    pub fn describe(&self) -> String {
        format!("{}{}", self.entry.reference, self.entry.signature)
    }

    /// Capture this callable with arguments, validating them against its signature.
    pub fn with_args(
        &self,
        args: Vec<Value>,
        named_args: NamedArgs,
    ) -> InvocationResult<DeferredInvocation> {
        self.bind_at(args, named_args, ValidationPhase::Bind)
    }

    pub(crate) fn bind_at(
        &self,
        args: Vec<Value>,
        named_args: NamedArgs,
        phase: ValidationPhase,
    ) -> InvocationResult<DeferredInvocation> {
        if !self.entry.signature.accepts(args.len(), &named_args) {
            return Err(InvocationError::signature_mismatch(self.describe(), phase));
        }
        Ok(DeferredInvocation::from_validated(
            self.entry.reference.clone(),
            args,
            named_args,
        ))
    }

    /// Invoke the handler directly with an already-shaped argument list.
    pub fn call(&self, args: CallArgs, ctx: &CallContext) -> anyhow::Result<Value> {
        (self.entry.handler)(args, ctx)
    }
}

impl PartialEq for Method {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
            || (self.entry.reference == other.entry.reference
                && self.entry.binding == other.entry.binding
                && self.entry.signature == other.entry.signature)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("reference", &self.entry.reference)
            .field("binding", &self.entry.binding)
            .field("signature", &self.entry.signature)
            .finish_non_exhaustive()
    }
}

/// Registry of callables, shared by enqueuing code and workers.
///
/// Cloning is cheap; clones share the same registrations.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<CallableReference, Method>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type-level callable. Re-registering a reference replaces it.
    pub fn define<F>(
        &self,
        container: impl Into<String>,
        function: impl Into<String>,
        signature: Signature,
        handler: F,
    ) -> Method
    where
        F: Fn(CallArgs, &CallContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(
            CallableReference::new(container, function),
            Binding::Type,
            signature,
            Arc::new(handler),
        )
    }

    /// Register a callable bound to one receiver (`receiver` names it, e.g. `Report#42`).
    ///
    /// Such callables can be captured and called in-process but never enqueued.
    pub fn define_instance<F>(
        &self,
        receiver: impl Into<String>,
        function: impl Into<String>,
        signature: Signature,
        handler: F,
    ) -> Method
    where
        F: Fn(CallArgs, &CallContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(
            CallableReference::new(receiver, function),
            Binding::Instance,
            signature,
            Arc::new(handler),
        )
    }

    fn insert(
        &self,
        reference: CallableReference,
        binding: Binding,
        signature: Signature,
        handler: Handler,
    ) -> Method {
        debug!(reference = %reference, ?binding, signature = %signature, "registered callable");
        let method = Method {
            entry: Arc::new(Entry {
                reference: reference.clone(),
                binding,
                signature,
                handler,
            }),
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference, method.clone());
        method
    }

    /// Remove a registration.
    pub fn remove(&self, reference: &CallableReference) -> Option<Method> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference)
    }

    /// Resolve a reference to its callable, whatever it is bound to.
    pub fn method(&self, reference: &CallableReference) -> InvocationResult<Method> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| InvocationError::reference(reference, "no such callable is registered"))
    }

    /// Resolve a reference that must name a type-level callable.
    pub fn type_method(&self, reference: &CallableReference) -> InvocationResult<Method> {
        let method = self.method(reference)?;
        if !method.is_type_level() {
            return Err(InvocationError::reference(
                reference,
                "delegate must be a type-level function, not bound to an instance",
            ));
        }
        Ok(method)
    }

    /// Signature inspector: the declared parameters of `reference`.
    pub fn parameters_of(&self, reference: &CallableReference) -> InvocationResult<Signature> {
        self.method(reference).map(|m| m.signature().clone())
    }

    pub fn contains(&self, reference: &CallableReference) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut refs: Vec<_> = guard.keys().map(ToString::to_string).collect();
        refs.sort();
        f.debug_struct("Registry").field("callables", &refs).finish()
    }
}
