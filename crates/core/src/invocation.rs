//! Deferred invocations: a callable reference captured with validated arguments.

use core::fmt;

use serde_json::Value;

use crate::call::{CallArgs, CallContext, NamedArgs};
use crate::error::InvocationResult;
use crate::reference::CallableReference;
use crate::registry::{Method, Registry};

/// "Call this function with these exact arguments", captured as a value.
///
/// The only ways to obtain one ([`DeferredInvocation::bind`], [`Method::with_args`]
/// and [`crate::codec::decode`]) validate the arguments against the callable's
/// signature, and the fields cannot be changed afterwards. Any instance in hand is
/// therefore known to match the signature it was checked against.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredInvocation {
    reference: CallableReference,
    args: Vec<Value>,
    named_args: NamedArgs,
}

impl DeferredInvocation {
    /// Resolve `reference` and capture it with the given arguments.
    pub fn bind(
        registry: &Registry,
        reference: CallableReference,
        args: Vec<Value>,
        named_args: NamedArgs,
    ) -> InvocationResult<Self> {
        registry.method(&reference)?.with_args(args, named_args)
    }

    pub(crate) fn from_validated(
        reference: CallableReference,
        args: Vec<Value>,
        named_args: NamedArgs,
    ) -> Self {
        Self {
            reference,
            args,
            named_args,
        }
    }

    pub fn reference(&self) -> &CallableReference {
        &self.reference
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn named_args(&self) -> &NamedArgs {
        &self.named_args
    }

    /// The callable this invocation was derived from.
    pub fn source(&self, registry: &Registry) -> InvocationResult<Method> {
        registry.method(&self.reference)
    }

    /// Shape the captured arguments for the call.
    ///
    /// Both lists non-empty → both are passed; no positional arguments → named only
    /// (even when that map is empty); otherwise positional only.
    pub fn call_args(&self) -> CallArgs {
        if !self.args.is_empty() && !self.named_args.is_empty() {
            CallArgs::Both {
                args: self.args.clone(),
                named: self.named_args.clone(),
            }
        } else if self.args.is_empty() {
            CallArgs::Named(self.named_args.clone())
        } else {
            CallArgs::Positional(self.args.clone())
        }
    }

    /// Invoke the captured callable. Handler failures are returned unchanged.
    pub fn call(&self, registry: &Registry, ctx: &CallContext) -> anyhow::Result<Value> {
        let method = self.source(registry)?;
        method.call(self.call_args(), ctx)
    }
}

impl fmt::Display for DeferredInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<DeferredInvocation: {} args: [", self.reference)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str("] named_args: {")?;
        for (i, (key, value)) in self.named_args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str("}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::error::{InvocationError, ValidationPhase};
    use crate::signature::Signature;

    fn named(pairs: &[(&str, Value)]) -> NamedArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Registers `Recorder.run` with `signature`, recording every call shape it receives.
    fn recording(signature: Signature) -> (Registry, Arc<Mutex<Vec<CallArgs>>>) {
        let registry = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.define("Recorder", "run", signature, move |args, _| {
            sink.lock().unwrap().push(args);
            Ok(json!("ran"))
        });
        (registry, seen)
    }

    fn reference() -> CallableReference {
        CallableReference::new("Recorder", "run")
    }

    #[test]
    fn positional_arity_is_enforced() {
        let (registry, _) = recording(Signature::new().required("a").required("b").required("c"));

        let two = DeferredInvocation::bind(&registry, reference(), vec![json!(1), json!(2)], NamedArgs::new());
        let three = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![json!(1), json!(2), json!(3)],
            NamedArgs::new(),
        );
        let four = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![json!(1), json!(2), json!(3), json!(4)],
            NamedArgs::new(),
        );

        assert!(matches!(
            two,
            Err(InvocationError::SignatureMismatch { phase: ValidationPhase::Bind, .. })
        ));
        assert_eq!(three.unwrap().args(), &[json!(1), json!(2), json!(3)]);
        assert!(four.is_err());
    }

    #[test]
    fn named_parameters_must_be_complete_and_known() {
        let (registry, _) = recording(Signature::new().key("a").key("b").key_optional("c"));

        let missing = DeferredInvocation::bind(&registry, reference(), vec![], named(&[("a", json!(1))]));
        let unknown = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![],
            named(&[("a", json!(1)), ("b", json!(2)), ("d", json!(3))]),
        );
        let ok = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![],
            named(&[("a", json!(1)), ("b", json!(2))]),
        );

        assert!(missing.is_err());
        assert!(unknown.is_err());
        assert_eq!(ok.unwrap().named_args().len(), 2);
    }

    #[test]
    fn mixed_required_positional_and_named() {
        let (registry, _) = recording(
            Signature::new()
                .required("arg1")
                .required("arg2")
                .key("arg3")
                .key("arg4"),
        );

        let err = DeferredInvocation::bind(&registry, reference(), vec![json!(1)], named(&[("arg4", json!(4))]))
            .unwrap_err();
        assert!(err.to_string().contains("Recorder.run(arg1, arg2, arg3:, arg4:)"));

        let ok = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![json!(1), json!(2)],
            named(&[("arg3", json!(3)), ("arg4", json!(4))]),
        )
        .unwrap();
        assert_eq!(ok.args(), &[json!(1), json!(2)]);
    }

    #[test]
    fn trailing_map_is_not_treated_as_named_arguments() {
        let (registry, _) = recording(Signature::new().required("id").key("force"));

        let err = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![json!(7), json!({"force": true})],
            NamedArgs::new(),
        )
        .unwrap_err();

        assert!(err.to_string().contains("trailing maps are never reinterpreted"));
    }

    #[test]
    fn variadic_callable_accepts_nothing_and_everything() {
        let (registry, _) = recording(Signature::variadic());

        let empty = DeferredInvocation::bind(&registry, reference(), vec![], NamedArgs::new()).unwrap();
        assert!(empty.args().is_empty());
        assert!(empty.named_args().is_empty());

        let mixed = DeferredInvocation::bind(
            &registry,
            reference(),
            vec![json!(1), json!("two")],
            named(&[("arg3", json!(3)), ("arg4", json!(4))]),
        )
        .unwrap();
        assert_eq!(mixed.args().len(), 2);
    }

    #[test]
    fn unregistered_reference_cannot_be_bound() {
        let registry = Registry::new();
        let err = DeferredInvocation::bind(&registry, reference(), vec![], NamedArgs::new()).unwrap_err();
        assert!(matches!(err, InvocationError::Reference { .. }));
    }

    #[test]
    fn call_uses_positional_shape_when_named_is_empty() {
        let (registry, seen) = recording(Signature::variadic());
        let inv = DeferredInvocation::bind(&registry, reference(), vec![json!(1)], NamedArgs::new()).unwrap();

        assert_eq!(inv.call(&registry, &CallContext::detached()).unwrap(), json!("ran"));
        assert_eq!(seen.lock().unwrap()[0], CallArgs::Positional(vec![json!(1)]));
    }

    #[test]
    fn call_uses_named_shape_when_positional_is_empty() {
        let (registry, seen) = recording(Signature::variadic());

        let inv = DeferredInvocation::bind(&registry, reference(), vec![], named(&[("k", json!(true))])).unwrap();
        inv.call(&registry, &CallContext::detached()).unwrap();
        let nothing = DeferredInvocation::bind(&registry, reference(), vec![], NamedArgs::new()).unwrap();
        nothing.call(&registry, &CallContext::detached()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], CallArgs::Named(named(&[("k", json!(true))])));
        assert_eq!(seen[1], CallArgs::Named(NamedArgs::new()));
    }

    #[test]
    fn call_uses_combined_shape_when_both_are_present() {
        let (registry, seen) = recording(Signature::variadic());
        let inv = DeferredInvocation::bind(&registry, reference(), vec![json!(1)], named(&[("k", json!(2))])).unwrap();

        inv.call(&registry, &CallContext::detached()).unwrap();
        assert_eq!(
            seen.lock().unwrap()[0],
            CallArgs::Both {
                args: vec![json!(1)],
                named: named(&[("k", json!(2))]),
            }
        );
    }

    #[test]
    fn handler_errors_pass_through() {
        let registry = Registry::new();
        registry.define("Boom", "go", Signature::new(), |_, _| anyhow::bail!("kaboom"));

        let inv = DeferredInvocation::bind(&registry, CallableReference::new("Boom", "go"), vec![], NamedArgs::new())
            .unwrap();
        let err = inv.call(&registry, &CallContext::detached()).unwrap_err();
        assert_eq!(err.to_string(), "kaboom");
    }

    #[test]
    fn equality_covers_reference_and_arguments() {
        let (registry, _) = recording(Signature::variadic());
        let a = DeferredInvocation::bind(&registry, reference(), vec![json!(1)], named(&[("k", json!(2))])).unwrap();
        let b = DeferredInvocation::bind(&registry, reference(), vec![json!(1)], named(&[("k", json!(2))])).unwrap();
        let c = DeferredInvocation::bind(&registry, reference(), vec![json!(2)], named(&[("k", json!(2))])).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.source(&registry).unwrap().reference(), &reference());
    }

    #[test]
    fn display_lists_arguments() {
        let (registry, _) = recording(Signature::variadic());
        let inv = DeferredInvocation::bind(&registry, reference(), vec![json!(1), json!("x")], named(&[("k", json!(2))]))
            .unwrap();

        assert_eq!(
            inv.to_string(),
            r#"#<DeferredInvocation: Recorder.run args: [1, "x"] named_args: {k: 2}>"#
        );
    }
}
