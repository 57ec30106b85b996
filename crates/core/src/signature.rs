//! Declared parameter contracts of registered callables.
//!
//! Signatures are registered explicitly alongside each callable instead of being
//! discovered at runtime. The shape mirrors what a reflective host would report:
//! an ordered list of `(kind, name)` pairs.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::call::NamedArgs;

/// Kind of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Positional, must be supplied.
    Required,
    /// Positional, may be omitted.
    Optional,
    /// Positional variadic capture.
    Rest,
    /// Named, must be supplied.
    KeyRequired,
    /// Named, may be omitted.
    KeyOptional,
    /// Named variadic capture.
    KeyRest,
}

impl ParamKind {
    pub fn is_named(self) -> bool {
        matches!(
            self,
            ParamKind::KeyRequired | ParamKind::KeyOptional | ParamKind::KeyRest
        )
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub kind: ParamKind,
    pub name: String,
}

/// Ordered parameter list of a callable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    params: Vec<Parameter>,
}

impl Signature {
    /// A signature taking no parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts any positional and any named arguments.
    pub fn variadic() -> Self {
        Self::new().rest("args").key_rest("options")
    }

    pub fn from_params(params: impl IntoIterator<Item = Parameter>) -> Self {
        Self {
            params: params.into_iter().collect(),
        }
    }

    pub fn param(mut self, kind: ParamKind, name: impl Into<String>) -> Self {
        self.params.push(Parameter {
            kind,
            name: name.into(),
        });
        self
    }

    pub fn required(self, name: impl Into<String>) -> Self {
        self.param(ParamKind::Required, name)
    }

    pub fn optional(self, name: impl Into<String>) -> Self {
        self.param(ParamKind::Optional, name)
    }

    pub fn rest(self, name: impl Into<String>) -> Self {
        self.param(ParamKind::Rest, name)
    }

    pub fn key(self, name: impl Into<String>) -> Self {
        self.param(ParamKind::KeyRequired, name)
    }

    pub fn key_optional(self, name: impl Into<String>) -> Self {
        self.param(ParamKind::KeyOptional, name)
    }

    pub fn key_rest(self, name: impl Into<String>) -> Self {
        self.param(ParamKind::KeyRest, name)
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Number of positional parameters that must be supplied.
    pub fn required_positional(&self) -> usize {
        self.count(ParamKind::Required)
    }

    /// Upper bound on positional arguments; `None` when a rest parameter is declared.
    pub fn max_positional(&self) -> Option<usize> {
        if self.has(ParamKind::Rest) {
            return None;
        }
        Some(self.count(ParamKind::Required) + self.count(ParamKind::Optional))
    }

    pub fn required_named(&self) -> impl Iterator<Item = &str> {
        self.named_of(ParamKind::KeyRequired)
    }

    /// Whether `name` may appear among the named arguments.
    pub fn accepts_named(&self, name: &str) -> bool {
        self.has(ParamKind::KeyRest)
            || self
                .params
                .iter()
                .any(|p| matches!(p.kind, ParamKind::KeyRequired | ParamKind::KeyOptional) && p.name == name)
    }

    /// Whether `positional` arguments plus `named` satisfy this signature.
    pub fn accepts(&self, positional: usize, named: &NamedArgs) -> bool {
        if positional < self.required_positional() {
            return false;
        }
        if self.max_positional().is_some_and(|max| positional > max) {
            return false;
        }
        if self.required_named().any(|name| !named.contains_key(name)) {
            return false;
        }
        named.keys().all(|key| self.accepts_named(key))
    }

    fn count(&self, kind: ParamKind) -> usize {
        self.params.iter().filter(|p| p.kind == kind).count()
    }

    fn has(&self, kind: ParamKind) -> bool {
        self.params.iter().any(|p| p.kind == kind)
    }

    fn named_of(&self, kind: ParamKind) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(move |p| p.kind == kind)
            .map(|p| p.name.as_str())
    }
}

/// Renders as `(a, [b], *args, key:, [opt:], **options)`.
impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match p.kind {
                ParamKind::Required => write!(f, "{}", p.name)?,
                ParamKind::Optional => write!(f, "[{}]", p.name)?,
                ParamKind::Rest => write!(f, "*{}", p.name)?,
                ParamKind::KeyRequired => write!(f, "{}:", p.name)?,
                ParamKind::KeyOptional => write!(f, "[{}:]", p.name)?,
                ParamKind::KeyRest => write!(f, "**{}", p.name)?,
            }
        }
        f.write_str(")")
    }
}
