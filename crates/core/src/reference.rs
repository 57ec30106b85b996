//! Callable references: a container name plus a function name.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InvocationError;

/// Names a statically addressable function, e.g. `Reports.rebuild`.
///
/// A reference is only a name. It is resolved against a
/// [`Registry`](crate::registry::Registry) whenever a handle is needed, so nothing
/// process-local ever travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallableReference {
    container: String,
    function: String,
}

impl CallableReference {
    pub fn new(container: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            function: function.into(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn function(&self) -> &str {
        &self.function
    }
}

impl fmt::Display for CallableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.container, self.function)
    }
}

impl FromStr for CallableReference {
    type Err = InvocationError;

    /// Parses `Container.function`. The split happens on the last `.`, so
    /// containers may themselves be dotted paths.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((container, function)) if !container.is_empty() && !function.is_empty() => {
                Ok(Self::new(container, function))
            }
            _ => Err(InvocationError::reference(
                s,
                "expected the form Container.function",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders() {
        let r: CallableReference = "billing.Invoices.close".parse().unwrap();
        assert_eq!(r.container(), "billing.Invoices");
        assert_eq!(r.function(), "close");
        assert_eq!(r.to_string(), "billing.Invoices.close");
    }

    #[test]
    fn rejects_missing_parts() {
        for bad in ["", "Reports", ".rebuild", "Reports."] {
            assert!(matches!(
                bad.parse::<CallableReference>(),
                Err(InvocationError::Reference { .. })
            ));
        }
    }
}
