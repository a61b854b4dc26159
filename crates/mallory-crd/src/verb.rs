//! Operation verbs

use std::fmt;
use std::str::FromStr;

/// Verb of a declared operation
///
/// Kept as a string on the wire; parsed once per dispatch so that an
/// unrecognized verb fails that operation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Idempotent create
    Create,
    /// Delete by name
    Delete,
    /// Fetch one object as JSON
    Get,
    /// Names of objects matching the document's labels
    List,
    /// Full replace
    Update,
    /// Run the first container's command in a matching pod
    Exec,
    /// Self subject access review
    Auth,
    /// Tail the log of a matching pod
    Logs,
}

/// Verb string outside the supported vocabulary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported verb: {0}")]
pub struct UnknownVerb(pub String);

impl Verb {
    /// Every supported verb, in declaration order
    pub const ALL: [Verb; 8] = [
        Verb::Create,
        Verb::Delete,
        Verb::Get,
        Verb::List,
        Verb::Update,
        Verb::Exec,
        Verb::Auth,
        Verb::Logs,
    ];

    /// Wire form of the verb
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Delete => "delete",
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Update => "update",
            Verb::Exec => "exec",
            Verb::Auth => "auth",
            Verb::Logs => "logs",
        }
    }

    /// Whether cleanup reverses this verb on deletion
    #[inline]
    #[must_use]
    pub fn is_reversible(self) -> bool {
        matches!(self, Verb::Create)
    }
}

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| UnknownVerb(s.to_string()))
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_wire_form() {
        for verb in Verb::ALL {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), verb);
        }
    }

    #[test]
    fn unknown_verb_keeps_literal() {
        let err = "patch".parse::<Verb>().unwrap_err();
        assert_eq!(err, UnknownVerb("patch".to_string()));
        assert_eq!(err.to_string(), "unsupported verb: patch");
    }

    #[test]
    fn verbs_are_case_sensitive() {
        assert!("Create".parse::<Verb>().is_err());
    }

    #[test]
    fn only_create_is_reversible() {
        let reversible: Vec<_> = Verb::ALL.into_iter().filter(|v| v.is_reversible()).collect();
        assert_eq!(reversible, vec![Verb::Create]);
    }
}
