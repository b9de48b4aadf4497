use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of actor. A tag discriminant, not a subtype hierarchy: workers and
/// agents are the same shape with different tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Creates tasks and consumes their results.
    Agent,
    /// Claims leases and executes tasks.
    Worker,
    /// The engine itself and other trusted infrastructure.
    System,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Worker => write!(f, "worker"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for PrincipalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "worker" => Ok(Self::Worker),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid principal kind: {s}")),
        }
    }
}

/// An actor identity: author or addressee of receipts, creator or claimant
/// of tasks. Flattened to `(kind, id)` columns in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Principal {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Agent,
            id: id.into(),
        }
    }

    pub fn worker(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Worker,
            id: id.into(),
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::System,
            id: id.into(),
        }
    }

    /// The engine's own identity, used as author of lifecycle receipts.
    pub fn asyncgate() -> Self {
        Self::system("asyncgate")
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_string_round_trip() {
        assert_eq!(PrincipalKind::Worker.to_string(), "worker");
        assert_eq!("agent".parse::<PrincipalKind>().unwrap(), PrincipalKind::Agent);
        assert!("robot".parse::<PrincipalKind>().is_err());
    }

    #[test]
    fn principal_equality_is_kind_and_id() {
        assert_eq!(Principal::agent("a1"), Principal::agent("a1"));
        assert_ne!(Principal::agent("a1"), Principal::worker("a1"));
    }
}
