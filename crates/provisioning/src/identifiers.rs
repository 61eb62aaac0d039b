//! Newtype domain identifiers.
//!
//! Every name that crosses the REST boundary is a distinct newtype wrapping a
//! primitive, so a [`BranchName`] cannot be passed where a [`RepoName`] is
//! expected even though both are strings under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or only whitespace.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (remote / Git names)
// ---------------------------------------------------------------------------

string_id! {
    /// The name of a remote repository, unique within its owner
    /// ignoring ASCII case (e.g. `"foo_app.svc"`).
    RepoName
}

string_id! {
    /// The login of the user or organization that owns the repositories.
    OwnerName
}

string_id! {
    /// A Git branch name (e.g. `"main"`, `"dev-integ"`).
    BranchName
}

string_id! {
    /// A Git commit SHA as reported by the remote.
    CommitSha
}

string_id! {
    /// A project whose repositories are provisioned together as one bundle.
    ProjectName
}

impl RepoName {
    /// The name lowercased, for comparisons the remote makes
    /// case-insensitively.
    pub fn folded(&self) -> Self {
        Self(self.0.to_ascii_lowercase())
    }
}

impl BranchName {
    /// The conventional default branch, `"main"`.
    pub fn main() -> Self {
        Self("main".to_string())
    }

    /// Returns the fully-qualified reference for this branch
    /// (e.g. `"refs/heads/main"`).
    pub fn to_ref(&self) -> String {
        format!("refs/heads/{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: integer-backed
// ---------------------------------------------------------------------------

/// The sequence number of a [`crate::SchedulingContext`] among its siblings.
///
/// Root contexts are numbered process-wide; child contexts are numbered in
/// the order their parent spawned them, starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Creates a new identifier from a raw integer.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying integer value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single call to [`crate::ProvisioningSupervisor::provision`].
///
/// Generated fresh for every batch and attached to every log record the
/// supervisor emits, so all activity from one run can be correlated across
/// log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRunId(Uuid);

impl BatchRunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`BatchRunId`] from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for BatchRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_reject_blank_values() {
        assert!(RepoName::new("").is_none());
        assert!(RepoName::new("   ").is_none());
        assert_eq!(RepoName::new("alpha").unwrap().as_str(), "alpha");
    }

    #[test]
    fn folded_repo_names_ignore_ascii_case() {
        let mixed = RepoName::new("Foo_App.Svc").unwrap();
        assert_eq!(mixed.folded(), RepoName::new("foo_app.svc").unwrap());
        assert_eq!(mixed.as_str(), "Foo_App.Svc");
    }

    #[test]
    fn branch_name_renders_full_ref() {
        let branch = BranchName::new("dev-integ").unwrap();
        assert_eq!(branch.to_ref(), "refs/heads/dev-integ");
    }
}
