//! Branch references, the server-wide default branch, and per-connection sessions.
//!
//! Every connection owns exactly one [`Session`]. The session's active branch
//! is a copy of the [`DefaultBranch`] taken when the connection opened; later
//! changes to the default are only seen by connections opened afterwards.

use parking_lot::RwLock;
use std::fmt;
use thiserror::Error;

/// Prefix accepted in front of branch names (`refs/heads/main` == `main`).
const HEADS_PREFIX: &str = "refs/heads/";

/// Identifier assigned to each accepted connection.
pub type ConnectionId = u32;

/// A malformed branch reference.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid branch name '{name}': {reason}")]
pub struct InvalidBranchRef {
    /// The rejected input.
    pub name: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// A validated branch name or commit identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchRef(String);

impl BranchRef {
    /// Parses and normalizes a branch reference.
    ///
    /// A leading `refs/heads/` is stripped.
    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidBranchRef> {
        let raw = name.as_ref();
        let name = raw.strip_prefix(HEADS_PREFIX).unwrap_or(raw);

        let reject = |reason| {
            Err(InvalidBranchRef {
                name: raw.to_string(),
                reason,
            })
        };

        if name.is_empty() {
            return reject("must not be empty");
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return reject("must not contain whitespace or control characters");
        }
        if name.starts_with('-') {
            return reject("must not start with '-'");
        }
        if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return reject("must not have empty path components");
        }
        if name.contains("..") {
            return reject("must not contain '..'");
        }
        if name.ends_with(".lock") {
            return reject("must not end with '.lock'");
        }
        if name.chars().any(|c| matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\')) {
            return reject("contains a reserved character");
        }

        Ok(Self(name.to_string()))
    }

    /// The branch every new store starts with.
    pub fn main() -> Self {
        Self(String::from("main"))
    }

    /// Returns the normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BranchRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The server-wide default branch.
///
/// Read by every connection at open time, replaced by
/// `SET GLOBAL default_branch`. Readers always see a whole value.
#[derive(Debug)]
pub struct DefaultBranch {
    current: RwLock<BranchRef>,
}

impl DefaultBranch {
    /// Creates the cell with an initial branch.
    pub fn new(initial: BranchRef) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Returns a snapshot of the current default.
    pub fn get(&self) -> BranchRef {
        self.current.read().clone()
    }

    /// Replaces the default, returning the previous one.
    pub fn set(&self, branch: BranchRef) -> BranchRef {
        std::mem::replace(&mut *self.current.write(), branch)
    }
}

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct Session {
    id: ConnectionId,
    user: String,
    active: BranchRef,
}

impl Session {
    /// Opens a session on whatever branch is the default right now.
    pub fn open(id: ConnectionId, user: impl Into<String>, default: &DefaultBranch) -> Self {
        Self {
            id,
            user: user.into(),
            active: default.get(),
        }
    }

    /// Returns the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the authenticated user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the branch statements on this connection currently run against.
    pub fn active_branch(&self) -> &BranchRef {
        &self.active
    }

    /// Switches this connection to `branch`, returning the previous one.
    pub fn checkout(&mut self, branch: BranchRef) -> BranchRef {
        std::mem::replace(&mut self.active, branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str) -> BranchRef {
        BranchRef::new(name).unwrap()
    }

    #[test]
    fn refs_heads_prefix_is_stripped() {
        assert_eq!(branch("refs/heads/new"), branch("new"));
        assert_eq!(branch("refs/heads/feature/x").as_str(), "feature/x");
    }

    #[test]
    fn malformed_refs_rejected() {
        for bad in [
            "", "refs/heads/", "-b", "has space", "a..b", "/lead", "trail/", "a//b", "x.lock",
            "what?", "tab\there",
        ] {
            assert!(BranchRef::new(bad).is_err(), "{bad:?} should be rejected");
        }
        let err = BranchRef::new("a..b").unwrap_err();
        assert_eq!(err.name, "a..b");
        assert!(err.to_string().contains("'..'"));
    }

    #[test]
    fn default_branch_set_returns_previous() {
        let default = DefaultBranch::new(branch("main"));
        let previous = default.set(branch("dev"));
        assert_eq!(previous, branch("main"));
        assert_eq!(default.get(), branch("dev"));
    }

    #[test]
    fn sessions_snapshot_default_at_open() {
        let default = DefaultBranch::new(branch("main"));
        let early = Session::open(1, "root", &default);

        default.set(branch("new"));
        let late = Session::open(2, "root", &default);

        assert_eq!(early.active_branch(), &branch("main"));
        assert_eq!(late.active_branch(), &branch("new"));
    }

    #[test]
    fn checkout_is_local_to_session() {
        let default = DefaultBranch::new(branch("main"));
        let mut first = Session::open(1, "root", &default);
        let second = Session::open(2, "root", &default);

        let previous = first.checkout(branch("feature"));

        assert_eq!(previous, branch("main"));
        assert_eq!(first.active_branch(), &branch("feature"));
        assert_eq!(second.active_branch(), &branch("main"));
        assert_eq!(default.get(), branch("main"));
    }

    #[test]
    fn concurrent_default_updates_are_whole_values() {
        use std::sync::Arc;

        let default = Arc::new(DefaultBranch::new(branch("main")));
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let default = Arc::clone(&default);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        default.set(branch(&format!("w{i}-{j}")));
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let seen = Session::open(0, "root", &default);
            let name = seen.active_branch().as_str();
            assert!(name == "main" || name.starts_with('w'));
        }
        for writer in writers {
            writer.join().unwrap();
        }
    }
}
