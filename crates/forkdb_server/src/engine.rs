//! Seams to the query engine and the versioned store.
//!
//! Both collaborators are opaque to the server: the store answers questions
//! about branches and commits, the engine turns SQL text plus a branch into
//! rows. In-memory implementations are provided for tests and for running the
//! server without a storage backend.

use crate::error::StatementError;
use crate::session::{BranchRef, ConnectionId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything the query engine learns about the statement's origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementContext {
    /// Connection the statement arrived on.
    pub connection_id: ConnectionId,
    /// Authenticated user.
    pub user: String,
    /// Branch the connection had checked out when the statement began.
    pub branch: BranchRef,
    /// Whether the server rejects writes.
    pub read_only: bool,
}

/// Rows produced by a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column names (empty for statements without a result set).
    pub columns: Vec<String>,
    /// Row values, one `Vec` per row.
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    /// A result with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A one-column, one-row result.
    pub fn single(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            columns: vec![column.into()],
            rows: vec![vec![value.into()]],
        }
    }

    /// Returns the number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// The relational query engine.
///
/// Called on a blocking thread; implementations may block.
pub trait QueryEngine: Send + Sync {
    /// Executes one statement against `ctx.branch`.
    fn execute(&self, ctx: &StatementContext, sql: &str) -> Result<QueryResult, StatementError>;
}

/// The versioned store, as far as the server needs to see it.
pub trait BranchStore: Send + Sync {
    /// Branch new servers start on when no default is configured.
    fn initial_branch(&self) -> BranchRef;

    /// Returns true if `reference` names an existing branch or commit.
    fn contains(&self, reference: &BranchRef) -> bool;

    /// Creates branch `name` pointing where `start_point` points.
    fn create_branch(&self, name: &BranchRef, start_point: &BranchRef)
        -> Result<(), StatementError>;

    /// Lists branch names.
    fn branches(&self) -> Vec<BranchRef>;
}

/// A query engine that accepts nothing.
///
/// Leaves only the server's own branch statements usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedEngine;

impl QueryEngine for UnsupportedEngine {
    fn execute(&self, _ctx: &StatementContext, sql: &str) -> Result<QueryResult, StatementError> {
        Err(StatementError::Unsupported(sql.to_string()))
    }
}

/// In-memory branch store.
///
/// Branches map to commit ids; commit ids are minted sequentially and are
/// themselves valid checkout targets.
#[derive(Debug)]
pub struct MemoryBranchStore {
    initial: BranchRef,
    branches: RwLock<BTreeMap<BranchRef, String>>,
    commits: RwLock<BTreeSet<String>>,
    next_commit: AtomicU64,
}

impl MemoryBranchStore {
    /// Creates a store holding a single branch at a root commit.
    pub fn new(initial: BranchRef) -> Self {
        let store = Self {
            initial: initial.clone(),
            branches: RwLock::new(BTreeMap::new()),
            commits: RwLock::new(BTreeSet::new()),
            next_commit: AtomicU64::new(1),
        };
        let root = store.commit();
        store.branches.write().insert(initial, root);
        store
    }

    /// Records a new commit on `branch` and returns its id.
    pub fn commit_on(&self, branch: &BranchRef) -> Result<String, StatementError> {
        let mut branches = self.branches.write();
        let head = branches
            .get_mut(branch)
            .ok_or_else(|| StatementError::BranchNotFound(branch.to_string()))?;
        let id = self.commit();
        *head = id.clone();
        Ok(id)
    }

    /// Returns the head commit of `branch`.
    pub fn head(&self, branch: &BranchRef) -> Option<String> {
        self.branches.read().get(branch).cloned()
    }

    fn commit(&self) -> String {
        let id = format!("{:032x}", self.next_commit.fetch_add(1, Ordering::Relaxed));
        self.commits.write().insert(id.clone());
        id
    }

    fn resolve(&self, reference: &BranchRef) -> Option<String> {
        if let Some(head) = self.branches.read().get(reference) {
            return Some(head.clone());
        }
        self.commits.read().get(reference.as_str()).cloned()
    }
}

impl Default for MemoryBranchStore {
    fn default() -> Self {
        Self::new(BranchRef::main())
    }
}

impl BranchStore for MemoryBranchStore {
    fn initial_branch(&self) -> BranchRef {
        self.initial.clone()
    }

    fn contains(&self, reference: &BranchRef) -> bool {
        self.resolve(reference).is_some()
    }

    fn create_branch(
        &self,
        name: &BranchRef,
        start_point: &BranchRef,
    ) -> Result<(), StatementError> {
        let commit = self
            .resolve(start_point)
            .ok_or_else(|| StatementError::BranchNotFound(start_point.to_string()))?;

        let mut branches = self.branches.write();
        if branches.contains_key(name) {
            return Err(StatementError::BranchExists(name.to_string()));
        }
        branches.insert(name.clone(), commit);
        Ok(())
    }

    fn branches(&self) -> Vec<BranchRef> {
        self.branches.read().keys().cloned().collect()
    }
}
