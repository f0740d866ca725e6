use std::{error::Error as StdError, fmt, sync::Arc};

use futures::future::BoxFuture;

use super::lane::ItemScope;
use crate::{
    config::Settings,
    error::{Error, Result},
    layout::Layout,
    protocol::{TaskName, WorkItem},
};

/// What every pool on a servant shares: the validated settings and the
/// servant's identity.
#[derive(Debug)]
pub struct Context {
    pub settings: Settings,
    pub layout: Layout,
    pub host: String,
}

impl Context {
    pub fn new(settings: Settings, host: impl Into<String>) -> Self {
        Self {
            layout: settings.phase.layout(),
            settings,
            host: host.into(),
        }
    }
}

/// Knows how to turn a directive for one task into a ready pool.
pub trait TaskHandler: Send + Sync + 'static {
    fn task(&self) -> TaskName;

    /// Loads whatever the lanes of one pool share (caches, connections).
    /// Runs once per directive, before any lane starts.
    fn prepare(&self, ctx: Arc<Context>) -> BoxFuture<'static, Result<Arc<dyn PreparedTask>>>;
}

/// Shared state of one pool; every lane runs its items through it.
pub trait PreparedTask: Send + Sync {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem)
        -> BoxFuture<'a, Result<(), TaskError>>;
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// Only this item failed; the lane takes the next one.
    Item,
    /// The lane cannot continue (e.g. its database connection is gone). The
    /// lane stops and its siblings stop after the item in hand.
    Lane,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub scope: FailureScope,
    pub message: String,
    pub trace: String,
}

impl TaskError {
    pub fn item(error: impl Into<Error>) -> Self {
        Self::with_scope(FailureScope::Item, error.into())
    }

    pub fn lane(error: impl Into<Error>) -> Self {
        Self::with_scope(FailureScope::Lane, error.into())
    }

    fn with_scope(scope: FailureScope, error: Error) -> Self {
        Self {
            scope,
            message: error.to_string(),
            trace: trace(&error),
        }
    }
}

impl From<Error> for TaskError {
    fn from(error: Error) -> Self {
        let scope = match error {
            Error::Database(_) | Error::ConnectionError(_) | Error::Join(_) => FailureScope::Lane,
            _ => FailureScope::Item,
        };
        Self::with_scope(scope, error)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The error followed by its chain of causes, one per line.
fn trace(error: &dyn StdError) -> String {
    let mut trace = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str("\n  caused by: ");
        trace.push_str(&cause.to_string());
        source = cause.source();
    }
    trace
}
