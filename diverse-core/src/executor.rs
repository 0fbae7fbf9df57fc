//! Where background work (preset validation) runs.
//!
//! Production code hands the engine a [`TokioExecutor`] built from a runtime
//! handle. Tests use [`InlineExecutor`], which drives each task to completion
//! on the calling thread so results are observable as soon as the spawning
//! call returns.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};

/// Runs detached background tasks.
pub trait TaskExecutor: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

// ============================================================================
// Tokio
// ============================================================================

/// Spawns tasks onto a tokio runtime.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: Handle,
    // Keeps an owned runtime alive for as long as any clone exists.
    _runtime: Option<Arc<Runtime>>,
}

impl TokioExecutor {
    /// Use an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    /// Use the runtime the caller is currently running inside, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    /// Build a small dedicated runtime for hosts that have none.
    pub fn owned(worker_threads: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("diverse-validate")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(runtime)),
        })
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("owned", &self._runtime.is_some())
            .finish()
    }
}

impl TaskExecutor for TokioExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.handle.spawn(task));
    }
}

// ============================================================================
// Inline
// ============================================================================

/// Runs every task to completion before `spawn` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        futures::executor::block_on(task);
    }
}
