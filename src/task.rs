//! Handles to in-flight fetches.
//!
//! A fetch is spawned once per key and shared by every caller that asks for
//! that key while it runs. Each caller holds a cloned [`FetchTask`] and awaits
//! the same completion.

use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::AbortHandle;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// How a fetch task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// The fetch produced a value and it was written to the entry.
    Succeeded,
    /// The fetch failed; the message was written to the entry.
    Failed(String),
    /// The task was aborted before it settled.
    Cancelled,
}

impl Settlement {
    pub fn is_success(&self) -> bool {
        matches!(self, Settlement::Succeeded)
    }

    /// Convert to a `Result` for callers that propagate with `?`.
    ///
    /// # Errors
    ///
    /// `Error::FetchError` with the stored message, or `Error::Cancelled`.
    pub fn into_result(self) -> Result<()> {
        match self {
            Settlement::Succeeded => Ok(()),
            Settlement::Failed(message) => Err(Error::FetchError(message)),
            Settlement::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Cloneable handle to a spawned fetch.
#[derive(Clone)]
pub struct FetchTask {
    id: u64,
    completion: Shared<BoxFuture<'static, Settlement>>,
    abort: AbortHandle,
}

impl FetchTask {
    /// Spawn `work` on the current tokio runtime.
    ///
    /// `work` receives the task id so it can recognise its own in-flight marker.
    /// The future keeps running when every handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub(crate) fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Settlement> + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(work(id));
        let abort = handle.abort_handle();

        let completion = async move {
            match handle.await {
                Ok(settlement) => settlement,
                Err(e) if e.is_cancelled() => Settlement::Cancelled,
                Err(e) => Settlement::Failed(format!("fetch task failed: {}", e)),
            }
        }
        .boxed()
        .shared();

        FetchTask {
            id,
            completion,
            abort,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the task to settle. Every clone observes the same settlement.
    pub async fn join(&self) -> Settlement {
        self.completion.clone().await
    }

    /// Abort the task. Callers already waiting in [`join`](Self::join) see
    /// `Settlement::Cancelled`.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl fmt::Debug for FetchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTask")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
