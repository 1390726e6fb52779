use std::future::Future;
use std::sync::Weak;

use super::Shared;
use crate::download::types::FileHash;

/// Handle to an in-flight alternate-source lookup.
pub trait CancelableLookup: Send {
    fn shutdown(self: Box<Self>);
}

/// Starts Kad alternate-source lookups for a file.
pub trait DhtLookupFactory: Send + Sync {
    /// Returns `None` when no lookup can be started (e.g. Kad not connected).
    ///
    /// The lookup must call [`LookupCompletion::complete`] once it finishes,
    /// successfully or not. Completing from inside `start_lookup` is allowed; the
    /// listener then hears `on_lookup_started` before `on_lookup_finished`.
    fn start_lookup(
        &self,
        file: FileHash,
        completion: LookupCompletion,
    ) -> Option<Box<dyn CancelableLookup>>;
}

/// One-shot completion callback for a single lookup.
///
/// Completions of a lookup that was already cancelled or superseded are ignored.
#[derive(Debug)]
pub struct LookupCompletion {
    pub(super) shared: Weak<Shared>,
    pub(super) generation: u64,
}

impl LookupCompletion {
    pub fn complete(self, success: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.finish_dht_lookup(Some(self.generation), success);
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A lookup running as a tokio task; `shutdown` aborts the task.
#[derive(Debug)]
pub struct TaskLookup {
    task: tokio::task::AbortHandle,
}

impl CancelableLookup for TaskLookup {
    fn shutdown(self: Box<Self>) {
        self.task.abort();
    }
}

/// Spawns `lookup` on the current runtime and fires `completion` with its result.
///
/// Must be called from within a tokio runtime.
pub fn spawn_task_lookup<F>(lookup: F, completion: LookupCompletion) -> TaskLookup
where
    F: Future<Output = bool> + Send + 'static,
{
    let join = tokio::spawn(async move {
        let success = lookup.await;
        completion.complete(success);
    });
    TaskLookup {
        task: join.abort_handle(),
    }
}
