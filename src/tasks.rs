use futures_util::FutureExt;
use std::{any::Any, future::Future, panic::AssertUnwindSafe};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Extract a printable message from a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// A wrapper around a [`TaskTracker`] and a [`CancellationToken`], used to
/// manage the set of tasks belonging to a server or to a single connection.
///
/// Tasks spawned on the set are wrapped so that cancelling the set stops them
/// even while they are blocked, and so that a panic inside a task is caught
/// and logged instead of taking down anything else.
///
/// When a [`Handle`] is provided, tasks are spawned on that handle. Otherwise,
/// they are spawned on the current runtime.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskSet {
    tasks: TaskTracker,
    token: CancellationToken,
    handle: Option<Handle>,
}

impl From<Handle> for TaskSet {
    fn from(handle: Handle) -> Self {
        Self::with_handle(handle)
    }
}

impl TaskSet {
    /// Create a new [`TaskSet`] with a handle.
    pub(crate) fn with_handle(handle: Handle) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: CancellationToken::new(),
            handle: Some(handle),
        }
    }

    /// Get a handle to the runtime that the task set is running on.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub(crate) fn handle(&self) -> Handle {
        self.handle
            .clone()
            .unwrap_or_else(tokio::runtime::Handle::current)
    }

    /// Cancel the token, causing all tasks in the set to be cancelled.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel all tasks and wait for them to finish.
    pub(crate) async fn shutdown(&self) {
        self.cancel();
        self.tasks.close();
        self.tasks.wait().await
    }

    /// Get a child [`TaskSet`]. The child is cancelled when the parent is
    /// cancelled, or may be cancelled independently. Its tasks stay tracked
    /// by the parent, so a parent [`Self::shutdown`] waits for them too.
    pub(crate) fn child(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            token: self.token.child_token(),
            handle: self.handle.clone(),
        }
    }

    /// Prepare a future to be added to the task set, wrapping it with the
    /// cancellation token and a panic catcher.
    fn prep_fut<F>(&self, task: F) -> impl Future<Output = Option<F::Output>> + Send + 'static
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        async move {
            tokio::select! {
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(task).catch_unwind() => match result {
                    Ok(output) => Some(output),
                    Err(panic) => {
                        tracing::error!(
                            panic = panic_message(&*panic),
                            "task panicked; exiting task only"
                        );
                        None
                    }
                },
            }
        }
    }

    /// Spawn a future on the provided handle, and add it to the task set.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime when
    /// `self.handle` is `None`.
    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn_on(self.prep_fut(task), &self.handle())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_stops_blocked_tasks() {
        let set = TaskSet::default();
        let handle = set.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        set.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let set = TaskSet::default();
        let handle = set.spawn(async {
            panic!("boom");
        });
        // The panic is swallowed, not propagated through the join handle.
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_waits_for_child_tasks() {
        use std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        };

        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let parent = TaskSet::default();
        let child = parent.child();
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        child.spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        parent.shutdown().await;
        // The child's task has fully exited, not merely been signalled.
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn child_cancelled_with_parent() {
        let parent = TaskSet::default();
        let child = parent.child();
        let handle = child.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        parent.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }
}
