use crate::tasks::TaskSet;
use std::{collections::HashMap, sync::Mutex};

/// Tracks the live keyspace-watcher tasks per connection id, so a `closed`
/// sentinel can cancel exactly the watcher belonging to that connection.
///
/// All access goes through [`Self::register`], [`Self::unregister`] and
/// [`Self::lookup`], under a single lock; nothing blocking happens inside
/// the critical section.
#[derive(Debug, Default)]
pub(crate) struct WatchRegistry {
    inner: Mutex<HashMap<String, TaskSet>>,
}

impl WatchRegistry {
    /// Register the watcher task set for a connection. A previous watcher
    /// for the same id, if any, is cancelled and replaced.
    pub(crate) fn register(&self, id: &str, tasks: TaskSet) {
        let previous = self.inner.lock().unwrap().insert(id.to_owned(), tasks);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Remove and cancel the watcher for a connection. Returns whether one
    /// was registered. Tolerates ids that were never registered, so a
    /// duplicate or unmatched `closed` sentinel is harmless.
    pub(crate) fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.lock().unwrap().remove(id);
        match removed {
            Some(tasks) => {
                tasks.cancel();
                true
            }
            None => false,
        }
    }

    /// Look up the watcher task set for a connection.
    pub(crate) fn lookup(&self, id: &str) -> Option<TaskSet> {
        self.inner.lock().unwrap().get(id).cloned()
    }
}
