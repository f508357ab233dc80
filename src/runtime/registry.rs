// In-memory table of running app processes
// Single source of truth for "is this app running"; reset on restart,
// so processes surviving a previous daemon are orphans the registry
// cannot see - lookups on them report NotRunningError

use crate::runtime::process::AppProcess;
use crate::runtime::protocol::AppId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// An operation asserted a running process that is not registered
#[derive(Debug, Error, PartialEq, Eq)]
#[error("app {0} has no running process")]
pub struct NotRunningError(pub AppId);

/// Live table of app id -> process handle
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<AppId, Arc<AppProcess>>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handle for an app, replacing any previous entry
    pub fn register(&self, app_id: AppId, handle: Arc<AppProcess>) {
        self.inner.lock().unwrap().insert(app_id, handle);
    }

    /// Remove and return the handle for an app
    pub fn unregister(&self, app_id: AppId) -> Option<Arc<AppProcess>> {
        self.inner.lock().unwrap().remove(&app_id)
    }

    /// Remove the entry only if it still points at this exact handle
    ///
    /// Used by the exit watcher so that a process that died around the
    /// same time the app was restarted cannot evict its replacement.
    pub fn unregister_if_current(&self, app_id: AppId, handle: &Arc<AppProcess>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .get(&app_id)
            .map(|current| Arc::ptr_eq(current, handle))
            .unwrap_or(false)
        {
            inner.remove(&app_id);
            true
        } else {
            false
        }
    }

    /// Get the handle for an app, if running
    pub fn lookup(&self, app_id: AppId) -> Option<Arc<AppProcess>> {
        self.inner.lock().unwrap().get(&app_id).cloned()
    }

    /// Get the handle for an app, or fail when absent
    pub fn expect_running(&self, app_id: AppId) -> Result<Arc<AppProcess>, NotRunningError> {
        self.lookup(app_id).ok_or(NotRunningError(app_id))
    }

    /// Number of registered processes
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Ids of all apps with a registered process
    pub fn running_apps(&self) -> Vec<AppId> {
        self.inner.lock().unwrap().keys().copied().collect()
    }
}
