//! Run Registry: `requestID → handle` under a single reader/writer lock,
//! plus cascading cancel groups for nested invocations (an agent that
//! recursively dispatches a sub-run, or the Ralph Loop's inner agent).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use runner_domain::cancel::CancelToken;
use runner_domain::error::{Error, Result};
use runner_domain::run::RunStatusSnapshot;

/// The handle registered for one live run. The cancel token and status
/// snapshot are each guarded by their own lock: status reads and cancels
/// never contend with each other.
pub struct RunHandle {
    cancel: CancelToken,
    status: RwLock<RunStatusSnapshot>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> RunStatusSnapshot {
        self.status.read().clone()
    }

    pub fn record_event(&self) {
        let mut snap = self.status.write();
        snap.event_count += 1;
        snap.last_event_at = Some(Utc::now());
    }
}

/// A concurrent `requestID → handle` map plus parent→child cancel groups.
/// A single lock guards the map: operations are mostly point lookups plus
/// a rare drain-on-close, so per-entry locking would add cost for no
/// benefit.
#[derive(Default)]
pub struct RunRegistry {
    handles: RwLock<HashMap<String, Arc<RunHandle>>>,
    groups: RwLock<HashMap<String, HashSet<String>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run. Fails if `request_id` is empty or already in use.
    pub fn register(
        &self,
        request_id: &str,
        invocation_id: &str,
        agent_name: &str,
        session_key: &str,
        cancel: CancelToken,
    ) -> Result<Arc<RunHandle>> {
        if request_id.is_empty() {
            return Err(Error::Config("request id must not be empty".into()));
        }
        let mut handles = self.handles.write();
        if handles.contains_key(request_id) {
            return Err(Error::Config(format!("request id already in use: {request_id}")));
        }
        let now = Utc::now();
        let handle = Arc::new(RunHandle {
            cancel,
            status: RwLock::new(RunStatusSnapshot {
                request_id: request_id.to_string(),
                invocation_id: invocation_id.to_string(),
                agent_name: agent_name.to_string(),
                session_key: session_key.to_string(),
                started_at: now,
                last_event_at: None,
                event_count: 0,
            }),
        });
        handles.insert(request_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn lookup(&self, request_id: &str) -> Option<Arc<RunHandle>> {
        self.handles.read().get(request_id).cloned()
    }

    pub fn unregister(&self, request_id: &str) {
        self.handles.write().remove(request_id);
        self.groups.write().remove(request_id);
    }

    /// Cancel a single run. Returns whether it was found. Cascades to any
    /// runs registered in this request's cancel group.
    pub fn cancel(&self, request_id: &str) -> bool {
        let found = if let Some(handle) = self.handles.read().get(request_id) {
            handle.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.read().get(request_id) {
            let handles = self.handles.read();
            for child in children {
                if let Some(handle) = handles.get(child) {
                    handle.cancel();
                }
            }
        }

        found
    }

    /// Drain the map into a local list and invoke every cancel function
    /// after releasing the lock, so cancellation never blocks on a held
    /// write lock.
    pub fn cancel_all(&self) {
        let drained: Vec<Arc<RunHandle>> = {
            let mut handles = self.handles.write();
            handles.drain().map(|(_, h)| h).collect()
        };
        self.groups.write().clear();
        for handle in drained {
            handle.cancel();
        }
    }

    pub fn add_to_group(&self, parent_request_id: &str, child_request_id: &str) {
        self.groups
            .write()
            .entry(parent_request_id.to_string())
            .or_default()
            .insert(child_request_id.to_string());
    }

    pub fn remove_from_group(&self, parent_request_id: &str, child_request_id: &str) {
        let mut groups = self.groups.write();
        if let Some(children) = groups.get_mut(parent_request_id) {
            children.remove(child_request_id);
            if children.is_empty() {
                groups.remove(parent_request_id);
            }
        }
    }
}
