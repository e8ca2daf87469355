use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::SubjectId;

/// Identity of one accepted viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames queued for a viewer's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Close,
}

/// Delivery half of a viewer connection
///
/// The registry owns the handle once registered. The matching receiver and
/// cancellation token stay with the connection's writer task.
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ViewerHandle {
    /// Create a handle with a bounded outbound queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            tx,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token cancelled when the registry gives up on this connection
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn try_deliver(&self, payload: &Arc<str>) -> bool {
        match self.tx.try_send(Outbound::Text(payload.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection = %self.id, "Viewer queue full, dropping connection");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection = %self.id, "Viewer queue closed");
                false
            }
        }
    }

    fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
        self.cancel.cancel();
    }
}

/// Outcome of one fan-out call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Connections in the snapshot
    pub attempted: usize,
    pub delivered: usize,
    /// Connections that failed and were pruned
    pub dropped: usize,
}

#[derive(Default)]
struct RegistryState {
    subjects: HashMap<SubjectId, HashMap<ConnectionId, ViewerHandle>>,
    owners: HashMap<ConnectionId, SubjectId>,
    alerts: HashMap<ConnectionId, ViewerHandle>,
}

impl RegistryState {
    fn remove_subject_connection(&mut self, id: ConnectionId, subject_id: SubjectId) -> bool {
        let Some(set) = self.subjects.get_mut(&subject_id) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            self.subjects.remove(&subject_id);
        }
        if removed {
            self.owners.remove(&id);
        }
        removed
    }
}

/// Live viewer connections, partitioned by subject plus an alert set
///
/// Cloning shares the same registry. The lock is only held for bookkeeping;
/// delivery to a snapshot happens outside it.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a subject's set, moving it if another subject owns it
    pub fn register_subject(&self, handle: ViewerHandle, subject_id: SubjectId) {
        let id = handle.id();
        let mut state = self.state.write();

        if let Some(previous) = state.owners.get(&id).copied() {
            if previous != subject_id {
                state.remove_subject_connection(id, previous);
            }
        }

        state.owners.insert(id, subject_id);
        state
            .subjects
            .entry(subject_id)
            .or_default()
            .insert(id, handle);

        tracing::debug!(connection = %id, subject_id, "Viewer registered");
    }

    /// Remove a connection from a subject's set; absent is a no-op
    pub fn unregister_subject(&self, id: ConnectionId, subject_id: SubjectId) -> bool {
        let removed = self.state.write().remove_subject_connection(id, subject_id);
        if removed {
            tracing::debug!(connection = %id, subject_id, "Viewer unregistered");
        }
        removed
    }

    pub fn register_alert(&self, handle: ViewerHandle) {
        let id = handle.id();
        self.state.write().alerts.insert(id, handle);
        tracing::debug!(connection = %id, "Alert viewer registered");
    }

    pub fn unregister_alert(&self, id: ConnectionId) -> bool {
        let removed = self.state.write().alerts.remove(&id).is_some();
        if removed {
            tracing::debug!(connection = %id, "Alert viewer unregistered");
        }
        removed
    }

    /// Deliver a payload to every connection watching `subject_id`
    pub fn fanout_subject(&self, subject_id: SubjectId, payload: &str) -> FanoutReport {
        let snapshot: Vec<ViewerHandle> = match self.state.read().subjects.get(&subject_id) {
            Some(set) => set.values().cloned().collect(),
            None => return FanoutReport::default(),
        };

        let (report, failed) = deliver(&snapshot, payload);
        if !failed.is_empty() {
            let mut state = self.state.write();
            for handle in &failed {
                state.remove_subject_connection(handle.id(), subject_id);
            }
        }
        report
    }

    /// Deliver a payload to every alert connection
    pub fn fanout_alert(&self, payload: &str) -> FanoutReport {
        let snapshot: Vec<ViewerHandle> = self.state.read().alerts.values().cloned().collect();
        if snapshot.is_empty() {
            return FanoutReport::default();
        }

        let (report, failed) = deliver(&snapshot, payload);
        if !failed.is_empty() {
            let mut state = self.state.write();
            for handle in &failed {
                state.alerts.remove(&handle.id());
            }
        }
        report
    }

    pub fn subject_connection_count(&self, subject_id: SubjectId) -> usize {
        self.state
            .read()
            .subjects
            .get(&subject_id)
            .map_or(0, HashMap::len)
    }

    pub fn alert_connection_count(&self) -> usize {
        self.state.read().alerts.len()
    }

    /// Subjects with at least one live viewer
    pub fn subject_ids(&self) -> Vec<SubjectId> {
        let mut ids: Vec<SubjectId> = self.state.read().subjects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn total_connections(&self) -> usize {
        let state = self.state.read();
        state.owners.len() + state.alerts.len()
    }

    /// Send a close notice to every connection, cancel it, and clear the registry
    pub fn close_all(&self) -> usize {
        let handles: Vec<ViewerHandle> = {
            let mut state = self.state.write();
            state.owners.clear();
            let subjects = std::mem::take(&mut state.subjects);
            let alerts = std::mem::take(&mut state.alerts);
            subjects
                .into_values()
                .flat_map(HashMap::into_values)
                .chain(alerts.into_values())
                .collect()
        };

        for handle in &handles {
            handle.close();
        }
        if !handles.is_empty() {
            tracing::info!("Closed {} viewer connections", handles.len());
        }
        handles.len()
    }
}

/// One non-blocking attempt per snapshot member; failures are cancelled
fn deliver(snapshot: &[ViewerHandle], payload: &str) -> (FanoutReport, Vec<ViewerHandle>) {
    let payload: Arc<str> = Arc::from(payload);
    let mut failed = Vec::new();
    let mut delivered = 0;

    for handle in snapshot {
        if handle.try_deliver(&payload) {
            delivered += 1;
        } else {
            handle.cancel.cancel();
            failed.push(handle.clone());
        }
    }

    let report = FanoutReport {
        attempted: snapshot.len(),
        delivered,
        dropped: failed.len(),
    };
    (report, failed)
}
