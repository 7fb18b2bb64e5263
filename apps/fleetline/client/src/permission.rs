use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Host location-permission state as reported by the permission capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Prompt,
    Denied,
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("permission query failed: {0}")]
    Query(String),
}

/// Host capability exposing the current permission state and asynchronous
/// change notifications.
#[async_trait]
pub trait PermissionProbe: Send + Sync {
    async fn query(&self) -> Result<PermissionState, PermissionError>;

    fn changes(&self) -> broadcast::Receiver<PermissionState>;
}

/// Tracks the host's location-permission state and notifies on change. A
/// probe failure reads as `Denied`: when the host cannot even answer the
/// question, the publisher must not start.
pub struct PermissionGate {
    probe: Arc<dyn PermissionProbe>,
    last: Arc<parking_lot::RwLock<PermissionState>>,
    events: broadcast::Sender<PermissionState>,
    forward: Option<tokio::task::JoinHandle<()>>,
}

impl PermissionGate {
    pub fn new(probe: Arc<dyn PermissionProbe>) -> Self {
        let (events, _) = broadcast::channel(8);
        let last = Arc::new(parking_lot::RwLock::new(PermissionState::Prompt));

        let mut probe_rx = probe.changes();
        let forward = {
            let last = last.clone();
            let events = events.clone();
            tokio::spawn(async move {
                loop {
                    match probe_rx.recv().await {
                        Ok(state) => {
                            *last.write() = state;
                            debug!(target: "fleet.permission", ?state, "permission state changed");
                            let _ = events.send(state);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            probe,
            last,
            events,
            forward: Some(forward),
        }
    }

    pub async fn query(&self) -> PermissionState {
        let state = match self.probe.query().await {
            Ok(state) => state,
            Err(err) => {
                warn!(target: "fleet.permission", error = %err, "permission query failed, treating as denied");
                PermissionState::Denied
            }
        };
        *self.last.write() = state;
        state
    }

    /// Most recent state seen by the gate, without re-querying the host.
    pub fn last_known(&self) -> PermissionState {
        *self.last.read()
    }

    /// Change notifications. Callers hold the receiver only while they need
    /// it; dropping it is the unsubscribe.
    pub fn changes(&self) -> broadcast::Receiver<PermissionState> {
        self.events.subscribe()
    }
}

impl Drop for PermissionGate {
    fn drop(&mut self) {
        if let Some(forward) = self.forward.take() {
            forward.abort();
        }
    }
}

/// Probe with an externally driven state, used by tests and by hosts whose
/// permission model is settled up front.
pub struct StaticProbe {
    state: parking_lot::RwLock<PermissionState>,
    tx: broadcast::Sender<PermissionState>,
    fail_queries: std::sync::atomic::AtomicBool,
}

impl StaticProbe {
    pub fn new(state: PermissionState) -> Self {
        let (tx, _) = broadcast::channel(8);
        Self {
            state: parking_lot::RwLock::new(state),
            tx,
            fail_queries: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Flip the reported state and fire a change notification.
    pub fn set(&self, state: PermissionState) {
        *self.state.write() = state;
        let _ = self.tx.send(state);
    }

    /// Make subsequent queries fail, as a host without the capability would.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl PermissionProbe for StaticProbe {
    async fn query(&self) -> Result<PermissionState, PermissionError> {
        if self.fail_queries.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PermissionError::Query("capability unavailable".to_string()));
        }
        Ok(*self.state.read())
    }

    fn changes(&self) -> broadcast::Receiver<PermissionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn query_reflects_the_probe() {
        let probe = Arc::new(StaticProbe::new(PermissionState::Granted));
        let gate = PermissionGate::new(probe);
        assert_eq!(gate.query().await, PermissionState::Granted);
        assert_eq!(gate.last_known(), PermissionState::Granted);
    }

    #[tokio::test]
    async fn query_failure_reads_as_denied() {
        let probe = Arc::new(StaticProbe::new(PermissionState::Granted));
        probe.fail_queries(true);
        let gate = PermissionGate::new(probe);
        assert_eq!(gate.query().await, PermissionState::Denied);
    }

    #[tokio::test]
    async fn change_events_reach_subscribers_and_update_the_cache() {
        let probe = Arc::new(StaticProbe::new(PermissionState::Prompt));
        let gate = PermissionGate::new(probe.clone());
        let mut changes = gate.changes();

        probe.set(PermissionState::Denied);

        let state = timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("change timeout")
            .expect("change event");
        assert_eq!(state, PermissionState::Denied);
        assert_eq!(gate.last_known(), PermissionState::Denied);
    }
}
