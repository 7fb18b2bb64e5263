use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleetline_core::{DriverId, LocationSample, INGEST_TOPIC};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use track_bus::Bus;

use crate::config::TrackingConfig;
use crate::connection::ConnectionManager;
use crate::geolocate::PositionAcquirer;
use crate::permission::{PermissionGate, PermissionState};

/// Publisher-side session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Publishing,
    /// The last cycle's acquisition failed; the schedule continues and the
    /// next tick tries again.
    Retrying,
    Stopped,
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("location permission denied")]
    PermissionDenied,
}

struct TrackingSession {
    driver_id: DriverId,
    active: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// Drives the periodic acquire-and-publish loop for one driver. At most one
/// session is active at a time; starting a second session stops the first.
pub struct LocationPublisher {
    gate: Arc<PermissionGate>,
    acquirer: Arc<PositionAcquirer>,
    connection: Arc<ConnectionManager>,
    cycle_interval: Duration,
    state: Arc<parking_lot::RwLock<SessionState>>,
    session: parking_lot::Mutex<Option<TrackingSession>>,
}

impl LocationPublisher {
    pub fn new(
        gate: Arc<PermissionGate>,
        acquirer: Arc<PositionAcquirer>,
        connection: Arc<ConnectionManager>,
        config: &TrackingConfig,
    ) -> Self {
        Self {
            gate,
            acquirer,
            connection,
            cycle_interval: config.cycle_interval,
            state: Arc::new(parking_lot::RwLock::new(SessionState::Idle)),
            session: parking_lot::Mutex::new(None),
        }
    }

    /// Begin publishing this driver's position. Runs one cycle immediately,
    /// then repeats on the configured interval until `stop` or permission
    /// revocation.
    pub async fn start(&self, driver_id: DriverId) -> Result<(), TrackError> {
        self.stop();

        if self.gate.query().await == PermissionState::Denied {
            warn!(target: "fleet.publisher", driver = %driver_id, "refusing to start, permission denied");
            return Err(TrackError::PermissionDenied);
        }

        self.connection.connect();

        let active = Arc::new(AtomicBool::new(true));
        *self.state.write() = SessionState::Idle;
        let task = tokio::spawn(run_session(
            driver_id.clone(),
            self.gate.clone(),
            self.acquirer.clone(),
            self.connection.clone(),
            self.state.clone(),
            active.clone(),
            self.cycle_interval,
        ));

        info!(target: "fleet.publisher", driver = %driver_id, "tracking session started");
        *self.session.lock() = Some(TrackingSession {
            driver_id,
            active,
            task,
        });
        Ok(())
    }

    /// Stop the active session, if any. Cancels the cycle timer before the
    /// session is discarded; safe to call repeatedly or before any `start`.
    pub fn stop(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        session.active.store(false, Ordering::SeqCst);
        session.task.abort();
        *self.state.write() = SessionState::Stopped;
        self.connection.disconnect();
        info!(target: "fleet.publisher", driver = %session.driver_id, "tracking session stopped");
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Driver of the currently active session.
    pub fn driver(&self) -> Option<DriverId> {
        self.session
            .lock()
            .as_ref()
            .filter(|session| session.active.load(Ordering::SeqCst))
            .map(|session| session.driver_id.clone())
    }
}

impl Drop for LocationPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_session(
    driver_id: DriverId,
    gate: Arc<PermissionGate>,
    acquirer: Arc<PositionAcquirer>,
    connection: Arc<ConnectionManager>,
    state: Arc<parking_lot::RwLock<SessionState>>,
    active: Arc<AtomicBool>,
    cycle_interval: Duration,
) {
    // Held only while the session runs, so a stopped session leaks no
    // permission listener.
    let mut permission_changes = gate.changes();

    let mut ticker = tokio::time::interval(cycle_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&driver_id, &acquirer, &connection, &state, &active).await;
            }
            changed = permission_changes.recv() => match changed {
                Ok(PermissionState::Denied) => {
                    warn!(target: "fleet.publisher", driver = %driver_id, "permission revoked, stopping session");
                    active.store(false, Ordering::SeqCst);
                    *state.write() = SessionState::Stopped;
                    connection.disconnect();
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
        if !active.load(Ordering::SeqCst) {
            break;
        }
    }
}

async fn run_cycle(
    driver_id: &DriverId,
    acquirer: &PositionAcquirer,
    connection: &ConnectionManager,
    state: &parking_lot::RwLock<SessionState>,
    active: &AtomicBool,
) {
    *state.write() = SessionState::Acquiring;

    match acquirer.acquire().await {
        Ok(fix) => {
            // The session may have been stopped while the acquisition was in
            // flight; a late fix must not resurrect it.
            if !active.load(Ordering::SeqCst) {
                return;
            }
            *state.write() = SessionState::Publishing;

            let sample = LocationSample::new(
                driver_id.clone(),
                fix.position,
                fix.address,
                OffsetDateTime::now_utc(),
            );
            let encoded = match sample.payload().encode() {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(target: "fleet.publisher", driver = %driver_id, error = %err, "sample encode failed, cycle skipped");
                    return;
                }
            };
            match connection.publish(INGEST_TOPIC, Bytes::from(encoded)) {
                Ok(0) => {
                    debug!(target: "fleet.publisher", driver = %driver_id, "no live link, sample dropped")
                }
                Ok(_) => {
                    debug!(
                        target: "fleet.publisher",
                        driver = %driver_id,
                        latitude = sample.latitude,
                        longitude = sample.longitude,
                        "location sample published"
                    )
                }
                Err(err) => {
                    warn!(target: "fleet.publisher", driver = %driver_id, error = %err, "publish failed, sample dropped")
                }
            }
        }
        Err(err) => {
            warn!(target: "fleet.publisher", driver = %driver_id, error = %err, "acquisition failed, cycle skipped");
            *state.write() = SessionState::Retrying;
        }
    }
}
