use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use track_bus::{Bus, BusMessage, BusResult, LocalBus};

use crate::transport::TransportConnector;

/// Lifecycle of the logical connection. The error path is not a state of its
/// own: a failed or dropped link re-enters `Connecting` after the reconnect
/// delay until `disconnect` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to whoever cares about connection health. Errors are
/// reported here, never thrown across the connection boundary.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Error(String),
    Closed,
}

/// JSON envelope carried on the wire: the topic routes, the payload is the
/// application message untouched.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    topic: String,
    payload: serde_json::Value,
}

struct Shared {
    state: parking_lot::RwLock<ConnectionState>,
    fanout: LocalBus,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    active: AtomicBool,
}

/// Owns one logical connection to the messaging transport, independent of
/// publish/subscribe role. Connecting is idempotent; a lost link reconnects
/// on a fixed delay forever until `disconnect` tears everything down.
pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    run: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, reconnect_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            connector,
            reconnect_delay,
            shared: Arc::new(Shared {
                state: parking_lot::RwLock::new(ConnectionState::Disconnected),
                fanout: LocalBus::new(),
                outbound: parking_lot::Mutex::new(None),
                events,
                active: AtomicBool::new(false),
            }),
            run: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Establish the connection. No-op while a run loop is already
    /// connecting or connected.
    pub fn connect(&self) {
        let mut run = self.run.lock();
        if run.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }
        self.shared.active.store(true, Ordering::SeqCst);
        *self.shared.state.write() = ConnectionState::Connecting;
        let shared = self.shared.clone();
        let connector = self.connector.clone();
        let delay = self.reconnect_delay;
        *run = Some(tokio::spawn(run_link(connector, shared, delay)));
    }

    /// Tear the connection down: the run loop is cancelled, the socket
    /// dropped, and every topic subscription closed. Safe to call at any
    /// time, any number of times.
    pub fn disconnect(&self) {
        let task = self.run.lock().take();
        let was_active = self.shared.active.swap(false, Ordering::SeqCst);
        self.shared.outbound.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.fanout.reset();
        *self.shared.state.write() = ConnectionState::Disconnected;
        if was_active {
            let _ = self.shared.events.send(ConnectionEvent::Closed);
            debug!(target: "fleet.connection", "connection torn down");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Bus for ConnectionManager {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.shared.fanout.subscribe(topic)
    }

    /// Fire-and-forget publish. While disconnected the frame is dropped
    /// silently; samples are not queued for a link that may never return.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let guard = self.shared.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            debug!(target: "fleet.connection", topic, "no live link, frame dropped");
            return Ok(0);
        };
        let Some(frame) = encode_frame(topic, &payload) else {
            return Err(track_bus::BusError::Transport(
                "payload is not valid JSON".to_string(),
            ));
        };
        match tx.send(frame) {
            Ok(()) => Ok(1),
            Err(_) => {
                // Link shut down between the state check and the send.
                debug!(target: "fleet.connection", topic, "link closing, frame dropped");
                Ok(0)
            }
        }
    }
}

async fn run_link(connector: Arc<dyn TransportConnector>, shared: Arc<Shared>, delay: Duration) {
    loop {
        if !shared.active.load(Ordering::SeqCst) {
            break;
        }
        match connector.connect().await {
            Ok(mut link) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
                *shared.outbound.lock() = Some(tx);
                *shared.state.write() = ConnectionState::Connected;
                let _ = shared.events.send(ConnectionEvent::Connected);
                debug!(target: "fleet.connection", "transport link established");

                loop {
                    tokio::select! {
                        outgoing = rx.recv() => match outgoing {
                            Some(frame) => {
                                if let Err(err) = link.send(&frame).await {
                                    warn!(target: "fleet.connection", error = %err, "send failed, recycling link");
                                    let _ = shared.events.send(ConnectionEvent::Error(err.to_string()));
                                    break;
                                }
                            }
                            None => break,
                        },
                        inbound = link.recv() => match inbound {
                            Some(data) => dispatch_frame(&shared.fanout, &data),
                            None => {
                                warn!(target: "fleet.connection", "transport link closed by remote");
                                let _ = shared.events.send(ConnectionEvent::Closed);
                                break;
                            }
                        },
                    }
                }
                shared.outbound.lock().take();
            }
            Err(err) => {
                warn!(target: "fleet.connection", error = %err, "transport connect failed");
                let _ = shared.events.send(ConnectionEvent::Error(err.to_string()));
            }
        }

        if !shared.active.load(Ordering::SeqCst) {
            break;
        }
        *shared.state.write() = ConnectionState::Connecting;
        tokio::time::sleep(delay).await;
    }
    *shared.state.write() = ConnectionState::Disconnected;
}

fn encode_frame(topic: &str, payload: &[u8]) -> Option<Vec<u8>> {
    let payload: serde_json::Value = serde_json::from_slice(payload).ok()?;
    serde_json::to_vec(&WireFrame {
        topic: topic.to_string(),
        payload,
    })
    .ok()
}

fn dispatch_frame(fanout: &LocalBus, data: &[u8]) {
    let frame: WireFrame = match serde_json::from_slice(data) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: "fleet.connection", error = %err, "malformed wire frame dropped");
            return;
        }
    };
    let payload = match serde_json::to_vec(&frame.payload) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            warn!(target: "fleet.connection", error = %err, "unencodable frame payload dropped");
            return;
        }
    };
    if let Err(err) = fanout.publish(&frame.topic, payload) {
        warn!(target: "fleet.connection", topic = %frame.topic, error = %err, "inbound fan-out failed");
    }
}
