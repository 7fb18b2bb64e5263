use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetline_core::{driver_topic, DriverId, LocationPayload, LocationSample};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};
use track_bus::{Bus, BusMessage};

use crate::config::TrackingConfig;
use crate::connection::ConnectionManager;

struct SubscriptionShared {
    driver_id: DriverId,
    last_sample: parking_lot::RwLock<Option<LocationSample>>,
    stale: AtomicBool,
}

/// A viewer's live binding to one driver's topic: last-known sample plus a
/// staleness flag that trips after the configured silence.
pub struct SubscriptionHandle {
    topic: String,
    shared: Arc<SubscriptionShared>,
    active: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub fn driver(&self) -> &DriverId {
        &self.shared.driver_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Last sample received, retained even after the feed goes stale.
    pub fn last_sample(&self) -> Option<LocationSample> {
        self.shared.last_sample.read().clone()
    }

    pub fn is_stale(&self) -> bool {
        self.shared.stale.load(Ordering::SeqCst)
    }

    /// Cancel the staleness timer and release the topic subscription. Safe
    /// to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(target: "fleet.subscriber", topic = %self.topic, "unsubscribed");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Viewer-side entry point: subscribes to driver topics over a shared
/// connection.
pub struct LocationSubscriber {
    connection: Arc<ConnectionManager>,
    stale_timeout: Duration,
}

impl LocationSubscriber {
    pub fn new(connection: Arc<ConnectionManager>, config: &TrackingConfig) -> Self {
        Self {
            connection,
            stale_timeout: config.stale_timeout,
        }
    }

    /// Subscribe to one driver's location feed and begin listening. The
    /// connection is established if it is not already up.
    pub fn subscribe(&self, driver_id: DriverId) -> SubscriptionHandle {
        self.connection.connect();

        let topic = driver_topic(&driver_id);
        let rx = self.connection.subscribe(&topic);

        let shared = Arc::new(SubscriptionShared {
            driver_id,
            last_sample: parking_lot::RwLock::new(None),
            stale: AtomicBool::new(false),
        });
        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(listen(
            rx,
            shared.clone(),
            active.clone(),
            self.stale_timeout,
        ));

        debug!(target: "fleet.subscriber", topic = %topic, "subscribed");
        SubscriptionHandle {
            topic,
            shared,
            active,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }
}

async fn listen(
    mut rx: broadcast::Receiver<BusMessage>,
    shared: Arc<SubscriptionShared>,
    active: Arc<AtomicBool>,
    stale_timeout: Duration,
) {
    // The deadline moves only when a sample is accepted; malformed or
    // misrouted traffic does not count as life in the feed.
    let mut deadline = Instant::now() + stale_timeout;
    loop {
        tokio::select! {
            inbound = rx.recv() => match inbound {
                Ok(message) => {
                    if handle_message(&shared, &message) {
                        deadline = Instant::now() + stale_timeout;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "fleet.subscriber", driver = %shared.driver_id, skipped, "listener lagging, messages dropped");
                }
                // Connection torn down; the handle keeps its last state.
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                if !shared.stale.swap(true, Ordering::SeqCst) {
                    warn!(target: "fleet.subscriber", driver = %shared.driver_id, "feed went stale");
                }
                deadline = Instant::now() + stale_timeout;
            }
        }
        if !active.load(Ordering::SeqCst) {
            break;
        }
    }
}

/// Returns true when the message replaced the held sample.
fn handle_message(shared: &SubscriptionShared, message: &BusMessage) -> bool {
    let payload = match LocationPayload::decode(&message.payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(target: "fleet.subscriber", topic = %message.topic, error = %err, "malformed payload dropped");
            return false;
        }
    };
    if payload.driver_id != shared.driver_id {
        warn!(
            target: "fleet.subscriber",
            expected = %shared.driver_id,
            got = %payload.driver_id,
            "payload for unexpected driver dropped"
        );
        return false;
    }

    {
        let mut guard = shared.last_sample.write();
        // Arrival order is delivery order, but a sample that is older than
        // the one on display must not regress the feed.
        if let Some(held) = guard.as_ref() {
            if payload.updated_at < held.captured_at {
                debug!(target: "fleet.subscriber", driver = %shared.driver_id, "out-of-order sample discarded");
                return false;
            }
        }
        *guard = Some(LocationSample::from_payload(payload));
    }
    shared.stale.store(false, Ordering::SeqCst);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockPeer};
    use time::macros::datetime;
    use tokio::time::{sleep, timeout};

    fn fast_config() -> TrackingConfig {
        TrackingConfig {
            stale_timeout: Duration::from_millis(120),
            reconnect_delay: Duration::from_millis(20),
            ..TrackingConfig::default()
        }
    }

    struct Fixture {
        subscriber: LocationSubscriber,
        peer: MockPeer,
    }

    fn fixture() -> Fixture {
        let connector = Arc::new(MockConnector::new());
        let peer = connector.push_link();
        let connection = Arc::new(ConnectionManager::new(
            connector,
            Duration::from_millis(20),
        ));
        let subscriber = LocationSubscriber::new(connection, &fast_config());
        Fixture { subscriber, peer }
    }

    fn frame(driver: &str, at: &str, latitude: f64) -> Vec<u8> {
        format!(
            r#"{{"topic":"fleet.location.driver.{driver}","payload":{{"driverId":"{driver}","updatedAt":"{at}","latitude":{latitude},"longitude":13.4,"address":"somewhere"}}}}"#
        )
        .into_bytes()
    }

    async fn wait_for_sample(handle: &SubscriptionHandle) -> LocationSample {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(sample) = handle.last_sample() {
                    return sample;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sample timeout")
    }

    async fn wait_until_stale(handle: &SubscriptionHandle) {
        timeout(Duration::from_secs(2), async {
            while !handle.is_stale() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("staleness timeout");
    }

    #[tokio::test]
    async fn valid_payloads_replace_the_sample_and_clear_staleness() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:30:00Z", 52.52));
        let sample = wait_for_sample(&handle).await;
        assert_eq!(sample.driver_id, DriverId::from("d-1"));
        assert_eq!(sample.latitude, 52.52);
        assert_eq!(sample.captured_at, datetime!(2026-03-01 12:30:00 UTC));
        assert!(!handle.is_stale());
    }

    #[tokio::test]
    async fn silence_flags_the_feed_stale_but_keeps_the_sample() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:30:00Z", 52.52));
        let sample = wait_for_sample(&handle).await;

        wait_until_stale(&handle).await;
        assert_eq!(handle.last_sample(), Some(sample));
    }

    #[tokio::test]
    async fn a_fresh_sample_clears_the_stale_flag() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:30:00Z", 52.52));
        wait_for_sample(&handle).await;
        wait_until_stale(&handle).await;

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:31:00Z", 52.53));
        timeout(Duration::from_secs(2), async {
            while handle.is_stale() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale flag must clear");
        assert_eq!(handle.last_sample().expect("sample").latitude, 52.53);
    }

    #[tokio::test]
    async fn silence_with_no_sample_still_goes_stale() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        wait_until_stale(&handle).await;
        assert_eq!(handle.last_sample(), None);
    }

    #[tokio::test]
    async fn malformed_payloads_leave_state_untouched() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:30:00Z", 52.52));
        let before = wait_for_sample(&handle).await;

        // Missing latitude.
        fixture.peer.send(
            br#"{"topic":"fleet.location.driver.d-1","payload":{"driverId":"d-1","updatedAt":"2026-03-01T12:32:00Z","longitude":13.4,"address":"x"}}"#
                .to_vec(),
        );
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.last_sample(), Some(before));
        assert!(!handle.is_stale());
    }

    #[tokio::test]
    async fn older_samples_do_not_regress_the_feed() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:30:00Z", 52.52));
        wait_for_sample(&handle).await;

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:29:00Z", 48.14));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.last_sample().expect("sample").latitude, 52.52);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_updates() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:30:00Z", 52.52));
        wait_for_sample(&handle).await;

        handle.unsubscribe();
        handle.unsubscribe();

        fixture
            .peer
            .send(frame("d-1", "2026-03-01T12:31:00Z", 52.99));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.last_sample().expect("sample").latitude, 52.52);
    }

    #[tokio::test]
    async fn payloads_for_other_drivers_are_dropped() {
        let fixture = fixture();
        let handle = fixture.subscriber.subscribe(DriverId::from("d-1"));

        // Misrouted: d-2's payload on d-1's topic.
        fixture.peer.send(
            br#"{"topic":"fleet.location.driver.d-1","payload":{"driverId":"d-2","updatedAt":"2026-03-01T12:30:00Z","latitude":1.0,"longitude":2.0,"address":"x"}}"#
                .to_vec(),
        );
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.last_sample(), None);
    }
}
