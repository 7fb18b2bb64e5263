use std::time::Duration;

use async_trait::async_trait;
use fleetline_core::{driver_topic, Coordinates, DriverId, INGEST_TOPIC};
use tokio::sync::mpsc;

use crate::config::TrackingConfig;
use crate::geocode::{GeocodeError, ReverseGeocoder};
use crate::geolocate::{GeolocateError, Geolocator};
use crate::transport::mock::MockPeer;

pub const BERLIN: Coordinates = Coordinates {
    latitude: 52.52,
    longitude: 13.405,
};

pub struct FixedLocator(pub Coordinates);

#[async_trait]
impl Geolocator for FixedLocator {
    async fn locate(&self) -> Result<Coordinates, GeolocateError> {
        Ok(self.0)
    }
}

pub struct FixedGeocoder(pub &'static str);

#[async_trait]
impl ReverseGeocoder for FixedGeocoder {
    async fn resolve(&self, _position: &Coordinates) -> Result<String, GeocodeError> {
        Ok(self.0.to_string())
    }
}

pub fn fast_config() -> TrackingConfig {
    TrackingConfig {
        cycle_interval: Duration::from_millis(40),
        acquire_timeout: Duration::from_millis(50),
        retry_budget: 2,
        retry_delay: Duration::from_millis(5),
        geocode_timeout: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(20),
        stale_timeout: Duration::from_millis(150),
    }
}

/// Minimal broker: ingest frames arrive on a shared channel and are routed
/// to the viewer link keyed by the payload's driver. Feed each publisher
/// link into the channel with [`pump_link`].
pub fn spawn_broker(
    mut subscriber_peer: MockPeer,
) -> (mpsc::UnboundedSender<Vec<u8>>, tokio::task::JoinHandle<()>) {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&frame) else {
                continue;
            };
            if value["topic"] != INGEST_TOPIC {
                continue;
            }
            let Some(driver) = value["payload"]["driverId"].as_str() else {
                continue;
            };
            let routed = serde_json::json!({
                "topic": driver_topic(&DriverId::from(driver)),
                "payload": value["payload"].clone(),
            });
            subscriber_peer.send(serde_json::to_vec(&routed).expect("routed frame"));
        }
    });
    (frames_tx, task)
}

/// Forward every frame a publisher link produces into the broker channel.
pub fn pump_link(mut publisher_peer: MockPeer, frames: mpsc::UnboundedSender<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(frame) = publisher_peer.recv().await {
            if frames.send(frame).is_err() {
                break;
            }
        }
    });
}
