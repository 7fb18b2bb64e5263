//! Fleetline client runtime: the live position tracking core of the booking
//! platform. A driver-side [`publisher::LocationPublisher`] acquires the
//! host's geolocation on a fixed cadence and publishes it through a
//! [`connection::ConnectionManager`]; viewer-side
//! [`subscriber::LocationSubscriber`]s follow one driver's topic and flag the
//! feed stale when updates stop.

pub mod config;
pub mod connection;
pub mod geocode;
pub mod geolocate;
pub mod permission;
pub mod publisher;
pub mod subscriber;
pub mod telemetry;
pub mod transport;

pub use config::TrackingConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use fleetline_core::{DriverId, LocationSample};
pub use publisher::{LocationPublisher, SessionState, TrackError};
pub use subscriber::{LocationSubscriber, SubscriptionHandle};

#[cfg(test)]
mod tests;
