//! Shared primitives for the Fleetline live position tracking feed. These
//! types keep the publisher and subscriber sides of the feed in sync without
//! copying wire shapes across crates.

pub mod sample;
pub mod topic;

pub use sample::{
    Coordinates, DriverId, LocationPayload, LocationSample, PayloadError, ADDRESS_UNAVAILABLE,
};
pub use topic::{driver_topic, INGEST_TOPIC};
