use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Sentinel address substituted when reverse geocoding fails or times out.
/// The sample itself still counts as valid.
pub const ADDRESS_UNAVAILABLE: &str = "address unavailable";

/// Opaque driver identifier. The booking backend mints these; the tracking
/// feed only routes on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A WGS84 coordinate pair as produced by the geolocation capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One position report for a driver. Immutable once created; every publish
/// cycle constructs a fresh sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub captured_at: OffsetDateTime,
}

impl LocationSample {
    pub fn new(
        driver_id: DriverId,
        position: Coordinates,
        address: String,
        captured_at: OffsetDateTime,
    ) -> Self {
        Self {
            driver_id,
            latitude: position.latitude,
            longitude: position.longitude,
            address,
            captured_at,
        }
    }

    pub fn position(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn payload(&self) -> LocationPayload {
        LocationPayload {
            driver_id: self.driver_id.clone(),
            updated_at: self.captured_at,
            latitude: self.latitude,
            longitude: self.longitude,
            address: self.address.clone(),
        }
    }

    pub fn from_payload(payload: LocationPayload) -> Self {
        Self {
            driver_id: payload.driver_id,
            latitude: payload.latitude,
            longitude: payload.longitude,
            address: payload.address,
            captured_at: payload.updated_at,
        }
    }
}

/// The JSON shape that crosses the messaging transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub driver_id: DriverId,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed location payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("coordinates out of range: lat {latitude}, lon {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
}

impl LocationPayload {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses and validates an inbound payload. Missing fields, unparseable
    /// timestamps, and off-planet coordinates all reject the message; the
    /// caller logs and drops it without touching subscription state.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_slice(bytes)?;
        if !payload.latitude.is_finite()
            || !payload.longitude.is_finite()
            || payload.latitude.abs() > 90.0
            || payload.longitude.abs() > 180.0
        {
            return Err(PayloadError::OutOfRange {
                latitude: payload.latitude,
                longitude: payload.longitude,
            });
        }
        Ok(payload)
    }
}
