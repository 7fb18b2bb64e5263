use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetline_core::{Coordinates, ADDRESS_UNAVAILABLE};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::TrackingConfig;
use crate::geocode::ReverseGeocoder;

/// Reason codes reported by the geolocation capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeolocateError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("geolocation timed out")]
    Timeout,
}

/// Failure of a whole acquisition cycle, after the retry budget is spent.
/// Reported, never fatal: the enclosing publish cycle is simply skipped.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("acquisition timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("acquisition failed after {attempts} attempts: {last}")]
    Failed { attempts: u32, last: GeolocateError },
}

/// Host capability producing one coordinate reading per call.
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn locate(&self) -> Result<Coordinates, GeolocateError>;
}

/// A successfully acquired position with its best-effort address.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub position: Coordinates,
    pub address: String,
}

/// Wraps a single geolocation read with per-attempt timeout and a bounded
/// retry budget, then attaches a best-effort reverse-geocoded address.
pub struct PositionAcquirer {
    locator: Arc<dyn Geolocator>,
    geocoder: Arc<dyn ReverseGeocoder>,
    attempt_timeout: Duration,
    retry_budget: u32,
    retry_delay: Duration,
    geocode_timeout: Duration,
}

impl PositionAcquirer {
    pub fn new(
        locator: Arc<dyn Geolocator>,
        geocoder: Arc<dyn ReverseGeocoder>,
        config: &TrackingConfig,
    ) -> Self {
        Self {
            locator,
            geocoder,
            attempt_timeout: config.acquire_timeout,
            retry_budget: config.retry_budget.max(1),
            retry_delay: config.retry_delay,
            geocode_timeout: config.geocode_timeout,
        }
    }

    /// Obtain one position fix within bounded latency. Geocoding failure
    /// does not fail the fix; it substitutes the sentinel address.
    pub async fn acquire(&self) -> Result<PositionFix, AcquireError> {
        let mut last: Option<GeolocateError> = None;

        for attempt in 1..=self.retry_budget {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match timeout(self.attempt_timeout, self.locator.locate()).await {
                Ok(Ok(position)) => {
                    let address = self.resolve_address(&position).await;
                    return Ok(PositionFix { position, address });
                }
                Ok(Err(err)) => {
                    debug!(target: "fleet.geolocate", attempt, error = %err, "geolocation attempt failed");
                    last = Some(err);
                }
                Err(_) => {
                    debug!(target: "fleet.geolocate", attempt, "geolocation attempt timed out");
                    last = Some(GeolocateError::Timeout);
                }
            }
        }

        let attempts = self.retry_budget;
        match last {
            Some(GeolocateError::Timeout) | None => Err(AcquireError::Timeout { attempts }),
            Some(err) => Err(AcquireError::Failed {
                attempts,
                last: err,
            }),
        }
    }

    async fn resolve_address(&self, position: &Coordinates) -> String {
        match timeout(self.geocode_timeout, self.geocoder.resolve(position)).await {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                warn!(target: "fleet.geolocate", error = %err, "reverse geocode failed, using sentinel");
                ADDRESS_UNAVAILABLE.to_string()
            }
            Err(_) => {
                warn!(target: "fleet.geolocate", "reverse geocode timed out, using sentinel");
                ADDRESS_UNAVAILABLE.to_string()
            }
        }
    }
}
