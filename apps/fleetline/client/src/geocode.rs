use std::time::Duration;

use async_trait::async_trait;
use fleetline_core::Coordinates;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Reverse-geocoding failures are always non-fatal: the acquirer substitutes
/// the sentinel address and the sample still counts.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(String),
    #[error("geocoder returned no address")]
    Empty,
}

/// Best-effort mapping from coordinates to a human-readable address.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn resolve(&self, position: &Coordinates) -> Result<String, GeocodeError>;
}

/// Reverse geocoder backed by a Nominatim-style HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpGeocoder {
    client: Client,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

impl HttpGeocoder {
    pub fn new(endpoint: Url) -> Result<Self, GeocodeError> {
        // Conservative timeouts: a slow geocoder must never hold up a
        // publish cycle longer than the acquirer's own geocode budget.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(4))
            .build()
            .map_err(|err| GeocodeError::Request(err.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ReverseGeocoder for HttpGeocoder {
    async fn resolve(&self, position: &Coordinates) -> Result<String, GeocodeError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("format", "jsonv2")
            .append_pair("lat", &position.latitude.to_string())
            .append_pair("lon", &position.longitude.to_string());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| GeocodeError::Request(err.to_string()))?
            .error_for_status()
            .map_err(|err| GeocodeError::Request(err.to_string()))?;

        let body: ReverseResponse = response
            .json()
            .await
            .map_err(|err| GeocodeError::Request(err.to_string()))?;

        body.display_name
            .filter(|name| !name.is_empty())
            .ok_or(GeocodeError::Empty)
    }
}
