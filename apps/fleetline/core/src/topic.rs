use crate::sample::DriverId;

/// Single shared publish destination. Every publisher sends here; the broker
/// fans samples out to the per-driver topics below.
pub const INGEST_TOPIC: &str = "fleet.location.ingest";

/// Inbound topic carrying one driver's location updates.
pub fn driver_topic(driver: &DriverId) -> String {
    format!("fleet.location.driver.{driver}")
}
