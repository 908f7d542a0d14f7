//! Id generation utilities.
//!
//! Every record the engine persists (plan executions, node executions, wait
//! instances, restraint instances) is keyed by a string id so that ids can
//! round-trip through external transports unchanged.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new string id suitable for keying persisted records.
#[must_use]
pub fn generate_id() -> String {
    generate_uuid().to_string()
}
