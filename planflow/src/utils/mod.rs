//! Utility functions for id generation and timestamp handling.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{epoch_millis, from_epoch_millis, iso_timestamp, now_utc, Timestamp};
pub use uuid_utils::{generate_id, generate_uuid};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_is_valid() {
        let id = generate_uuid();
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.contains(':'));
    }
}
