//! Shared row-decoding helpers for the storage backends.
//!
//! Database rows are decoded leniently: an unknown status code or sub-status
//! written by a newer (or older) build must not poison reads, so the
//! converters fall back to conservative defaults instead of failing the row.

use crate::{EventType, ProbeStatus, SubStatus};

/// Decode a persisted status code, treating unknown values as red.
pub fn status_lossy(code: i64) -> ProbeStatus {
    ProbeStatus::from_code(code).unwrap_or(ProbeStatus::Red)
}

/// Decode a persisted sub-status, treating unknown strings as empty.
pub fn sub_status_lossy(raw: &str) -> SubStatus {
    SubStatus::parse(raw).unwrap_or_default()
}

/// Decode a persisted event type, treating unknown strings as DOWN (the
/// conservative direction for a notifier).
pub fn event_type_lossy(raw: &str) -> EventType {
    EventType::parse(raw).unwrap_or(EventType::Down)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossy_decoders_fall_back() {
        assert_eq!(status_lossy(1), ProbeStatus::Green);
        assert_eq!(status_lossy(9), ProbeStatus::Red);
        assert_eq!(sub_status_lossy("rate_limit"), SubStatus::RateLimit);
        assert_eq!(sub_status_lossy("mystery"), SubStatus::None);
        assert_eq!(event_type_lossy("UP"), EventType::Up);
        assert_eq!(event_type_lossy("SIDEWAYS"), EventType::Down);
    }
}
