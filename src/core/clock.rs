//! Monotonic-enough wall clock helpers shared across the hub.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Current time as whole seconds since the Unix epoch, the unit JWT `exp`/`iat`
/// claims and session expiry fields are expressed in.
pub fn now_s() -> u64 {
    now_ms() / 1000
}

/// Current time formatted as RFC 3339 / ISO-8601, used on wire envelopes that
/// carry a human-readable timestamp (channel broadcasts, `/health`).
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_s_tracks_now_ms() {
        let a = now_ms();
        let b = now_s();
        assert!(b * 1000 <= a + 1000);
    }

    #[test]
    fn now_iso_is_rfc3339() {
        let s = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&s).is_ok());
    }
}
