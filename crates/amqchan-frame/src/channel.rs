//! Channel number ranges.
//!
//! Channel 0 carries connection-level methods.
//! Channels 1..=channel-max are application channels.

/// Connection-level methods (close, close-ok, heartbeats).
pub const CONNECTION: u16 = 0;

/// First application channel number.
pub const FIRST_CHANNEL: u16 = 1;

/// Channel-max used when the broker does not negotiate a lower one.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Returns true if frames on this channel address the connection itself.
pub fn is_connection_level(id: u16) -> bool {
    id == CONNECTION
}

/// Returns a human-readable label for a channel number.
pub fn channel_label(id: u16) -> String {
    if is_connection_level(id) {
        "connection".to_string()
    } else {
        format!("channel #{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(channel_label(0), "connection");
        assert_eq!(channel_label(7), "channel #7");
        assert!(is_connection_level(CONNECTION));
        assert!(!is_connection_level(FIRST_CHANNEL));
    }
}
