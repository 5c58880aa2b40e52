//! Wire-level constants shared by the server and the test client.

use std::time::Duration;

/// Path of the upgrade endpoint.
pub const WS_PATH: &str = "/ws";

/// Query parameter carrying the claimed client id.
pub const UID_PARAM: &str = "uid";

/// A peer that has not answered a ping within this window is dropped.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a single outbound write (frame, ping or close).
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted inbound frame / message size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// How long a closing side waits for the peer's close acknowledgment.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Ping period for a given peer timeout: 90% of it, so a ping always lands
/// before the peer's read deadline expires.
pub fn ping_period(peer_timeout: Duration) -> Duration {
    peer_timeout * 9 / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ping_period_is_54s() {
        assert_eq!(ping_period(DEFAULT_PEER_TIMEOUT), Duration::from_secs(54));
    }

    #[test]
    fn ping_period_short_timeouts() {
        assert_eq!(
            ping_period(Duration::from_millis(500)),
            Duration::from_millis(450)
        );
    }
}
