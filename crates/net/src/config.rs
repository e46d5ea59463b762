use std::time::Duration;

/// Tunable knobs for sessions and servers. Defaults match the protocol's
/// reference timings; tests shrink them to keep handshakes fast.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Stream keep-alive interval.
    pub reliable_ping_interval: Duration,
    /// Datagram keep-alive interval (doubles as the NAT probe cadence).
    pub unreliable_ping_interval: Duration,
    /// Inactivity window after which a connection is considered dead.
    pub timeout: Duration,
    /// Outbound packet queue capacity (scaled by connection count on the
    /// server's shared datagram queue).
    pub packet_queue_size: usize,
    /// Inbound event queue capacity (scaled likewise on the server).
    pub event_queue_size: usize,
    /// Client worker pacing sleep between ticks.
    pub client_idle_sleep: Duration,
    /// Server worker pacing sleep between ticks.
    pub server_idle_sleep: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            reliable_ping_interval: Duration::from_secs(3),
            unreliable_ping_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(15),
            packet_queue_size: 25,
            event_queue_size: 25,
            client_idle_sleep: Duration::from_micros(200),
            server_idle_sleep: Duration::from_micros(50),
        }
    }
}
