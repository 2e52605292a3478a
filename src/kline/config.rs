//! Framing-engine configuration.

use std::time::Duration;

/// Default spacing between consecutive writes to the bus.
pub const DEFAULT_WRITE_SPACING: Duration = Duration::from_millis(30);

/// Shortest write spacing the bus tolerates.
pub const MIN_WRITE_SPACING: Duration = Duration::from_millis(20);

/// Longest write spacing that still keeps the module's keep-alive window.
pub const MAX_WRITE_SPACING: Duration = Duration::from_millis(100);

/// Tunables for the framing engine.
///
/// The defaults match the bus as observed; most callers only ever touch
/// [`with_write_spacing`](LinkConfig::with_write_spacing).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Minimum gap between consecutive frame writes.
    pub write_spacing: Duration,
    /// How long `send` waits for room in the outbound queue before giving
    /// up with `BufferFull`.
    pub send_timeout: Duration,
    /// Outbound queue depth.
    pub outbound_depth: usize,
    /// Inbound (reader → dispatcher) queue depth.
    pub inbound_depth: usize,
    /// Per-subscriber queue depth.
    pub subscriber_depth: usize,
    /// Echo-suppression ring capacity in bytes.
    pub echo_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            write_spacing: DEFAULT_WRITE_SPACING,
            send_timeout: Duration::from_secs(1),
            outbound_depth: 100,
            inbound_depth: 100,
            subscriber_depth: 10,
            echo_capacity: 1024,
        }
    }
}

impl LinkConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the write spacing, clamped to the range the bus tolerates.
    #[must_use]
    pub fn with_write_spacing(mut self, spacing: Duration) -> Self {
        self.write_spacing = spacing.clamp(MIN_WRITE_SPACING, MAX_WRITE_SPACING);
        self
    }

    /// Set how long `send` waits for queue room before failing.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the per-subscriber queue depth.
    #[must_use]
    pub fn with_subscriber_depth(mut self, depth: usize) -> Self {
        self.subscriber_depth = depth.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_observed_bus_parameters() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.write_spacing, Duration::from_millis(30));
        assert_eq!(cfg.send_timeout, Duration::from_secs(1));
        assert_eq!(cfg.outbound_depth, 100);
        assert_eq!(cfg.subscriber_depth, 10);
        assert!(cfg.echo_capacity >= 1024);
    }

    #[test]
    fn write_spacing_is_clamped() {
        let fast = LinkConfig::new().with_write_spacing(Duration::from_millis(5));
        assert_eq!(fast.write_spacing, MIN_WRITE_SPACING);
        let slow = LinkConfig::new().with_write_spacing(Duration::from_millis(500));
        assert_eq!(slow.write_spacing, MAX_WRITE_SPACING);
    }
}
