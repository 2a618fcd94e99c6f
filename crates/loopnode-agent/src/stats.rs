//! Stats hook
//!
//! The agent emits per-event counters; an external aggregator (bandwidth
//! accounting, dashboards) consumes them. No aggregation happens here.

use std::sync::Arc;

/// A single countable event. Byte counts are per relayed chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatsEvent {
    Connected,
    Disconnected,
    TunnelOpened,
    TunnelClosed,
    /// Bytes relayed from a tunnel target toward the gateway.
    TunnelBytesUp(u64),
    /// Bytes written from the gateway into a tunnel target.
    TunnelBytesDown(u64),
    ProxyCompleted { ok: bool },
    IpInfoSent,
}

/// Event consumer. Called from arbitrary tasks.
pub trait StatsSink: Send + Sync {
    fn record(&self, event: StatsEvent);
}

pub type SharedStats = Arc<dyn StatsSink>;

/// Discards every event.
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record(&self, _event: StatsEvent) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records events for assertions.
    #[derive(Default)]
    pub struct RecordingStats {
        pub events: Mutex<Vec<StatsEvent>>,
    }

    impl StatsSink for RecordingStats {
        fn record(&self, event: StatsEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
