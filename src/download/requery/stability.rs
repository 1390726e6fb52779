use std::sync::Mutex;

use super::{MIN_MESSAGES_PER_CONNECTION, MIN_STABLE_CONNECTIONS, MIN_TOTAL_MESSAGES};

/// Read-only view of the live server/peer connections.
pub trait ConnectionProbe: Send + Sync {
    /// Number of connections that have exchanged at least `messages` messages.
    fn count_connections_with_at_least(&self, messages: u64) -> u32;
    /// Messages exchanged over all currently active connections.
    fn total_active_connection_messages(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityThresholds {
    pub min_stable_connections: u32,
    pub min_messages_per_connection: u64,
    pub min_total_messages: u64,
}

impl Default for StabilityThresholds {
    fn default() -> Self {
        Self {
            min_stable_connections: MIN_STABLE_CONNECTIONS,
            min_messages_per_connection: MIN_MESSAGES_PER_CONNECTION,
            min_total_messages: MIN_TOTAL_MESSAGES,
        }
    }
}

impl StabilityThresholds {
    /// Connections are stable enough for a requery once enough of them carried
    /// real traffic. On a small private network these limits can be too strict.
    pub fn is_stable(&self, probe: &dyn ConnectionProbe) -> bool {
        probe.count_connections_with_at_least(self.min_messages_per_connection)
            >= self.min_stable_connections
            && probe.total_active_connection_messages() >= self.min_total_messages
    }
}

/// Probe over per-connection message counts pushed in by the host.
#[derive(Debug, Default)]
pub struct StaticConnectionProbe {
    per_connection: Mutex<Vec<u64>>,
}

impl StaticConnectionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counts(counts: impl IntoIterator<Item = u64>) -> Self {
        let probe = Self::new();
        probe.set_counts(counts);
        probe
    }

    /// Replaces the message count of every active connection.
    pub fn set_counts(&self, counts: impl IntoIterator<Item = u64>) {
        let mut guard = match self.per_connection.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clear();
        guard.extend(counts);
    }

    fn read<T>(&self, f: impl FnOnce(&[u64]) -> T) -> T {
        match self.per_connection.lock() {
            Ok(g) => f(g.as_slice()),
            Err(poisoned) => f(poisoned.into_inner().as_slice()),
        }
    }
}

impl ConnectionProbe for StaticConnectionProbe {
    fn count_connections_with_at_least(&self, messages: u64) -> u32 {
        self.read(|counts| {
            let n = counts.iter().filter(|c| **c >= messages).count();
            u32::try_from(n).unwrap_or(u32::MAX)
        })
    }

    fn total_active_connection_messages(&self) -> u64 {
        self.read(|counts| counts.iter().fold(0u64, |acc, c| acc.saturating_add(*c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_at_exact_thresholds() {
        // Two connections at the per-connection minimum plus enough traffic elsewhere.
        let probe = StaticConnectionProbe::with_counts([6, 6, 33]);
        assert!(StabilityThresholds::default().is_stable(&probe));
    }

    #[test]
    fn unstable_with_too_few_busy_connections() {
        let probe = StaticConnectionProbe::with_counts([100, 5, 5]);
        assert!(!StabilityThresholds::default().is_stable(&probe));
    }

    #[test]
    fn unstable_with_too_little_total_traffic() {
        let probe = StaticConnectionProbe::with_counts([6, 6, 6, 6, 6, 6, 6]);
        assert_eq!(probe.total_active_connection_messages(), 42);
        assert!(!StabilityThresholds::default().is_stable(&probe));
    }

    #[test]
    fn unstable_without_connections() {
        let probe = StaticConnectionProbe::new();
        assert_eq!(probe.count_connections_with_at_least(0), 0);
        assert!(!StabilityThresholds::default().is_stable(&probe));
    }

    #[test]
    fn set_counts_replaces_previous_snapshot() {
        let probe = StaticConnectionProbe::with_counts([50, 50]);
        assert!(StabilityThresholds::default().is_stable(&probe));
        probe.set_counts([1]);
        assert!(!StabilityThresholds::default().is_stable(&probe));
    }
}
