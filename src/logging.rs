use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

fn shorten(value: &str, head: usize, tail: usize) -> String {
    if value.len() <= head + tail {
        return value.to_string();
    }
    format!("{}..{}", &value[..head], &value[value.len() - tail..])
}

pub fn redact_hex(value: &str) -> String {
    shorten(value, 8, 8)
}

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Rate limit for one repeating warning.
///
/// `allow` returns `Some(suppressed)` when the warning may be emitted, where
/// `suppressed` is how many calls were swallowed since the last emitted one.
#[derive(Debug)]
pub struct WarnThrottle {
    interval: Duration,
    state: Mutex<Option<WarnThrottleState>>,
}

impl WarnThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(None),
        }
    }

    pub fn allow(&self, now: Instant) -> Option<u64> {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("warn throttle lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        };
        if let Some(state) = guard.as_mut() {
            if now.saturating_duration_since(state.last) < self.interval {
                state.suppressed = state.suppressed.saturating_add(1);
                return None;
            }
            let suppressed = state.suppressed;
            state.last = now;
            state.suppressed = 0;
            return Some(suppressed);
        }
        *guard = Some(WarnThrottleState {
            last: now,
            suppressed: 0,
        });
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hex_keeps_head_and_tail() {
        assert_eq!(
            redact_hex("0123456789abcdef0123456789abcdef"),
            "01234567..89abcdef"
        );
        assert_eq!(redact_hex("abcd"), "abcd");
    }

    #[test]
    fn throttle_counts_suppressed_calls_until_interval_passes() {
        let throttle = WarnThrottle::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(throttle.allow(t0), Some(0));
        assert_eq!(throttle.allow(t0 + Duration::from_secs(1)), None);
        assert_eq!(throttle.allow(t0 + Duration::from_secs(9)), None);
        assert_eq!(throttle.allow(t0 + Duration::from_secs(10)), Some(2));
        assert_eq!(throttle.allow(t0 + Duration::from_secs(11)), None);
    }
}
