use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A single monotonically increasing counter.
///
/// # Test
///
/// ```
/// use sip_gateway_service::stats::Count;
///
/// let count = Count::default();
///
/// assert_eq!(count.get(), 0);
/// count.add(1);
/// assert_eq!(count.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Count(AtomicU64);

impl Count {
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters surfaced on the health endpoint.
#[derive(Debug, Default)]
pub struct Stats {
    pub calls_placed: Count,
    pub calls_received: Count,
    pub calls_completed: Count,
    pub calls_failed: Count,
    pub retried_invites: Count,
    pub re_invites: Count,
    pub dtmf_digits_received: Count,
    pub relay_requests: Count,
    pub relay_errors: Count,
    pub parse_errors: Count,
}

/// Point-in-time copy of [`Stats`], shaped for the `/health` JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub calls_placed: u64,
    pub calls_received: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub retried_invites: u64,
    pub re_invites: u64,
    pub dtmf_digits_received: u64,
    pub relay_requests: u64,
    pub relay_errors: u64,
    pub parse_errors: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls_placed: self.calls_placed.get(),
            calls_received: self.calls_received.get(),
            calls_completed: self.calls_completed.get(),
            calls_failed: self.calls_failed.get(),
            retried_invites: self.retried_invites.get(),
            re_invites: self.re_invites.get(),
            dtmf_digits_received: self.dtmf_digits_received.get(),
            relay_requests: self.relay_requests.get(),
            relay_errors: self.relay_errors.get(),
            parse_errors: self.parse_errors.get(),
        }
    }
}
