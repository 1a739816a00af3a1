use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::ErrorKind;
use crate::state::ServingState;

/// Counters and timings published by the query service.
#[derive(Debug, Default)]
pub struct TabletStats {
    errors: [AtomicU64; 4],
    panics: AtomicU64,
    timings: Mutex<BTreeMap<&'static str, Timing>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Timing {
    pub count: u64,
    #[serde(rename = "total_micros", serialize_with = "serialize_micros")]
    pub total: Duration,
}

fn serialize_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

impl TabletStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the time elapsed since `start` for a statement type.
    pub fn record_timing(&self, name: &'static str, start: Instant) {
        let elapsed = start.elapsed();
        let mut timings = self.timings.lock();
        let timing = timings.entry(name).or_default();
        timing.count += 1;
        timing.total += elapsed;
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind.index()].load(Ordering::Relaxed)
    }

    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn timing(&self, name: &str) -> Option<Timing> {
        self.timings.lock().get(name).copied()
    }

    pub fn snapshot(&self, state: ServingState) -> StatsSnapshot {
        StatsSnapshot {
            state: state as u8,
            state_name: state.as_str(),
            errors: ErrorKind::ALL
                .iter()
                .map(|kind| (kind.as_str(), self.error_count(*kind)))
                .collect(),
            panics: self.panic_count(),
            timings: self.timings.lock().clone(),
        }
    }
}

/// Point in time copy of the stats, ready to be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub state: u8,
    pub state_name: &'static str,
    pub errors: BTreeMap<&'static str, u64>,
    pub panics: u64,
    pub timings: BTreeMap<&'static str, Timing>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes() {
        let stats = TabletStats::new();
        stats.record_error(ErrorKind::Retry);
        stats.record_error(ErrorKind::Retry);
        stats.record_error(ErrorKind::Fail);
        stats.record_panic();
        stats.record_timing("BEGIN", Instant::now());

        let snapshot = stats.snapshot(ServingState::Serving);
        assert_eq!(2, snapshot.errors["Retry"]);
        assert_eq!(0, snapshot.errors["Fatal"]);
        assert_eq!(1, snapshot.errors["Fail"]);
        assert_eq!(1, snapshot.timings["BEGIN"].count);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!("SERVING", json["state_name"]);
        assert_eq!(2, json["state"]);
        assert_eq!(1, json["panics"]);
        assert!(json["timings"]["BEGIN"]["total_micros"].is_u64());
    }
}
