//! Process-wide counters for the link core.
//! Cheap relaxed atomics; read them with [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::dedup::DuplicateReason;

static RECONNECT_STARTED: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static RECONNECT_RECOVERED: AtomicU64 = AtomicU64::new(0);
static RECONNECT_EXHAUSTED: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ABORTED: AtomicU64 = AtomicU64::new(0);
static RECOVERY_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static REGION_APPLIED: AtomicU64 = AtomicU64::new(0);
static REGION_FAILED: AtomicU64 = AtomicU64::new(0);
static INBOUND_ADMITTED: AtomicU64 = AtomicU64::new(0);
static DUP_APP_ID: AtomicU64 = AtomicU64::new(0);
static DUP_PACKET_ID: AtomicU64 = AtomicU64::new(0);
static DUP_RECENT: AtomicU64 = AtomicU64::new(0);
static DUP_FINGERPRINT: AtomicU64 = AtomicU64::new(0);
static SEND_ACKED: AtomicU64 = AtomicU64::new(0);
static SEND_EXPIRED: AtomicU64 = AtomicU64::new(0);

pub fn inc_reconnect_started() {
    RECONNECT_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
/// Count a recovery that took `elapsed` from loop start.
pub fn observe_recovered(elapsed: Duration) {
    RECONNECT_RECOVERED.fetch_add(1, Ordering::Relaxed);
    let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    RECOVERY_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
}
pub fn inc_reconnect_exhausted() {
    RECONNECT_EXHAUSTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_aborted() {
    RECONNECT_ABORTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_region_applied() {
    REGION_APPLIED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_region_failed() {
    REGION_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbound_admitted() {
    INBOUND_ADMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicate(reason: DuplicateReason) {
    let counter = match reason {
        DuplicateReason::AppId => &DUP_APP_ID,
        DuplicateReason::PacketId => &DUP_PACKET_ID,
        DuplicateReason::RecentSignature => &DUP_RECENT,
        DuplicateReason::ContentFingerprint => &DUP_FINGERPRINT,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_send_acked() {
    SEND_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_send_expired() {
    SEND_EXPIRED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub reconnect_started: u64,
    pub reconnect_attempts: u64,
    pub reconnect_recovered: u64,
    pub reconnect_exhausted: u64,
    pub reconnect_aborted: u64,
    pub recovery_latency_avg_ms: Option<u64>,
    pub region_applied: u64,
    pub region_failed: u64,
    pub inbound_admitted: u64,
    pub duplicates_app_id: u64,
    pub duplicates_packet_id: u64,
    pub duplicates_recent: u64,
    pub duplicates_fingerprint: u64,
    pub send_acked: u64,
    pub send_expired: u64,
}

impl Snapshot {
    pub fn duplicates_total(&self) -> u64 {
        self.duplicates_app_id
            + self.duplicates_packet_id
            + self.duplicates_recent
            + self.duplicates_fingerprint
    }
}

pub fn snapshot() -> Snapshot {
    let recovered = RECONNECT_RECOVERED.load(Ordering::Relaxed);
    let latency_sum = RECOVERY_LATENCY_SUM_MS.load(Ordering::Relaxed);
    Snapshot {
        reconnect_started: RECONNECT_STARTED.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        reconnect_recovered: recovered,
        reconnect_exhausted: RECONNECT_EXHAUSTED.load(Ordering::Relaxed),
        reconnect_aborted: RECONNECT_ABORTED.load(Ordering::Relaxed),
        recovery_latency_avg_ms: if recovered > 0 {
            Some(latency_sum / recovered)
        } else {
            None
        },
        region_applied: REGION_APPLIED.load(Ordering::Relaxed),
        region_failed: REGION_FAILED.load(Ordering::Relaxed),
        inbound_admitted: INBOUND_ADMITTED.load(Ordering::Relaxed),
        duplicates_app_id: DUP_APP_ID.load(Ordering::Relaxed),
        duplicates_packet_id: DUP_PACKET_ID.load(Ordering::Relaxed),
        duplicates_recent: DUP_RECENT.load(Ordering::Relaxed),
        duplicates_fingerprint: DUP_FINGERPRINT.load(Ordering::Relaxed),
        send_acked: SEND_ACKED.load(Ordering::Relaxed),
        send_expired: SEND_EXPIRED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are process-wide and other tests bump them concurrently, so only
    // monotonic growth is asserted.
    #[test]
    fn duplicate_counters_grow() {
        let before = snapshot();
        inc_duplicate(DuplicateReason::PacketId);
        inc_duplicate(DuplicateReason::ContentFingerprint);
        let after = snapshot();
        assert!(after.duplicates_packet_id > before.duplicates_packet_id);
        assert!(after.duplicates_fingerprint > before.duplicates_fingerprint);
        assert!(after.duplicates_total() >= before.duplicates_total() + 2);
    }

    #[test]
    fn recovery_latency_average_present_after_recovery() {
        let before = snapshot();
        observe_recovered(Duration::from_millis(40));
        let after = snapshot();
        assert!(after.reconnect_recovered > before.reconnect_recovered);
        assert!(after.recovery_latency_avg_ms.is_some());
    }
}
