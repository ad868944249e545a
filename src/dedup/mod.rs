//! # Delivery Deduplication
//!
//! A message can reach the phone twice: once over the live radio stream and
//! once through the out-of-band push relay, or several times over the same path
//! when the radio retransmits. [`DeliveryDeduplicator`] makes ingestion
//! idempotent across all of them.
//!
//! ## Layers
//!
//! Checked in order, first match wins:
//!
//! 1. **Application id** - exact match against held items.
//! 2. **Packet id** - exact match on the radio packet id (device path only).
//! 3. **Recent signature** - `(conversation, text, timestamp)` seen within the
//!    short recent window. Catches rapid resends before a stable id exists.
//! 4. **Content fingerprint** - same sender and text, and same channel (for
//!    broadcasts) or recipient (for direct messages), with timestamps within
//!    the fingerprint window.
//!
//! Only layer 4 is heuristic. A duplicate is dropped whole; nothing is merged.
//!
//! The held set is bounded by [`DedupTuning::max_held`] and evicts FIFO,
//! cleaning the id indexes as entries leave.
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use crate::logutil::escape_log;
use crate::metrics;
use crate::protocol::{InboundMessage, Recipient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupTuning {
    pub recent_window: Duration,
    pub fingerprint_window: Duration,
    /// Coarse timestamp bucket folded into derived application ids.
    pub bucket: Duration,
    pub max_held: usize,
}

impl Default for DedupTuning {
    fn default() -> Self {
        Self {
            recent_window: Duration::from_secs(5),
            fingerprint_window: Duration::from_secs(60),
            bucket: Duration::from_secs(60),
            max_held: 2000,
        }
    }
}

/// Which layer recognised a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DuplicateReason {
    AppId,
    PacketId,
    RecentSignature,
    ContentFingerprint,
}

impl fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DuplicateReason::AppId => "app-id",
            DuplicateReason::PacketId => "packet-id",
            DuplicateReason::RecentSignature => "recent-signature",
            DuplicateReason::ContentFingerprint => "content-fingerprint",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// New message; carries the application id it is now held under.
    Admitted { app_id: String },
    Duplicate(DuplicateReason),
}

impl DedupVerdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, DedupVerdict::Admitted { .. })
    }
}

/// Channel for broadcasts, the destination node for direct messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addressee {
    Channel(u32),
    Node(u32),
}

/// Content identity of a message, independent of delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFingerprint {
    pub sender: u32,
    pub addressee: Addressee,
    pub text: String,
    /// `timestamp / bucket`, in whole buckets since the epoch.
    pub bucket: i64,
}

impl MessageFingerprint {
    pub fn new(
        sender: u32,
        recipient: Recipient,
        channel: u32,
        text: &str,
        timestamp: DateTime<Utc>,
        bucket: Duration,
    ) -> Self {
        let addressee = match recipient {
            Recipient::Broadcast => Addressee::Channel(channel),
            Recipient::Node(n) => Addressee::Node(n),
        };
        let bucket_secs = bucket.as_secs().max(1) as i64;
        Self {
            sender,
            addressee,
            text: text.to_string(),
            bucket: timestamp.timestamp().div_euclid(bucket_secs),
        }
    }

    pub fn from_message(msg: &InboundMessage, bucket: Duration) -> Self {
        Self::new(
            msg.sender,
            msg.recipient,
            msg.channel,
            &msg.text,
            msg.timestamp,
            bucket,
        )
    }

    /// Deterministic application id: hex of the first 16 bytes of SHA-256 over
    /// the fingerprint fields.
    pub fn app_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.to_be_bytes());
        match self.addressee {
            Addressee::Channel(c) => {
                hasher.update(b"c");
                hasher.update(c.to_be_bytes());
            }
            Addressee::Node(n) => {
                hasher.update(b"n");
                hasher.update(n.to_be_bytes());
            }
        }
        hasher.update(self.bucket.to_be_bytes());
        hasher.update(self.text.as_bytes());
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Clone)]
struct Held {
    app_id: String,
    packet_id: Option<u32>,
    sender: u32,
    recipient: Recipient,
    channel: u32,
    text: String,
    timestamp: DateTime<Utc>,
}

impl Held {
    fn same_content(&self, msg: &InboundMessage, window: chrono::Duration) -> bool {
        if self.sender != msg.sender || self.text != msg.text {
            return false;
        }
        let addressed_alike = match (self.recipient, msg.recipient) {
            // Relays rewrite the destination of channel traffic; compare channels only.
            (Recipient::Broadcast, Recipient::Broadcast) => self.channel == msg.channel,
            (Recipient::Node(a), Recipient::Node(b)) => a == b,
            _ => false,
        };
        let delta = self.timestamp - msg.timestamp;
        addressed_alike && delta <= window && delta >= -window
    }
}

pub struct DeliveryDeduplicator {
    tuning: DedupTuning,
    held: VecDeque<Held>,
    app_ids: HashSet<String>,
    packet_ids: HashSet<u32>,
    recent: VecDeque<(String, DateTime<Utc>)>,
    recent_index: HashMap<String, DateTime<Utc>>,
}

impl DeliveryDeduplicator {
    pub fn new(tuning: DedupTuning) -> Self {
        Self {
            tuning,
            held: VecDeque::new(),
            app_ids: HashSet::new(),
            packet_ids: HashSet::new(),
            recent: VecDeque::new(),
            recent_index: HashMap::new(),
        }
    }

    pub fn tuning(&self) -> &DedupTuning {
        &self.tuning
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn contains_app_id(&self, app_id: &str) -> bool {
        self.app_ids.contains(app_id)
    }

    /// Application id for `msg`: its own id when present, otherwise derived
    /// from the content fingerprint.
    pub fn app_id_for(&self, msg: &InboundMessage) -> String {
        match &msg.app_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => MessageFingerprint::from_message(msg, self.tuning.bucket).app_id(),
        }
    }

    pub fn admit(&mut self, msg: &InboundMessage) -> DedupVerdict {
        self.admit_at(msg, Utc::now())
    }

    /// Run `msg` through every layer, treating `now` as the arrival time.
    pub fn admit_at(&mut self, msg: &InboundMessage, now: DateTime<Utc>) -> DedupVerdict {
        self.prune_recent(now);
        let app_id = self.app_id_for(msg);
        let verdict = match self.find_duplicate(msg, &app_id) {
            Some(reason) => DedupVerdict::Duplicate(reason),
            None => {
                self.hold(msg, app_id.clone(), now);
                DedupVerdict::Admitted { app_id }
            }
        };
        match &verdict {
            DedupVerdict::Admitted { app_id } => {
                metrics::inc_inbound_admitted();
                trace!(
                    "Admitted {} from {:08x} via {:?}: {}",
                    app_id,
                    msg.sender,
                    msg.path,
                    escape_log(&msg.text)
                );
            }
            DedupVerdict::Duplicate(reason) => {
                metrics::inc_duplicate(*reason);
                debug!(
                    "Dropped duplicate ({}) from {:08x} via {:?}: {}",
                    reason,
                    msg.sender,
                    msg.path,
                    escape_log(&msg.text)
                );
            }
        }
        verdict
    }

    fn find_duplicate(&self, msg: &InboundMessage, app_id: &str) -> Option<DuplicateReason> {
        if self.app_ids.contains(app_id) {
            return Some(DuplicateReason::AppId);
        }
        if let Some(pid) = msg.packet_id {
            if self.packet_ids.contains(&pid) {
                return Some(DuplicateReason::PacketId);
            }
        }
        if self.recent_index.contains_key(&signature(msg)) {
            return Some(DuplicateReason::RecentSignature);
        }
        let window = to_chrono(self.tuning.fingerprint_window);
        if self.held.iter().rev().any(|h| h.same_content(msg, window)) {
            return Some(DuplicateReason::ContentFingerprint);
        }
        None
    }

    fn hold(&mut self, msg: &InboundMessage, app_id: String, now: DateTime<Utc>) {
        while self.held.len() >= self.tuning.max_held {
            match self.held.pop_front() {
                Some(old) => {
                    self.app_ids.remove(&old.app_id);
                    if let Some(pid) = old.packet_id {
                        self.packet_ids.remove(&pid);
                    }
                }
                None => break,
            }
        }
        self.app_ids.insert(app_id.clone());
        if let Some(pid) = msg.packet_id {
            self.packet_ids.insert(pid);
        }
        self.held.push_back(Held {
            app_id,
            packet_id: msg.packet_id,
            sender: msg.sender,
            recipient: msg.recipient,
            channel: msg.channel,
            text: msg.text.clone(),
            timestamp: msg.timestamp,
        });

        let sig = signature(msg);
        self.recent_index.insert(sig.clone(), now);
        self.recent.push_back((sig, now));
    }

    fn prune_recent(&mut self, now: DateTime<Utc>) {
        let cutoff = now - to_chrono(self.tuning.recent_window);
        while let Some((_, seen)) = self.recent.front() {
            if *seen > cutoff {
                break;
            }
            if let Some((sig, seen)) = self.recent.pop_front() {
                // Only drop the index entry if it was not refreshed later.
                if self.recent_index.get(&sig) == Some(&seen) {
                    self.recent_index.remove(&sig);
                }
            }
        }
    }
}

fn signature(msg: &InboundMessage) -> String {
    format!(
        "{}|{}|{}",
        msg.conversation(),
        msg.timestamp.timestamp_millis(),
        msg.text
    )
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeliveryPath;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn channel_msg(app_id: Option<&str>, text: &str, ts: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            app_id: app_id.map(str::to_string),
            packet_id: None,
            sender: 0x1234_abcd,
            recipient: Recipient::Broadcast,
            channel: 1,
            text: text.to_string(),
            timestamp: ts,
            path: DeliveryPath::Device,
        }
    }

    #[test]
    fn app_id_is_stable_and_content_sensitive() {
        let a = MessageFingerprint::from_message(&channel_msg(None, "hi", at(0)), Duration::from_secs(60));
        let b = MessageFingerprint::from_message(&channel_msg(None, "hi", at(30)), Duration::from_secs(60));
        let c = MessageFingerprint::from_message(&channel_msg(None, "hey", at(0)), Duration::from_secs(60));
        assert_eq!(a.app_id(), b.app_id());
        assert_ne!(a.app_id(), c.app_id());
        assert_eq!(a.app_id().len(), 32);
    }

    #[test]
    fn replay_with_same_id_is_dropped_and_not_held_twice() {
        let mut dedup = DeliveryDeduplicator::new(DedupTuning::default());
        let msg = channel_msg(Some("x1"), "hi", at(0));
        assert!(dedup.admit_at(&msg, at(0)).is_admitted());
        for i in 1..5 {
            assert_eq!(
                dedup.admit_at(&msg, at(i * 100)),
                DedupVerdict::Duplicate(DuplicateReason::AppId)
            );
        }
        assert_eq!(dedup.held_count(), 1);
    }

    #[test]
    fn packet_id_catches_redelivery_with_new_app_id() {
        let mut dedup = DeliveryDeduplicator::new(DedupTuning::default());
        let mut first = channel_msg(Some("a"), "ping", at(0));
        first.packet_id = Some(77);
        let mut again = channel_msg(Some("b"), "pong", at(400));
        again.packet_id = Some(77);
        assert!(dedup.admit_at(&first, at(0)).is_admitted());
        assert_eq!(
            dedup.admit_at(&again, at(400)),
            DedupVerdict::Duplicate(DuplicateReason::PacketId)
        );
    }

    #[test]
    fn recent_signature_window_expires() {
        let tuning = DedupTuning {
            fingerprint_window: Duration::from_secs(5),
            ..DedupTuning::default()
        };
        let mut dedup = DeliveryDeduplicator::new(tuning);
        let ts = at(0);
        assert!(dedup.admit_at(&channel_msg(Some("a"), "yo", ts), at(0)).is_admitted());
        assert_eq!(
            dedup.admit_at(&channel_msg(Some("b"), "yo", ts), at(2)),
            DedupVerdict::Duplicate(DuplicateReason::RecentSignature)
        );
        // Past the recent window only the fingerprint layer remains, and the
        // message timestamp is still inside it.
        assert_eq!(
            dedup.admit_at(&channel_msg(Some("c"), "yo", ts), at(10)),
            DedupVerdict::Duplicate(DuplicateReason::ContentFingerprint)
        );
    }

    #[test]
    fn fingerprint_skips_recipient_for_broadcasts() {
        let mut dedup = DeliveryDeduplicator::new(DedupTuning::default());
        assert!(dedup.admit_at(&channel_msg(Some("x1"), "hi", at(0)), at(0)).is_admitted());
        let mut relayed = channel_msg(Some("x2"), "hi", at(20));
        relayed.path = DeliveryPath::PushRelay;
        assert_eq!(
            dedup.admit_at(&relayed, at(20)),
            DedupVerdict::Duplicate(DuplicateReason::ContentFingerprint)
        );
        let mut other_channel = channel_msg(Some("x3"), "hi", at(25));
        other_channel.channel = 2;
        assert!(dedup.admit_at(&other_channel, at(25)).is_admitted());
    }

    #[test]
    fn direct_messages_compare_recipient() {
        let mut dedup = DeliveryDeduplicator::new(DedupTuning::default());
        let mut to_a = channel_msg(Some("d1"), "meet at 5", at(0));
        to_a.recipient = Recipient::Node(0xa);
        let mut to_b = channel_msg(Some("d2"), "meet at 5", at(10));
        to_b.recipient = Recipient::Node(0xb);
        assert!(dedup.admit_at(&to_a, at(0)).is_admitted());
        assert!(dedup.admit_at(&to_b, at(10)).is_admitted());
    }

    #[test]
    fn same_text_ten_minutes_apart_is_admitted() {
        let mut dedup = DeliveryDeduplicator::new(DedupTuning::default());
        assert!(dedup.admit_at(&channel_msg(None, "check-in", at(0)), at(0)).is_admitted());
        assert!(dedup
            .admit_at(&channel_msg(None, "check-in", at(600)), at(600))
            .is_admitted());
        assert_eq!(dedup.held_count(), 2);
    }

    #[test]
    fn held_set_evicts_fifo_and_cleans_indexes() {
        let tuning = DedupTuning {
            max_held: 3,
            ..DedupTuning::default()
        };
        let mut dedup = DeliveryDeduplicator::new(tuning);
        for i in 0..4i64 {
            let mut m = channel_msg(Some(&format!("id{}", i)), &format!("m{}", i), at(i * 1000));
            m.packet_id = Some(i as u32);
            assert!(dedup.admit_at(&m, at(i * 1000)).is_admitted());
        }
        assert_eq!(dedup.held_count(), 3);
        assert!(!dedup.contains_app_id("id0"));
        assert!(dedup.contains_app_id("id3"));
        let mut back = channel_msg(Some("id0"), "m0", at(0));
        back.packet_id = Some(0);
        assert!(dedup.admit_at(&back, at(5000)).is_admitted());
    }
}
