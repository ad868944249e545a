//! # Protocol Session Interface
//!
//! The application protocol (config handshake, packet encode/decode) runs on top
//! of a [`crate::transport::TransportLink`] and is supplied by the embedding
//! application. This module defines the [`ProtocolSession`] trait plus the
//! message, ack and region types the rest of the crate consumes.
//!
//! Streams are broadcast channels so the link manager can drop and re-take its
//! subscriptions after a reconnect without coordinating with the producer.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

use crate::error::ProtocolError;

/// Broadcast destination used by Meshtastic for channel traffic.
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// LoRa regulatory region. Changing it makes the radio reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RegionCode {
    Unset,
    Us,
    Eu433,
    Eu868,
    Cn,
    Jp,
    Anz,
    Kr,
    Tw,
    Ru,
    In,
    Nz865,
    Th,
    Lora24,
    Ua433,
    Ua868,
    My433,
    My919,
    Sg923,
}

impl RegionCode {
    pub const ALL: [RegionCode; 19] = [
        RegionCode::Unset,
        RegionCode::Us,
        RegionCode::Eu433,
        RegionCode::Eu868,
        RegionCode::Cn,
        RegionCode::Jp,
        RegionCode::Anz,
        RegionCode::Kr,
        RegionCode::Tw,
        RegionCode::Ru,
        RegionCode::In,
        RegionCode::Nz865,
        RegionCode::Th,
        RegionCode::Lora24,
        RegionCode::Ua433,
        RegionCode::Ua868,
        RegionCode::My433,
        RegionCode::My919,
        RegionCode::Sg923,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RegionCode::Unset => "UNSET",
            RegionCode::Us => "US",
            RegionCode::Eu433 => "EU_433",
            RegionCode::Eu868 => "EU_868",
            RegionCode::Cn => "CN",
            RegionCode::Jp => "JP",
            RegionCode::Anz => "ANZ",
            RegionCode::Kr => "KR",
            RegionCode::Tw => "TW",
            RegionCode::Ru => "RU",
            RegionCode::In => "IN",
            RegionCode::Nz865 => "NZ_865",
            RegionCode::Th => "TH",
            RegionCode::Lora24 => "LORA_24",
            RegionCode::Ua433 => "UA_433",
            RegionCode::Ua868 => "UA_868",
            RegionCode::My433 => "MY_433",
            RegionCode::My919 => "MY_919",
            RegionCode::Sg923 => "SG_923",
        }
    }
}

impl TryFrom<String> for RegionCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegionCode> for String {
    fn from(region: RegionCode) -> Self {
        region.as_str().to_string()
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        RegionCode::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == wanted)
            .ok_or_else(|| format!("unknown region '{}'", s))
    }
}

/// Who a message was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Node(u32),
    Broadcast,
}

impl Recipient {
    pub fn from_dest(dest: u32) -> Self {
        if dest == BROADCAST_ADDR {
            Recipient::Broadcast
        } else {
            Recipient::Node(dest)
        }
    }

    pub fn is_broadcast(self) -> bool {
        matches!(self, Recipient::Broadcast)
    }
}

/// Which channel delivered an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryPath {
    /// Live stream from the connected radio.
    Device,
    /// Out-of-band push relay (notification service).
    PushRelay,
}

/// A text message as decoded by the protocol layer or the push relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Deterministic application id when the producer already knows it.
    pub app_id: Option<String>,
    /// Transport packet id; only present on the device path.
    pub packet_id: Option<u32>,
    pub sender: u32,
    pub recipient: Recipient,
    pub channel: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub path: DeliveryPath,
}

impl InboundMessage {
    /// Conversation key: the channel for broadcasts, the peer for DMs.
    pub fn conversation(&self) -> String {
        match self.recipient {
            Recipient::Broadcast => format!("ch:{}", self.channel),
            Recipient::Node(_) => format!("dm:{:08x}", self.sender),
        }
    }
}

/// Radio confirmation that a previously sent packet was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    pub packet_id: u32,
}

/// Text to transmit through the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingText {
    /// `None` for a channel broadcast.
    pub to_node: Option<u32>,
    pub channel: u32,
    pub content: String,
    pub want_ack: bool,
}

/// Application-level session layered over a transport link.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Run the config handshake on the current link. Resolves once complete.
    async fn start(&self) -> Result<(), ProtocolError>;

    fn handshake_complete(&self) -> bool;

    fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage>;

    fn subscribe_acks(&self) -> broadcast::Receiver<DeliveryAck>;

    /// Region values as reported by the radio's config stream.
    fn subscribe_region(&self) -> broadcast::Receiver<RegionCode>;

    async fn set_region(&self, region: RegionCode) -> Result<(), ProtocolError>;

    /// Send text; returns the transport packet id used for ack correlation.
    async fn send_text(&self, msg: OutgoingText) -> Result<u32, ProtocolError>;
}
