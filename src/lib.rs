//! # meshlink - Connection Lifecycle Core for Meshtastic Radios
//!
//! meshlink keeps one logical session between a phone and a battery-powered
//! Meshtastic radio alive over an unreliable BLE or USB-serial link.
//!
//! ## Features
//!
//! - **Background Reconnection**: bounded scan/connect/handshake retries after an
//!   unexpected drop, always yielding to a user-initiated connect.
//! - **Region Apply**: LoRa region changes confirmed purely by observing the
//!   radio's reboot and reconnect, without treating the expected drop as a failure.
//! - **Delivery Deduplication**: layered idempotency filter so a message that
//!   arrives over the radio and through the push relay is applied once.
//! - **Explicit Ownership**: every background listener is an owner-held
//!   subscription handle; no global session singleton.
//! - **Simulated Radio**: an in-process radio model for tests and the CLI.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlink::config::Config;
//! use meshlink::link::{LinkManager, LinkSettings};
//! use meshlink::sim::SimRadio;
//! use meshlink::storage::JsonFileStore;
//! use meshlink::transport::{ProtocolKind, TargetDevice};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let radio = Arc::new(SimRadio::new());
//!     let store = Arc::new(JsonFileStore::new(&config.storage.state_file));
//!     let link = LinkManager::new(radio.clone(), radio, store, LinkSettings::from_config(&config));
//!     link.start().await?;
//!     link.connect_manual(TargetDevice::new("C4:DE:E2:10:22:01", "Meshtastic_2201", ProtocolKind::Ble))
//!         .await?;
//!     println!("{:?}", link.status());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - physical link collaborator trait and device types
//! - [`protocol`] - application protocol collaborator trait, messages, regions
//! - [`session`] - intent guard, pairing tracker, session identity, subscriptions
//! - [`reconnect`] - background reconnect orchestrator
//! - [`region`] - region apply coordinator
//! - [`dedup`] - inbound delivery deduplicator
//! - [`link`] - the manager that wires everything together
//! - [`storage`] - persisted pairing state
//! - [`config`] - configuration loading and tuning
//! - [`sim`] - simulated radio
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   LinkManager   │ ← Intents, notices, derived status
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Reconnect/Region│ ← Orchestration over the guard and session identity
//! │ /Dedup          │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Transport and   │ ← Collaborators (platform drivers, simulator)
//! │ Protocol traits │
//! └─────────────────┘
//! ```

pub mod config;
pub mod dedup;
pub mod error;
pub mod link;
pub mod logutil;
pub mod metrics;
pub mod protocol;
pub mod reconnect;
pub mod region;
pub mod session;
pub mod sim;
pub mod storage;
pub mod transport;
