//! # Session Bookkeeping
//!
//! Three independent state machines describe "how connected are we":
//!
//! - [`guard::ConnectionIntentGuard`] - who may drive the transport right now
//!   (manual connect vs. background reconnection).
//! - [`pairing::PairingTracker`] - validity of the physical pairing with one
//!   radio, including the terminal `Invalidated` state.
//! - [`identity::SessionIdentity`] - the strictly increasing [`SessionId`]
//!   minted on every completed handshake.
//!
//! They are deliberately kept apart and only combined by
//! [`crate::link::LinkStatus::derive`] when a caller needs one answer.
//! [`subscription::SubscriptionHandle`] is the owner-held cancellation handle
//! used for every background listener the link manager spawns.

pub mod guard;
pub mod identity;
pub mod pairing;
pub mod subscription;

pub use guard::{ConnectionIntentGuard, ConnectionSessionState};
pub use identity::{SessionHandle, SessionId, SessionIdentity};
pub use pairing::{DevicePairingState, PairingTracker};
pub use subscription::SubscriptionHandle;
