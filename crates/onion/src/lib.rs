//! onionp2p overlay protocol core
//!
//! An anonymity-preserving overlay on a libp2p substrate. A client tunnels
//! traffic through a chain of relays, each knowing only its neighbors; the
//! chain can terminate at another overlay peer, at a hidden service
//! addressed by the hash of its public key, or at a clearnet endpoint via
//! an exit node.
//!
//! ## Layout
//!
//! - [`frame`]: length-delimited, optionally gzipped envelopes
//! - [`message`]: the control messages adjacent circuit peers exchange
//! - [`session`]: the per-inbound-stream relay state machine
//! - [`circuit`]: the client-side builder extending one hop at a time
//! - [`hidden`]: hidden-service index, listener and connection
//! - [`peers`]: capability CIDs and overlay peer discovery
//! - [`service`]: bootstrap, advertisement, admission pricing

use std::time::Duration;

use libp2p::StreamProtocol;

pub mod circuit;
pub mod conduit;
pub mod config;
pub mod error;
pub mod frame;
pub mod hidden;
pub mod message;
pub mod mux;
pub mod noise;
pub mod peers;
mod session;
pub mod service;
pub mod splice;

pub use circuit::Circuit;
pub use conduit::{boxed, BoxConduit, Conduit};
pub use config::{OnionConfig, DEFAULT_TTL};
pub use error::{OnionError, Result};
pub use hidden::{HiddenConnection, HiddenListener, HiddenServiceIndex};
pub use message::{Message, Settings};
pub use peers::PeerEntry;
pub use service::Onion;

/// The overlay wire protocol ID.
pub const PROTOCOL_ID: StreamProtocol = StreamProtocol::new("/onionp2p/0.0.1");

/// Default bound on each logical protocol step.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10 * 60);
