//! Peer Connection (spec §4.4): per-peer negotiation state machine and the
//! two media sub-channels layered on top of it.

pub mod connection;
pub mod subchannel;

pub use connection::{NegotiationState, PeerConnEvent, PeerConnection};
