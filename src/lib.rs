//! LAN peer-to-peer file-sharing engine.
//!
//! Five components composed bottom-up: identity and network utilities,
//! mDNS-based discovery, a TCP signalling transport, WebRTC-style peer
//! connections with perfect negotiation, and a chunked transfer engine on
//! top of them. [`node::Node`] is the façade wiring all of it together.

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod log_layer;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod signalling;
pub mod transfer;

pub use config::EngineConfig;
pub use error::{CodecError, DiscoveryError, EngineError};
pub use node::{Node, NodeCommand, NodeEvent, NodeHandle};
