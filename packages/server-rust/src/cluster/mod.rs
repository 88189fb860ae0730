//! Sibling-instance discovery and the peer fallback lookup.

pub mod peers;

pub use peers::{
    HttpPeerClient, InstanceRegistry, PeerClient, PeerError, PeerInstance, PeerResolver,
    StaticRegistry,
};
