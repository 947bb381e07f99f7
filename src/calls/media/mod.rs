//! Negotiation and media for peer-to-peer calls.
//!
//! # Architecture
//!
//! - [`NegotiationController`]: owns the per-call peer connection and the
//!   local/remote streams, produces offers and answers, buffers candidates
//! - [`PeerConnection`], [`PeerConnectionFactory`]: the platform's ICE/SDP engine
//! - [`MediaDevices`], [`MediaTrack`], [`MediaStream`]: platform capture handles
//!
//! Everything platform-specific sits behind a trait; the in-process
//! implementations in [`crate::calls::sim`] back the tests and the demo binary.

mod controller;
mod peer;
mod stream;

pub use controller::{NegotiationController, OfferGuard};
pub use peer::{
    ConnectionState, PeerConnection, PeerConnectionConfig, PeerConnectionFactory, PeerEvent,
    PeerEventKind, PeerEventSink, SessionId, SignalingState,
};
pub use stream::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
