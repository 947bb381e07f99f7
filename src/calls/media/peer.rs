//! The negotiation resource seam (an ICE/SDP peer connection).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::stream::MediaTrack;
use crate::calls::error::CallError;
use crate::calls::transport::{IceCandidate, SessionDescription};
use crate::config::IceServer;

/// Offer/answer readiness of a peer connection (JSEP signaling state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    /// A local offer may be applied from here.
    pub fn can_set_local_offer(&self) -> bool {
        matches!(
            self,
            Self::Stable | Self::HaveLocalOffer | Self::HaveRemotePranswer
        )
    }

    /// A local answer may be applied from here.
    pub fn can_set_local_answer(&self) -> bool {
        matches!(
            self,
            Self::Stable | Self::HaveRemoteOffer | Self::HaveLocalPranswer
        )
    }

    pub fn can_set_remote(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Settings used when allocating a peer connection.
#[derive(Debug, Clone, Default)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Identifies one negotiation resource; bumps every time a session is created.
pub type SessionId = u64;

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    NegotiationNeeded,
    Track(Arc<dyn MediaTrack>),
    ConnectionStateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub session: SessionId,
    pub kind: PeerEventKind,
}

/// Callback target handed to a peer connection at creation.
///
/// Every event is tagged with the session it came from so events of a torn
/// down connection can be told apart from the live one.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { session, tx }
    }

    /// The session every event from this sink is tagged with.
    pub fn session(&self) -> SessionId {
        self.session
    }

    fn emit(&self, kind: PeerEventKind) {
        // The receiver only goes away when the call manager shuts down.
        let _ = self.tx.send(PeerEvent {
            session: self.session,
            kind,
        });
    }

    pub fn ice_candidate(&self, candidate: Option<IceCandidate>) {
        self.emit(PeerEventKind::IceCandidate(candidate));
    }

    pub fn negotiation_needed(&self) {
        self.emit(PeerEventKind::NegotiationNeeded);
    }

    pub fn track(&self, track: Arc<dyn MediaTrack>) {
        self.emit(PeerEventKind::Track(track));
    }

    pub fn connection_state(&self, state: ConnectionState) {
        self.emit(PeerEventKind::ConnectionStateChanged(state));
    }
}

/// One negotiation resource.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    fn add_track(&self, track: Arc<dyn MediaTrack>, stream_id: &str) -> Result<(), CallError>;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn remote_description(&self) -> Option<SessionDescription>;
    fn close(&self);
}

/// Allocates peer connections.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &PeerConnectionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}
