//! Owner of the negotiation resource and the call's media streams.
//!
//! The controller knows nothing about call semantics. It allocates one peer
//! connection per call, produces and applies session descriptions when the
//! signaling state allows it, and buffers candidates that arrive before the
//! remote description they belong to.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use super::peer::{
    PeerConnection, PeerConnectionConfig, PeerConnectionFactory, PeerEvent, PeerEventSink,
    SessionId, SignalingState,
};
use super::stream::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::calls::error::CallError;
use crate::calls::transport::{IceCandidate, SessionDescription};
use crate::config::VideoConstraints;

/// Shared "local offer in flight" flag.
///
/// The signaling channel reads it to drop inbound offers that collide with
/// one we are producing.
#[derive(Debug, Clone, Default)]
pub struct OfferGuard(Arc<AtomicBool>);

impl OfferGuard {
    pub fn is_negotiating(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Marks an offer as in flight. Returns `false` if one already was.
    pub(crate) fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct NegotiationController {
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    config: PeerConnectionConfig,
    video_constraints: VideoConstraints,
    events: mpsc::UnboundedSender<PeerEvent>,
    offer_guard: OfferGuard,
    session_id: SessionId,
    peer: Option<Arc<dyn PeerConnection>>,
    local_media: Option<MediaStream>,
    local_clones: Vec<MediaStream>,
    remote_media: Option<MediaStream>,
    buffered_candidates: Vec<IceCandidate>,
    attached_tracks: HashSet<String>,
    negotiating_answer: bool,
    stream_seq: u64,
}

impl NegotiationController {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        config: PeerConnectionConfig,
        video_constraints: VideoConstraints,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            devices,
            config,
            video_constraints,
            events,
            offer_guard: OfferGuard::default(),
            session_id: 0,
            peer: None,
            local_media: None,
            local_clones: Vec::new(),
            remote_media: None,
            buffered_candidates: Vec::new(),
            attached_tracks: HashSet::new(),
            negotiating_answer: false,
            stream_seq: 0,
        }
    }

    /// Shared flag the signaling channel checks before accepting an offer.
    pub fn offer_guard(&self) -> OfferGuard {
        self.offer_guard.clone()
    }

    /// Id of the most recently created session.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether a negotiation resource is open.
    pub fn has_session(&self) -> bool {
        self.peer.is_some()
    }

    /// Whether `session` names the live negotiation resource.
    pub fn is_current(&self, session: SessionId) -> bool {
        self.peer.is_some() && session == self.session_id
    }

    /// Signaling state of the open resource.
    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.peer.as_ref().map(|p| p.signaling_state())
    }

    /// The primary captured stream.
    pub fn local_media(&self) -> Option<&MediaStream> {
        self.local_media.as_ref()
    }

    /// Tracks received from the peer so far.
    pub fn remote_media(&self) -> Option<&MediaStream> {
        self.remote_media.as_ref()
    }

    /// Remote candidates waiting for a remote description.
    pub fn buffered_candidates(&self) -> &[IceCandidate] {
        &self.buffered_candidates
    }

    /// Replace the negotiation resource with a fresh one.
    pub fn create_session(&mut self) -> Result<SessionId, CallError> {
        self.close_session();

        self.offer_guard.end();
        self.negotiating_answer = false;
        self.buffered_candidates.clear();
        self.attached_tracks.clear();
        if let Some(remote) = self.remote_media.take() {
            remote.stop();
        }

        self.session_id += 1;
        let sink = PeerEventSink::new(self.session_id, self.events.clone());
        let peer = self.factory.create(&self.config, sink)?;
        self.peer = Some(peer);
        info!("Created negotiation session {}", self.session_id);
        Ok(self.session_id)
    }

    /// Close the negotiation resource, if any. Idempotent.
    pub fn close_session(&mut self) {
        if let Some(peer) = self.peer.take() {
            debug!("Closing negotiation session {}", self.session_id);
            peer.close();
        }
    }

    /// Request device access once and hand out a clone of the stream.
    ///
    /// Returns `Ok(None)` when neither audio nor video is wanted.
    pub async fn acquire_local_media(
        &mut self,
        wants_audio: bool,
        wants_video: bool,
    ) -> Result<Option<MediaStream>, CallError> {
        if !wants_audio && !wants_video {
            debug!("acquire_local_media: audio and video both off");
            return Ok(None);
        }

        if self.local_media.is_none() {
            let constraints = MediaConstraints {
                audio: wants_audio,
                video: wants_video.then(|| self.video_constraints.clone()),
            };
            debug!("acquire_local_media: requesting devices {:?}", constraints);
            let stream = self.devices.get_user_media(&constraints).await?;
            let primary = stream.clone_stream(self.next_stream_id("local"));
            self.local_clones.push(stream);
            self.local_media = Some(primary);
        }

        let Some(primary) = self.local_media.as_ref() else {
            return Ok(None);
        };
        let handed_out = primary.clone_stream(format!("{}-view", primary.id()));
        self.local_clones.push(handed_out.clone());
        Ok(Some(handed_out))
    }

    /// Stop and drop every media handle: local clones, then the primary
    /// local stream, then the remote stream.
    pub fn release_media(&mut self) {
        for clone in self.local_clones.drain(..) {
            clone.stop();
        }
        if let Some(local) = self.local_media.take() {
            local.stop();
        }
        if let Some(remote) = self.remote_media.take() {
            remote.stop();
        }
    }

    /// Mute or unmute every local track of `kind`, clones included.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(local) = &self.local_media {
            local.set_enabled(kind, enabled);
        }
        for clone in &self.local_clones {
            clone.set_enabled(kind, enabled);
        }
    }

    /// Add the local tracks to the resource for transmission.
    pub fn attach_local_tracks(&mut self) {
        let (Some(peer), Some(local)) = (self.peer.as_ref(), self.local_media.as_ref()) else {
            debug!("attach_local_tracks: nothing to attach");
            return;
        };

        for track in local.tracks() {
            let id = track.id();
            if !self.attached_tracks.insert(id.clone()) {
                continue;
            }
            if let Err(e) = peer.add_track(track.clone(), local.id()) {
                warn!("Failed to attach local track {}: {}", id, e);
                self.attached_tracks.remove(&id);
            }
        }
    }

    /// Produce an offer and apply it locally.
    ///
    /// `None` means the offer was skipped or failed; callers do not retry.
    pub async fn create_offer(&mut self) -> Option<SessionDescription> {
        self.produce_offer(false).await
    }

    /// Renegotiation variant: only runs from a stable signaling state.
    pub async fn negotiate_offer(&mut self) -> Option<SessionDescription> {
        if self.offer_guard.is_negotiating() {
            debug!("negotiate_offer: offer already in flight");
            return None;
        }
        match self.signaling_state() {
            Some(SignalingState::Stable) => self.produce_offer(true).await,
            state => {
                debug!("negotiate_offer: skipped in state {:?}", state);
                None
            }
        }
    }

    async fn produce_offer(&mut self, require_stable: bool) -> Option<SessionDescription> {
        let Some(peer) = self.peer.clone() else {
            debug!("create_offer: no negotiation session");
            return None;
        };
        if !self.offer_guard.begin() {
            debug!("create_offer: offer already in flight");
            return None;
        }
        let guard = self.offer_guard.clone();
        let _reset = scopeguard::guard((), move |_| guard.end());

        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("create_offer: {}", e);
                return None;
            }
        };

        let state = peer.signaling_state();
        let permitted = if require_stable {
            state == SignalingState::Stable
        } else {
            state.can_set_local_offer()
        };
        if !permitted {
            let skipped = CallError::InvalidNegotiationState {
                operation: "set local offer",
                state,
            };
            debug!("create_offer: skipped, {}", skipped);
            return None;
        }

        match peer.set_local_description(offer.clone()).await {
            Ok(()) => {
                debug!("create_offer: local offer applied");
                Some(offer)
            }
            Err(e) => {
                warn!("create_offer: error setting local offer: {}", e);
                None
            }
        }
    }

    /// Produce an answer and apply it locally.
    pub async fn create_answer(&mut self) -> Option<SessionDescription> {
        if self.negotiating_answer {
            debug!("create_answer: answer already in flight");
            return None;
        }
        self.negotiating_answer = true;
        let answer = self.produce_answer().await;
        self.negotiating_answer = false;
        answer
    }

    async fn produce_answer(&self) -> Option<SessionDescription> {
        let Some(peer) = self.peer.clone() else {
            debug!("create_answer: no negotiation session");
            return None;
        };

        let state = peer.signaling_state();
        if !state.can_set_local_answer() {
            let skipped = CallError::InvalidNegotiationState {
                operation: "create answer",
                state,
            };
            debug!("create_answer: skipped, {}", skipped);
            return None;
        }

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("create_answer: {}", e);
                return None;
            }
        };

        // Re-check: the state may have moved while the answer was produced.
        let state = peer.signaling_state();
        if !state.can_set_local_answer() {
            let skipped = CallError::InvalidNegotiationState {
                operation: "set local answer",
                state,
            };
            debug!("create_answer: skipped, {}", skipped);
            return None;
        }

        match peer.set_local_description(answer.clone()).await {
            Ok(()) => Some(answer),
            Err(e) => {
                warn!("create_answer: error setting local answer: {}", e);
                None
            }
        }
    }

    /// Apply the peer's description, then flush buffered candidates in
    /// arrival order. Returns whether the description was applied.
    pub async fn apply_remote_description(&mut self, desc: SessionDescription) -> bool {
        let Some(peer) = self.peer.clone() else {
            debug!("apply_remote_description: no negotiation session");
            return false;
        };

        let state = peer.signaling_state();
        if !state.can_set_remote() {
            let skipped = CallError::InvalidNegotiationState {
                operation: "set remote description",
                state,
            };
            debug!("apply_remote_description: skipped, {}", skipped);
            return false;
        }

        if let Err(e) = peer.set_remote_description(desc).await {
            warn!("apply_remote_description: {}", e);
            return false;
        }

        self.flush_candidates(peer.as_ref()).await;
        true
    }

    /// Apply a remote candidate, or buffer it until a remote description exists.
    pub async fn add_candidate(&mut self, candidate: IceCandidate) {
        let peer = match self.peer.clone() {
            Some(peer) if peer.remote_description().is_some() => peer,
            _ => {
                debug!(
                    "add_candidate: buffering ({} queued)",
                    self.buffered_candidates.len() + 1
                );
                self.buffered_candidates.push(candidate);
                return;
            }
        };

        self.flush_candidates(peer.as_ref()).await;
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("add_candidate: {}", e);
        }
    }

    async fn flush_candidates(&mut self, peer: &dyn PeerConnection) {
        let pending = std::mem::take(&mut self.buffered_candidates);
        if pending.is_empty() {
            return;
        }
        debug!("Applying {} buffered candidates", pending.len());
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Buffered candidate rejected: {}", e);
            }
        }
    }

    /// Record a track received from the peer; returns the updated remote stream.
    pub fn add_remote_track(&mut self, track: Arc<dyn MediaTrack>) -> MediaStream {
        let mut remote = match self.remote_media.take() {
            Some(remote) => remote,
            None => MediaStream::new(self.next_stream_id("remote"), Vec::new()),
        };
        remote.add_track(track);
        self.remote_media = Some(remote.clone());
        remote
    }

    fn next_stream_id(&mut self, prefix: &str) -> String {
        self.stream_seq += 1;
        format!("{}-{}", prefix, self.stream_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::peer::{ConnectionState, PeerEventKind};
    use crate::calls::sim::{SimMediaDevices, SimPeerFactory};

    struct Fixture {
        controller: NegotiationController,
        factory: Arc<SimPeerFactory>,
        devices: Arc<SimMediaDevices>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn fixture() -> Fixture {
        let factory = Arc::new(SimPeerFactory::new("test"));
        let devices = Arc::new(SimMediaDevices::new());
        let (tx, events) = mpsc::unbounded_channel();
        let controller = NegotiationController::new(
            factory.clone(),
            devices.clone(),
            PeerConnectionConfig::default(),
            VideoConstraints::default(),
            tx,
        );
        Fixture {
            controller,
            factory,
            devices,
            events,
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 UDP 2130706431 10.0.0.9 {} typ host", n, 5000 + n))
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let mut fx = fixture();
        fx.controller.create_session().unwrap();

        fx.controller.add_candidate(candidate(1)).await;
        fx.controller.add_candidate(candidate(2)).await;
        fx.controller.add_candidate(candidate(3)).await;
        assert_eq!(fx.controller.buffered_candidates().len(), 3);

        let pc = fx.factory.last().unwrap();
        assert!(pc.applied_candidates().is_empty());

        assert!(
            fx.controller
                .apply_remote_description(SessionDescription::offer("v=0 remote"))
                .await
        );
        assert!(fx.controller.buffered_candidates().is_empty());
        assert_eq!(pc.applied_candidates(), vec![candidate(1), candidate(2), candidate(3)]);

        // After the flush, candidates are applied straight away.
        fx.controller.add_candidate(candidate(4)).await;
        assert!(fx.controller.buffered_candidates().is_empty());
        assert_eq!(pc.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_create_session_replaces_and_resets() {
        let mut fx = fixture();
        let first = fx.controller.create_session().unwrap();
        fx.controller.add_candidate(candidate(1)).await;
        let first_pc = fx.factory.last().unwrap();

        let second = fx.controller.create_session().unwrap();
        assert!(second > first);
        assert!(first_pc.is_closed());
        assert!(fx.controller.buffered_candidates().is_empty());
        assert!(fx.controller.is_current(second));
        assert!(!fx.controller.is_current(first));
        assert_eq!(fx.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_local_media_requests_devices_once() {
        let mut fx = fixture();
        let a = fx.controller.acquire_local_media(true, true).await.unwrap().unwrap();
        let b = fx.controller.acquire_local_media(true, true).await.unwrap().unwrap();

        assert_eq!(fx.devices.request_count(), 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.tracks().len(), 2);

        // Each caller holds its own clone.
        a.stop();
        assert!(b.tracks().iter().all(|t| !t.is_stopped()));
        let primary = fx.controller.local_media().unwrap();
        assert!(primary.tracks().iter().all(|t| !t.is_stopped()));
    }

    #[tokio::test]
    async fn test_acquire_nothing_wanted() {
        let mut fx = fixture();
        assert!(fx.controller.acquire_local_media(false, false).await.unwrap().is_none());
        assert_eq!(fx.devices.request_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_denied_surfaces_media_unavailable() {
        let mut fx = fixture();
        fx.devices.deny(true);
        let result = fx.controller.acquire_local_media(true, false).await;
        assert!(matches!(result, Err(CallError::MediaUnavailable(_))));
        assert!(fx.controller.local_media().is_none());
    }

    #[tokio::test]
    async fn test_release_media_stops_everything() {
        let mut fx = fixture();
        fx.controller.create_session().unwrap();
        let view = fx.controller.acquire_local_media(true, true).await.unwrap().unwrap();
        let primary = fx.controller.local_media().unwrap().clone();
        let remote_track = fx.devices.make_track(TrackKind::Video);
        let remote = fx.controller.add_remote_track(remote_track.clone());

        fx.controller.release_media();

        assert!(view.tracks().iter().all(|t| t.is_stopped()));
        assert!(primary.tracks().iter().all(|t| t.is_stopped()));
        assert!(remote.tracks().iter().all(|t| t.is_stopped()));
        assert!(fx.controller.local_media().is_none());
        assert!(fx.controller.remote_media().is_none());

        // Releasing twice is harmless.
        fx.controller.release_media();
    }

    #[tokio::test]
    async fn test_attach_local_tracks_is_idempotent() {
        let mut fx = fixture();
        fx.controller.attach_local_tracks();

        fx.controller.create_session().unwrap();
        fx.controller.acquire_local_media(true, true).await.unwrap();
        fx.controller.attach_local_tracks();
        fx.controller.attach_local_tracks();

        let pc = fx.factory.last().unwrap();
        assert_eq!(pc.track_count(), 2);
    }

    #[tokio::test]
    async fn test_offer_skipped_when_state_forbids() {
        let mut fx = fixture();
        assert!(fx.controller.create_offer().await.is_none());

        fx.controller.create_session().unwrap();
        assert!(
            fx.controller
                .apply_remote_description(SessionDescription::offer("v=0 remote"))
                .await
        );
        // have-remote-offer: a local offer is not allowed.
        assert!(fx.controller.create_offer().await.is_none());
        assert!(!fx.controller.offer_guard().is_negotiating());

        let answer = fx.controller.create_answer().await;
        assert!(answer.is_some());
        assert_eq!(fx.controller.signaling_state(), Some(SignalingState::Stable));
    }

    #[tokio::test]
    async fn test_answer_skipped_without_remote_offer() {
        let mut fx = fixture();
        fx.controller.create_session().unwrap();
        let offer = fx.controller.create_offer().await;
        assert!(offer.is_some());
        assert_eq!(
            fx.controller.signaling_state(),
            Some(SignalingState::HaveLocalOffer)
        );
        assert!(fx.controller.create_answer().await.is_none());
    }

    #[tokio::test]
    async fn test_negotiate_offer_requires_stable() {
        let mut fx = fixture();
        fx.controller.create_session().unwrap();
        assert!(fx.controller.create_offer().await.is_some());
        assert!(fx.controller.negotiate_offer().await.is_none());

        fx.controller
            .apply_remote_description(SessionDescription::answer("v=0 remote"))
            .await;
        assert_eq!(fx.controller.signaling_state(), Some(SignalingState::Stable));
        assert!(fx.controller.negotiate_offer().await.is_some());
    }

    #[tokio::test]
    async fn test_offer_guard_resets_after_failure() {
        let mut fx = fixture();
        fx.controller.create_session().unwrap();
        fx.factory.last().unwrap().fail_offers(true);

        assert!(fx.controller.create_offer().await.is_none());
        assert!(!fx.controller.offer_guard().is_negotiating());
    }

    #[tokio::test]
    async fn test_events_tagged_with_session() {
        let mut fx = fixture();
        let session = fx.controller.create_session().unwrap();
        let pc = fx.factory.last().unwrap();
        pc.simulate_connection_state(ConnectionState::Disconnected);

        let event = fx.events.recv().await.unwrap();
        assert_eq!(event.session, session);
        assert!(matches!(
            event.kind,
            PeerEventKind::ConnectionStateChanged(ConnectionState::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_toggle_disables_local_tracks() {
        let mut fx = fixture();
        let view = fx.controller.acquire_local_media(true, true).await.unwrap().unwrap();
        fx.controller.set_track_enabled(TrackKind::Video, false);

        assert!(view.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));
        assert!(view.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
    }
}
