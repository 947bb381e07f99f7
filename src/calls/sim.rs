//! In-process stand-ins for the platform: capture devices, peer connections
//! and the chat transport.
//!
//! The peer connection follows the JSEP signaling-state rules closely enough
//! that two call managers wired through a [`LoopbackBus`] negotiate, connect
//! and exchange candidates exactly as they would against a browser engine.
//! Used by the test suites and the demo binary.

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::error::CallError;
use super::media::{
    ConnectionState, MediaConstraints, MediaDevices, MediaStream, MediaTrack, PeerConnection,
    PeerConnectionConfig, PeerConnectionFactory, PeerEventSink, SignalingState, TrackKind,
};
use super::message::SignalingMessage;
use super::signaling::SignalingChannel;
use super::transport::{ChatTransport, IceCandidate, SdpType, SessionDescription};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

fn next_track_id(kind: TrackKind) -> String {
    let n = NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed);
    match kind {
        TrackKind::Audio => format!("audio-{}", n),
        TrackKind::Video => format!("video-{}", n),
    }
}

#[derive(Debug)]
pub struct SimTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
    enabled: AtomicBool,
}

impl SimTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: next_track_id(kind),
            kind,
            stopped: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for SimTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn clone_track(&self) -> Arc<dyn MediaTrack> {
        let track = SimTrack::new(self.kind);
        track.set_enabled(self.is_enabled());
        track
    }
}

/// Capture devices that hand out [`SimTrack`]s.
#[derive(Debug, Default)]
pub struct SimMediaDevices {
    denied: AtomicBool,
    requests: AtomicUsize,
}

impl SimMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse device access from now on, as if the user denied permission.
    pub fn deny(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// How many times capture was requested, denied or not.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn make_track(&self, kind: TrackKind) -> Arc<dyn MediaTrack> {
        SimTrack::new(kind)
    }
}

#[async_trait]
impl MediaDevices for SimMediaDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, CallError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if self.denied.load(Ordering::SeqCst) {
            return Err(CallError::MediaUnavailable("permission denied".to_string()));
        }

        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(SimTrack::new(TrackKind::Audio));
        }
        if constraints.video.is_some() {
            tracks.push(SimTrack::new(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(CallError::MediaUnavailable("no device requested".to_string()));
        }
        Ok(MediaStream::new(format!("capture-{}", n), tracks))
    }
}

#[derive(Debug)]
struct SimPeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    tracks: Vec<(Arc<dyn MediaTrack>, String)>,
    remote_tracks_seen: usize,
    gathered: bool,
    fail_offers: bool,
}

/// A peer connection that negotiates in memory.
///
/// Descriptions carry one `m=` line per attached track so the far side can
/// surface matching remote tracks once it applies them.
pub struct SimPeerConnection {
    label: String,
    ice_servers: usize,
    sink: PeerEventSink,
    state: Mutex<SimPeerState>,
}

impl SimPeerConnection {
    fn new(label: String, config: &PeerConnectionConfig, sink: PeerEventSink) -> Self {
        Self {
            label,
            ice_servers: config.ice_servers.len(),
            sink,
            state: Mutex::new(SimPeerState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                applied_candidates: Vec::new(),
                tracks: Vec::new(),
                remote_tracks_seen: 0,
                gathered: false,
                fail_offers: false,
            }),
        }
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied_candidates.clone()
    }

    /// Number of local tracks attached for sending.
    pub fn track_count(&self) -> usize {
        lock(&self.state).tracks.len()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).signaling == SignalingState::Closed
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    /// ICE servers from the configuration this connection was built with.
    pub fn ice_server_count(&self) -> usize {
        self.ice_servers
    }

    /// Make `create_offer` fail, as an engine does on internal errors.
    pub fn fail_offers(&self, fail: bool) {
        lock(&self.state).fail_offers = fail;
    }

    /// Force a transport state change and report it.
    pub fn simulate_connection_state(&self, connection: ConnectionState) {
        lock(&self.state).connection = connection;
        self.sink.connection_state(connection);
    }

    /// Fire `NegotiationNeeded` whatever the signaling state, like an event
    /// the engine queued before the connection was closed.
    pub fn simulate_negotiation_needed(&self) {
        self.sink.negotiation_needed();
    }

    fn describe(&self, state: &SimPeerState, sdp_type: SdpType) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no={} {} 2 IN IP4 127.0.0.1\r\ns=-\r\n",
            self.label,
            self.sink.session()
        );
        for (track, _) in &state.tracks {
            let media = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{}\r\n", media, track.id()));
        }
        SessionDescription { sdp_type, sdp }
    }

    fn host_candidate(&self) -> IceCandidate {
        let mut rng = rand::rng();
        let port: u16 = rng.random_range(40000..60000);
        let ufrag: u32 = rng.random();
        IceCandidate::new(format!(
            "candidate:{} 1 UDP 2130706431 127.0.0.1 {} typ host",
            self.sink.session(),
            port
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
        .with_username_fragment(format!("{:08x}", ufrag))
    }

    /// Report `Connected` once both descriptions are applied and stable.
    fn check_connected(&self, state: &mut SimPeerState) -> bool {
        let ready = state.signaling == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && state.connection == ConnectionState::New;
        if ready {
            state.connection = ConnectionState::Connected;
        }
        ready
    }

    fn closed_error(&self, operation: &str) -> CallError {
        CallError::Negotiation(format!("{}: connection {} is closed", operation, self.label))
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let state = lock(&self.state);
        if state.signaling == SignalingState::Closed {
            return Err(self.closed_error("create_offer"));
        }
        if state.fail_offers {
            return Err(CallError::Negotiation("offer generation failed".to_string()));
        }
        Ok(self.describe(&state, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let state = lock(&self.state);
        match state.signaling {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                Ok(self.describe(&state, SdpType::Answer))
            }
            SignalingState::Closed => Err(self.closed_error("create_answer")),
            other => Err(CallError::Negotiation(format!(
                "cannot answer in state {:?}",
                other
            ))),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let (gather, connected) = {
            let mut state = lock(&self.state);
            let next = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (
                    SdpType::Answer,
                    SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer,
                ) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(CallError::Negotiation(format!(
                        "cannot set local {:?} in state {:?}",
                        sdp_type, current
                    )));
                }
            };
            state.signaling = next;
            state.local = Some(desc);
            let gather = !state.gathered;
            state.gathered = true;
            (gather, self.check_connected(&mut state))
        };

        if gather {
            self.sink.ice_candidate(Some(self.host_candidate()));
            self.sink.ice_candidate(None);
        }
        if connected {
            self.sink.connection_state(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let (new_tracks, connected) = {
            let mut state = lock(&self.state);
            let next = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (
                    SdpType::Answer,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer,
                ) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(CallError::Negotiation(format!(
                        "cannot set remote {:?} in state {:?}",
                        sdp_type, current
                    )));
                }
            };

            let kinds: Vec<TrackKind> = desc
                .sdp
                .lines()
                .filter_map(|line| match line {
                    l if l.starts_with("m=audio") => Some(TrackKind::Audio),
                    l if l.starts_with("m=video") => Some(TrackKind::Video),
                    _ => None,
                })
                .collect();
            let new_tracks: Vec<TrackKind> =
                kinds.into_iter().skip(state.remote_tracks_seen).collect();
            state.remote_tracks_seen += new_tracks.len();

            state.signaling = next;
            state.remote = Some(desc);
            (new_tracks, self.check_connected(&mut state))
        };

        for kind in new_tracks {
            self.sink.track(SimTrack::new(kind));
        }
        if connected {
            self.sink.connection_state(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut state = lock(&self.state);
        if state.signaling == SignalingState::Closed {
            return Err(self.closed_error("add_ice_candidate"));
        }
        if state.remote.is_none() {
            return Err(CallError::Negotiation(
                "candidate without remote description".to_string(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&self, track: Arc<dyn MediaTrack>, stream_id: &str) -> Result<(), CallError> {
        let renegotiate = {
            let mut state = lock(&self.state);
            if state.signaling == SignalingState::Closed {
                return Err(self.closed_error("add_track"));
            }
            state.tracks.push((track, stream_id.to_string()));
            state.signaling == SignalingState::Stable && state.local.is_some()
        };
        if renegotiate {
            self.sink.negotiation_needed();
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
    }
}

/// Creates [`SimPeerConnection`]s and keeps them around for inspection.
#[derive(Default)]
pub struct SimPeerFactory {
    label: String,
    created: Mutex<Vec<Arc<SimPeerConnection>>>,
}

impl SimPeerFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            created: Mutex::new(Vec::new()),
        }
    }

    /// The most recently created connection.
    pub fn last(&self) -> Option<Arc<SimPeerConnection>> {
        lock(&self.created).last().cloned()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }
}

impl PeerConnectionFactory for SimPeerFactory {
    fn create(
        &self,
        config: &PeerConnectionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let pc = Arc::new(SimPeerConnection::new(
            format!("{}-{}", self.label, events.session()),
            config,
            events,
        ));
        lock(&self.created).push(pc.clone());
        let pc: Arc<dyn PeerConnection> = pc;
        Ok(pc)
    }
}

/// Chat transport connecting signaling channels in the same process.
///
/// Delivery is immediate: `send` hands the payload straight to the
/// recipient's [`SignalingChannel::handle_incoming`].
#[derive(Default)]
pub struct LoopbackBus {
    channels: Mutex<HashMap<String, Weak<SignalingChannel>>>,
    offline: Mutex<HashSet<String>>,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: &Arc<SignalingChannel>) {
        lock(&self.channels).insert(channel.self_id().to_string(), Arc::downgrade(channel));
    }

    /// Messages for an offline user are accepted and silently lost.
    pub fn set_offline(&self, user_id: &str, offline: bool) {
        let mut set = lock(&self.offline);
        if offline {
            set.insert(user_id.to_string());
        } else {
            set.remove(user_id);
        }
    }

    /// Reject every send with [`CallError::TransportSendFailure`].
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Every accepted send, in order, as `(recipient, message)`.
    pub fn sent_messages(&self) -> Vec<(String, SignalingMessage)> {
        lock(&self.sent)
            .iter()
            .filter_map(|(to, payload)| {
                SignalingMessage::from_json(payload)
                    .ok()
                    .map(|msg| (to.clone(), msg))
            })
            .collect()
    }
}

#[async_trait]
impl ChatTransport for LoopbackBus {
    async fn send(&self, channel_id: &str, payload: String) -> Result<(), CallError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CallError::TransportSendFailure {
                channel: channel_id.to_string(),
                reason: "loopback bus rejecting sends".to_string(),
            });
        }
        lock(&self.sent).push((channel_id.to_string(), payload.clone()));

        if lock(&self.offline).contains(channel_id) {
            debug!("Loopback: {} offline, dropping message", channel_id);
            return Ok(());
        }
        let target = lock(&self.channels).get(channel_id).and_then(Weak::upgrade);
        match target {
            Some(channel) => channel.handle_incoming(&payload),
            None => info!("Loopback: no channel registered for {}", channel_id),
        }
        Ok(())
    }
}
