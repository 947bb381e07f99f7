//! Call manager for orchestrating call lifecycle.
//!
//! [`CallManager`] owns the call session, the signaling channel and the
//! negotiation controller, and runs as a single task: user commands,
//! signaling events and peer-connection events are funneled into one loop so
//! no two handlers ever interleave. The UI talks to it through a cloneable
//! [`CallHandle`].

use log::{debug, info, log, warn};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};

use super::clock::{Clock, SystemClock};
use super::error::CallError;
use super::media::{
    ConnectionState, MediaDevices, MediaStream, NegotiationController, PeerConnectionConfig,
    PeerConnectionFactory, PeerEvent, PeerEventKind, TrackKind,
};
use super::signaling::{SignalingChannel, SignalingEvent};
use super::state::{CallEvent, CallInfo, CallKey, CallSession, CallState, CallType};
use super::transport::ChatTransport;
use crate::config::RtcSettings;

const NOTIFICATION_CAPACITY: usize = 128;

/// Platform services the manager is built on.
#[derive(Clone)]
pub struct CallPlatform {
    pub transport: Arc<dyn ChatTransport>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub clock: Arc<dyn Clock>,
}

impl CallPlatform {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        media_devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            transport,
            peer_factory,
            media_devices,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for CallPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPlatform").finish_non_exhaustive()
    }
}

/// What the UI is told about.
#[derive(Debug, Clone)]
pub enum CallNotification {
    /// The session changed; carries the current call.
    CallUpdated(CallInfo),
    RingingStarted(CallKey),
    RingingStopped(CallKey),
    LocalStreamReady(MediaStream),
    RemoteStreamUpdated(MediaStream),
    MediaReleased,
}

pub(crate) enum CallCommand {
    PlaceCall {
        peer_id: String,
        reply: oneshot::Sender<Result<CallKey, CallError>>,
    },
    AnswerCall {
        reply: oneshot::Sender<Result<CallKey, CallError>>,
    },
    EndCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleAudio {
        reply: oneshot::Sender<bool>,
    },
    ToggleVideo {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

enum CallInput {
    Command(CallCommand),
    Signaling(SignalingEvent),
    Peer(PeerEvent),
}

/// Cloneable front end to a running [`CallManager`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    session: Arc<RwLock<CallSession>>,
    notifications: broadcast::Sender<CallNotification>,
    signaling: Arc<SignalingChannel>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)
    }

    /// Dial `peer_id`; returns the new call's identity.
    pub async fn place_call(&self, peer_id: &str) -> Result<CallKey, CallError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| CallCommand::PlaceCall { peer_id, reply })
            .await?
    }

    /// Pick up the ringing incoming call.
    pub async fn answer_call(&self) -> Result<CallKey, CallError> {
        self.request(|reply| CallCommand::AnswerCall { reply }).await?
    }

    /// Hang up, cancel or decline, depending on the current call's state.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::EndCall { reply }).await?
    }

    /// Returns whether audio is now on.
    pub async fn toggle_local_audio(&self) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleAudio { reply }).await
    }

    /// Returns whether video is now on.
    pub async fn toggle_local_video(&self) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleVideo { reply }).await
    }

    /// Snapshot of the call session.
    pub async fn session(&self) -> CallSession {
        self.session.read().await.clone()
    }

    /// Receive UI notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.notifications.subscribe()
    }

    /// Feed a payload received on our chat channel.
    pub fn deliver(&self, payload: &str) {
        self.signaling.handle_incoming(payload);
    }

    /// The channel a chat transport should deliver into.
    pub fn signaling(&self) -> Arc<SignalingChannel> {
        self.signaling.clone()
    }

    /// Stop the manager; pending commands still run first.
    pub fn shutdown(&self) {
        let _ = self.commands.send(CallCommand::Shutdown);
    }
}

pub struct CallManager {
    self_id: String,
    settings: RtcSettings,
    clock: Arc<dyn Clock>,
    session: Arc<RwLock<CallSession>>,
    signaling: Arc<SignalingChannel>,
    media: NegotiationController,
    notifications: broadcast::Sender<CallNotification>,
    wants_audio: bool,
    wants_video: bool,
    /// Call the live negotiation session was opened for.
    session_owner: Option<CallKey>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl CallManager {
    pub fn new(
        self_id: impl Into<String>,
        settings: RtcSettings,
        platform: CallPlatform,
    ) -> (Self, CallHandle) {
        let self_id = self_id.into();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_events) = mpsc::unbounded_channel();
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let media = NegotiationController::new(
            platform.peer_factory,
            platform.media_devices,
            PeerConnectionConfig {
                ice_servers: settings.ice_servers.clone(),
            },
            settings.video_constraints.clone(),
            peer_tx,
        );
        let signaling = Arc::new(SignalingChannel::new(
            self_id.clone(),
            platform.transport,
            settings.dialing_timeout(),
            signaling_tx,
            media.offer_guard(),
        ));
        let session = Arc::new(RwLock::new(CallSession::new()));

        let handle = CallHandle {
            commands: command_tx,
            session: session.clone(),
            notifications: notifications.clone(),
            signaling: signaling.clone(),
        };
        let manager = Self {
            self_id,
            wants_audio: settings.start_with_audio,
            wants_video: settings.start_with_video,
            settings,
            clock: platform.clock,
            session,
            signaling,
            media,
            notifications,
            session_owner: None,
            commands,
            signaling_events,
            peer_events,
        };
        (manager, handle)
    }

    /// Process inputs until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!("Call manager for {} running", self.self_id);
        loop {
            let input = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => CallInput::Command(command),
                    None => break,
                },
                Some(event) = self.signaling_events.recv() => CallInput::Signaling(event),
                Some(event) = self.peer_events.recv() => CallInput::Peer(event),
            };
            if !self.handle_input(input).await {
                break;
            }
        }
        self.teardown();
        info!("Call manager for {} stopped", self.self_id);
    }

    async fn handle_input(&mut self, input: CallInput) -> bool {
        match input {
            CallInput::Command(command) => return self.handle_command(command).await,
            CallInput::Signaling(event) => {
                if let Err(e) = self.handle_signaling_event(event).await {
                    log!(e.log_level(), "Signaling event not handled: {}", e);
                }
            }
            CallInput::Peer(event) => {
                if let Err(e) = self.handle_peer_event(event).await {
                    log!(e.log_level(), "Peer event not handled: {}", e);
                }
            }
        }
        true
    }

    async fn handle_command(&mut self, command: CallCommand) -> bool {
        match command {
            CallCommand::PlaceCall { peer_id, reply } => {
                let _ = reply.send(self.place_call(&peer_id).await);
            }
            CallCommand::AnswerCall { reply } => {
                let _ = reply.send(self.answer_call().await);
            }
            CallCommand::EndCall { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            CallCommand::ToggleAudio { reply } => {
                let _ = reply.send(self.toggle_local_audio());
            }
            CallCommand::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_local_video());
            }
            CallCommand::Shutdown => return false,
        }
        true
    }

    pub async fn place_call(&mut self, peer_id: &str) -> Result<CallKey, CallError> {
        let start_time = self.clock.now_millis();
        let key = CallKey::new(peer_id, start_time);
        info!("Calling {}", key);

        self.teardown();
        self.prepare_local_media().await?;

        if let Err(e) = self.signaling.call_init(peer_id, start_time).await {
            // The pending entry is armed regardless, so the call still times out.
            warn!("Failed to dial {}: {}", key, e);
        }
        self.apply(CallEvent::OutgoingCallInitiated {
            peer_id: key.peer_id.clone(),
            start_time,
        })
        .await;
        Ok(key)
    }

    pub async fn answer_call(&mut self) -> Result<CallKey, CallError> {
        let target = {
            let session = self.session.read().await;
            // A call that ended while ringing stays Receiving in
            // last_incoming_call; only the current call can be picked up.
            let current = &session.current_call;
            let target = &session.last_incoming_call;
            if target.call_state != CallState::Receiving
                || current.call_state != CallState::Receiving
                || !current.matches(&target.peer_user_id, target.start_time)
            {
                return Err(CallError::NoIncomingCall);
            }
            target.clone()
        };
        let key = target.key();
        info!("Answering {}", key);

        self.media.release_media();
        self.prepare_local_media().await?;

        let accepted = self
            .apply(CallEvent::IncomingCallAccepted {
                peer_id: key.peer_id.clone(),
                start_time: key.start_time,
            })
            .await;
        if !accepted {
            return Err(CallError::NoIncomingCall);
        }

        self.open_session(&key)?;
        if let Err(e) = self.signaling.call_accept(&key.peer_id, key.start_time).await {
            warn!("Failed to send accept for {}: {}", key, e);
        }
        Ok(key)
    }

    pub async fn end_call(&mut self) -> Result<(), CallError> {
        let current = self.session.read().await.current_call.clone();
        let terminal = match current.call_state {
            CallState::Accepted | CallState::Connected => Some(CallState::Completed),
            CallState::Initiated => Some(CallState::Canceled),
            CallState::Receiving => Some(CallState::Declined),
            _ => None,
        };

        if let Some(state) = terminal {
            let key = current.key();
            info!("Ending {} as {:?}", key, state);
            self.finish_call(state, &key).await;
            if current.has_peer()
                && let Err(e) = self.signaling.call_end(&key.peer_id, key.start_time).await
            {
                warn!("Failed to send end for {}: {}", key, e);
            }
        } else {
            debug!("end_call: no active call ({:?})", current.call_state);
        }

        self.teardown();
        Ok(())
    }

    pub fn toggle_local_audio(&mut self) -> bool {
        self.wants_audio = !self.wants_audio;
        self.media.set_track_enabled(TrackKind::Audio, self.wants_audio);
        debug!("Local audio {}", if self.wants_audio { "on" } else { "off" });
        self.wants_audio
    }

    pub fn toggle_local_video(&mut self) -> bool {
        self.wants_video = !self.wants_video;
        self.media.set_track_enabled(TrackKind::Video, self.wants_video);
        debug!("Local video {}", if self.wants_video { "on" } else { "off" });
        self.wants_video
    }

    pub async fn handle_signaling_event(&mut self, event: SignalingEvent) -> Result<(), CallError> {
        match event {
            SignalingEvent::IncomingCall(key) => {
                let known = {
                    let session = self.session.read().await;
                    session.current_call.matches(&key.peer_id, key.start_time)
                        || session.last_incoming_call.matches(&key.peer_id, key.start_time)
                };
                if known {
                    debug!("Ignoring repeated initiate for {}", key);
                    return Ok(());
                }
                self.apply(CallEvent::IncomingCallReceived {
                    peer_id: key.peer_id,
                    start_time: key.start_time,
                })
                .await;
            }

            SignalingEvent::CallAccepted(key) => {
                let current = self.current_call().await;
                if !current.matches(&key.peer_id, key.start_time)
                    || current.call_type != CallType::Outgoing
                    || current.call_state != CallState::Initiated
                {
                    return Err(stale(&key));
                }
                info!("{} accepted", key);
                self.apply(CallEvent::OutgoingCallAccepted {
                    peer_id: key.peer_id.clone(),
                    start_time: key.start_time,
                })
                .await;

                self.open_session(&key)?;
                self.media.attach_local_tracks();
                match self.media.create_offer().await {
                    Some(offer) => {
                        self.signaling
                            .ice_offer(&key.peer_id, key.start_time, offer)
                            .await?
                    }
                    None => debug!("No offer produced for {}", key),
                }
            }

            SignalingEvent::CallEnded(key) => {
                let current = self.current_call().await;
                if !current.matches(&key.peer_id, key.start_time) {
                    return Err(stale(&key));
                }
                let terminal = match (current.call_type, current.call_state) {
                    (CallType::Outgoing, CallState::Initiated) => Some(CallState::Declined),
                    (CallType::Incoming, CallState::Receiving) => Some(CallState::Canceled),
                    (_, CallState::Accepted | CallState::Connected) => Some(CallState::Completed),
                    _ => None,
                };
                let Some(state) = terminal else {
                    debug!("{} already over ({:?})", key, current.call_state);
                    return Ok(());
                };
                info!("{} ended by peer as {:?}", key, state);
                self.finish_call(state, &key).await;
                self.teardown();
            }

            SignalingEvent::CallTimeout(key) => {
                let current = self.current_call().await;
                if !current.matches(&key.peer_id, key.start_time) || !current.call_state.is_ringing()
                {
                    debug!("Ignoring timeout for {}", key);
                    return Ok(());
                }
                info!("{} not answered", key);
                self.finish_call(CallState::NotAnswered, &key).await;
                if current.call_type == CallType::Outgoing
                    && let Err(e) = self.signaling.call_end(&key.peer_id, key.start_time).await
                {
                    warn!("Failed to send end for {}: {}", key, e);
                }
                self.teardown();
            }

            SignalingEvent::IceCandidate(key, candidate) => {
                if !self.owns_session(&key).await {
                    return Err(stale(&key));
                }
                match candidate {
                    Some(candidate) => self.media.add_candidate(candidate).await,
                    None => debug!("{} finished gathering candidates", key),
                }
            }

            SignalingEvent::IceOffer(key, offer) => {
                if !self.owns_session(&key).await {
                    return Err(stale(&key));
                }
                if !self.media.apply_remote_description(offer).await {
                    return Ok(());
                }
                self.media.attach_local_tracks();
                match self.media.create_answer().await {
                    Some(answer) => {
                        self.signaling
                            .ice_answer(&key.peer_id, key.start_time, answer)
                            .await?
                    }
                    None => debug!("No answer produced for {}", key),
                }
            }

            SignalingEvent::IceAnswer(key, answer) => {
                if !self.owns_session(&key).await {
                    return Err(stale(&key));
                }
                self.media.apply_remote_description(answer).await;
            }
        }
        Ok(())
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), CallError> {
        if !self.media.is_current(event.session) {
            debug!("Dropping event from closed session {}", event.session);
            return Ok(());
        }
        let Some(owner) = self.session_owner.clone() else {
            return Ok(());
        };
        let current = self.current_call().await;
        if !current.matches(&owner.peer_id, owner.start_time) {
            debug!("Session {} no longer belongs to the current call", event.session);
            return Ok(());
        }

        match event.kind {
            PeerEventKind::IceCandidate(Some(candidate)) => {
                self.signaling
                    .ice_candidate(&owner.peer_id, owner.start_time, candidate)
                    .await?;
            }
            PeerEventKind::IceCandidate(None) => {}
            PeerEventKind::NegotiationNeeded => {
                if !current.call_state.is_live() {
                    return Ok(());
                }
                if let Some(offer) = self.media.negotiate_offer().await {
                    self.signaling
                        .ice_offer(&owner.peer_id, owner.start_time, offer)
                        .await?;
                }
            }
            PeerEventKind::Track(track) => {
                debug!("Remote {:?} track {}", track.kind(), track.id());
                let remote = self.media.add_remote_track(track);
                self.notify(CallNotification::RemoteStreamUpdated(remote));
            }
            PeerEventKind::ConnectionStateChanged(ConnectionState::Connected) => {
                self.media.attach_local_tracks();
                if current.call_state == CallState::Accepted {
                    info!("{} connected", owner);
                    self.apply(CallEvent::CallConnected {
                        peer_id: owner.peer_id.clone(),
                        start_time: owner.start_time,
                    })
                    .await;
                }
            }
            PeerEventKind::ConnectionStateChanged(
                state @ (ConnectionState::Disconnected | ConnectionState::Failed),
            ) => {
                info!("{} transport {:?}", owner, state);
                if current.call_state.is_live() {
                    self.finish_call(CallState::Completed, &owner).await;
                }
                self.teardown();
            }
            PeerEventKind::ConnectionStateChanged(state) => {
                debug!("{} transport {:?}", owner, state);
            }
        }
        Ok(())
    }

    async fn current_call(&self) -> CallInfo {
        self.session.read().await.current_call.clone()
    }

    async fn owns_session(&self, key: &CallKey) -> bool {
        self.session_owner.as_ref() == Some(key)
            && self.media.has_session()
            && self.current_call().await.matches(&key.peer_id, key.start_time)
    }

    fn open_session(&mut self, key: &CallKey) -> Result<(), CallError> {
        self.media.create_session()?;
        self.session_owner = Some(key.clone());
        Ok(())
    }

    /// Close the negotiation session and release all media.
    fn teardown(&mut self) {
        let had_media = self.media.has_session() || self.media.local_media().is_some();
        self.media.close_session();
        self.media.release_media();
        self.session_owner = None;
        if had_media {
            self.notify(CallNotification::MediaReleased);
        }
    }

    async fn prepare_local_media(&mut self) -> Result<(), CallError> {
        match self
            .media
            .acquire_local_media(self.wants_audio, self.wants_video)
            .await
        {
            Ok(Some(stream)) => {
                self.notify(CallNotification::LocalStreamReady(stream));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) if self.settings.require_local_media => Err(e),
            Err(e) => {
                warn!("Continuing without local media: {}", e);
                Ok(())
            }
        }
    }

    async fn finish_call(&self, state: CallState, key: &CallKey) {
        if let Some(event) = CallEvent::terminal(state, key, self.clock.now_millis()) {
            self.apply(event).await;
        }
    }

    /// Apply `event` to the session and tell the UI what changed.
    async fn apply(&self, event: CallEvent) -> bool {
        let (changed, before, after) = {
            let mut session = self.session.write().await;
            let before = session.current_call.clone();
            let changed = session.apply(event);
            (changed, before, session.current_call.clone())
        };
        if !changed {
            return false;
        }

        let same_call = before.key() == after.key();
        if before.call_state.is_ringing() && !(same_call && after.call_state.is_ringing()) {
            self.notify(CallNotification::RingingStopped(before.key()));
        }
        if after.call_state.is_ringing() && !(same_call && before.call_state.is_ringing()) {
            self.notify(CallNotification::RingingStarted(after.key()));
        }
        self.notify(CallNotification::CallUpdated(after));
        true
    }

    fn notify(&self, notification: CallNotification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }
}

fn stale(key: &CallKey) -> CallError {
    CallError::StaleSignal {
        peer_id: key.peer_id.clone(),
        start_time: key.start_time,
    }
}
