//! Signaling channel: call-control and negotiation messages over the chat
//! transport, plus pending-call bookkeeping with dialing timeouts.
//!
//! Inbound payloads arrive on whatever task owns the chat subscription and
//! outbound sends happen on the orchestrator task, so the pending maps are
//! concurrent and the channel only ever talks to the orchestrator through
//! [`SignalingEvent`]s.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::error::CallError;
use super::media::OfferGuard;
use super::message::{CallSignalType, IceSignalType, SignalingMessage};
use super::state::CallKey;
use super::transport::{ChatTransport, IceCandidate, SessionDescription};

/// What the channel reports to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    IncomingCall(CallKey),
    CallAccepted(CallKey),
    CallEnded(CallKey),
    /// A pending call was neither accepted nor ended within the dialing timeout.
    CallTimeout(CallKey),
    /// `None` is the peer's end-of-candidates marker.
    IceCandidate(CallKey, Option<IceCandidate>),
    IceOffer(CallKey, SessionDescription),
    IceAnswer(CallKey, SessionDescription),
}

/// An unanswered call and its timeout timer.
#[derive(Debug)]
pub struct PendingCall {
    pub peer_id: String,
    pub start_time: i64,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn cancel(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

type PendingCalls = Arc<DashMap<CallKey, PendingCall>>;

pub struct SignalingChannel {
    self_id: String,
    transport: Arc<dyn ChatTransport>,
    dialing_timeout: Duration,
    pending_outgoing: PendingCalls,
    pending_incoming: PendingCalls,
    events: mpsc::UnboundedSender<SignalingEvent>,
    offer_guard: OfferGuard,
}

impl SignalingChannel {
    pub fn new(
        self_id: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
        dialing_timeout: Duration,
        events: mpsc::UnboundedSender<SignalingEvent>,
        offer_guard: OfferGuard,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            transport,
            dialing_timeout,
            pending_outgoing: Arc::new(DashMap::new()),
            pending_incoming: Arc::new(DashMap::new()),
            events,
            offer_guard,
        }
    }

    /// Our user id.
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Calls we dialed that are still waiting for an answer.
    pub fn pending_outgoing_count(&self) -> usize {
        self.pending_outgoing.len()
    }

    /// Calls ringing here that are not yet answered.
    pub fn pending_incoming_count(&self) -> usize {
        self.pending_incoming.len()
    }

    /// Whether `key` is pending in either direction.
    pub fn is_pending(&self, key: &CallKey) -> bool {
        self.pending_outgoing.contains_key(key) || self.pending_incoming.contains_key(key)
    }

    /// Dial `peer_id`. The call stays pending until accepted, ended or timed out.
    pub async fn call_init(&self, peer_id: &str, start_time: i64) -> Result<(), CallError> {
        let key = CallKey::new(peer_id, start_time);
        self.track_pending(&self.pending_outgoing, key);
        self.send_call(CallSignalType::Initiate, peer_id, start_time)
            .await
    }

    /// Tell the caller we picked up.
    pub async fn call_accept(&self, peer_id: &str, start_time: i64) -> Result<(), CallError> {
        Self::clear_pending(&self.pending_incoming, &CallKey::new(peer_id, start_time));
        self.send_call(CallSignalType::Accept, peer_id, start_time)
            .await
    }

    /// Hang up, decline or cancel; the peer decides which from its own state.
    pub async fn call_end(&self, peer_id: &str, start_time: i64) -> Result<(), CallError> {
        let key = CallKey::new(peer_id, start_time);
        Self::clear_pending(&self.pending_outgoing, &key);
        Self::clear_pending(&self.pending_incoming, &key);
        self.send_call(CallSignalType::End, peer_id, start_time)
            .await
    }

    /// Forward one of our gathered candidates.
    pub async fn ice_candidate(
        &self,
        peer_id: &str,
        start_time: i64,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::candidate(&self.self_id, start_time, candidate);
        self.send(peer_id, &msg).await
    }

    /// Send an offer, initial or renegotiated.
    pub async fn ice_offer(
        &self,
        peer_id: &str,
        start_time: i64,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::offer(&self.self_id, start_time, offer);
        self.send(peer_id, &msg).await
    }

    /// Send our answer to the peer's offer.
    pub async fn ice_answer(
        &self,
        peer_id: &str,
        start_time: i64,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::answer(&self.self_id, start_time, answer);
        self.send(peer_id, &msg).await
    }

    async fn send_call(
        &self,
        signal: CallSignalType,
        peer_id: &str,
        start_time: i64,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::call(signal, &self.self_id, start_time);
        self.send(peer_id, &msg).await
    }

    async fn send(&self, peer_id: &str, msg: &SignalingMessage) -> Result<(), CallError> {
        let payload = msg.to_json()?;
        debug!("-> {}: {}", peer_id, payload);
        if let Err(e) = self.transport.send(peer_id, payload).await {
            warn!("Signaling send to {} failed: {}", peer_id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Entry point for every payload received on our chat channel.
    pub fn handle_incoming(&self, payload: &str) {
        let msg = match SignalingMessage::from_json(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping unparseable signaling payload: {}", e);
                return;
            }
        };

        if msg.sender_id() == self.self_id {
            return;
        }
        debug!("<- {}: {}", msg.sender_id(), payload);

        match msg {
            SignalingMessage::Call(call) => {
                let key = CallKey::new(call.sender_id, call.start_time);
                match call.call_signal_type {
                    CallSignalType::Initiate => {
                        if self.pending_incoming.contains_key(&key) {
                            debug!("Duplicate initiate for {}", key);
                            return;
                        }
                        info!("Incoming call {}", key);
                        self.track_pending(&self.pending_incoming, key.clone());
                        self.emit(SignalingEvent::IncomingCall(key));
                    }
                    CallSignalType::Accept => {
                        Self::clear_pending(&self.pending_outgoing, &key);
                        self.emit(SignalingEvent::CallAccepted(key));
                    }
                    CallSignalType::End => {
                        Self::clear_pending(&self.pending_outgoing, &key);
                        Self::clear_pending(&self.pending_incoming, &key);
                        self.emit(SignalingEvent::CallEnded(key));
                    }
                }
            }
            SignalingMessage::Ice(ice) => {
                let key = CallKey::new(ice.sender_id, ice.start_time);
                match ice.ice_signal_type {
                    IceSignalType::Candidate => {
                        self.emit(SignalingEvent::IceCandidate(key, ice.candidate));
                    }
                    IceSignalType::Offer => {
                        if self.offer_guard.is_negotiating() {
                            debug!("Dropping offer from {}: local offer in flight", key);
                            return;
                        }
                        match ice.offer {
                            Some(offer) => self.emit(SignalingEvent::IceOffer(key, offer)),
                            None => warn!("Offer from {} carries no description", key),
                        }
                    }
                    IceSignalType::Answer => match ice.answer {
                        Some(answer) => self.emit(SignalingEvent::IceAnswer(key, answer)),
                        None => warn!("Answer from {} carries no description", key),
                    },
                }
            }
        }
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            debug!("Call manager gone, dropping signaling event");
        }
    }

    /// Register `key` in `map` and arm its timeout.
    fn track_pending(&self, map: &PendingCalls, key: CallKey) {
        let previous = map.insert(
            key.clone(),
            PendingCall {
                peer_id: key.peer_id.clone(),
                start_time: key.start_time,
                timer: None,
            },
        );
        if let Some(previous) = previous {
            previous.cancel();
        }

        let timer = {
            let map = map.clone();
            let events = self.events.clone();
            let timeout = self.dialing_timeout;
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // Whoever removes the entry first owns the outcome.
                if map.remove(&key).is_some() {
                    info!("Call {} timed out after {:?}", key, timeout);
                    let _ = events.send(SignalingEvent::CallTimeout(key));
                }
            })
        };

        match map.get_mut(&key) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    fn clear_pending(map: &PendingCalls, key: &CallKey) {
        if let Some((_, entry)) = map.remove(key) {
            entry.cancel();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for entry in self.pending_outgoing.iter() {
            entry.cancel();
        }
        for entry in self.pending_incoming.iter() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(String, SignalingMessage)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(to, payload)| (to.clone(), SignalingMessage::from_json(payload).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send(&self, channel_id: &str, payload: String) -> Result<(), CallError> {
            if self.fail {
                return Err(CallError::TransportSendFailure {
                    channel: channel_id.to_string(),
                    reason: "offline".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), payload));
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn channel(
        transport: Arc<RecordingTransport>,
    ) -> (SignalingChannel, mpsc::UnboundedReceiver<SignalingEvent>, OfferGuard) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = OfferGuard::default();
        let channel = SignalingChannel::new("alice", transport, TIMEOUT, tx, guard.clone());
        (channel, rx, guard)
    }

    fn payload(msg: SignalingMessage) -> String {
        msg.to_json().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_init_sends_and_times_out_once() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport.clone());

        channel.call_init("bob", 1000).await.unwrap();
        assert_eq!(channel.pending_outgoing_count(), 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "bob");
        assert_eq!(
            sent[0].1,
            SignalingMessage::call(CallSignalType::Initiate, "alice", 1000)
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event, SignalingEvent::CallTimeout(CallKey::new("bob", 1000)));
        assert_eq!(channel.pending_outgoing_count(), 0);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_end_cancels_timeout() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport.clone());

        channel.call_init("bob", 1000).await.unwrap();
        tokio::time::sleep(TIMEOUT / 2).await;
        channel.call_end("bob", 1000).await.unwrap();
        assert_eq!(channel.pending_outgoing_count(), 0);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert!(rx.try_recv().is_err());

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1].1,
            SignalingMessage::call(CallSignalType::End, "alice", 1000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_accept_clears_pending_outgoing() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport);

        channel.call_init("bob", 1000).await.unwrap();
        channel.handle_incoming(&payload(SignalingMessage::call(
            CallSignalType::Accept,
            "bob",
            1000,
        )));

        assert_eq!(
            rx.recv().await.unwrap(),
            SignalingEvent::CallAccepted(CallKey::new("bob", 1000))
        );
        assert_eq!(channel.pending_outgoing_count(), 0);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_initiate_registers_pending_incoming() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport);
        let initiate = payload(SignalingMessage::call(CallSignalType::Initiate, "bob", 7));

        channel.handle_incoming(&initiate);
        channel.handle_incoming(&initiate);

        let key = CallKey::new("bob", 7);
        assert_eq!(rx.recv().await.unwrap(), SignalingEvent::IncomingCall(key.clone()));
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.pending_incoming_count(), 1);

        // Unanswered incoming calls expire too.
        assert_eq!(rx.recv().await.unwrap(), SignalingEvent::CallTimeout(key));
        assert_eq!(channel.pending_incoming_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_accept_clears_pending_incoming() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport.clone());
        channel.handle_incoming(&payload(SignalingMessage::call(
            CallSignalType::Initiate,
            "bob",
            7,
        )));
        rx.recv().await.unwrap();

        channel.call_accept("bob", 7).await.unwrap();
        assert_eq!(channel.pending_incoming_count(), 0);
        assert_eq!(
            transport.sent()[0].1,
            SignalingMessage::call(CallSignalType::Accept, "alice", 7)
        );

        tokio::time::sleep(TIMEOUT * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_end_clears_both_maps() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport);
        channel.call_init("bob", 1).await.unwrap();
        channel.handle_incoming(&payload(SignalingMessage::call(
            CallSignalType::End,
            "bob",
            1,
        )));

        assert_eq!(
            rx.recv().await.unwrap(),
            SignalingEvent::CallEnded(CallKey::new("bob", 1))
        );
        assert!(!channel.is_pending(&CallKey::new("bob", 1)));
    }

    #[tokio::test]
    async fn test_ignores_own_and_garbage_messages() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport);

        channel.handle_incoming("not json");
        channel.handle_incoming(r#"{"type":"call","callSignalType":"RING","senderId":"bob","startTime":1}"#);
        channel.handle_incoming(&payload(SignalingMessage::call(
            CallSignalType::Initiate,
            "alice",
            1,
        )));

        assert!(rx.try_recv().is_err());
        assert_eq!(channel.pending_incoming_count(), 0);
    }

    #[tokio::test]
    async fn test_negotiation_messages_are_forwarded() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport);
        let key = CallKey::new("bob", 5);
        let candidate = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.2 5000 typ host");

        channel.handle_incoming(&payload(SignalingMessage::candidate("bob", 5, candidate.clone())));
        channel.handle_incoming(&payload(SignalingMessage::offer(
            "bob",
            5,
            SessionDescription::offer("v=0 o"),
        )));
        channel.handle_incoming(&payload(SignalingMessage::answer(
            "bob",
            5,
            SessionDescription::answer("v=0 a"),
        )));

        assert_eq!(
            rx.recv().await.unwrap(),
            SignalingEvent::IceCandidate(key.clone(), Some(candidate))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SignalingEvent::IceOffer(key.clone(), SessionDescription::offer("v=0 o"))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SignalingEvent::IceAnswer(key, SessionDescription::answer("v=0 a"))
        );
    }

    #[tokio::test]
    async fn test_offer_dropped_while_local_offer_in_flight() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, guard) = channel(transport);
        let offer = payload(SignalingMessage::offer(
            "bob",
            5,
            SessionDescription::offer("v=0"),
        ));

        assert!(guard.begin());
        channel.handle_incoming(&offer);
        assert!(rx.try_recv().is_err());

        guard.end();
        channel.handle_incoming(&offer);
        assert!(matches!(rx.try_recv(), Ok(SignalingEvent::IceOffer(..))));
    }

    #[tokio::test]
    async fn test_offer_without_description_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, mut rx, _) = channel(transport);
        channel.handle_incoming(r#"{"type":"ice","iceSignalType":"OFFER","senderId":"bob","startTime":1}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_returned_and_call_still_times_out() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let (channel, mut rx, _) = channel(transport);

        let result = channel.call_init("bob", 1000).await;
        assert!(matches!(result, Err(CallError::TransportSendFailure { .. })));

        assert_eq!(
            rx.recv().await.unwrap(),
            SignalingEvent::CallTimeout(CallKey::new("bob", 1000))
        );
    }
}
