//! Call state machine implementation.

use serde::Serialize;

/// Who initiated a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    #[default]
    None,
    Incoming,
    Outgoing,
}

/// Lifecycle state of a call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    #[default]
    None,
    /// Outgoing call: `Initiate` sent, waiting for the peer.
    Initiated,
    /// Incoming call: ringing locally.
    Receiving,
    /// Accepted by the callee, media negotiation in progress.
    Accepted,
    NotAnswered,
    Declined,
    Canceled,
    /// Media transport established.
    Connected,
    Completed,
}

impl CallState {
    /// Terminal states are the ones recorded in the call log.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotAnswered | Self::Declined | Self::Canceled | Self::Completed
        )
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Initiated | Self::Receiving)
    }

    /// Accepted or connected: a negotiation session exists for the call.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Accepted | Self::Connected)
    }
}

/// Identity of a call attempt: the peer plus the call's start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub peer_id: String,
    pub start_time: i64,
}

impl CallKey {
    pub fn new(peer_id: impl Into<String>, start_time: i64) -> Self {
        Self {
            peer_id: peer_id.into(),
            start_time,
        }
    }
}

impl std::fmt::Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.start_time)
    }
}

/// One call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub call_type: CallType,
    pub call_state: CallState,
    pub peer_user_id: String,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl CallInfo {
    fn new(call_type: CallType, call_state: CallState, peer: &str, start_time: i64) -> Self {
        Self {
            call_type,
            call_state,
            peer_user_id: peer.to_string(),
            start_time,
            end_time: None,
        }
    }

    /// Same call attempt as `(peer_id, start_time)`.
    pub fn matches(&self, peer_id: &str, start_time: i64) -> bool {
        self.peer_user_id == peer_id && self.start_time == start_time
    }

    pub fn key(&self) -> CallKey {
        CallKey::new(self.peer_user_id.clone(), self.start_time)
    }

    pub fn has_peer(&self) -> bool {
        !self.peer_user_id.is_empty()
    }

    /// Label shown by call controls.
    pub fn status_text(&self) -> &'static str {
        match (self.call_state, self.call_type) {
            (CallState::Initiated, _) => "Calling",
            (CallState::Accepted, _) => "Call Accepted",
            (CallState::Receiving, _) => "Receiving Call",
            (CallState::Connected, _) => "Call Connected",
            (CallState::Completed, _) => "Call Completed",
            (CallState::Canceled, _) => "Call Canceled",
            (CallState::Declined, _) => "Call Declined",
            (CallState::NotAnswered, CallType::Incoming) => "Call Missed",
            (CallState::NotAnswered, CallType::Outgoing) => "Call Not Answered",
            _ => "",
        }
    }
}

/// Call lifecycle events driving [`CallSession::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    OutgoingCallInitiated { peer_id: String, start_time: i64 },
    IncomingCallReceived { peer_id: String, start_time: i64 },
    IncomingCallAccepted { peer_id: String, start_time: i64 },
    OutgoingCallAccepted { peer_id: String, start_time: i64 },
    CallConnected { peer_id: String, start_time: i64 },
    CallDeclined { peer_id: String, start_time: i64, end_time: i64 },
    CallCanceled { peer_id: String, start_time: i64, end_time: i64 },
    CallNotAnswered { peer_id: String, start_time: i64, end_time: i64 },
    CallCompleted { peer_id: String, start_time: i64, end_time: i64 },
}

impl CallEvent {
    /// Builds the terminal event that moves a call into `state`.
    ///
    /// Returns `None` for non-terminal states.
    pub fn terminal(state: CallState, key: &CallKey, end_time: i64) -> Option<Self> {
        let peer_id = key.peer_id.clone();
        let start_time = key.start_time;
        Some(match state {
            CallState::Declined => Self::CallDeclined { peer_id, start_time, end_time },
            CallState::Canceled => Self::CallCanceled { peer_id, start_time, end_time },
            CallState::NotAnswered => Self::CallNotAnswered { peer_id, start_time, end_time },
            CallState::Completed => Self::CallCompleted { peer_id, start_time, end_time },
            _ => return None,
        })
    }
}

/// Authoritative record of the current call, the last incoming call and the
/// call history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub current_call: CallInfo,
    pub last_incoming_call: CallInfo,
    pub call_log: Vec<CallInfo>,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a lifecycle event. Returns `true` if the session changed.
    ///
    /// Accept and connect transitions on the current call trust the caller;
    /// terminal transitions only apply to the call they name, so a late
    /// signal for a superseded call leaves the session untouched.
    pub fn apply(&mut self, event: CallEvent) -> bool {
        match event {
            CallEvent::OutgoingCallInitiated { peer_id, start_time } => {
                self.current_call =
                    CallInfo::new(CallType::Outgoing, CallState::Initiated, &peer_id, start_time);
                true
            }
            CallEvent::IncomingCallReceived { peer_id, start_time } => {
                if self.current_call.call_state == CallState::Connected {
                    // Already in a call: log it as missed, no busy signal.
                    let missed = CallInfo::new(
                        CallType::Incoming,
                        CallState::NotAnswered,
                        &peer_id,
                        start_time,
                    );
                    self.last_incoming_call = missed.clone();
                    self.call_log.push(missed);
                } else {
                    // Most recent incoming call wins.
                    let ringing =
                        CallInfo::new(CallType::Incoming, CallState::Receiving, &peer_id, start_time);
                    self.last_incoming_call = ringing.clone();
                    self.current_call = ringing;
                }
                true
            }
            CallEvent::IncomingCallAccepted { peer_id, start_time } => {
                let last = &self.last_incoming_call;
                if last.call_state != CallState::Receiving || !last.matches(&peer_id, start_time) {
                    return false;
                }
                self.last_incoming_call.call_state = CallState::Accepted;
                self.current_call = self.last_incoming_call.clone();
                true
            }
            CallEvent::OutgoingCallAccepted { .. } => {
                self.current_call.call_state = CallState::Accepted;
                true
            }
            CallEvent::CallConnected { .. } => {
                self.current_call.call_state = CallState::Connected;
                true
            }
            CallEvent::CallDeclined { peer_id, start_time, end_time } => {
                self.finish(CallState::Declined, &peer_id, start_time, end_time)
            }
            CallEvent::CallCanceled { peer_id, start_time, end_time } => {
                self.finish(CallState::Canceled, &peer_id, start_time, end_time)
            }
            CallEvent::CallNotAnswered { peer_id, start_time, end_time } => {
                self.finish(CallState::NotAnswered, &peer_id, start_time, end_time)
            }
            CallEvent::CallCompleted { peer_id, start_time, end_time } => {
                self.finish(CallState::Completed, &peer_id, start_time, end_time)
            }
        }
    }

    fn finish(&mut self, state: CallState, peer_id: &str, start_time: i64, end_time: i64) -> bool {
        if !self.current_call.matches(peer_id, start_time) {
            return false;
        }
        self.current_call.call_state = state;
        self.current_call.end_time = Some(end_time);
        self.call_log.push(self.current_call.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(peer: &str, t: i64) -> CallEvent {
        CallEvent::IncomingCallReceived {
            peer_id: peer.into(),
            start_time: t,
        }
    }

    fn connected_session(peer: &str, t: i64) -> CallSession {
        let mut session = CallSession::new();
        session.apply(CallEvent::OutgoingCallInitiated {
            peer_id: peer.into(),
            start_time: t,
        });
        session.apply(CallEvent::OutgoingCallAccepted {
            peer_id: peer.into(),
            start_time: t,
        });
        session.apply(CallEvent::CallConnected {
            peer_id: peer.into(),
            start_time: t,
        });
        session
    }

    #[test]
    fn test_initial_session_is_empty() {
        let session = CallSession::new();
        assert_eq!(session.current_call.call_type, CallType::None);
        assert_eq!(session.current_call.call_state, CallState::None);
        assert_eq!(session.current_call.peer_user_id, "");
        assert_eq!(session.current_call.start_time, 0);
        assert!(session.call_log.is_empty());
    }

    /// Flow: Initiated → Accepted → Connected → Completed
    #[test]
    fn test_outgoing_call_flow() {
        let mut session = connected_session("bob", 1000);
        assert_eq!(session.current_call.call_type, CallType::Outgoing);
        assert_eq!(session.current_call.call_state, CallState::Connected);

        assert!(session.apply(CallEvent::CallCompleted {
            peer_id: "bob".into(),
            start_time: 1000,
            end_time: 5000,
        }));
        assert_eq!(session.current_call.call_state, CallState::Completed);
        assert_eq!(session.current_call.end_time, Some(5000));
        assert_eq!(session.call_log, vec![session.current_call.clone()]);
    }

    #[test]
    fn test_incoming_call_accepted() {
        let mut session = CallSession::new();
        session.apply(received("alice", 2000));
        assert!(session.apply(CallEvent::IncomingCallAccepted {
            peer_id: "alice".into(),
            start_time: 2000,
        }));

        let expected = CallInfo {
            call_type: CallType::Incoming,
            call_state: CallState::Accepted,
            peer_user_id: "alice".into(),
            start_time: 2000,
            end_time: None,
        };
        assert_eq!(session.current_call, expected);
        assert_eq!(session.last_incoming_call, expected);

        // Replaying the accept is a no-op.
        let before = session.clone();
        assert!(!session.apply(CallEvent::IncomingCallAccepted {
            peer_id: "alice".into(),
            start_time: 2000,
        }));
        assert_eq!(session, before);
    }

    #[test]
    fn test_incoming_accept_for_other_call_is_ignored() {
        let mut session = CallSession::new();
        session.apply(received("alice", 2000));
        let before = session.clone();

        assert!(!session.apply(CallEvent::IncomingCallAccepted {
            peer_id: "alice".into(),
            start_time: 1999,
        }));
        assert!(!session.apply(CallEvent::IncomingCallAccepted {
            peer_id: "mallory".into(),
            start_time: 2000,
        }));
        assert_eq!(session, before);
    }

    #[test]
    fn test_incoming_while_connected_is_logged_as_missed() {
        let mut session = connected_session("bob", 1000);
        let current = session.current_call.clone();

        session.apply(received("carol", 3000));

        assert_eq!(session.current_call, current);
        assert_eq!(session.call_log.len(), 1);
        let missed = &session.call_log[0];
        assert_eq!(missed.call_type, CallType::Incoming);
        assert_eq!(missed.call_state, CallState::NotAnswered);
        assert_eq!(missed.peer_user_id, "carol");
        assert_eq!(missed.status_text(), "Call Missed");
    }

    #[test]
    fn test_latest_incoming_call_wins() {
        let mut session = CallSession::new();
        session.apply(received("alice", 2000));
        session.apply(received("carol", 2100));

        assert!(session.current_call.matches("carol", 2100));
        assert_eq!(session.current_call.call_state, CallState::Receiving);
        assert!(session.last_incoming_call.matches("carol", 2100));
    }

    #[test]
    fn test_terminal_mismatch_leaves_session_unchanged() {
        let mut session = connected_session("bob", 1000);
        let before = session.clone();

        for state in [
            CallState::Declined,
            CallState::Canceled,
            CallState::NotAnswered,
            CallState::Completed,
        ] {
            let stale = CallEvent::terminal(state, &CallKey::new("bob", 999), 4000).unwrap();
            assert!(!session.apply(stale));
            let other = CallEvent::terminal(state, &CallKey::new("eve", 1000), 4000).unwrap();
            assert!(!session.apply(other));
        }
        assert_eq!(session, before);
    }

    #[test]
    fn test_accept_and_connect_trust_current_call() {
        let mut session = CallSession::new();
        session.apply(CallEvent::OutgoingCallInitiated {
            peer_id: "bob".into(),
            start_time: 1000,
        });

        // No identity check on accept/connect.
        session.apply(CallEvent::OutgoingCallAccepted {
            peer_id: "someone-else".into(),
            start_time: 1,
        });
        assert_eq!(session.current_call.call_state, CallState::Accepted);
        session.apply(CallEvent::CallConnected {
            peer_id: "someone-else".into(),
            start_time: 1,
        });
        assert_eq!(session.current_call.call_state, CallState::Connected);
        assert!(session.current_call.matches("bob", 1000));
    }

    #[test]
    fn test_terminal_state_persists_until_next_call() {
        let mut session = CallSession::new();
        session.apply(CallEvent::OutgoingCallInitiated {
            peer_id: "bob".into(),
            start_time: 1000,
        });
        session.apply(CallEvent::CallCanceled {
            peer_id: "bob".into(),
            start_time: 1000,
            end_time: 1500,
        });
        assert_eq!(session.current_call.call_state, CallState::Canceled);
        assert_eq!(session.current_call.status_text(), "Call Canceled");

        session.apply(CallEvent::OutgoingCallInitiated {
            peer_id: "dave".into(),
            start_time: 6000,
        });
        assert!(session.current_call.matches("dave", 6000));
        assert_eq!(session.current_call.end_time, None);
        assert_eq!(session.call_log.len(), 1);
    }

    #[test]
    fn test_terminal_event_builder() {
        let key = CallKey::new("bob", 1000);
        assert_eq!(CallEvent::terminal(CallState::Connected, &key, 1), None);
        assert_eq!(
            CallEvent::terminal(CallState::NotAnswered, &key, 31000),
            Some(CallEvent::CallNotAnswered {
                peer_id: "bob".into(),
                start_time: 1000,
                end_time: 31000,
            })
        );
    }

    #[test]
    fn test_status_text_for_outgoing_not_answered() {
        let info = CallInfo {
            call_type: CallType::Outgoing,
            call_state: CallState::NotAnswered,
            peer_user_id: "bob".into(),
            start_time: 1,
            end_time: Some(2),
        };
        assert_eq!(info.status_text(), "Call Not Answered");
        assert!(info.call_state.is_terminal());
    }

    #[test]
    fn test_call_info_serializes_camel_case() {
        let info = CallInfo {
            call_type: CallType::Incoming,
            call_state: CallState::Receiving,
            peer_user_id: "alice".into(),
            start_time: 2000,
            end_time: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["callType"], "INCOMING");
        assert_eq!(json["callState"], "RECEIVING");
        assert_eq!(json["peerUserId"], "alice");
        assert!(json.get("endTime").is_none());
    }
}
