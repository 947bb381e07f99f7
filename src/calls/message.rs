//! Signaling message shapes exchanged over the chat transport.
//!
//! Two families share one JSON envelope discriminated by `type`:
//!
//! ```json
//! {"type":"call","callSignalType":"INITIATE","senderId":"alice","startTime":1000}
//! {"type":"ice","iceSignalType":"OFFER","senderId":"alice","startTime":1000,"offer":{"type":"offer","sdp":"..."}}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::CallError;
use super::transport::{IceCandidate, SessionDescription};

/// Call-control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallSignalType {
    /// Dial the peer.
    Initiate,
    /// Callee picked up.
    Accept,
    /// Either side hung up, declined or canceled.
    End,
}

/// Negotiation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IceSignalType {
    Candidate,
    Offer,
    Answer,
}

impl fmt::Display for CallSignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiate => "initiate",
            Self::Accept => "accept",
            Self::End => "end",
        };
        f.write_str(name)
    }
}

impl fmt::Display for IceSignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Candidate => "candidate",
            Self::Offer => "offer",
            Self::Answer => "answer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessage {
    pub call_signal_type: CallSignalType,
    pub sender_id: String,
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceMessage {
    pub ice_signal_type: IceSignalType,
    pub sender_id: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl IceMessage {
    fn new(ice_signal_type: IceSignalType, sender_id: &str, start_time: i64) -> Self {
        Self {
            ice_signal_type,
            sender_id: sender_id.to_string(),
            start_time,
            candidate: None,
            offer: None,
            answer: None,
        }
    }
}

/// Envelope for every signaling payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "call")]
    Call(CallMessage),
    #[serde(rename = "ice")]
    Ice(IceMessage),
}

impl SignalingMessage {
    pub fn call(signal: CallSignalType, sender_id: &str, start_time: i64) -> Self {
        Self::Call(CallMessage {
            call_signal_type: signal,
            sender_id: sender_id.to_string(),
            start_time,
        })
    }

    pub fn candidate(sender_id: &str, start_time: i64, candidate: IceCandidate) -> Self {
        let mut msg = IceMessage::new(IceSignalType::Candidate, sender_id, start_time);
        msg.candidate = Some(candidate);
        Self::Ice(msg)
    }

    pub fn offer(sender_id: &str, start_time: i64, offer: SessionDescription) -> Self {
        let mut msg = IceMessage::new(IceSignalType::Offer, sender_id, start_time);
        msg.offer = Some(offer);
        Self::Ice(msg)
    }

    pub fn answer(sender_id: &str, start_time: i64, answer: SessionDescription) -> Self {
        let mut msg = IceMessage::new(IceSignalType::Answer, sender_id, start_time);
        msg.answer = Some(answer);
        Self::Ice(msg)
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Self::Call(m) => &m.sender_id,
            Self::Ice(m) => &m.sender_id,
        }
    }

    pub fn start_time(&self) -> i64 {
        match self {
            Self::Call(m) => m.start_time,
            Self::Ice(m) => m.start_time,
        }
    }

    pub fn to_json(&self) -> Result<String, CallError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self, CallError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_message_wire_shape() {
        let msg = SignalingMessage::call(CallSignalType::Initiate, "alice", 1000);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call",
                "callSignalType": "INITIATE",
                "senderId": "alice",
                "startTime": 1000
            })
        );
    }

    #[test]
    fn test_offer_message_wire_shape() {
        let msg = SignalingMessage::offer("alice", 1000, SessionDescription::offer("v=0"));
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ice");
        assert_eq!(value["iceSignalType"], "OFFER");
        assert_eq!(value["offer"]["type"], "offer");
        assert!(value.get("answer").is_none());
        assert!(value.get("candidate").is_none());
    }

    #[test]
    fn test_parse_candidate_message() {
        let payload = r#"{
            "type": "ice",
            "iceSignalType": "CANDIDATE",
            "senderId": "bob",
            "startTime": 42,
            "candidate": {"candidate": "candidate:1 1 UDP 1 10.0.0.2 5000 typ host", "sdpMid": "0"}
        }"#;
        let msg = SignalingMessage::from_json(payload).unwrap();
        assert_eq!(msg.sender_id(), "bob");
        assert_eq!(msg.start_time(), 42);
        match msg {
            SignalingMessage::Ice(ice) => {
                assert_eq!(ice.ice_signal_type, IceSignalType::Candidate);
                assert_eq!(ice.candidate.unwrap().sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_null_candidate_parses_as_none() {
        let payload = r#"{"type":"ice","iceSignalType":"CANDIDATE","senderId":"bob","startTime":1,"candidate":null}"#;
        match SignalingMessage::from_json(payload).unwrap() {
            SignalingMessage::Ice(ice) => assert!(ice.candidate.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let payload = r#"{"type":"text","senderId":"bob","startTime":1}"#;
        assert!(matches!(
            SignalingMessage::from_json(payload),
            Err(CallError::Serialization(_))
        ));
    }
}
