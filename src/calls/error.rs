//! Call-related error types.

use thiserror::Error;

use super::media::SignalingState;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("cannot {operation} in signaling state {state:?}")]
    InvalidNegotiationState {
        operation: &'static str,
        state: SignalingState,
    },

    #[error("stale signal for call {peer_id}@{start_time}")]
    StaleSignal { peer_id: String, start_time: i64 },

    #[error("failed to send signaling message to {channel}: {reason}")]
    TransportSendFailure { channel: String, reason: String },

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("call manager is not running")]
    ManagerClosed,
}

impl CallError {
    /// Level to log a failed inbound event at. Stale signals are routine
    /// after a call ends and are dropped quietly.
    pub fn log_level(&self) -> log::Level {
        match self {
            Self::StaleSignal { .. } => log::Level::Debug,
            _ => log::Level::Warn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_signals_log_quietly() {
        let stale = CallError::StaleSignal {
            peer_id: "alice".to_string(),
            start_time: 1000,
        };
        assert_eq!(stale.log_level(), log::Level::Debug);

        let send = CallError::TransportSendFailure {
            channel: "alice".to_string(),
            reason: "offline".to_string(),
        };
        assert_eq!(send.log_level(), log::Level::Warn);
        assert_eq!(CallError::Negotiation("x".into()).log_level(), log::Level::Warn);
    }
}
