//! Peer-to-peer audio/video calls signaled over the chat transport.
//!
//! # Architecture
//!
//! - [`CallSession`] & [`CallEvent`]: call state machine and call history
//! - [`SignalingChannel`]: call-control and negotiation messages, pending
//!   calls and their dialing timeouts
//! - [`NegotiationController`]: the per-call peer connection, candidate
//!   buffering and local/remote media
//! - [`CallManager`] & [`CallHandle`]: orchestrates the above in a single task
//!
//! # Protocol Overview
//!
//! 1. Caller sends `INITIATE`; both sides track the call as pending
//! 2. Callee answers with `ACCEPT`, or either side sends `END`
//! 3. Unanswered calls expire after the dialing timeout
//! 4. On accept the caller sends an `OFFER`, the callee replies with an `ANSWER`
//! 5. ICE candidates flow both ways; early ones are buffered until the remote
//!    description is applied
//! 6. Either side hangs up with `END`

mod clock;
mod error;
mod manager;
pub mod media;
mod message;
mod signaling;
pub mod sim;
mod state;
mod transport;


pub use clock::{Clock, MonotonicClock, SystemClock};
pub use error::CallError;
pub use manager::{CallHandle, CallManager, CallNotification, CallPlatform};
pub use media::{NegotiationController, OfferGuard};
pub use message::{CallMessage, CallSignalType, IceMessage, IceSignalType, SignalingMessage};
pub use signaling::{PendingCall, SignalingChannel, SignalingEvent};
pub use state::{CallEvent, CallInfo, CallKey, CallSession, CallState, CallType};
pub use transport::{ChatTransport, IceCandidate, SdpType, SessionDescription};
