pub mod calls;
pub mod config;

pub use calls::{CallError, CallHandle, CallManager, CallNotification, CallPlatform};
pub use config::RtcSettings;
