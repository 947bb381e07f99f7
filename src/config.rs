//! Call settings.
//!
//! Stored as JSON alongside the rest of the client's settings. Keys keep the
//! names the settings file has always used (`rtcIceConfig`, ...), and every
//! field falls back to a default when absent.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_DIALING_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One or many URLs, as browsers accept for `RTCIceServer.urls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(url) => vec![url.clone()],
            Self::Many(urls) => urls.clone(),
        }
    }
}

/// A STUN or TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }
}

/// Capture constraints for the camera.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facing_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RtcSettings {
    #[serde(rename = "rtcIceConfig")]
    pub ice_servers: Vec<IceServer>,
    #[serde(rename = "rtcVideoConstraints")]
    pub video_constraints: VideoConstraints,
    #[serde(rename = "rtcDialingTimeoutSeconds")]
    pub dialing_timeout_seconds: u64,
    /// Abort the call flow when camera/microphone access fails instead of
    /// continuing without local media.
    pub require_local_media: bool,
    pub start_with_audio: bool,
    pub start_with_video: bool,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            video_constraints: VideoConstraints::default(),
            dialing_timeout_seconds: DEFAULT_DIALING_TIMEOUT_SECS,
            require_local_media: false,
            start_with_audio: true,
            start_with_video: true,
        }
    }
}

impl RtcSettings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("failed to parse settings in {}", path.display()))
    }

    pub fn dialing_timeout(&self) -> Duration {
        Duration::from_secs(self.dialing_timeout_seconds)
    }
}
