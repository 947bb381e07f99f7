//! Local and remote media stream handles.
//!
//! Device capture and rendering belong to the platform; the call subsystem
//! only needs to hold tracks, stop them, and flip their enabled flag.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::calls::error::CallError;
use crate::config::VideoConstraints;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single platform media track.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Independent track over the same source; stopping one leaves the other live.
    fn clone_track(&self) -> Arc<dyn MediaTrack>;
}

/// A group of tracks handed out together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        self.tracks.push(track);
    }

    /// Clone every track into a new stream with its own id.
    pub fn clone_stream(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: self.tracks.iter().map(|t| t.clone_track()).collect(),
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }
}

/// Constraints passed to the platform when requesting device access.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

/// Platform device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with [`CallError::MediaUnavailable`] when access is denied or no
    /// device matches.
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, CallError>;
}
