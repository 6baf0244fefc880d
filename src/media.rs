//! Local and remote media streams, and the media source seam.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn codec_type(self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }

    fn mime_type(self) -> &'static str {
        match self {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// One captured track. Clones share the enabled flag and the underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            track,
        }
    }

    /// A sample-fed track with the default codec for `kind`.
    pub fn with_default_codec(kind: MediaKind, id: &str, stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: kind.mime_type().to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self::new(kind, Arc::new(track))
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The local participant's capture stream, shared read-only by every peer connection.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some()
    }

    /// Enabled flag of the `kind` track; false when there is none.
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some_and(LocalTrack::is_enabled)
    }

    /// Flips the enabled flag of the `kind` track. Returns the new value, or `None`
    /// if the stream has no such track.
    pub fn toggle(&self, kind: MediaKind) -> Option<bool> {
        let track = self.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        Some(enabled)
    }

    /// Adds tracks whose kind the stream does not carry yet.
    pub fn merge(&mut self, other: LocalStream) {
        for track in other.tracks {
            if !self.has(track.kind()) {
                self.tracks.push(track);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// A track received from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// RTP reader, when the transport exposes one.
    pub handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn from_remote(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = MediaKind::from_codec_type(track.kind())?;
        Some(Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
            handle: Some(track),
        })
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Media received from one peer. Exists once the first remote track arrived.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Adds `track`, replacing one with the same id.
    pub fn add_track(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Owner of the local capture devices.
#[async_trait]
pub trait MediaSource: Send {
    /// Opens the requested devices and returns their tracks. Fails with
    /// [`Error::MediaUnavailable`] if a requested device cannot be opened.
    async fn acquire(&mut self, video: bool, audio: bool) -> Result<LocalStream>;

    /// Stops every track handed out and frees the devices.
    fn release(&mut self);
}

/// Media source backed by the host's default devices.
///
/// Hands out sample-based tracks with the default codec of their kind. With the
/// `device-audio` feature the default input device is probed before an audio track
/// is handed out.
pub struct DeviceMediaSource {
    stream_id: String,
    issued: Vec<LocalTrack>,
}

impl DeviceMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            issued: Vec::new(),
        }
    }

    fn open(&mut self, kind: MediaKind) -> Result<LocalTrack> {
        if kind == MediaKind::Audio {
            probe_audio_input()?;
        }
        let id = format!("{}-{}", self.stream_id, kind);
        let track = LocalTrack::with_default_codec(kind, &id, &self.stream_id);
        debug!(track = %id, "opened local track");
        self.issued.push(track.clone());
        Ok(track)
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&mut self, video: bool, audio: bool) -> Result<LocalStream> {
        if !video && !audio {
            return Err(Error::MediaUnavailable("no media requested".into()));
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(self.open(MediaKind::Audio)?);
        }
        if video {
            tracks.push(self.open(MediaKind::Video)?);
        }
        info!(audio, video, "acquired local media");
        Ok(LocalStream::new(tracks))
    }

    fn release(&mut self) {
        for track in self.issued.drain(..) {
            track.set_enabled(false);
        }
        debug!("released local media");
    }
}

#[cfg(feature = "device-audio")]
fn probe_audio_input() -> Result<()> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaUnavailable("No input device available".into()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::MediaUnavailable(format!("input device unusable: {}", e)))?;
    debug!(?config, "input device available");
    Ok(())
}

#[cfg(not(feature = "device-audio"))]
fn probe_audio_input() -> Result<()> {
    Ok(())
}
