//! Local capture streams and the operations that mutate them.
//!
//! [`LocalMediaController`] is the only owner allowed to add, remove or
//! replace tracks. Peer sessions only ever attach what it hands them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};
use crate::transport::{set_outbound_track, Transport};

const STREAM_ID: &str = "mesh-call";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Permission denied for {0}")]
    Denied(String),

    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Capture returned no {0} track")]
    NoTrack(MediaKind),
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtc: Arc<TrackLocalStaticSample>,
}

/// A local capture track. Clones share the same underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Self::with_codec(kind, label, codec)
    }

    pub fn with_codec(
        kind: MediaKind,
        label: impl Into<String>,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        let id = format!("{}-{:08x}", kind, rand::random::<u32>());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                rtc,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Stop capture. Idempotent; wakes every `ended()` waiter.
    pub fn stop(&self) {
        if !self.inner.ended.send_replace(true) {
            debug!(track_id = %self.inner.id, kind = %self.inner.kind, "Track stopped");
        }
    }

    /// Resolves once the track has been stopped, by us or by the capture source.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn rtc(&self) -> &Arc<TrackLocalStaticSample> {
        &self.inner.rtc
    }

    /// Identity comparison: true only for clones of the same track.
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracks(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn add_track(&mut self, track: LocalTrack) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn first(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.tracks_of(kind).next().cloned()
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub user_media: bool,
    pub display_capture: bool,
}

/// Capture devices of the host.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    async fn user_media(&self, constraints: MediaConstraints) -> std::result::Result<MediaStream, MediaError>;

    async fn display_media(&self) -> std::result::Result<MediaStream, MediaError>;
}

/// What the local preview is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewSource {
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFlags {
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub screen_share_active: bool,
    pub preview: PreviewSource,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            mic_enabled: false,
            cam_enabled: false,
            screen_share_active: false,
            preview: PreviewSource::Camera,
        }
    }
}

#[derive(Debug)]
pub struct LocalMediaState {
    pub stream: MediaStream,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub screen_stream: Option<MediaStream>,
    pub preview: PreviewSource,
}

impl LocalMediaState {
    pub fn screen_share_active(&self) -> bool {
        self.screen_stream.is_some()
    }

    /// The track every transport should currently be sending as video.
    pub fn outbound_video(&self) -> Option<LocalTrack> {
        self.screen_stream
            .as_ref()
            .and_then(|s| s.first(MediaKind::Video))
            .or_else(|| self.stream.first(MediaKind::Video))
    }

    pub fn flags(&self) -> MediaFlags {
        MediaFlags {
            mic_enabled: self.mic_enabled,
            cam_enabled: self.cam_enabled,
            screen_share_active: self.screen_share_active(),
            preview: self.preview,
        }
    }
}

pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    state: Option<LocalMediaState>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: None,
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.devices.capabilities()
    }

    pub fn state(&self) -> Option<&LocalMediaState> {
        self.state.as_ref()
    }

    pub fn flags(&self) -> MediaFlags {
        self.state.as_ref().map(|s| s.flags()).unwrap_or_default()
    }

    /// Open the camera and microphone. A device that fails on its own is
    /// skipped as long as the other one opens.
    pub async fn acquire(&mut self, no_audio: bool, video_off: bool) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }

        let both = MediaConstraints { audio: true, video: true };
        let stream = match self.devices.user_media(both).await {
            Ok(stream) => stream,
            Err(first) => {
                warn!(error = %first, "Camera and microphone together unavailable, trying separately");
                let mut partial = MediaStream::new();
                for constraints in [
                    MediaConstraints { audio: true, video: false },
                    MediaConstraints { audio: false, video: true },
                ] {
                    match self.devices.user_media(constraints).await {
                        Ok(s) => s.tracks().iter().cloned().for_each(|t| partial.add_track(t)),
                        Err(e) => debug!(error = %e, ?constraints, "Capture failed"),
                    }
                }
                if partial.is_empty() {
                    return Err(first.into());
                }
                partial
            }
        };

        for track in stream.tracks_of(MediaKind::Audio) {
            track.set_enabled(!no_audio);
        }
        for track in stream.tracks_of(MediaKind::Video) {
            track.set_enabled(!video_off);
        }

        let state = LocalMediaState {
            mic_enabled: stream.has(MediaKind::Audio) && !no_audio,
            cam_enabled: stream.has(MediaKind::Video) && !video_off,
            stream,
            screen_stream: None,
            preview: PreviewSource::Camera,
        };
        info!(
            tracks = state.stream.tracks().len(),
            mic = state.mic_enabled,
            cam = state.cam_enabled,
            "Local media acquired"
        );
        self.state = Some(state);
        Ok(())
    }

    /// Attach the current local tracks to a freshly created transport. The
    /// video slot gets whatever is outbound right now (camera or screen). A
    /// kind with no track gets an empty slot for a later acquire to fill.
    pub async fn attach_to(&self, transport: &dyn Transport) -> Result<()> {
        let state = self.state.as_ref().ok_or(Error::NoLocalStream)?;
        match state.stream.first(MediaKind::Audio) {
            Some(audio) => {
                transport.add_track(&audio).await?;
            }
            None => {
                transport.reserve_sender(MediaKind::Audio).await?;
            }
        }
        match state.outbound_video() {
            Some(video) => {
                transport.add_track(&video).await?;
            }
            None => {
                transport.reserve_sender(MediaKind::Video).await?;
            }
        }
        Ok(())
    }

    pub async fn toggle_microphone(&mut self, transports: &[Arc<dyn Transport>]) -> Result<bool> {
        let has_audio = self
            .state
            .as_ref()
            .ok_or(Error::NoLocalStream)?
            .stream
            .has(MediaKind::Audio);

        if !has_audio {
            let track = self.capture(MediaKind::Audio).await?;
            track.set_enabled(true);
            publish(transports, &track).await;
            let state = self.state.as_mut().ok_or(Error::NoLocalStream)?;
            state.stream.add_track(track);
            state.mic_enabled = true;
            return Ok(true);
        }

        let state = self.state.as_mut().ok_or(Error::NoLocalStream)?;
        let enabled = !state.mic_enabled;
        for track in state.stream.tracks_of(MediaKind::Audio) {
            track.set_enabled(enabled);
        }
        state.mic_enabled = enabled;
        Ok(enabled)
    }

    pub async fn toggle_camera(&mut self, transports: &[Arc<dyn Transport>]) -> Result<bool> {
        let state = self.state.as_ref().ok_or(Error::NoLocalStream)?;
        let has_video = state.stream.has(MediaKind::Video);
        let sharing = state.screen_share_active();

        if !has_video {
            let track = self.capture(MediaKind::Video).await?;
            track.set_enabled(true);
            // While sharing, the camera waits for the share to end.
            if !sharing {
                publish(transports, &track).await;
            }
            let state = self.state.as_mut().ok_or(Error::NoLocalStream)?;
            state.stream.add_track(track);
            state.cam_enabled = true;
            if !sharing {
                state.preview = PreviewSource::Camera;
            }
            return Ok(true);
        }

        let state = self.state.as_mut().ok_or(Error::NoLocalStream)?;
        let enabled = !state.cam_enabled;
        for track in state.stream.tracks_of(MediaKind::Video) {
            track.set_enabled(enabled);
        }
        state.cam_enabled = enabled;
        Ok(enabled)
    }

    /// Replace the outbound video on every transport with a display capture.
    /// Returns the display track so the caller can watch for it ending.
    pub async fn start_screen_share(
        &mut self,
        transports: &[Arc<dyn Transport>],
    ) -> Result<LocalTrack> {
        let state = self.state.as_ref().ok_or(Error::NoLocalStream)?;
        if let Some(existing) = state.screen_stream.as_ref().and_then(|s| s.first(MediaKind::Video)) {
            return Ok(existing);
        }
        if !self.devices.capabilities().display_capture {
            return Err(MediaError::Unsupported("screen sharing".into()).into());
        }

        let screen = self.devices.display_media().await?;
        let Some(track) = screen.first(MediaKind::Video) else {
            screen.stop_all();
            return Err(MediaError::NoTrack(MediaKind::Video).into());
        };

        publish(transports, &track).await;

        let state = self.state.as_mut().ok_or(Error::NoLocalStream)?;
        state.preview = PreviewSource::Screen;
        state.screen_stream = Some(screen);
        info!(track_id = %track.id(), peers = transports.len(), "Screen share started");
        Ok(track)
    }

    /// Put the camera back on every transport and release the display capture.
    /// Returns false when no share was active.
    pub async fn stop_screen_share(&mut self, transports: &[Arc<dyn Transport>]) -> Result<bool> {
        let state = self.state.as_mut().ok_or(Error::NoLocalStream)?;
        let Some(screen) = state.screen_stream.take() else {
            return Ok(false);
        };
        let camera = state.stream.first(MediaKind::Video);
        state.preview = PreviewSource::Camera;

        for transport in transports {
            for sender in transport.senders().await {
                if sender.kind() != MediaKind::Video {
                    continue;
                }
                if let Err(e) = sender.replace_track(camera.clone()).await {
                    warn!(error = %e, "Failed to restore camera track");
                }
            }
        }
        screen.stop_all();
        info!(peers = transports.len(), "Screen share stopped");
        Ok(true)
    }

    /// Stop every local track. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(screen) = &state.screen_stream {
                screen.stop_all();
            }
            state.stream.stop_all();
        }
    }

    async fn capture(&self, kind: MediaKind) -> Result<LocalTrack> {
        let constraints = MediaConstraints {
            audio: kind == MediaKind::Audio,
            video: kind == MediaKind::Video,
        };
        let stream = self.devices.user_media(constraints).await?;
        stream
            .first(kind)
            .ok_or_else(|| MediaError::NoTrack(kind).into())
    }
}

async fn publish(transports: &[Arc<dyn Transport>], track: &LocalTrack) {
    for transport in transports {
        if let Err(e) = set_outbound_track(transport.as_ref(), track).await {
            warn!(error = %e, track_id = %track.id(), "Failed to attach track to transport");
        }
    }
}
