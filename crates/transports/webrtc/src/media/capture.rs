//! Local media acquisition

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Kind of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// One captured track
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

/// Local tracks owned by a session
///
/// Bound to one peer connection: the session stops them on teardown and
/// acquires new ones from its [`CaptureDevice`] for the next connection.
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    /// No tracks (receive-only participant)
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Tracks still live; empty once stopped
    pub fn tracks(&self) -> &[LocalTrack] {
        if self.is_stopped() {
            &[]
        } else {
            &self.tracks
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks()
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.track.clone())
    }

    pub fn has_audio(&self) -> bool {
        self.track(MediaKind::Audio).is_some()
    }

    pub fn has_video(&self) -> bool {
        self.track(MediaKind::Video).is_some()
    }

    /// Feed an encoded sample into the track of the given kind
    pub async fn write_sample(&self, kind: MediaKind, sample: &Sample) -> Result<()> {
        let track = self
            .track(kind)
            .ok_or_else(|| Error::MediaCapture(format!("No live {} track", kind)))?;

        track
            .write_sample(sample)
            .await
            .map_err(|e| Error::MediaCapture(format!("Failed to write {} sample: {}", kind, e)))
    }

    /// Release the tracks; repeated calls are no-ops
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Stopped {} local track(s)", self.tracks.len());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of local microphone/camera tracks
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the requested tracks
    ///
    /// Failure is reported as [`Error::MediaCapture`].
    async fn acquire(&self, audio: bool, video: bool) -> Result<LocalMedia>;
}

/// Device producing sample-fed Opus/VP8 tracks
///
/// The application writes encoded samples through
/// [`LocalMedia::write_sample`].
#[derive(Debug, Clone)]
pub struct SampleTrackDevice {
    stream_id: String,
}

impl Default for SampleTrackDevice {
    fn default() -> Self {
        Self::new(format!("stream-{}", uuid::Uuid::new_v4()))
    }
}

impl SampleTrackDevice {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }

    fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ))
    }

    fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            self.stream_id.clone(),
        ))
    }
}

#[async_trait]
impl CaptureDevice for SampleTrackDevice {
    async fn acquire(&self, audio: bool, video: bool) -> Result<LocalMedia> {
        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                track: self.audio_track(),
            });
        }
        if video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                track: self.video_track(),
            });
        }

        debug!(
            stream_id = %self.stream_id,
            audio, video, "Acquired local tracks"
        );
        Ok(LocalMedia::new(tracks))
    }
}
