//! Local media tracks
//!
//! Capture itself sits behind [`CaptureDevice`]; the session only needs the
//! resulting tracks to attach them to each peer connection.

mod capture;

pub use capture::{CaptureDevice, LocalMedia, LocalTrack, MediaKind, SampleTrackDevice};
