//! Stream-level properties for audio/video containers and video frame
//! capture for thumbnails.

use std::{path::Path, process::Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::{
	probe::{run_with_timeout, ProbeOutput},
	Error, Result,
};

/// Longest thumbnail edge in pixels.
pub const THUMBNAIL_MAX_DIM: u32 = 512;

/// Seek offset for video thumbnails. Early enough to exist in short clips,
/// late enough to skip leader frames.
const THUMBNAIL_SEEK_SECS: f64 = 1.0;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamProps {
	pub duration_secs: Option<i64>,
	// audio side
	pub sample_rate: Option<i64>,
	pub bit_rate: Option<i64>,
	pub bits_per_sample: Option<i64>,
	pub channels: Option<i64>,
	// video side
	pub width: Option<i64>,
	pub height: Option<i64>,
	pub frame_rate: Option<f64>,
}

impl StreamProps {
	pub fn from_probe(probe: &ProbeOutput) -> Self {
		let audio = probe.first_stream("audio");
		let video = probe.video_stream();

		Self {
			duration_secs: probe.duration_secs(),
			sample_rate: audio.and_then(|s| s.sample_rate()),
			bit_rate: audio
				.and_then(|s| s.bit_rate())
				.or_else(|| probe.bit_rate()),
			bits_per_sample: audio.and_then(|s| s.bits_per_sample()),
			channels: audio.and_then(|s| s.channels),
			width: video.and_then(|s| s.width),
			height: video.and_then(|s| s.height),
			frame_rate: video.and_then(|s| s.frame_rate()),
		}
	}

	pub fn has_video(&self) -> bool {
		self.width.is_some() && self.height.is_some()
	}
}

/// Grab one frame of the first video stream and write it to `out` as a
/// JPEG, downscaled so neither edge exceeds [`THUMBNAIL_MAX_DIM`].
pub async fn capture_video_frame(path: impl AsRef<Path>, out: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();
	let out = out.as_ref();

	let scale = format!(
		"scale='min(iw,{0})':'min(ih,{0})':force_original_aspect_ratio=decrease",
		THUMBNAIL_MAX_DIM
	);

	let output = run_with_timeout(
		Command::new("ffmpeg")
			.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
			.args(["-ss", &format!("{THUMBNAIL_SEEK_SECS:.3}")])
			.arg("-i")
			.arg(path)
			.args(["-map", "0:v:0", "-frames:v", "1", "-an", "-sn", "-dn"])
			.args(["-vf", &scale, "-update", "1"])
			.arg(out)
			.stdout(Stdio::null())
			.stderr(Stdio::null()),
	)
	.await?;

	if !output.status.success() {
		let _ = tokio::fs::remove_file(out).await;
		return Err(Error::NoStream(path.to_path_buf()));
	}

	debug!(path = %path.display(), out = %out.display(), "video thumbnail written");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn props_from_video_probe() {
		let probe: ProbeOutput = serde_json::from_str(
			r#"{
				"format": { "duration": "4.5", "bit_rate": "512000" },
				"streams": [
					{
						"codec_type": "video",
						"width": 1920,
						"height": 1080,
						"avg_frame_rate": "25/1"
					},
					{ "codec_type": "audio", "sample_rate": "48000", "channels": 6 }
				]
			}"#,
		)
		.unwrap();

		let props = StreamProps::from_probe(&probe);
		assert!(props.has_video());
		assert_eq!(props.width, Some(1920));
		assert_eq!(props.height, Some(1080));
		assert_eq!(props.frame_rate, Some(25.0));
		assert_eq!(props.duration_secs, Some(5));
		assert_eq!(props.sample_rate, Some(48000));
		assert_eq!(props.channels, Some(6));
		// no per-stream bit rate, falls back to the container rate
		assert_eq!(props.bit_rate, Some(512000));
	}

	#[test]
	fn audio_only_probe_has_no_video() {
		let probe: ProbeOutput = serde_json::from_str(
			r#"{
				"format": { "duration": "200.0" },
				"streams": [{ "codec_type": "audio", "sample_rate": "44100", "channels": 2 }]
			}"#,
		)
		.unwrap();

		let props = StreamProps::from_probe(&probe);
		assert!(!props.has_video());
		assert_eq!(props.channels, Some(2));
	}
}
