//! Container probing via the `ffprobe` CLI.
//!
//! The probe shells out to `ffprobe -print_format json -show_format
//! -show_streams` and deserializes the interesting subset of its output.
//! ffprobe reports every numeric field as a JSON string, so the structs
//! below keep strings and expose typed accessors.

use std::{collections::HashMap, path::Path, process::Stdio, time::Duration};

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Hard ceiling for a single ffprobe/ffmpeg invocation. A corrupt file must
/// not stall the extraction worker forever.
pub const PROBE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
pub struct ProbeOutput {
	#[serde(default)]
	pub format: ProbeFormat,
	#[serde(default)]
	pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeFormat {
	pub duration: Option<String>,
	pub bit_rate: Option<String>,
	#[serde(default)]
	pub tags: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeStream {
	pub codec_type: Option<String>,
	pub width: Option<i64>,
	pub height: Option<i64>,
	pub sample_rate: Option<String>,
	pub channels: Option<i64>,
	pub bits_per_raw_sample: Option<String>,
	pub bits_per_sample: Option<i64>,
	pub bit_rate: Option<String>,
	pub avg_frame_rate: Option<String>,
	#[serde(default)]
	pub disposition: HashMap<String, i64>,
}

impl ProbeOutput {
	/// Duration in whole seconds, from the container format section.
	pub fn duration_secs(&self) -> Option<i64> {
		parse_f64(self.format.duration.as_deref()).map(|d| d.round() as i64)
	}

	pub fn bit_rate(&self) -> Option<i64> {
		parse_i64(self.format.bit_rate.as_deref())
	}

	/// Case-insensitive lookup in the container tags.
	pub fn tag(&self, name: &str) -> Option<&str> {
		self.format
			.tags
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn first_stream(&self, codec_type: &str) -> Option<&ProbeStream> {
		self.streams
			.iter()
			.find(|s| s.codec_type.as_deref() == Some(codec_type))
	}

	/// The first real video stream, skipping attached pictures (cover art
	/// shows up as a video stream with the `attached_pic` disposition).
	pub fn video_stream(&self) -> Option<&ProbeStream> {
		self.streams.iter().find(|s| {
			s.codec_type.as_deref() == Some("video")
				&& s.disposition.get("attached_pic").copied().unwrap_or(0) == 0
		})
	}

	pub fn has_cover_art(&self) -> bool {
		self.streams.iter().any(|s| {
			s.codec_type.as_deref() == Some("video")
				&& s.disposition.get("attached_pic").copied().unwrap_or(0) != 0
		})
	}
}

impl ProbeStream {
	pub fn sample_rate(&self) -> Option<i64> {
		parse_i64(self.sample_rate.as_deref())
	}

	pub fn bits_per_sample(&self) -> Option<i64> {
		// Lossless codecs report bits_per_raw_sample; PCM reports
		// bits_per_sample. Either counts, zero means unknown.
		parse_i64(self.bits_per_raw_sample.as_deref())
			.or(self.bits_per_sample)
			.filter(|b| *b > 0)
	}

	pub fn bit_rate(&self) -> Option<i64> {
		parse_i64(self.bit_rate.as_deref())
	}

	/// Frame rate from the `num/den` rational ffprobe reports.
	pub fn frame_rate(&self) -> Option<f64> {
		let raw = self.avg_frame_rate.as_deref()?;
		let (num, den) = raw.split_once('/')?;
		let num = num.trim().parse::<f64>().ok()?;
		let den = den.trim().parse::<f64>().ok()?;
		(den != 0.0 && num > 0.0).then(|| num / den)
	}
}

/// Run ffprobe against `path` and parse its JSON output.
pub async fn probe(path: impl AsRef<Path>) -> Result<ProbeOutput> {
	let path = path.as_ref();

	let output = run_with_timeout(
		Command::new("ffprobe")
			.args(["-v", "error", "-print_format", "json"])
			.args(["-show_format", "-show_streams", "--"])
			.arg(path)
			.stdout(Stdio::piped())
			.stderr(Stdio::null()),
	)
	.await?;

	if !output.status.success() || output.stdout.is_empty() {
		return Err(Error::Probe(path.to_path_buf()));
	}

	let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
	debug!(
		path = %path.display(),
		streams = parsed.streams.len(),
		"ffprobe ok"
	);
	Ok(parsed)
}

pub(crate) async fn run_with_timeout(cmd: &mut Command) -> Result<std::process::Output> {
	let timeout = Duration::from_secs(PROBE_TIMEOUT_SECS);
	let child = cmd
		.kill_on_drop(true)
		.spawn()
		.map_err(|e| Error::Io(e, Path::new("ffprobe").to_path_buf()))?;

	match tokio::time::timeout(timeout, child.wait_with_output()).await {
		Ok(result) => result.map_err(|e| Error::Io(e, Path::new("ffprobe").to_path_buf())),
		// kill_on_drop reaps the child when the future is dropped here
		Err(_) => Err(Error::ProbeTimeout(PROBE_TIMEOUT_SECS)),
	}
}

fn parse_f64(raw: Option<&str>) -> Option<f64> {
	raw.and_then(|s| s.trim().parse::<f64>().ok())
		.filter(|v| v.is_finite() && *v > 0.0)
}

fn parse_i64(raw: Option<&str>) -> Option<i64> {
	raw.and_then(|s| s.trim().parse::<i64>().ok()).filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> ProbeOutput {
		serde_json::from_str(
			r#"{
				"format": {
					"duration": "226.123000",
					"bit_rate": "192000",
					"tags": { "TITLE": "Good Bye Baby", "artist": "Miss A" }
				},
				"streams": [
					{
						"codec_type": "audio",
						"sample_rate": "44100",
						"channels": 2,
						"bits_per_raw_sample": "0",
						"bit_rate": "192000"
					},
					{
						"codec_type": "video",
						"width": 500,
						"height": 500,
						"avg_frame_rate": "0/0",
						"disposition": { "attached_pic": 1 }
					}
				]
			}"#,
		)
		.unwrap()
	}

	#[test]
	fn duration_rounds_to_seconds() {
		assert_eq!(sample().duration_secs(), Some(226));
	}

	#[test]
	fn tags_are_case_insensitive() {
		let probe = sample();
		assert_eq!(probe.tag("title"), Some("Good Bye Baby"));
		assert_eq!(probe.tag("Artist"), Some("Miss A"));
		assert_eq!(probe.tag("album"), None);
	}

	#[test]
	fn attached_pic_is_not_a_video_stream() {
		let probe = sample();
		assert!(probe.video_stream().is_none());
		assert!(probe.has_cover_art());
	}

	#[test]
	fn audio_stream_props() {
		let probe = sample();
		let audio = probe.first_stream("audio").unwrap();
		assert_eq!(audio.sample_rate(), Some(44100));
		assert_eq!(audio.channels, Some(2));
		// bits_per_raw_sample of "0" means unknown
		assert_eq!(audio.bits_per_sample(), None);
	}

	#[test]
	fn frame_rate_rational() {
		let stream = ProbeStream {
			avg_frame_rate: Some("30000/1001".into()),
			..Default::default()
		};
		let rate = stream.frame_rate().unwrap();
		assert!((rate - 29.97).abs() < 0.01);
	}
}
