//! Embedded tag reading for audio containers, plus cover art extraction.

use std::{path::Path, process::Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::{
	probe::{run_with_timeout, ProbeOutput},
	Result,
};

/// The tag set an audio container can carry. Everything is optional; a file
/// with no tags at all still probes successfully.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AudioTags {
	pub title: Option<String>,
	pub artist: Option<String>,
	pub album: Option<String>,
	pub album_artist: Option<String>,
	pub genre: Option<String>,
	pub track: Option<i64>,
	pub total_tracks: Option<i64>,
	pub date: Option<String>,
	pub lyrics: Option<String>,
	pub duration_secs: Option<i64>,
	pub has_cover_art: bool,
}

impl AudioTags {
	pub fn from_probe(probe: &ProbeOutput) -> Self {
		let (track, total_tracks) = probe
			.tag("track")
			.map(parse_track_pair)
			.unwrap_or((None, None));

		Self {
			title: probe.tag("title").map(str::to_owned),
			artist: probe.tag("artist").map(str::to_owned),
			album: probe.tag("album").map(str::to_owned),
			album_artist: probe.tag("album_artist").map(str::to_owned),
			genre: probe.tag("genre").map(str::to_owned),
			track,
			total_tracks: probe
				.tag("tracktotal")
				.and_then(|t| t.parse().ok())
				.or(total_tracks),
			date: probe.tag("date").map(str::to_owned),
			lyrics: probe
				.tag("lyrics")
				.or_else(|| probe.tag("unsyncedlyrics"))
				.map(str::to_owned),
			duration_secs: probe.duration_secs(),
			has_cover_art: probe.has_cover_art(),
		}
	}
}

/// Write the embedded cover art of `path` to `out` as a JPEG.
///
/// Returns `Ok(false)` when the container carries no attached picture.
pub async fn extract_cover_art(path: impl AsRef<Path>, out: impl AsRef<Path>) -> Result<bool> {
	let path = path.as_ref();
	let out = out.as_ref();

	let output = run_with_timeout(
		Command::new("ffmpeg")
			.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
			.arg("-i")
			.arg(path)
			.args(["-map", "0:v", "-frames:v", "1", "-update", "1", "-an"])
			.arg(out)
			.stdout(Stdio::null())
			.stderr(Stdio::null()),
	)
	.await?;

	if !output.status.success() {
		let _ = tokio::fs::remove_file(out).await;
		return Ok(false);
	}

	let written = tokio::fs::metadata(out)
		.await
		.map(|m| m.len() > 0)
		.unwrap_or(false);
	debug!(path = %path.display(), written, "cover art extraction");
	Ok(written)
}

/// Tags encode the track either plain (`7`) or as `track/total` (`7/12`).
fn parse_track_pair(raw: &str) -> (Option<i64>, Option<i64>) {
	match raw.split_once('/') {
		Some((track, total)) => (track.trim().parse().ok(), total.trim().parse().ok()),
		None => (raw.trim().parse().ok(), None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn track_pair_variants() {
		assert_eq!(parse_track_pair("7"), (Some(7), None));
		assert_eq!(parse_track_pair("7/12"), (Some(7), Some(12)));
		assert_eq!(parse_track_pair("x"), (None, None));
	}

	#[test]
	fn tags_from_probe() {
		let probe: ProbeOutput = serde_json::from_str(
			r#"{
				"format": {
					"duration": "132.2",
					"tags": {
						"title": "Impact Moderato",
						"artist": "Kevin MacLeod",
						"album": "YouTube Audio Library",
						"genre": "Cinematic",
						"track": "3/10"
					}
				},
				"streams": [{ "codec_type": "audio" }]
			}"#,
		)
		.unwrap();

		let tags = AudioTags::from_probe(&probe);
		assert_eq!(tags.title.as_deref(), Some("Impact Moderato"));
		assert_eq!(tags.track, Some(3));
		assert_eq!(tags.total_tracks, Some(10));
		assert_eq!(tags.duration_secs, Some(132));
		assert_eq!(tags.album_artist, None);
		assert!(!tags.has_cover_art);
	}
}
