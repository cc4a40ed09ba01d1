//! Metadata extraction seam.
//!
//! The pipeline picks an extractor by `(media type, extension)` through the
//! configurator and hands it the media item plus the resolved file path.
//! Concrete probing lives in the `mindex-media-metadata` crate; this module
//! adapts its results onto the media item's meta keys.

use std::{
	collections::hash_map::DefaultHasher,
	hash::{Hash, Hasher},
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mindex_media_metadata::{audio, image::ImageMetadata, probe, stream};
use tracing::{debug, warn};

use crate::{
	config::ExtractorKind,
	media_item::{MediaItem, MediaType, MetaKey},
};

/// The listing format used for `last_modified_date` columns.
const LAST_MODIFIED_FORMAT: &str = "%a %b %e %H:%M:%S %Y GMT";

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
	/// The file could not be opened or decoded at all.
	#[error("unreadable media file: {0}")]
	Unreadable(String),
	/// No extractor understands this file.
	#[error("unsupported media file: {0}")]
	Unsupported(String),
	/// Some fields were extracted before the failure; they are kept.
	#[error("partial extraction: {0}")]
	Partial(String),
}

#[async_trait]
pub trait MetaExtractor: Send + Sync {
	/// Fill the item's metadata from the file at `file`.
	async fn extract(&self, item: &mut MediaItem, file: &Path) -> Result<(), ExtractorError>;
}

/// The extractor set the indexer dispatches into.
pub struct Extractors {
	tag: TagExtractor,
	stream: StreamExtractor,
	image: ImageExtractor,
}

impl Extractors {
	pub fn new(thumbnail_root: impl Into<PathBuf>) -> Self {
		let thumbnail_root = thumbnail_root.into();
		Self {
			tag: TagExtractor {
				thumbnail_root: thumbnail_root.clone(),
			},
			stream: StreamExtractor { thumbnail_root },
			image: ImageExtractor,
		}
	}

	pub fn for_kind(&self, kind: ExtractorKind) -> &dyn MetaExtractor {
		match kind {
			ExtractorKind::Tag => &self.tag,
			ExtractorKind::Stream => &self.stream,
			ExtractorKind::Image => &self.image,
		}
	}
}

/// Stable thumbnail path for an item: one file per uri, grouped by device,
/// so re-extraction overwrites in place and cleanup can unlink it.
pub fn thumbnail_path(root: &Path, item: &MediaItem) -> PathBuf {
	let device_dir: String = item
		.device_uri()
		.chars()
		.map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
		.collect();

	let mut hasher = DefaultHasher::new();
	item.uri().hash(&mut hasher);
	root.join(device_dir).join(format!("{:016x}.jpg", hasher.finish()))
}

/// File size and modification date are recorded for every item, whatever
/// the extractor outcome.
fn set_file_meta(item: &mut MediaItem, file: &Path) {
	if let Ok(metadata) = std::fs::metadata(file) {
		item.set_meta(MetaKey::FileSize, metadata.len() as i64);
		if let Ok(modified) = metadata.modified() {
			let stamp: DateTime<Utc> = modified.into();
			item.set_meta(
				MetaKey::LastModifiedDate,
				stamp.format(LAST_MODIFIED_FORMAT).to_string(),
			);
		}
	}
}

async fn prepare_thumbnail_dir(path: &Path) -> std::io::Result<()> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	Ok(())
}

/// Embedded tag reader for `mp3`/`ogg` audio.
pub struct TagExtractor {
	thumbnail_root: PathBuf,
}

#[async_trait]
impl MetaExtractor for TagExtractor {
	async fn extract(&self, item: &mut MediaItem, file: &Path) -> Result<(), ExtractorError> {
		set_file_meta(item, file);

		let probe = probe::probe(file)
			.await
			.map_err(|e| ExtractorError::Unreadable(e.to_string()))?;
		let tags = audio::AudioTags::from_probe(&probe);

		if let Some(title) = tags.title {
			item.set_meta(MetaKey::Title, title);
		}
		if let Some(artist) = tags.artist {
			item.set_meta(MetaKey::Artist, artist);
		}
		if let Some(album) = tags.album {
			item.set_meta(MetaKey::Album, album);
		}
		if let Some(album_artist) = tags.album_artist {
			item.set_meta(MetaKey::AlbumArtist, album_artist);
		}
		if let Some(genre) = tags.genre {
			item.set_meta(MetaKey::Genre, genre);
		}
		if let Some(track) = tags.track {
			item.set_meta(MetaKey::Track, track);
		}
		if let Some(total) = tags.total_tracks {
			item.set_meta(MetaKey::TotalTracks, total);
		}
		if let Some(date) = tags.date {
			item.set_meta(MetaKey::DateOfCreation, date);
		}
		if let Some(lyrics) = tags.lyrics {
			item.set_meta(MetaKey::Lyric, lyrics);
		}
		if let Some(duration) = tags.duration_secs {
			item.set_meta(MetaKey::Duration, duration);
		}

		if tags.has_cover_art {
			let thumb = thumbnail_path(&self.thumbnail_root, item);
			prepare_thumbnail_dir(&thumb)
				.await
				.map_err(|e| ExtractorError::Partial(e.to_string()))?;
			match audio::extract_cover_art(file, &thumb).await {
				Ok(true) => {
					item.set_meta(MetaKey::Thumbnail, thumb.to_string_lossy().to_string());
				}
				Ok(false) => {}
				Err(e) => {
					warn!(file = %file.display(), error = %e, "cover art extraction failed");
					return Err(ExtractorError::Partial(e.to_string()));
				}
			}
		}

		debug!(uri = %item.uri(), "tag extraction done");
		Ok(())
	}
}

/// Container prober for remaining audio and all video.
pub struct StreamExtractor {
	thumbnail_root: PathBuf,
}

#[async_trait]
impl MetaExtractor for StreamExtractor {
	async fn extract(&self, item: &mut MediaItem, file: &Path) -> Result<(), ExtractorError> {
		set_file_meta(item, file);

		let probe = probe::probe(file)
			.await
			.map_err(|e| ExtractorError::Unreadable(e.to_string()))?;
		let props = stream::StreamProps::from_probe(&probe);

		// container tags also show up on plain streams (e.g. flac)
		if let Some(title) = probe.tag("title") {
			item.set_meta(MetaKey::Title, title);
		}
		if let Some(artist) = probe.tag("artist") {
			item.set_meta(MetaKey::Artist, artist);
		}

		if let Some(duration) = props.duration_secs {
			item.set_meta(MetaKey::Duration, duration);
		}
		if let Some(sample_rate) = props.sample_rate {
			item.set_meta(MetaKey::SampleRate, sample_rate);
		}
		if let Some(bit_rate) = props.bit_rate {
			item.set_meta(MetaKey::BitRate, bit_rate);
		}
		if let Some(bits) = props.bits_per_sample {
			item.set_meta(MetaKey::BitsPerSample, bits);
		}
		if let Some(channels) = props.channels {
			item.set_meta(MetaKey::Channels, channels);
		}
		if let Some(width) = props.width {
			item.set_meta(MetaKey::Width, width);
		}
		if let Some(height) = props.height {
			item.set_meta(MetaKey::Height, height);
		}
		if let Some(rate) = props.frame_rate {
			item.set_meta(MetaKey::FrameRate, rate);
		}

		let wants_thumbnail =
			item.media_type() == MediaType::Video && props.has_video();
		let has_cover = probe.has_cover_art();

		if wants_thumbnail || has_cover {
			let thumb = thumbnail_path(&self.thumbnail_root, item);
			prepare_thumbnail_dir(&thumb)
				.await
				.map_err(|e| ExtractorError::Partial(e.to_string()))?;

			let written = if wants_thumbnail {
				stream::capture_video_frame(file, &thumb).await.map(|_| true)
			} else {
				audio::extract_cover_art(file, &thumb).await
			};

			match written {
				Ok(true) => {
					item.set_meta(MetaKey::Thumbnail, thumb.to_string_lossy().to_string());
				}
				Ok(false) => {}
				Err(e) => {
					warn!(file = %file.display(), error = %e, "thumbnail generation failed");
					return Err(ExtractorError::Partial(e.to_string()));
				}
			}
		}

		debug!(uri = %item.uri(), "stream extraction done");
		Ok(())
	}
}

/// Image decoder with EXIF support.
pub struct ImageExtractor;

#[async_trait]
impl MetaExtractor for ImageExtractor {
	async fn extract(&self, item: &mut MediaItem, file: &Path) -> Result<(), ExtractorError> {
		set_file_meta(item, file);

		let metadata = ImageMetadata::from_path(file)
			.await
			.map_err(|e| ExtractorError::Unreadable(e.to_string()))?;

		item.set_meta(MetaKey::Width, metadata.width);
		item.set_meta(MetaKey::Height, metadata.height);

		if let Some(date) = metadata.date_taken {
			item.set_meta(MetaKey::DateOfCreation, date.to_string());
		}
		if let Some(location) = metadata.location {
			item.set_meta(MetaKey::GeoLocLatitude, location.latitude);
			item.set_meta(MetaKey::GeoLocLongitude, location.longitude);
		}

		debug!(uri = %item.uri(), "image extraction done");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn thumbnail_path_is_stable_and_scoped() {
		let item = MediaItem::new("msc://ABCD-1234", "music/a.mp3", "audio/mpeg", 1).unwrap();
		let root = Path::new("/media/.thumbnails");

		let first = thumbnail_path(root, &item);
		let second = thumbnail_path(root, &item);
		assert_eq!(first, second);
		assert!(first.starts_with(root.join("msc___ABCD-1234")));
		assert_eq!(first.extension().unwrap(), "jpg");

		let other = MediaItem::new("msc://ABCD-1234", "music/b.mp3", "audio/mpeg", 1).unwrap();
		assert_ne!(first, thumbnail_path(root, &other));
	}

	#[tokio::test]
	async fn image_extractor_fills_dimensions() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("pic.png");
		let mut bytes = Vec::new();
		image::DynamicImage::new_rgb8(4, 3)
			.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
			.unwrap();
		std::fs::write(&file, bytes).unwrap();

		let mut item = MediaItem::new("storage://internal", "pic.png", "image/png", 1).unwrap();
		ImageExtractor.extract(&mut item, &file).await.unwrap();

		assert_eq!(item.meta(MetaKey::Width).unwrap().to_json(), 4);
		assert_eq!(item.meta(MetaKey::Height).unwrap().to_json(), 3);
		assert!(item.parsed());
		assert!(item.meta(MetaKey::FileSize).is_some());
	}

	#[tokio::test]
	async fn broken_image_is_unreadable() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("broken.jpg");
		std::fs::write(&file, b"not an image").unwrap();

		let mut item =
			MediaItem::new("storage://internal", "broken.jpg", "image/jpeg", 1).unwrap();
		let err = ImageExtractor.extract(&mut item, &file).await.unwrap_err();
		assert!(matches!(err, ExtractorError::Unreadable(_)));
		// bookkeeping meta was recorded before the failure; the pipeline
		// resets the parsed flag when it handles the error
		assert!(item.meta(MetaKey::FileSize).is_some());
	}
}
