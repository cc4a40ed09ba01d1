//! Extension table configuration.
//!
//! Maps filename extensions to a media type and the extractor responsible
//! for that extension. Loaded once from a JSON document; a broken document
//! degrades to the empty table, which makes every file unsupported but
//! keeps the daemon running.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::media_item::MediaType;

/// Which extractor handles a given extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorKind {
	/// Embedded tag reader, used for `mp3` and `ogg` audio.
	Tag,
	/// Container/stream prober, used for remaining audio and all video.
	Stream,
	/// Image decoder with EXIF support.
	Image,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
	#[serde(rename = "force-sw-decoders", default)]
	force_sw_decoders: bool,
	#[serde(rename = "supportedMediaExtension", default)]
	supported: SupportedExtensions,
}

#[derive(Debug, Default, Deserialize)]
struct SupportedExtensions {
	#[serde(default)]
	audio: Vec<String>,
	#[serde(default)]
	video: Vec<String>,
	#[serde(default)]
	image: Vec<String>,
}

/// In-memory extension table plus decoder policy flags.
#[derive(Debug, Clone, Default)]
pub struct Configurator {
	path: Option<PathBuf>,
	force_sw_decoders: bool,
	extensions: HashMap<String, (MediaType, ExtractorKind)>,
}

impl Configurator {
	/// Load the table from a configuration file. Parse errors are logged
	/// and leave the table empty.
	pub fn load(path: impl AsRef<Path>) -> Self {
		let path = path.as_ref();

		let document = match std::fs::read_to_string(path) {
			Ok(raw) => match serde_json::from_str::<ConfigDocument>(&raw) {
				Ok(doc) => doc,
				Err(e) => {
					warn!(path = %path.display(), error = %e, "configuration file parse error, running with empty extension set");
					ConfigDocument::default()
				}
			},
			Err(e) => {
				warn!(path = %path.display(), error = %e, "configuration file unreadable, running with empty extension set");
				ConfigDocument::default()
			}
		};

		let mut this = Self::from_document(document);
		this.path = Some(path.to_path_buf());
		this
	}

	/// Build the table from an already-parsed JSON value. Used by tests and
	/// by callers embedding the config document elsewhere.
	pub fn from_json(value: serde_json::Value) -> Self {
		match serde_json::from_value::<ConfigDocument>(value) {
			Ok(doc) => Self::from_document(doc),
			Err(e) => {
				warn!(error = %e, "invalid configuration document, running with empty extension set");
				Self::default()
			}
		}
	}

	fn from_document(doc: ConfigDocument) -> Self {
		let mut extensions = HashMap::new();

		for ext in doc.supported.audio {
			// mp3 and ogg go to the tag reader, everything else is probed
			let kind = if ext == "mp3" || ext == "ogg" {
				ExtractorKind::Tag
			} else {
				ExtractorKind::Stream
			};
			extensions.insert(ext.to_ascii_lowercase(), (MediaType::Audio, kind));
		}
		for ext in doc.supported.video {
			extensions.insert(
				ext.to_ascii_lowercase(),
				(MediaType::Video, ExtractorKind::Stream),
			);
		}
		for ext in doc.supported.image {
			extensions.insert(
				ext.to_ascii_lowercase(),
				(MediaType::Image, ExtractorKind::Image),
			);
		}

		debug!(count = extensions.len(), "supported extensions loaded");

		Self {
			path: None,
			force_sw_decoders: doc.force_sw_decoders,
			extensions,
		}
	}

	pub fn is_supported(&self, ext: &str) -> bool {
		self.extensions.contains_key(&ext.to_ascii_lowercase())
	}

	pub fn type_info(&self, ext: &str) -> Option<(MediaType, ExtractorKind)> {
		self.extensions.get(&ext.to_ascii_lowercase()).copied()
	}

	pub fn supported_extensions(&self) -> impl Iterator<Item = &str> {
		self.extensions.keys().map(String::as_str)
	}

	pub fn insert_extension(
		&mut self,
		ext: impl Into<String>,
		media_type: MediaType,
		kind: ExtractorKind,
	) -> bool {
		self.extensions
			.insert(ext.into().to_ascii_lowercase(), (media_type, kind))
			.is_none()
	}

	pub fn remove_extension(&mut self, ext: &str) -> bool {
		self.extensions.remove(&ext.to_ascii_lowercase()).is_some()
	}

	pub fn force_sw_decoders(&self) -> bool {
		self.force_sw_decoders
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn audio_extensions_split_by_extractor() {
		let config = Configurator::from_json(json!({
			"supportedMediaExtension": { "audio": ["mp3", "flac"] }
		}));

		assert_eq!(
			config.type_info("mp3"),
			Some((MediaType::Audio, ExtractorKind::Tag))
		);
		assert_eq!(
			config.type_info("flac"),
			Some((MediaType::Audio, ExtractorKind::Stream))
		);
		assert_eq!(config.type_info("jpg"), None);
		assert!(!config.is_supported("jpg"));
	}

	#[test]
	fn video_and_image_mappings() {
		let config = Configurator::from_json(json!({
			"force-sw-decoders": true,
			"supportedMediaExtension": {
				"audio": ["ogg"],
				"video": ["mp4", "mkv"],
				"image": ["jpg", "png"]
			}
		}));

		assert!(config.force_sw_decoders());
		assert_eq!(
			config.type_info("ogg"),
			Some((MediaType::Audio, ExtractorKind::Tag))
		);
		assert_eq!(
			config.type_info("MP4"),
			Some((MediaType::Video, ExtractorKind::Stream))
		);
		assert_eq!(
			config.type_info("png"),
			Some((MediaType::Image, ExtractorKind::Image))
		);
		assert_eq!(config.supported_extensions().count(), 5);
	}

	#[test]
	fn broken_document_degrades_to_empty() {
		let config = Configurator::from_json(json!({ "supportedMediaExtension": 7 }));
		assert_eq!(config.supported_extensions().count(), 0);
	}

	#[test]
	fn insert_and_remove() {
		let mut config = Configurator::default();
		assert!(config.insert_extension("webp", MediaType::Image, ExtractorKind::Image));
		assert!(!config.insert_extension("webp", MediaType::Image, ExtractorKind::Image));
		assert!(config.is_supported("webp"));
		assert!(config.remove_extension("webp"));
		assert!(!config.remove_extension("webp"));
	}

	#[test]
	fn unreadable_file_degrades_to_empty() {
		let config = Configurator::load("/nonexistent/mindex.json");
		assert_eq!(config.supported_extensions().count(), 0);
		assert!(!config.force_sw_decoders());
	}
}
