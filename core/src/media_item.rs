//! Media item value object.
//!
//! A [`MediaItem`] is constructed during enumeration, moved through the
//! pipeline and dropped after the store write acknowledges. The back
//! reference to its device is a plain uri; the indexer resolves it through
//! its device table when needed.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media classification derived from the MIME prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
	Audio,
	Video,
	Image,
}

impl MediaType {
	pub const ALL: [MediaType; 3] = [MediaType::Audio, MediaType::Video, MediaType::Image];

	/// Classify a MIME string by prefix. `None` for anything the indexer
	/// does not handle.
	pub fn from_mime(mime: &str) -> Option<Self> {
		Self::ALL
			.into_iter()
			.find(|t| mime.starts_with(t.as_str()))
	}

	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Audio => "audio",
			Self::Video => "video",
			Self::Image => "image",
		}
	}
}

impl fmt::Display for MediaType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The closed set of metadata keys a media item can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetaKey {
	Title,
	Genre,
	Album,
	Artist,
	AlbumArtist,
	Track,
	TotalTracks,
	DateOfCreation,
	Duration,
	Width,
	Height,
	FileSize,
	Thumbnail,
	LastModifiedDate,
	GeoLocLongitude,
	GeoLocLatitude,
	GeoLocCountry,
	GeoLocCity,
	SampleRate,
	BitRate,
	BitsPerSample,
	Channels,
	Lyric,
	FrameRate,
}

impl MetaKey {
	pub const ALL: [MetaKey; 24] = [
		MetaKey::Title,
		MetaKey::Genre,
		MetaKey::Album,
		MetaKey::Artist,
		MetaKey::AlbumArtist,
		MetaKey::Track,
		MetaKey::TotalTracks,
		MetaKey::DateOfCreation,
		MetaKey::Duration,
		MetaKey::Width,
		MetaKey::Height,
		MetaKey::FileSize,
		MetaKey::Thumbnail,
		MetaKey::LastModifiedDate,
		MetaKey::GeoLocLongitude,
		MetaKey::GeoLocLatitude,
		MetaKey::GeoLocCountry,
		MetaKey::GeoLocCity,
		MetaKey::SampleRate,
		MetaKey::BitRate,
		MetaKey::BitsPerSample,
		MetaKey::Channels,
		MetaKey::Lyric,
		MetaKey::FrameRate,
	];

	/// Column name in the index store.
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Title => "title",
			Self::Genre => "genre",
			Self::Album => "album",
			Self::Artist => "artist",
			Self::AlbumArtist => "album_artist",
			Self::Track => "track",
			Self::TotalTracks => "total_tracks",
			Self::DateOfCreation => "date_of_creation",
			Self::Duration => "duration",
			Self::Width => "width",
			Self::Height => "height",
			Self::FileSize => "file_size",
			Self::Thumbnail => "thumbnail",
			Self::LastModifiedDate => "last_modified_date",
			Self::GeoLocLongitude => "geo_location_longitude",
			Self::GeoLocLatitude => "geo_location_latitude",
			Self::GeoLocCountry => "geo_location_country",
			Self::GeoLocCity => "geo_location_city",
			Self::SampleRate => "sample_rate",
			Self::BitRate => "bit_rate",
			Self::BitsPerSample => "bits_per_sample",
			Self::Channels => "channels",
			Self::Lyric => "lyric",
			Self::FrameRate => "frame_rate",
		}
	}
}

/// Tagged metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
	Int(i64),
	Float(f64),
	Text(String),
}

impl MetaValue {
	pub fn to_json(&self) -> Value {
		match self {
			Self::Int(v) => Value::from(*v),
			Self::Float(v) => Value::from(*v),
			Self::Text(v) => Value::from(v.clone()),
		}
	}
}

impl From<i64> for MetaValue {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<f64> for MetaValue {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<String> for MetaValue {
	fn from(v: String) -> Self {
		Self::Text(v)
	}
}

impl From<&str> for MetaValue {
	fn from(v: &str) -> Self {
		Self::Text(v.to_owned())
	}
}

/// One enumerated file on a device, owned by the scan that produced it.
#[derive(Debug, Clone)]
pub struct MediaItem {
	uri: String,
	path: String,
	mime: String,
	media_type: MediaType,
	hash: u64,
	meta: BTreeMap<MetaKey, MetaValue>,
	parsed: bool,
	device_uri: String,
}

impl MediaItem {
	/// Compose the item uri from the device uri and the relative path with
	/// exactly one `/` joiner, and classify the MIME type.
	///
	/// Returns `None` when the MIME prefix matches no media type; such files
	/// are rejected by the pipeline before any work is spent on them.
	pub fn new(
		device_uri: impl Into<String>,
		path: impl Into<String>,
		mime: impl Into<String>,
		hash: u64,
	) -> Option<Self> {
		let device_uri = device_uri.into();
		let path = path.into();
		let mime = mime.into();

		let media_type = MediaType::from_mime(&mime)?;

		let mut uri = device_uri.clone();
		match (uri.ends_with('/'), path.starts_with('/')) {
			(false, false) => {
				uri.push('/');
				uri.push_str(&path);
			}
			(true, false) | (false, true) => uri.push_str(&path),
			(true, true) => uri.push_str(path.trim_start_matches('/')),
		}

		Some(Self {
			uri,
			path,
			mime,
			media_type,
			hash,
			meta: BTreeMap::new(),
			parsed: false,
			device_uri,
		})
	}

	pub fn uri(&self) -> &str {
		&self.uri
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn mime(&self) -> &str {
		&self.mime
	}

	pub fn media_type(&self) -> MediaType {
		self.media_type
	}

	pub fn hash(&self) -> u64 {
		self.hash
	}

	pub fn device_uri(&self) -> &str {
		&self.device_uri
	}

	pub fn meta(&self, key: MetaKey) -> Option<&MetaValue> {
		self.meta.get(&key)
	}

	/// Once any metadata is set the item counts as parsed. Setting the
	/// artist also seeds the album artist unless one was set already.
	pub fn set_meta(&mut self, key: MetaKey, value: impl Into<MetaValue>) {
		let value = value.into();
		self.parsed = true;

		if key == MetaKey::Artist && !self.meta.contains_key(&MetaKey::AlbumArtist) {
			self.meta.insert(MetaKey::AlbumArtist, value.clone());
		}

		self.meta.insert(key, value);
	}

	pub fn parsed(&self) -> bool {
		self.parsed
	}

	/// Mark the item unparsed again; used when an extractor failed outright
	/// but partial bookkeeping meta (file size, mtime) was already recorded.
	pub fn reset_parsed(&mut self) {
		self.parsed = false;
	}

	pub fn meta_entries(&self) -> impl Iterator<Item = (MetaKey, &MetaValue)> {
		self.meta.iter().map(|(k, v)| (*k, v))
	}
}
