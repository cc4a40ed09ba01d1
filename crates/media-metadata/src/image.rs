//! Image metadata: pixel dimensions plus the EXIF subset the indexer
//! persists (creation date, GPS location).

use std::{
	fs::File,
	io::BufReader,
	path::Path,
	str::FromStr,
};

use chrono::NaiveDateTime;
use exif::{Exif, In, Tag};
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Division factors for degree/minute/second GPS rationals.
const DMS_DIVISION: [f64; 3] = [1.0, 60.0, 3600.0];

/// EXIF timestamps render as `YYYY-MM-DD HH:MM:SS` through `display_value`.
const EXIF_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImageMetadata {
	pub width: i64,
	pub height: i64,
	pub date_taken: Option<NaiveDateTime>,
	pub location: Option<GpsLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsLocation {
	pub latitude: f64,
	pub longitude: f64,
}

impl ImageMetadata {
	/// Decode dimensions from the image header and, when present, the EXIF
	/// block. Absence of EXIF data is not an error; dimensions must exist.
	pub async fn from_path(path: impl AsRef<Path> + Send) -> Result<Self> {
		let path = path.as_ref().to_owned();
		spawn_blocking(move || {
			let (width, height) =
				image::image_dimensions(&path).map_err(Error::Image)?;

			let exif = ExifReader::from_path(&path).ok();

			Ok(Self {
				width: i64::from(width),
				height: i64::from(height),
				date_taken: exif.as_ref().and_then(ExifReader::date_taken),
				location: exif.as_ref().and_then(|r| r.location().ok()),
			})
		})
		.await
		.map_err(|e| Error::Io(std::io::Error::other(e), Default::default()))?
	}
}

/// Thin wrapper over the exif crate with typed tag access.
pub struct ExifReader(Exif);

impl ExifReader {
	pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
		let file = File::open(&path)
			.map_err(|e| Error::Io(e, path.as_ref().to_path_buf()))?;
		exif::Reader::new()
			.read_from_container(&mut BufReader::new(file))
			.map(Self)
			.map_err(Into::into)
	}

	/// Get the target `Tag` as `T`, provided `T` impls `FromStr`. Strips the
	/// quoting the exif crate adds to rendered values.
	fn get_tag<T: FromStr>(&self, tag: Tag) -> Option<T> {
		self.0.get_field(tag, In::PRIMARY).and_then(|field| {
			field
				.display_value()
				.to_string()
				.replace(['\\', '\"'], "")
				.parse::<T>()
				.ok()
		})
	}

	pub fn date_taken(&self) -> Option<NaiveDateTime> {
		[Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
			.into_iter()
			.find_map(|tag| {
				let raw: String = self.get_tag(tag)?;
				NaiveDateTime::parse_from_str(&raw, EXIF_TIME_FORMAT).ok()
			})
	}

	/// Decode the GPS DMS rationals into decimal degrees, negated for
	/// western/southern hemisphere references.
	pub fn location(&self) -> Result<GpsLocation> {
		let latitude = self.coordinate(Tag::GPSLatitude, Tag::GPSLatitudeRef, "S")?;
		let longitude = self.coordinate(Tag::GPSLongitude, Tag::GPSLongitudeRef, "W")?;
		Ok(GpsLocation { latitude, longitude })
	}

	fn coordinate(&self, tag: Tag, ref_tag: Tag, negative_ref: &str) -> Result<f64> {
		let mut raw: String = self.get_tag(tag).ok_or(Error::MediaLocationParse)?;
		let reference: String = self.get_tag(ref_tag).unwrap_or_default();

		raw.retain(|c| c.is_numeric() || c.is_whitespace() || c == '.');
		let parts: Vec<f64> = raw
			.split_whitespace()
			.filter_map(|p| p.parse::<f64>().ok())
			.collect();
		if parts.len() != 3 {
			return Err(Error::MediaLocationParse);
		}

		let degrees: f64 = parts
			.iter()
			.zip(DMS_DIVISION.iter())
			.map(|(value, div)| value / div)
			.sum();

		Ok(if reference == negative_ref {
			-degrees
		} else {
			degrees
		})
	}
}
