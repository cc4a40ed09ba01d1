use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("i/o error at {}: {0}", .1.display())]
	Io(std::io::Error, PathBuf),
	#[error("error from the exif crate: {0}")]
	Exif(#[from] exif::Error),
	#[error("image decoding error: {0}")]
	Image(#[from] image::ImageError),
	#[error("error while parsing time with chrono: {0}")]
	Chrono(#[from] chrono::ParseError),
	#[error("error while parsing the location of an image")]
	MediaLocationParse,
	#[error("ffprobe produced no usable output for {}", .0.display())]
	Probe(PathBuf),
	#[error("ffprobe/ffmpeg did not finish within {0} seconds")]
	ProbeTimeout(u64),
	#[error("no stream of the requested kind in {}", .0.display())]
	NoStream(PathBuf),
	#[error("serde error: {0}")]
	Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
