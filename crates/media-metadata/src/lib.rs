//! Concrete metadata probing for the media indexer.
//!
//! Audio/video containers are probed through the ffprobe/ffmpeg CLI tools;
//! images are decoded with the `image` crate and their EXIF block read with
//! `kamadak-exif`. The indexing core talks to this crate through its own
//! extractor seam and never depends on the probing details.

mod error;

pub mod audio;
pub mod image;
pub mod probe;
pub mod stream;

pub use error::{Error, Result};
