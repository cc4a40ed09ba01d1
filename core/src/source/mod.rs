//! Device sources.
//!
//! A device source ("plugin") owns the devices for one uri scheme: it
//! produces appearance/disappearance events, enumerates files on a device
//! and resolves item uris back to playback paths. The indexer only ever
//! talks to the [`DeviceSource`] trait.

pub mod msc;
pub mod storage;

use std::{
	path::Path,
	sync::Arc,
	time::UNIX_EPOCH,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{config::Configurator, device::Device, store::device::DeviceRecord};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
	#[error("no plugin registered for uri '{0}'")]
	UnknownUri(String),
	#[error("device '{0}' is gone")]
	DeviceGone(String),
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}

/// Device lifecycle notifications flowing into the indexer.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
	Appeared(Arc<Device>),
	Modified(Arc<Device>),
	Disappeared(String),
}

/// One enumerated file, relative to the device root.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
	pub path: String,
	pub mime: String,
	pub hash: u64,
}

#[async_trait]
pub trait DeviceSource: Send + Sync + 'static {
	/// Uri scheme this plugin serves, e.g. `msc`.
	fn scheme(&self) -> &'static str;

	/// Start device detection; events go into `events`.
	async fn start(&self, events: mpsc::Sender<DeviceEvent>);

	/// Stop detection. Devices stay registered; no further events fire.
	async fn stop(&self);

	fn active(&self) -> bool;

	/// Devices currently owned by this plugin.
	fn devices(&self) -> Vec<Arc<Device>>;

	/// Walk a device and stream its supported files. Cancellation is
	/// honored at file boundaries.
	async fn enumerate(
		&self,
		device: &Device,
		tx: mpsc::Sender<FileEntry>,
		cancel: CancellationToken,
	) -> Result<(), SourceError>;

	/// Seed a device known from a previous run. No events fire; the device
	/// becomes visible once detection confirms it.
	async fn inject(&self, record: DeviceRecord);

	/// Map an item uri to something a player can open.
	fn resolve_playback_uri(&self, uri: &str) -> Option<String>;
}

/// Change-detection hash for a file: mtime seconds folded with the size.
/// Deterministic in file state, changes when either component changes.
pub fn file_hash(metadata: &std::fs::Metadata) -> u64 {
	let mtime = metadata
		.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_secs())
		.unwrap_or(0);
	mtime ^ (metadata.len() << 1)
}

/// Shared mountpoint walk used by the bundled plugins.
///
/// Runs the filesystem traversal on the blocking pool and feeds entries
/// through the bounded channel. Unreadable subtrees are logged as truncated
/// and skipped; entries already sent still count.
pub(crate) async fn walk_mountpoint(
	config: Arc<Configurator>,
	mountpoint: &Path,
	tx: mpsc::Sender<FileEntry>,
	cancel: CancellationToken,
) -> Result<(), SourceError> {
	let mountpoint = mountpoint.to_path_buf();

	tokio::task::spawn_blocking(move || {
		for entry in WalkDir::new(&mountpoint).follow_links(false) {
			if cancel.is_cancelled() {
				debug!(mountpoint = %mountpoint.display(), "enumeration cancelled");
				return;
			}

			let entry = match entry {
				Ok(entry) => entry,
				Err(e) => {
					// truncation marker: the subtree below this point is
					// not part of this scan
					warn!(
						mountpoint = %mountpoint.display(),
						error = %e,
						"enumeration truncated"
					);
					continue;
				}
			};

			if !entry.file_type().is_file() {
				continue;
			}

			let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) else {
				continue;
			};
			if !config.is_supported(ext) {
				continue;
			}

			let Some(mime) = mime_guess::from_ext(ext).first_raw() else {
				continue;
			};

			let metadata = match entry.metadata() {
				Ok(metadata) => metadata,
				Err(e) => {
					warn!(path = %entry.path().display(), error = %e, "stat failed");
					continue;
				}
			};

			let Ok(relative) = entry.path().strip_prefix(&mountpoint) else {
				continue;
			};

			let file = FileEntry {
				path: relative.to_string_lossy().into_owned(),
				mime: mime.to_owned(),
				hash: file_hash(&metadata),
			};

			// a closed receiver means the scan was abandoned
			if tx.blocking_send(file).is_err() {
				return;
			}
		}
	})
	.await
	.map_err(|e| SourceError::Io(std::io::Error::other(e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn test_config() -> Arc<Configurator> {
		Arc::new(Configurator::from_json(json!({
			"supportedMediaExtension": {
				"audio": ["mp3"],
				"video": ["mp4"],
				"image": ["jpg"]
			}
		})))
	}

	#[tokio::test]
	async fn walk_streams_supported_files_only() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir(dir.path().join("music")).unwrap();
		std::fs::write(dir.path().join("music/a.mp3"), b"x").unwrap();
		std::fs::write(dir.path().join("b.jpg"), b"x").unwrap();
		std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
		std::fs::write(dir.path().join("noext"), b"x").unwrap();

		let (tx, mut rx) = mpsc::channel(16);
		walk_mountpoint(test_config(), dir.path(), tx, CancellationToken::new())
			.await
			.unwrap();

		let mut paths = Vec::new();
		while let Some(entry) = rx.recv().await {
			paths.push((entry.path, entry.mime));
		}
		paths.sort();

		assert_eq!(
			paths,
			vec![
				("b.jpg".to_string(), "image/jpeg".to_string()),
				("music/a.mp3".to_string(), "audio/mpeg".to_string()),
			]
		);
	}

	#[tokio::test]
	async fn cancelled_walk_stops_early() {
		let dir = tempfile::tempdir().unwrap();
		for i in 0..64 {
			std::fs::write(dir.path().join(format!("{i}.mp3")), b"x").unwrap();
		}

		let (tx, rx) = mpsc::channel(1);
		let cancel = CancellationToken::new();
		cancel.cancel();
		drop(rx);

		// neither the closed channel nor the cancel may panic the walk
		walk_mountpoint(test_config(), dir.path(), tx, cancel)
			.await
			.unwrap();
	}

	#[test]
	fn hash_changes_with_size() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.mp3");
		std::fs::write(&path, b"x").unwrap();
		let first = file_hash(&std::fs::metadata(&path).unwrap());
		std::fs::write(&path, b"xy").unwrap();
		let second = file_hash(&std::fs::metadata(&path).unwrap());
		assert_ne!(first, second);
	}
}
