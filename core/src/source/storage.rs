//! Internal storage source (`storage://`).
//!
//! Serves a fixed set of built-in directories. They appear once when
//! detection starts and never disappear on their own.

use std::{
	collections::HashMap,
	path::PathBuf,
	sync::atomic::{AtomicBool, Ordering},
	sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{walk_mountpoint, DeviceEvent, DeviceSource, FileEntry, SourceError};
use crate::{
	config::Configurator,
	device::{Device, DeviceMeta},
	store::device::DeviceRecord,
};

pub const SCHEME: &str = "storage";

pub struct StorageSource {
	config: Arc<Configurator>,
	roots: Vec<(String, PathBuf)>,
	devices: Arc<RwLock<HashMap<String, Arc<Device>>>>,
	active: AtomicBool,
}

impl StorageSource {
	/// `roots` is a list of `(name, directory)` pairs; each becomes one
	/// device with uri `storage://<name>`.
	pub fn new(config: Arc<Configurator>, roots: Vec<(String, PathBuf)>) -> Self {
		Self {
			config,
			roots,
			devices: Arc::new(RwLock::new(HashMap::new())),
			active: AtomicBool::new(false),
		}
	}
}

#[async_trait]
impl DeviceSource for StorageSource {
	fn scheme(&self) -> &'static str {
		SCHEME
	}

	async fn start(&self, events: mpsc::Sender<DeviceEvent>) {
		self.active.store(true, Ordering::Release);

		for (name, path) in &self.roots {
			if !path.is_dir() {
				debug!(root = %path.display(), "storage root missing, skipped");
				continue;
			}

			let uri = format!("{SCHEME}://{name}");
			let mut table = self.devices.write().await;

			let device = match table.get(&uri) {
				Some(device) => {
					device.mark_appeared();
					device.clone()
				}
				None => {
					let device = Arc::new(Device::new(&uri, path.clone()));
					device.set_meta(DeviceMeta {
						name: name.clone(),
						description: format!("internal storage at {}", path.display()),
					});
					table.insert(uri.clone(), device.clone());
					device
				}
			};

			info!(uri = %uri, "storage device available");
			let _ = events.send(DeviceEvent::Appeared(device)).await;
		}
	}

	async fn stop(&self) {
		self.active.store(false, Ordering::Release);
	}

	fn active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	fn devices(&self) -> Vec<Arc<Device>> {
		self.devices
			.try_read()
			.map(|table| table.values().cloned().collect())
			.unwrap_or_default()
	}

	async fn enumerate(
		&self,
		device: &Device,
		tx: mpsc::Sender<FileEntry>,
		cancel: CancellationToken,
	) -> Result<(), SourceError> {
		if !device.available() {
			return Err(SourceError::DeviceGone(device.uri().to_owned()));
		}
		walk_mountpoint(self.config.clone(), device.mountpoint(), tx, cancel).await
	}

	async fn inject(&self, record: DeviceRecord) {
		// internal storage is declared in the configuration, not learned
		// from the store; a stale record for an unknown root is ignored
		let known = self
			.roots
			.iter()
			.any(|(name, _)| record.uri == format!("{SCHEME}://{name}"));
		if !known {
			debug!(uri = %record.uri, "unknown storage root, injection skipped");
		}
	}

	fn resolve_playback_uri(&self, uri: &str) -> Option<String> {
		let table = self.devices.try_read().ok()?;
		let device = table.values().find(|d| uri.starts_with(d.uri()))?;
		let relative = uri
			.strip_prefix(device.uri())?
			.trim_start_matches('/');
		Some(format!(
			"file://{}/{}",
			device.mountpoint().display(),
			relative
		))
	}
}
