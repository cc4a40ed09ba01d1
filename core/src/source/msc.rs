//! Mass-storage device source (`msc://`).
//!
//! Watches a mount root (e.g. `/media`) for mount directories appearing and
//! vanishing. Each directory is one device; the directory name doubles as
//! the device serial. Devices are retained across disappearances so a
//! re-plug of the same serial reuses the device and bumps its generation
//! counter.

use std::{
	collections::{HashMap, HashSet},
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, Ordering},
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{walk_mountpoint, DeviceEvent, DeviceSource, FileEntry, SourceError};
use crate::{
	config::Configurator,
	device::{Device, DeviceMeta},
	store::device::DeviceRecord,
};

pub const SCHEME: &str = "msc";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct MscSource {
	config: Arc<Configurator>,
	mount_root: PathBuf,
	poll_interval: Duration,
	devices: Arc<RwLock<HashMap<String, Arc<Device>>>>,
	active: Arc<AtomicBool>,
	watcher: Mutex<Option<CancellationToken>>,
}

impl MscSource {
	pub fn new(config: Arc<Configurator>, mount_root: impl Into<PathBuf>) -> Self {
		Self {
			config,
			mount_root: mount_root.into(),
			poll_interval: DEFAULT_POLL_INTERVAL,
			devices: Arc::new(RwLock::new(HashMap::new())),
			active: Arc::new(AtomicBool::new(false)),
			watcher: Mutex::new(None),
		}
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	fn device_uri(serial: &str) -> String {
		format!("{SCHEME}://{serial}")
	}

	/// One detection pass: diff the mount root against the device table and
	/// emit the resulting lifecycle events.
	async fn refresh(
		mount_root: &Path,
		devices: &RwLock<HashMap<String, Arc<Device>>>,
		events: &mpsc::Sender<DeviceEvent>,
	) {
		let mut seen = HashSet::new();

		let mut read_dir = match tokio::fs::read_dir(mount_root).await {
			Ok(read_dir) => read_dir,
			Err(e) => {
				debug!(root = %mount_root.display(), error = %e, "mount root unreadable");
				return;
			}
		};

		while let Ok(Some(entry)) = read_dir.next_entry().await {
			let is_dir = entry
				.file_type()
				.await
				.map(|t| t.is_dir())
				.unwrap_or(false);
			if !is_dir {
				continue;
			}

			let serial = entry.file_name().to_string_lossy().into_owned();
			let uri = Self::device_uri(&serial);
			seen.insert(uri.clone());

			let mut table = devices.write().await;
			match table.get(&uri) {
				Some(device) if device.available() => {}
				Some(device) => {
					// the same serial came back: reuse, bump generation
					device.mark_appeared();
					info!(uri = %uri, "device re-appeared");
					let _ = events.send(DeviceEvent::Appeared(device.clone())).await;
				}
				None => {
					let device = Arc::new(Device::new(&uri, entry.path()));
					device.set_meta(DeviceMeta {
						name: serial.clone(),
						description: format!("mass storage at {}", entry.path().display()),
					});
					table.insert(uri.clone(), device.clone());
					info!(uri = %uri, "new device discovered");
					let _ = events.send(DeviceEvent::Appeared(device)).await;
				}
			}
		}

		// anything not seen in this pass is gone
		let table = devices.read().await;
		for (uri, device) in table.iter() {
			if device.available() && !seen.contains(uri) {
				device.mark_gone();
				info!(uri = %uri, "device disappeared");
				let _ = events.send(DeviceEvent::Disappeared(uri.clone())).await;
			}
		}
	}
}

#[async_trait]
impl DeviceSource for MscSource {
	fn scheme(&self) -> &'static str {
		SCHEME
	}

	async fn start(&self, events: mpsc::Sender<DeviceEvent>) {
		let mut watcher = self.watcher.lock().await;
		if watcher.is_some() {
			return;
		}

		self.active.store(true, Ordering::Release);
		let cancel = CancellationToken::new();
		*watcher = Some(cancel.clone());

		let mount_root = self.mount_root.clone();
		let devices = self.devices.clone();
		let interval = self.poll_interval;

		tokio::spawn(async move {
			info!(root = %mount_root.display(), "msc detection started");
			let mut ticker = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = ticker.tick() => {
						Self::refresh(&mount_root, &devices, &events).await;
					}
				}
			}
			info!("msc detection stopped");
		});
	}

	async fn stop(&self) {
		if let Some(cancel) = self.watcher.lock().await.take() {
			cancel.cancel();
		}
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
		let Some(serial) = record.uri.strip_prefix(&format!("{SCHEME}://")) else {
			warn!(uri = %record.uri, "not an msc uri, injection skipped");
			return;
		};

		let mut table = self.devices.write().await;
		if table.contains_key(&record.uri) {
			return;
		}

		let device = Arc::new(Device::new(&record.uri, self.mount_root.join(serial)));
		device.set_meta(DeviceMeta {
			name: record.name,
			description: record.description,
		});
		// not seen yet in this run; detection will confirm and announce it
		device.mark_gone();
		debug!(uri = %record.uri, "known device injected");
		table.insert(record.uri, device);
	}

	fn resolve_playback_uri(&self, uri: &str) -> Option<String> {
		let table = self.devices.try_read().ok()?;
		let device = table
			.values()
			.find(|d| uri.starts_with(d.uri()))?;
		let relative = uri.strip_prefix(d_uri_with_slash(device.uri()).as_str())?;
		Some(format!(
			"file://{}/{}",
			device.mountpoint().display(),
			relative
		))
	}
}

fn d_uri_with_slash(uri: &str) -> String {
	if uri.ends_with('/') {
		uri.to_owned()
	} else {
		format!("{uri}/")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn test_source(root: &Path) -> MscSource {
		let config = Arc::new(Configurator::from_json(json!({
			"supportedMediaExtension": { "audio": ["mp3"] }
		})));
		MscSource::new(config, root)
	}

	#[tokio::test]
	async fn refresh_emits_appearance_and_disappearance() {
		let root = tempfile::tempdir().unwrap();
		std::fs::create_dir(root.path().join("ABCD-1234")).unwrap();

		let source = test_source(root.path());
		let (tx, mut rx) = mpsc::channel(8);

		MscSource::refresh(&source.mount_root, &source.devices, &tx).await;
		let event = rx.try_recv().unwrap();
		let device = match event {
			DeviceEvent::Appeared(device) => device,
			other => panic!("expected appearance, got {other:?}"),
		};
		assert_eq!(device.uri(), "msc://ABCD-1234");
		let generation = device.alive();

		// nothing changed: no further events
		MscSource::refresh(&source.mount_root, &source.devices, &tx).await;
		assert!(rx.try_recv().is_err());

		// unplug
		std::fs::remove_dir(root.path().join("ABCD-1234")).unwrap();
		MscSource::refresh(&source.mount_root, &source.devices, &tx).await;
		assert!(matches!(
			rx.try_recv().unwrap(),
			DeviceEvent::Disappeared(uri) if uri == "msc://ABCD-1234"
		));

		// replug the same serial: same device, bumped generation
		std::fs::create_dir(root.path().join("ABCD-1234")).unwrap();
		MscSource::refresh(&source.mount_root, &source.devices, &tx).await;
		match rx.try_recv().unwrap() {
			DeviceEvent::Appeared(reappeared) => {
				assert_eq!(reappeared.uri(), device.uri());
				assert_eq!(reappeared.alive(), generation + 1);
			}
			other => panic!("expected re-appearance, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn injected_device_stays_silent_until_confirmed() {
		let root = tempfile::tempdir().unwrap();
		let source = test_source(root.path());
		let (tx, mut rx) = mpsc::channel(8);

		source
			.inject(DeviceRecord {
				uri: "msc://ABCD-1234".into(),
				name: "USB stick".into(),
				description: String::new(),
				alive: 3,
				last_seen: 0,
			})
			.await;
		assert!(rx.try_recv().is_err());
		assert_eq!(source.devices().len(), 1);
		assert!(!source.devices()[0].available());

		std::fs::create_dir(root.path().join("ABCD-1234")).unwrap();
		MscSource::refresh(&source.mount_root, &source.devices, &tx).await;
		match rx.try_recv().unwrap() {
			DeviceEvent::Appeared(device) => {
				assert_eq!(device.meta().name, "USB stick");
				assert!(device.available());
			}
			other => panic!("expected appearance, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn playback_uri_resolves_through_mountpoint() {
		let root = tempfile::tempdir().unwrap();
		std::fs::create_dir(root.path().join("ABCD-1234")).unwrap();

		let source = test_source(root.path());
		let (tx, _rx) = mpsc::channel(8);
		MscSource::refresh(&source.mount_root, &source.devices, &tx).await;

		let resolved = source
			.resolve_playback_uri("msc://ABCD-1234/music/a.mp3")
			.unwrap();
		assert_eq!(
			resolved,
			format!(
				"file://{}/music/a.mp3",
				root.path().join("ABCD-1234").display()
			)
		);
		assert!(source.resolve_playback_uri("msc://NOPE/x.mp3").is_none());
	}
}
