//! The indexing orchestrator.
//!
//! Owns the device source plugins, the device table, the hash cache and the
//! pipeline workers, and wires device lifecycle events into the dirty-flag
//! protocol: mark dirty → scan → per-item check/extract/write → dirty
//! sweep. One event loop task services all plugins; enumeration and
//! extraction never run on it.

mod pipeline;

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	cache::HashCache,
	config::Configurator,
	device::{Device, DeviceMeta},
	events::{Event, EventBus},
	extract::Extractors,
	media_item::{MediaItem, MediaType},
	source::{DeviceEvent, DeviceSource, SourceError},
	store::{device::DeviceStore, media::MediaStore},
};

use pipeline::{shard_for, spawn_workers, ItemTask, PipelineContext};

/// Queue depth between enumeration and the dispatch loop.
const INTAKE_QUEUE_DEPTH: usize = 64;

/// Snapshot of one plugin and its devices, for the device list RPC.
#[derive(Debug, Clone)]
pub struct PluginSnapshot {
	pub uri: String,
	pub active: bool,
	pub devices: Vec<DeviceSnapshot>,
}

#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
	pub uri: String,
	pub available: bool,
	pub meta: DeviceMeta,
	pub audio_count: u64,
	pub video_count: u64,
	pub image_count: u64,
}

struct DeviceEntry {
	device: Arc<Device>,
	source: Arc<dyn DeviceSource>,
}

pub struct Indexer {
	config: Arc<Configurator>,
	plugins: Vec<Arc<dyn DeviceSource>>,
	devices: RwLock<HashMap<String, DeviceEntry>>,
	media: MediaStore,
	device_store: DeviceStore,
	cache: Arc<HashCache>,
	events: Arc<EventBus>,
	workers: Vec<mpsc::Sender<ItemTask>>,
	/// Cancellation token of the running scan per device uri.
	scans: Mutex<HashMap<String, CancellationToken>>,
	event_tx: mpsc::Sender<DeviceEvent>,
	ctx: PipelineContext,
}

impl Indexer {
	/// Build the orchestrator and start its event loop and worker shards.
	pub fn new(
		config: Arc<Configurator>,
		media: MediaStore,
		device_store: DeviceStore,
		extractors: Arc<Extractors>,
		events: Arc<EventBus>,
		plugins: Vec<Arc<dyn DeviceSource>>,
	) -> Arc<Self> {
		let cache = Arc::new(HashCache::new());

		let ctx = PipelineContext {
			config: config.clone(),
			media: media.clone(),
			cache: cache.clone(),
			extractors,
			events: events.clone(),
		};
		let workers = spawn_workers(ctx.clone());

		let (event_tx, event_rx) = mpsc::channel(INTAKE_QUEUE_DEPTH);

		let indexer = Arc::new(Self {
			config,
			plugins,
			devices: RwLock::new(HashMap::new()),
			media,
			device_store,
			cache,
			events,
			workers,
			scans: Mutex::new(HashMap::new()),
			event_tx,
			ctx,
		});

		tokio::spawn(indexer.clone().run_event_loop(event_rx));
		indexer
	}

	/// Assert store schemas and re-inject devices seen in earlier runs, so
	/// their records survive until detection confirms or cleans them.
	pub async fn initialize(&self) -> crate::store::Result<()> {
		self.media.ensure_kinds().await?;
		self.device_store.ensure_kind().await?;

		for plugin in &self.plugins {
			let prefix = format!("{}://", plugin.scheme());
			for record in self.device_store.known_devices(&prefix).await? {
				plugin.inject(record).await;
			}
		}
		Ok(())
	}

	pub fn events(&self) -> &Arc<EventBus> {
		&self.events
	}

	pub fn media(&self) -> &MediaStore {
		&self.media
	}

	pub fn config(&self) -> &Arc<Configurator> {
		&self.config
	}

	fn plugin_for_uri(&self, uri: &str) -> Option<Arc<dyn DeviceSource>> {
		self.plugins
			.iter()
			.find(|p| uri.starts_with(&format!("{}://", p.scheme())))
			.cloned()
	}

	/// Start or stop device detection; `uri` scopes the request to one
	/// plugin, empty means all of them.
	pub async fn set_detect(&self, run: bool, uri: Option<&str>) -> Result<(), SourceError> {
		let mut matched = false;
		for plugin in &self.plugins {
			let selected = match uri {
				Some(uri) if !uri.is_empty() => {
					uri.starts_with(&format!("{}://", plugin.scheme())) || uri == plugin.scheme()
				}
				_ => true,
			};
			if !selected {
				continue;
			}
			matched = true;

			if run {
				plugin.start(self.event_tx.clone()).await;
			} else {
				plugin.stop().await;
			}
		}

		if !matched {
			return Err(SourceError::UnknownUri(uri.unwrap_or_default().to_owned()));
		}
		info!(run, uri = uri.unwrap_or("<all>"), "detection toggled");
		Ok(())
	}

	/// Plugin uris for the plugin list RPC.
	pub fn plugin_uris(&self) -> Vec<String> {
		self.plugins
			.iter()
			.map(|p| format!("{}://", p.scheme()))
			.collect()
	}

	/// Per-plugin device snapshot for the device list RPC.
	pub async fn device_snapshot(&self) -> Vec<PluginSnapshot> {
		let mut snapshot = Vec::new();
		for plugin in &self.plugins {
			let devices = plugin
				.devices()
				.into_iter()
				.map(|device| DeviceSnapshot {
					uri: device.uri().to_owned(),
					available: device.available(),
					meta: device.meta(),
					audio_count: device.item_count(MediaType::Audio),
					video_count: device.item_count(MediaType::Video),
					image_count: device.item_count(MediaType::Image),
				})
				.collect();

			snapshot.push(PluginSnapshot {
				uri: format!("{}://", plugin.scheme()),
				active: plugin.active(),
				devices,
			});
		}
		snapshot
	}

	pub fn resolve_playback_uri(&self, uri: &str) -> Option<String> {
		self.plugin_for_uri(uri)?.resolve_playback_uri(uri)
	}

	/// Find the device whose mountpoint matches the given path and trigger
	/// a scan. Returns the device uri, plus whether a new scan actually
	/// started (false means an already-running scan coalesced).
	pub async fn request_scan_by_path(
		self: &Arc<Self>,
		path: &str,
	) -> Result<(String, bool), SourceError> {
		let devices = self.devices.read().await;
		let entry = devices
			.values()
			.find(|entry| {
				let mountpoint = entry.device.mountpoint().to_string_lossy();
				entry.device.available()
					&& (path.starts_with(mountpoint.as_ref())
						|| mountpoint.as_ref().starts_with(path))
			})
			.ok_or_else(|| SourceError::UnknownUri(path.to_owned()))?;

		let device = entry.device.clone();
		let source = entry.source.clone();
		drop(devices);

		let uri = device.uri().to_owned();
		let started = self.trigger_scan(device, source).await;
		Ok((uri, started))
	}

	/// Begin a scan cycle unless one is already running. The heavy work
	/// happens on a spawned task; this only claims the cycle.
	async fn trigger_scan(
		self: &Arc<Self>,
		device: Arc<Device>,
		source: Arc<dyn DeviceSource>,
	) -> bool {
		if !device.begin_scan() {
			debug!(uri = %device.uri(), "scan request coalesced");
			return false;
		}

		let cancel = CancellationToken::new();
		self.scans
			.lock()
			.await
			.insert(device.uri().to_owned(), cancel.clone());

		tokio::spawn(self.clone().run_scan(device, source, cancel));
		true
	}

	/// One scan cycle: dirty-mark, enumerate, dispatch to the pipeline.
	/// The happens-before chain is the control flow of this function.
	#[instrument(skip_all, fields(uri = %device.uri()))]
	async fn run_scan(
		self: Arc<Self>,
		device: Arc<Device>,
		source: Arc<dyn DeviceSource>,
		cancel: CancellationToken,
	) {
		let cycle = device.scan_cycle();

		// the cache dedupes within one pass; entries from earlier passes
		// would swallow the unflag step of the dirty protocol
		self.cache.purge_device(device.uri());

		// step 1: flags must be in place before the first file is seen
		if let Err(e) = self.media.mark_all_dirty(device.uri()).await {
			warn!(error = %e, "dirty marking failed, stale rows may linger");
		}

		let (tx, mut rx) = mpsc::channel(INTAKE_QUEUE_DEPTH);
		let walk = {
			let device = device.clone();
			let source = source.clone();
			let cancel = cancel.clone();
			tokio::spawn(async move {
				if let Err(e) = source.enumerate(&device, tx, cancel).await {
					warn!(uri = %device.uri(), error = %e, "enumeration failed");
				}
			})
		};

		while let Some(entry) = rx.recv().await {
			let Some(item) = MediaItem::new(device.uri(), entry.path, entry.mime, entry.hash)
			else {
				continue;
			};

			device.increment_item_count(item.media_type());

			let shard = shard_for(item.uri(), self.workers.len());
			let task = ItemTask {
				item,
				device: device.clone(),
				source: source.clone(),
				cycle,
			};
			if self.workers[shard].send(task).await.is_err() {
				warn!("pipeline worker gone, aborting scan");
				break;
			}
		}
		let _ = walk.await;

		device.finish_enumeration();
		debug!(
			audio = device.item_count(MediaType::Audio),
			video = device.item_count(MediaType::Video),
			image = device.item_count(MediaType::Image),
			"enumeration complete"
		);

		// covers empty scans and the race where the last item finished
		// before enumeration did
		if device.try_activate_cleanup() {
			pipeline::finish_scan_cycle(&self.ctx, &device).await;
		}

		self.scans.lock().await.remove(device.uri());
	}

	async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<DeviceEvent>) {
		while let Some(event) = rx.recv().await {
			match event {
				DeviceEvent::Appeared(device) => self.on_device_appeared(device).await,
				DeviceEvent::Modified(device) => self.on_device_modified(device).await,
				DeviceEvent::Disappeared(uri) => self.on_device_disappeared(&uri).await,
			}
		}
		debug!("indexer event loop finished");
	}

	async fn on_device_appeared(self: &Arc<Self>, device: Arc<Device>) {
		let Some(source) = self.plugin_for_uri(device.uri()) else {
			warn!(uri = %device.uri(), "appearance from unknown scheme");
			return;
		};

		info!(uri = %device.uri(), "device appeared");
		self.devices.write().await.insert(
			device.uri().to_owned(),
			DeviceEntry {
				device: device.clone(),
				source: source.clone(),
			},
		);

		if let Err(e) = self.device_store.update_device(&device).await {
			warn!(uri = %device.uri(), error = %e, "device record write failed");
		}
		self.events.emit(Event::DeviceListChanged);

		self.trigger_scan(device, source).await;
	}

	async fn on_device_modified(&self, device: Arc<Device>) {
		if let Err(e) = self.device_store.update_device(&device).await {
			warn!(uri = %device.uri(), error = %e, "device record write failed");
		}
		self.events.emit(Event::DeviceListChanged);
	}

	/// Index records stay in place; a later re-appearance revalidates them
	/// through the dirty protocol.
	async fn on_device_disappeared(&self, uri: &str) {
		info!(uri, "device disappeared");

		if let Some(cancel) = self.scans.lock().await.get(uri) {
			cancel.cancel();
		}
		if let Some(entry) = self.devices.read().await.get(uri) {
			entry.device.mark_gone();
		}

		self.cache.purge_device(uri);
		self.events.emit(Event::DeviceListChanged);
	}
}
