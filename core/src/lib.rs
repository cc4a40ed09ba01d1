//! Media indexer core.
//!
//! Watches storage devices, enumerates their media files, extracts
//! metadata and keeps a persistent per-kind index that clients query over
//! the RPC surface. The pipeline is organized around the dirty-flag
//! protocol: device appearance marks the device's records dirty, every
//! confirmed file clears its flag, and the post-scan sweep deletes what
//! stayed dirty.

pub mod cache;
pub mod config;
pub mod device;
pub mod events;
pub mod extract;
pub mod indexer;
pub mod media_item;
pub mod rpc;
pub mod source;
pub mod store;

use std::{path::PathBuf, sync::Arc};

use tracing::info;

use crate::{
	config::Configurator,
	events::EventBus,
	extract::Extractors,
	indexer::Indexer,
	rpc::RpcServer,
	source::{msc::MscSource, storage::StorageSource, DeviceSource},
	store::{
		connection::DbConnection, device::DeviceStore, media::MediaStore,
		memory::MemoryBackend, StoreBackend,
	},
};

/// Filesystem layout and tunables for one daemon instance.
#[derive(Debug, Clone)]
pub struct CoreOptions {
	/// Extension table configuration file.
	pub config_path: PathBuf,
	/// Where the index document lives; `None` keeps the index in memory.
	pub index_path: Option<PathBuf>,
	/// Root under which mass-storage devices get mounted.
	pub mount_root: PathBuf,
	/// Internal storage roots, `(name, directory)` per device.
	pub storage_roots: Vec<(String, PathBuf)>,
	/// Where extracted thumbnails are written.
	pub thumbnail_root: PathBuf,
	/// Unix socket the RPC server binds.
	pub socket_path: PathBuf,
}

/// The assembled daemon core.
pub struct Core {
	pub indexer: Arc<Indexer>,
	pub events: Arc<EventBus>,
	socket_path: PathBuf,
}

impl Core {
	/// Wire configuration, store, plugins and the indexer together.
	pub async fn new(options: CoreOptions) -> store::Result<Self> {
		let config = Arc::new(Configurator::load(&options.config_path));
		info!(
			extensions = config.supported_extensions().count(),
			force_sw_decoders = config.force_sw_decoders(),
			"configuration loaded"
		);

		let backend: Box<dyn StoreBackend> = match &options.index_path {
			Some(path) => Box::new(MemoryBackend::open(path)),
			None => Box::new(MemoryBackend::new()),
		};
		let conn = DbConnection::spawn_boxed(backend);
		let media = MediaStore::new(conn.clone());
		let device_store = DeviceStore::new(conn);

		let events = Arc::new(EventBus::default());
		let extractors = Arc::new(Extractors::new(&options.thumbnail_root));

		let plugins: Vec<Arc<dyn DeviceSource>> = vec![
			Arc::new(MscSource::new(config.clone(), &options.mount_root)),
			Arc::new(StorageSource::new(config.clone(), options.storage_roots)),
		];

		let indexer = Indexer::new(
			config,
			media,
			device_store,
			extractors,
			events.clone(),
			plugins,
		);
		indexer.initialize().await?;

		info!("core initialized");
		Ok(Self {
			indexer,
			events,
			socket_path: options.socket_path,
		})
	}

	/// Start device detection on every plugin.
	pub async fn start_detection(&self) -> Result<(), source::SourceError> {
		self.indexer.set_detect(true, None).await
	}

	/// Serve the RPC socket; runs until the listener fails.
	pub async fn serve(&self) -> std::io::Result<()> {
		RpcServer::new(self.indexer.clone())
			.serve(&self.socket_path)
			.await
	}
}
