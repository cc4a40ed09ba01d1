//! The media indexer daemon.
//!
//! Wires the core together from command line flags, starts device
//! detection and serves the RPC socket until terminated.

use std::path::PathBuf;

use clap::Parser;
use mindex_core::{Core, CoreOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mindexd", about = "media indexer daemon")]
struct Args {
	/// Extension table configuration file.
	#[arg(long, default_value = "/etc/mindex/config.json")]
	config: PathBuf,

	/// Directory for the index document and thumbnails.
	#[arg(long)]
	data_dir: Option<PathBuf>,

	/// Keep the index in memory instead of persisting it.
	#[arg(long)]
	ephemeral: bool,

	/// Mount root watched for mass-storage devices.
	#[arg(long, default_value = "/media")]
	mount_root: PathBuf,

	/// Internal storage directory, attachable multiple times as
	/// `name=/some/path`.
	#[arg(long = "storage")]
	storage_roots: Vec<String>,

	/// RPC socket path; defaults to the runtime directory.
	#[arg(long)]
	socket: Option<PathBuf>,
}

fn data_dir(args: &Args) -> PathBuf {
	args.data_dir.clone().unwrap_or_else(|| {
		dirs::data_dir()
			.unwrap_or_else(|| PathBuf::from("/var/lib"))
			.join("mindex")
	})
}

fn socket_path(args: &Args) -> PathBuf {
	args.socket.clone().unwrap_or_else(|| {
		dirs::runtime_dir()
			.unwrap_or_else(std::env::temp_dir)
			.join("mindex.sock")
	})
}

fn parse_storage_roots(raw: &[String]) -> Vec<(String, PathBuf)> {
	raw.iter()
		.filter_map(|entry| {
			let (name, path) = entry.split_once('=')?;
			Some((name.to_owned(), PathBuf::from(path)))
		})
		.collect()
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let data_dir = data_dir(&args);
	if let Err(e) = std::fs::create_dir_all(&data_dir) {
		error!(dir = %data_dir.display(), error = %e, "cannot create data directory");
		std::process::exit(1);
	}

	let options = CoreOptions {
		config_path: args.config.clone(),
		index_path: (!args.ephemeral).then(|| data_dir.join("index.json")),
		mount_root: args.mount_root.clone(),
		storage_roots: parse_storage_roots(&args.storage_roots),
		thumbnail_root: data_dir.join("thumbnails"),
		socket_path: socket_path(&args),
	};

	info!(
		config = %options.config_path.display(),
		mount_root = %options.mount_root.display(),
		socket = %options.socket_path.display(),
		"starting media indexer daemon"
	);

	let core = match Core::new(options).await {
		Ok(core) => core,
		Err(e) => {
			error!(error = %e, "core initialization failed");
			std::process::exit(1);
		}
	};

	if let Err(e) = core.start_detection().await {
		error!(error = %e, "device detection failed to start");
	}

	if let Err(e) = core.serve().await {
		error!(error = %e, "rpc server terminated");
		std::process::exit(1);
	}
}
