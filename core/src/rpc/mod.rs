//! RPC surface over a Unix domain socket.
//!
//! Clients connect, send one JSON request per line and read JSON responses
//! the same way. Subscribed clients additionally receive pushed payloads
//! whenever the underlying state changes; pushes are coalesced so a scan
//! writing thousands of rows does not turn into thousands of pushes.

mod service;
mod subscriptions;

pub use service::RpcService;
pub use subscriptions::SubscriptionTable;

use std::{collections::HashSet, io, path::Path, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	net::{UnixListener, UnixStream},
	sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{events::Event, indexer::Indexer, media_item::MediaType};

/// Flush interval for coalesced subscription pushes.
const PUSH_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub struct RpcServer {
	service: Arc<RpcService>,
}

impl RpcServer {
	pub fn new(indexer: Arc<Indexer>) -> Self {
		Self {
			service: Arc::new(RpcService::new(indexer)),
		}
	}

	/// Bind the socket and serve forever.
	pub async fn serve(&self, socket_path: impl AsRef<Path>) -> io::Result<()> {
		let socket_path = socket_path.as_ref();

		// a stale socket from a previous run blocks the bind
		let _ = tokio::fs::remove_file(socket_path).await;
		let listener = UnixListener::bind(socket_path)?;
		info!(socket = %socket_path.display(), "rpc server listening");

		tokio::spawn(run_push_task(self.service.clone()));

		loop {
			let (stream, _) = listener.accept().await?;
			let sender = format!("client-{}", uuid::Uuid::new_v4().simple());
			tokio::spawn(handle_connection(self.service.clone(), stream, sender));
		}
	}
}

async fn handle_connection(service: Arc<RpcService>, stream: UnixStream, sender: String) {
	debug!(sender = %sender, "client connected");

	let (reader, mut writer) = stream.into_split();
	let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

	// writer task: everything this client receives goes through one queue,
	// responses and subscription pushes alike
	let write_half = tokio::spawn(async move {
		while let Some(line) = line_rx.recv().await {
			if writer.write_all(line.as_bytes()).await.is_err()
				|| writer.write_all(b"\n").await.is_err()
			{
				break;
			}
		}
	});

	let mut lines = BufReader::new(reader).lines();
	let mut token: u64 = 0;

	while let Ok(Some(line)) = lines.next_line().await {
		if line.trim().is_empty() {
			continue;
		}
		token += 1;

		let response = match serde_json::from_str::<Value>(&line) {
			Ok(request) => service.dispatch(&sender, token, &line_tx, request).await,
			Err(e) => {
				warn!(sender = %sender, error = %e, "bad request");
				serde_json::json!({
					"returnValue": false,
					"errorCode": -1,
					"errorText": format!("invalid request: {e}"),
				})
			}
		};

		if line_tx.send(response.to_string()).is_err() {
			break;
		}
	}

	// disconnect drops every subscription this sender held
	service.subs.drop_sender(&sender);
	drop(line_tx);
	let _ = write_half.await;
	debug!(sender = %sender, "client disconnected");
}

/// Turn bus events into subscription pushes, coalescing bursts.
async fn run_push_task(service: Arc<RpcService>) {
	let mut events = service.indexer.events().subscribe();
	let mut flush = tokio::time::interval(PUSH_FLUSH_INTERVAL);

	let mut pending_types: HashSet<MediaType> = HashSet::new();
	let mut pending_devices = false;

	loop {
		tokio::select! {
			event = events.recv() => match event {
				Ok(Event::MediaUpdated { media_type }) => {
					pending_types.insert(media_type);
				}
				Ok(Event::DeviceListChanged) | Ok(Event::ScanCompleted { .. }) => {
					pending_devices = true;
				}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
					// missed events: assume everything changed
					pending_types.extend(MediaType::ALL);
					pending_devices = true;
				}
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			},
			_ = flush.tick() => {
				if pending_devices {
					pending_devices = false;
					push_device_list(&service).await;
				}
				for media_type in pending_types.drain() {
					push_media_list(&service, media_type).await;
				}
			}
		}
	}
	debug!("push task finished");
}

async fn push_device_list(service: &RpcService) {
	let subscribers = service.subs.subscribers_of("getDeviceList");
	if subscribers.is_empty() {
		return;
	}

	let mut payload = service.build_device_list().await;
	if let Some(obj) = payload.as_object_mut() {
		obj.insert("method".into(), Value::from("getDeviceList"));
	}
	let line = payload.to_string();

	for subscriber in subscribers {
		subscriber.push(line.clone());
	}
}

async fn push_media_list(service: &RpcService, media_type: MediaType) {
	let method = service::list_method(media_type);
	let subscribers = service.subs.subscribers_of(method);
	if subscribers.is_empty() {
		return;
	}

	let mut payload = service.build_media_list(media_type).await;
	if let Some(obj) = payload.as_object_mut() {
		obj.insert("method".into(), Value::from(method));
	}
	let line = payload.to_string();

	for subscriber in subscribers {
		subscriber.push(line.clone());
	}
}
