//! RPC method dispatch.
//!
//! Requests are one JSON object per line: `{"method": ..., "payload":
//! {...}}`. Every response carries at least `returnValue`, `errorCode` and
//! `errorText`; list and metadata payloads ride alongside. Subscribable
//! methods honor a `subscribe` flag in their payload and are pushed the
//! same shape later through the subscription table.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::subscriptions::SubscriptionTable;
use crate::{
	events::Event,
	indexer::Indexer,
	media_item::MediaType,
	store::StoreError,
};

/// How long `requestMediaScan` blocks waiting for the cycle to finish.
pub(super) const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RpcService {
	pub(super) indexer: Arc<Indexer>,
	pub(super) subs: Arc<SubscriptionTable>,
}

impl RpcService {
	pub fn new(indexer: Arc<Indexer>) -> Self {
		Self {
			indexer,
			subs: Arc::new(SubscriptionTable::default()),
		}
	}

	/// Handle one request line from `sender`; `token` identifies the
	/// request for subscription bookkeeping.
	pub async fn dispatch(
		&self,
		sender: &str,
		token: u64,
		line_tx: &mpsc::UnboundedSender<String>,
		request: Value,
	) -> Value {
		let Some(method) = request.get("method").and_then(Value::as_str) else {
			return error_response(None, "request must carry a method");
		};
		let payload = request.get("payload").cloned().unwrap_or(json!({}));
		debug!(sender, method, token, "rpc request");

		let mut response = match method {
			"runDetect" => self.detect(&payload, true).await,
			"stopDetect" => self.detect(&payload, false).await,
			"getPluginList" => self.plugin_list(),
			"getPlugin" => self.plugin_get_put(&payload, true).await,
			"putPlugin" => self.plugin_get_put(&payload, false).await,
			"getDeviceList" => {
				self.device_list(sender, token, line_tx, &payload).await
			}
			"getMediaDbPermission" => self.media_db_permission(&payload).await,
			"getAudioList" => {
				self.media_list(sender, token, line_tx, &payload, MediaType::Audio)
					.await
			}
			"getVideoList" => {
				self.media_list(sender, token, line_tx, &payload, MediaType::Video)
					.await
			}
			"getImageList" => {
				self.media_list(sender, token, line_tx, &payload, MediaType::Image)
					.await
			}
			"getAudioMetadata" => self.media_metadata(&payload, MediaType::Audio).await,
			"getVideoMetadata" => self.media_metadata(&payload, MediaType::Video).await,
			// the image path queries the image kind
			"getImageMetadata" => self.media_metadata(&payload, MediaType::Image).await,
			"requestDelete" => self.request_delete(&payload).await,
			"requestMediaScan" => self.request_media_scan(&payload).await,
			"cancelSubscription" => self.cancel_subscription(sender, &payload),
			unknown => error_response(Some(unknown), "unknown method"),
		};

		if let Some(obj) = response.as_object_mut() {
			obj.insert("method".into(), Value::from(method));
		}
		response
	}

	async fn detect(&self, payload: &Value, run: bool) -> Value {
		let uri = payload.get("uri").and_then(Value::as_str);
		match self.indexer.set_detect(run, uri).await {
			Ok(()) => ok_response(Map::new()),
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	fn plugin_list(&self) -> Value {
		let plugins: Vec<Value> = self
			.indexer
			.plugin_uris()
			.into_iter()
			.map(|uri| json!({ "uri": uri }))
			.collect();

		let mut body = Map::new();
		body.insert("pluginList".into(), Value::from(plugins));
		ok_response(body)
	}

	/// `getPlugin` activates detection for a plugin (all of them when no
	/// uri is given); `putPlugin` releases it and requires the uri.
	async fn plugin_get_put(&self, payload: &Value, get: bool) -> Value {
		let uri = payload.get("uri").and_then(Value::as_str);
		if !get && uri.is_none() {
			return error_response(None, "client must specify uri");
		}
		match self.indexer.set_detect(get, uri).await {
			Ok(()) => ok_response(Map::new()),
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	async fn device_list(
		&self,
		sender: &str,
		token: u64,
		line_tx: &mpsc::UnboundedSender<String>,
		payload: &Value,
	) -> Value {
		if payload.get("subscribe").and_then(Value::as_bool) == Some(true) {
			self.subs.add(sender, "getDeviceList", token, line_tx.clone());
			// device list subscribers implicitly get read access
			if let Err(e) = self.indexer.media().grant_access(sender).await {
				warn!(sender, error = %e, "implicit read grant failed");
			}
		}

		self.build_device_list().await
	}

	/// The full device list payload, also used for subscription pushes.
	pub(super) async fn build_device_list(&self) -> Value {
		let plugins: Vec<Value> = self
			.indexer
			.device_snapshot()
			.await
			.into_iter()
			.map(|plugin| {
				let devices: Vec<Value> = plugin
					.devices
					.into_iter()
					.map(|d| {
						json!({
							"uri": d.uri,
							"available": d.available,
							"name": d.meta.name,
							"description": d.meta.description,
							"audioCount": d.audio_count,
							"videoCount": d.video_count,
							"imageCount": d.image_count,
						})
					})
					.collect();

				json!({
					"uri": plugin.uri,
					"active": plugin.active,
					"deviceList": devices,
				})
			})
			.collect();

		let mut body = Map::new();
		body.insert("pluginList".into(), Value::from(plugins));
		ok_response(body)
	}

	async fn media_db_permission(&self, payload: &Value) -> Value {
		let Some(service) = payload.get("serviceName").and_then(Value::as_str) else {
			return error_response(None, "serviceName field is mandatory input");
		};
		if service.is_empty() {
			return error_response(None, "empty string input");
		}

		match self.indexer.media().grant_access(service).await {
			Ok(()) => ok_response(Map::new()),
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	async fn media_list(
		&self,
		sender: &str,
		token: u64,
		line_tx: &mpsc::UnboundedSender<String>,
		payload: &Value,
		media_type: MediaType,
	) -> Value {
		let uri = payload
			.get("uri")
			.and_then(Value::as_str)
			.filter(|u| !u.is_empty())
			.map(str::to_owned);
		let count = payload
			.get("count")
			.and_then(Value::as_u64)
			.map(|c| c as usize);

		let method = list_method(media_type);
		if payload.get("subscribe").and_then(Value::as_bool) == Some(true) {
			self.subs.add(sender, method, token, line_tx.clone());
		}

		match self
			.indexer
			.media()
			.media_list(media_type, uri.as_deref(), count, None)
			.await
		{
			Ok(page) => {
				let body = media_list_body(media_type, uri.as_deref(), page.rows);
				ok_response(body)
			}
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	/// The full listing for subscription pushes; follows the page cursor
	/// until the result set is exhausted.
	pub(super) async fn build_media_list(&self, media_type: MediaType) -> Value {
		match self.indexer.media().media_list_all(media_type, None).await {
			Ok(rows) => ok_response(media_list_body(media_type, None, rows)),
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	async fn media_metadata(&self, payload: &Value, media_type: MediaType) -> Value {
		let Some(uri) = payload.get("uri").and_then(Value::as_str) else {
			return error_response(None, "client must specify uri");
		};

		match self.indexer.media().media_metadata(media_type, uri).await {
			Ok(row) => {
				let mut body = Map::new();
				body.insert("metadata".into(), json!(row));
				ok_response(body)
			}
			Err(StoreError::NotFound(_)) => error_response(None, "no such media item"),
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	async fn request_delete(&self, payload: &Value) -> Value {
		let Some(uri) = payload.get("uri").and_then(Value::as_str) else {
			return error_response(None, "client must specify uri");
		};

		match self.indexer.media().request_delete(uri).await {
			Ok(()) => ok_response(Map::new()),
			Err(StoreError::NotFound(_)) => error_response(None, "no such media item"),
			Err(e) => error_response(None, &e.to_string()),
		}
	}

	/// Trigger a scan for the device backing `path` and block until its
	/// cycle completes, up to [`SCAN_TIMEOUT`]. A timeout fails the call
	/// but never aborts the background scan.
	async fn request_media_scan(&self, payload: &Value) -> Value {
		let Some(path) = payload.get("path").and_then(Value::as_str) else {
			return error_response(None, "client must specify path");
		};

		// subscribe before triggering so the completion cannot be missed
		let mut events = self.indexer.events().subscribe();

		let (device_uri, started) = match self.indexer.request_scan_by_path(path).await {
			Ok(result) => result,
			Err(e) => {
				warn!(path, error = %e, "media scan request failed");
				return scan_failed();
			}
		};

		if !started {
			// already scanning: no-op with success
			return scan_ok();
		}

		let wait = async {
			loop {
				match events.recv().await {
					Ok(Event::ScanCompleted { device_uri: uri }) if uri == device_uri => {
						return true
					}
					Ok(_) => continue,
					Err(_) => return false,
				}
			}
		};

		match tokio::time::timeout(SCAN_TIMEOUT, wait).await {
			Ok(true) => scan_ok(),
			_ => scan_failed(),
		}
	}

	fn cancel_subscription(&self, sender: &str, payload: &Value) -> Value {
		let method = payload.get("method").and_then(Value::as_str);
		let token = payload.get("token").and_then(Value::as_u64);
		match (method, token) {
			(Some(method), Some(token)) if self.subs.remove(sender, method, token) => {
				ok_response(Map::new())
			}
			(Some(_), Some(_)) => error_response(None, "no such subscription"),
			_ => error_response(None, "client must specify method and token"),
		}
	}
}

pub(super) fn list_method(media_type: MediaType) -> &'static str {
	match media_type {
		MediaType::Audio => "getAudioList",
		MediaType::Video => "getVideoList",
		MediaType::Image => "getImageList",
	}
}

fn list_key(media_type: MediaType) -> &'static str {
	match media_type {
		MediaType::Audio => "audioList",
		MediaType::Video => "videoList",
		MediaType::Image => "imageList",
	}
}

fn media_list_body(
	media_type: MediaType,
	uri: Option<&str>,
	rows: Vec<crate::store::Row>,
) -> Map<String, Value> {
	let mut list = Map::new();
	list.insert("count".into(), Value::from(rows.len()));
	list.insert("results".into(), json!(rows));
	if let Some(uri) = uri {
		list.insert("uri".into(), Value::from(uri));
	}

	let mut body = Map::new();
	body.insert(list_key(media_type).into(), Value::Object(list));
	body
}

fn ok_response(mut body: Map<String, Value>) -> Value {
	body.insert("returnValue".into(), Value::from(true));
	body.insert("errorCode".into(), Value::from(0));
	body.insert("errorText".into(), Value::from("No Error"));
	Value::Object(body)
}

fn error_response(method: Option<&str>, text: &str) -> Value {
	let mut body = Map::new();
	if let Some(method) = method {
		body.insert("method".into(), Value::from(method));
	}
	body.insert("returnValue".into(), Value::from(false));
	body.insert("errorCode".into(), Value::from(-1));
	body.insert("errorText".into(), Value::from(text));
	Value::Object(body)
}

fn scan_ok() -> Value {
	ok_response(Map::new())
}

fn scan_failed() -> Value {
	let mut body = Map::new();
	body.insert("returnValue".into(), Value::from(false));
	body.insert("errorCode".into(), Value::from(-1));
	body.insert("errorText".into(), Value::from("Scan Failed"));
	Value::Object(body)
}
