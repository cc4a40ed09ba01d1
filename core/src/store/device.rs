//! Device records in the store.
//!
//! Devices get their own kind so a restart can re-inject previously seen
//! devices into their plugins before any filesystem event arrives.

use serde_json::Value;
use tracing::{debug, info};

use super::{connection::DbConnection, Clause, Result, Row, SearchQuery, DEVICE_KIND};
use crate::device::Device;

/// A persisted device row, the subset needed for re-injection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
	pub uri: String,
	pub name: String,
	pub description: String,
	pub alive: i64,
	pub last_seen: i64,
}

#[derive(Debug, Clone)]
pub struct DeviceStore {
	conn: DbConnection,
}

impl DeviceStore {
	pub fn new(conn: DbConnection) -> Self {
		Self { conn }
	}

	pub async fn ensure_kind(&self) -> Result<()> {
		self.conn.ensure_kind(DEVICE_KIND, &["uri"]).await
	}

	/// Upsert the record for a device. Called on appearance and on
	/// modification; disappearances leave the record in place.
	pub async fn update_device(&self, device: &Device) -> Result<()> {
		let meta = device.meta();

		let mut props = Row::new();
		props.insert("uri".into(), Value::from(device.uri()));
		props.insert("name".into(), Value::from(meta.name));
		props.insert("description".into(), Value::from(meta.description));
		props.insert("alive".into(), Value::from(device.alive()));
		props.insert(
			"last_seen".into(),
			Value::from(device.last_seen().timestamp()),
		);

		debug!(uri = %device.uri(), "device record updated");
		self.conn.merge_put(DEVICE_KIND, device.uri(), props).await
	}

	/// All known devices whose uri starts with the given prefix. Used at
	/// startup to seed plugins with the devices they saw before.
	pub async fn known_devices(&self, uri_prefix: &str) -> Result<Vec<DeviceRecord>> {
		let mut records = Vec::new();
		let mut page = None;

		loop {
			let result = self
				.conn
				.search(
					DEVICE_KIND,
					SearchQuery {
						where_: vec![Clause::prefix("uri", uri_prefix)],
						page,
						..Default::default()
					},
				)
				.await?;

			for row in result.rows {
				let Some(uri) = row.get("uri").and_then(Value::as_str) else {
					continue;
				};
				records.push(DeviceRecord {
					uri: uri.to_owned(),
					name: row
						.get("name")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_owned(),
					description: row
						.get("description")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_owned(),
					alive: row.get("alive").and_then(Value::as_i64).unwrap_or(0),
					last_seen: row.get("last_seen").and_then(Value::as_i64).unwrap_or(0),
				});
			}

			match result.next {
				Some(next) => page = Some(next),
				None => break,
			}
		}

		if !records.is_empty() {
			info!(prefix = uri_prefix, count = records.len(), "known devices loaded");
		}
		Ok(records)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{device::DeviceMeta, store::memory::MemoryBackend};

	#[tokio::test]
	async fn update_then_load_round_trips() {
		let store = DeviceStore::new(DbConnection::spawn(MemoryBackend::new()));
		store.ensure_kind().await.unwrap();

		let device = Device::new("msc://ABCD-1234", "/mnt/usb1");
		device.set_meta(DeviceMeta {
			name: "USB stick".into(),
			description: "mass storage".into(),
		});
		store.update_device(&device).await.unwrap();

		let known = store.known_devices("msc://").await.unwrap();
		assert_eq!(known.len(), 1);
		assert_eq!(known[0].uri, "msc://ABCD-1234");
		assert_eq!(known[0].name, "USB stick");
		assert_eq!(known[0].alive, device.alive());

		let none = store.known_devices("storage://").await.unwrap();
		assert!(none.is_empty());
	}
}
