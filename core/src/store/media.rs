//! Media index operations on top of the store connection.
//!
//! Owns the dirty-flag protocol: mark everything dirty on device
//! appearance, unflag per confirmed item, sweep the remaining dirty rows
//! when a device finishes processing. Also answers the list/metadata
//! queries the RPC surface exposes.

use std::{path::Path, time::Duration};

use futures::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{
	connection::DbConnection, kind_for, Clause, PermissionGrant, Result, Row, SearchPage,
	SearchQuery, StoreError, MEDIA_KINDS,
};
use crate::{
	cache::HashCache,
	media_item::{MediaItem, MediaType, MetaKey},
};

/// Attempts per store write before the item is dropped for this pass.
const WRITE_ATTEMPTS: u32 = 3;
/// Base backoff; doubles per retry.
const WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of the deduplication check for one enumerated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
	/// Item already handled or unchanged with complete metadata.
	Unchanged,
	/// New, changed, or stored with insufficient metadata.
	NeedsExtraction,
}

#[derive(Debug, Clone)]
pub struct MediaStore {
	conn: DbConnection,
}

impl MediaStore {
	pub fn new(conn: DbConnection) -> Self {
		Self { conn }
	}

	pub fn connection(&self) -> &DbConnection {
		&self.conn
	}

	/// Assert the three media kinds with their indexes. Safe to repeat.
	pub async fn ensure_kinds(&self) -> Result<()> {
		for kind in MEDIA_KINDS {
			self.conn.ensure_kind(kind, &["uri", "type", "dirty"]).await?;
		}
		Ok(())
	}

	/// Step 1 of the dirty protocol: on device appearance, flag every
	/// record under the device uri across all media kinds. The fan-out
	/// joins before returning so the scan starts strictly after the flags
	/// are in place.
	#[instrument(skip(self))]
	pub async fn mark_all_dirty(&self, device_uri: &str) -> Result<()> {
		let mut dirty = Row::new();
		dirty.insert("dirty".into(), Value::from(true));

		try_join_all(MEDIA_KINDS.into_iter().map(|kind| {
			let props = dirty.clone();
			let clauses = vec![Clause::prefix("uri", device_uri)];
			async move { self.conn.merge_where(kind, clauses, props).await }
		}))
		.await?;

		Ok(())
	}

	/// Step 2 of the dirty protocol, standalone form: confirm one uri as
	/// present without rewriting the whole row.
	pub async fn unflag_dirty(&self, media_type: MediaType, uri: &str) -> Result<()> {
		let mut props = Row::new();
		props.insert("dirty".into(), Value::from(false));
		self.conn.merge_put(kind_for(media_type), uri, props).await
	}

	/// Deduplication: decide whether an enumerated item needs extraction.
	#[instrument(skip(self, cache, item), fields(uri = %item.uri()))]
	pub async fn check_for_change(
		&self,
		cache: &HashCache,
		item: &MediaItem,
	) -> Result<CheckOutcome> {
		if cache.check_and_update(item.uri(), item.hash()) {
			// already handled in this run
			return Ok(CheckOutcome::Unchanged);
		}

		let Some(stored) = self
			.conn
			.find(kind_for(item.media_type()), item.uri(), true)
			.await?
		else {
			debug!("new media item needs metadata");
			return Ok(CheckOutcome::NeedsExtraction);
		};

		let stored_hash = stored.get("hash").and_then(Value::as_u64);
		if stored_hash == Some(item.hash()) && is_enough_info(&stored, item.media_type()) {
			self.unflag_dirty(item.media_type(), item.uri()).await?;
			debug!("media item unchanged");
			return Ok(CheckOutcome::Unchanged);
		}

		debug!("media item changed, needs metadata update");
		Ok(CheckOutcome::NeedsExtraction)
	}

	/// Write one media item. Every meta column of the schema is written,
	/// absent values as empty strings, so listings have a stable shape.
	/// Retries transport failures with capped exponential backoff; after
	/// the last attempt the error is returned and the item stays dirty for
	/// the next scan.
	pub async fn put_media_item(&self, item: &MediaItem, file_path: &str) -> Result<()> {
		let mut props = Row::new();
		props.insert("uri".into(), Value::from(item.uri()));
		props.insert("hash".into(), Value::from(item.hash()));
		props.insert("dirty".into(), Value::from(false));
		props.insert("type".into(), Value::from(item.media_type().as_str()));
		props.insert("mime".into(), Value::from(item.mime()));
		props.insert("parsed".into(), Value::from(item.parsed()));
		props.insert("file_path".into(), Value::from(file_path));

		for key in MetaKey::ALL {
			let value = item
				.meta(key)
				.map(|v| v.to_json())
				.unwrap_or_else(|| Value::from(""));
			props.insert(key.as_str().into(), value);
		}

		let kind = kind_for(item.media_type());
		let mut attempt = 0;
		loop {
			match self.conn.merge_put(kind, item.uri(), props.clone()).await {
				Ok(()) => return Ok(()),
				Err(e) if attempt + 1 < WRITE_ATTEMPTS => {
					let delay = WRITE_BACKOFF * 2u32.pow(attempt);
					warn!(
						uri = %item.uri(),
						attempt,
						error = %e,
						"store write failed, retrying in {delay:?}"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}

	/// Step 3 of the dirty protocol: after a device finished processing,
	/// delete every row still flagged dirty under its uri and unlink the
	/// thumbnails those rows own. Returns the number of rows removed.
	#[instrument(skip(self))]
	pub async fn cleanup_device(&self, device_uri: &str) -> Result<usize> {
		let clauses = vec![
			Clause::prefix("uri", device_uri),
			Clause::eq("dirty", true),
		];

		let mut removed = 0;
		for kind in MEDIA_KINDS {
			let mut page = None;
			loop {
				let result = self
					.conn
					.search(
						kind,
						SearchQuery {
							select: vec!["uri".into(), "thumbnail".into()],
							where_: clauses.clone(),
							page,
							..Default::default()
						},
					)
					.await?;

				for row in &result.rows {
					remove_thumbnail(row).await;
				}

				if result.next.is_none() {
					break;
				}
				page = result.next;
			}

			removed += self.conn.del(kind, clauses.clone()).await?;
		}

		if removed > 0 {
			info!(device_uri, removed, "dirty rows swept");
		}
		Ok(removed)
	}

	/// Remove a single row (any media kind) and its thumbnail.
	pub async fn request_delete(&self, uri: &str) -> Result<()> {
		for kind in MEDIA_KINDS {
			if let Some(row) = self.conn.find(kind, uri, true).await? {
				remove_thumbnail(&row).await;
				self.conn.del(kind, vec![Clause::eq("uri", uri)]).await?;
				return Ok(());
			}
		}
		Err(StoreError::NotFound(uri.to_owned()))
	}

	/// One page of the listing for a media type, optionally scoped to a
	/// uri prefix. The caller re-issues with the returned cursor.
	pub async fn media_list(
		&self,
		media_type: MediaType,
		uri_prefix: Option<&str>,
		count: Option<usize>,
		page: Option<String>,
	) -> Result<SearchPage> {
		let mut where_ = Vec::new();
		if let Some(prefix) = uri_prefix {
			where_.push(Clause::prefix("uri", prefix));
		}

		self.conn
			.search(
				kind_for(media_type),
				SearchQuery {
					where_,
					page,
					limit: count,
					..Default::default()
				},
			)
			.await
	}

	/// The full listing, following cursors until exhausted. Used when
	/// pushing to subscribers.
	pub async fn media_list_all(
		&self,
		media_type: MediaType,
		uri_prefix: Option<&str>,
	) -> Result<Vec<Row>> {
		let mut rows = Vec::new();
		let mut page = None;
		loop {
			let result = self
				.media_list(media_type, uri_prefix, None, page)
				.await?;
			rows.extend(result.rows);
			match result.next {
				Some(next) => page = Some(next),
				None => return Ok(rows),
			}
		}
	}

	/// Metadata for a single uri in the given kind.
	pub async fn media_metadata(&self, media_type: MediaType, uri: &str) -> Result<Row> {
		self.conn
			.find(kind_for(media_type), uri, true)
			.await?
			.ok_or_else(|| StoreError::NotFound(uri.to_owned()))
	}

	/// Grant read access on every media kind to a service.
	pub async fn grant_access(&self, service: &str) -> Result<()> {
		info!(service, "read access granted on media kinds");
		let grants = MEDIA_KINDS
			.into_iter()
			.map(|kind| PermissionGrant {
				kind: kind.to_owned(),
				caller: service.to_owned(),
				operations: vec!["read".into()],
			})
			.collect();
		self.conn.put_permissions(grants).await
	}
}

/// Complete-enough check used by deduplication: audio and video rows need a
/// thumbnail, image rows need their dimensions.
fn is_enough_info(row: &Row, media_type: MediaType) -> bool {
	let non_empty = |prop: &str| match row.get(prop) {
		Some(Value::String(s)) => !s.is_empty(),
		Some(Value::Number(n)) => n.as_i64().map(|v| v > 0).unwrap_or(true),
		_ => false,
	};

	match media_type {
		MediaType::Audio | MediaType::Video => non_empty("thumbnail"),
		MediaType::Image => non_empty("width") && non_empty("height"),
	}
}

/// Unlink a row's thumbnail file, when it has one, and sync the directory
/// so the unlink survives power loss together with the row removal.
async fn remove_thumbnail(row: &Row) {
	let Some(path) = row.get("thumbnail").and_then(Value::as_str) else {
		return;
	};
	if path.is_empty() {
		return;
	}

	match tokio::fs::remove_file(path).await {
		Ok(()) => {
			debug!(path, "thumbnail unlinked");
			if let Some(parent) = Path::new(path).parent() {
				if let Ok(dir) = std::fs::File::open(parent) {
					let _ = dir.sync_all();
				}
			}
		}
		Err(e) => debug!(path, error = %e, "thumbnail unlink skipped"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::memory::MemoryBackend;
	use serde_json::json;

	fn media_store() -> MediaStore {
		MediaStore::new(DbConnection::spawn(MemoryBackend::new()))
	}

	fn item(path: &str, mime: &str, hash: u64) -> MediaItem {
		MediaItem::new("msc://ABCD-1234", path, mime, hash).unwrap()
	}

	#[tokio::test]
	async fn dirty_mark_write_unflag_cycle() {
		let store = media_store();
		store.ensure_kinds().await.unwrap();

		let audio = item("a.mp3", "audio/mpeg", 100);
		store.put_media_item(&audio, "file:///mnt/a.mp3").await.unwrap();

		store.mark_all_dirty("msc://ABCD-1234").await.unwrap();
		let row = store
			.media_metadata(MediaType::Audio, audio.uri())
			.await
			.unwrap();
		assert_eq!(row["dirty"], json!(true));

		store
			.unflag_dirty(MediaType::Audio, audio.uri())
			.await
			.unwrap();
		let row = store
			.media_metadata(MediaType::Audio, audio.uri())
			.await
			.unwrap();
		assert_eq!(row["dirty"], json!(false));
		// other columns were not disturbed
		assert_eq!(row["hash"], json!(100));
	}

	#[tokio::test]
	async fn written_row_has_stable_shape() {
		let store = media_store();
		store.ensure_kinds().await.unwrap();

		let mut audio = item("broken.mp3", "audio/mpeg", 5);
		audio.reset_parsed();
		store
			.put_media_item(&audio, "file:///mnt/broken.mp3")
			.await
			.unwrap();

		let row = store
			.media_metadata(MediaType::Audio, audio.uri())
			.await
			.unwrap();
		assert_eq!(row["parsed"], json!(false));
		assert_eq!(row["dirty"], json!(false));
		assert_eq!(row["title"], json!(""));
		assert_eq!(row["artist"], json!(""));
		assert_eq!(row["thumbnail"], json!(""));
		assert_eq!(row["type"], json!("audio"));
	}

	#[tokio::test]
	async fn check_for_change_new_changed_unchanged() {
		let store = media_store();
		store.ensure_kinds().await.unwrap();
		let cache = HashCache::new();

		let first = item("a.mp3", "audio/mpeg", 100);
		assert_eq!(
			store.check_for_change(&cache, &first).await.unwrap(),
			CheckOutcome::NeedsExtraction
		);

		// store it with a thumbnail so it counts as complete
		let mut parsed = first.clone();
		parsed.set_meta(MetaKey::Thumbnail, "/media/.thumbnails/a.jpg");
		store.put_media_item(&parsed, "file:///a.mp3").await.unwrap();

		// cache hit short-circuits
		assert_eq!(
			store.check_for_change(&cache, &first).await.unwrap(),
			CheckOutcome::Unchanged
		);

		// fresh cache, same hash: store confirms, unflags
		let cache = HashCache::new();
		store.mark_all_dirty("msc://ABCD-1234").await.unwrap();
		assert_eq!(
			store.check_for_change(&cache, &first).await.unwrap(),
			CheckOutcome::Unchanged
		);
		let row = store
			.media_metadata(MediaType::Audio, first.uri())
			.await
			.unwrap();
		assert_eq!(row["dirty"], json!(false));

		// changed hash: extraction required again
		let cache = HashCache::new();
		let changed = item("a.mp3", "audio/mpeg", 101);
		assert_eq!(
			store.check_for_change(&cache, &changed).await.unwrap(),
			CheckOutcome::NeedsExtraction
		);
	}

	#[tokio::test]
	async fn incomplete_row_forces_reextraction() {
		let store = media_store();
		store.ensure_kinds().await.unwrap();

		// stored without thumbnail: not enough info for audio
		let audio = item("a.mp3", "audio/mpeg", 100);
		store.put_media_item(&audio, "file:///a.mp3").await.unwrap();

		let cache = HashCache::new();
		assert_eq!(
			store.check_for_change(&cache, &audio).await.unwrap(),
			CheckOutcome::NeedsExtraction
		);

		// image without dimensions is equally incomplete
		let image = item("b.jpg", "image/jpeg", 7);
		store.put_media_item(&image, "file:///b.jpg").await.unwrap();
		let cache = HashCache::new();
		assert_eq!(
			store.check_for_change(&cache, &image).await.unwrap(),
			CheckOutcome::NeedsExtraction
		);
	}

	#[tokio::test]
	async fn cleanup_removes_only_dirty_rows() {
		let store = media_store();
		store.ensure_kinds().await.unwrap();

		let keep = item("keep.mp3", "audio/mpeg", 1);
		let vanish = item("vanished.jpg", "image/jpeg", 2);
		store.put_media_item(&keep, "file:///keep.mp3").await.unwrap();
		store
			.put_media_item(&vanish, "file:///vanished.jpg")
			.await
			.unwrap();

		store.mark_all_dirty("msc://ABCD-1234").await.unwrap();
		store
			.unflag_dirty(MediaType::Audio, keep.uri())
			.await
			.unwrap();

		let removed = store.cleanup_device("msc://ABCD-1234").await.unwrap();
		assert_eq!(removed, 1);

		assert!(store
			.media_metadata(MediaType::Audio, keep.uri())
			.await
			.is_ok());
		assert!(matches!(
			store.media_metadata(MediaType::Image, vanish.uri()).await,
			Err(StoreError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn cleanup_unlinks_thumbnail_files() {
		let dir = tempfile::tempdir().unwrap();
		let thumb = dir.path().join("vanished.jpg");
		std::fs::write(&thumb, b"jpeg").unwrap();

		let store = media_store();
		store.ensure_kinds().await.unwrap();

		let mut vanish = item("vanished.mp4", "video/mp4", 2);
		vanish.set_meta(MetaKey::Thumbnail, thumb.to_string_lossy().to_string());
		store
			.put_media_item(&vanish, "file:///vanished.mp4")
			.await
			.unwrap();

		store.mark_all_dirty("msc://ABCD-1234").await.unwrap();
		store.cleanup_device("msc://ABCD-1234").await.unwrap();
		assert!(!thumb.exists());
	}

	#[tokio::test]
	async fn request_delete_removes_row_and_thumbnail() {
		let dir = tempfile::tempdir().unwrap();
		let thumb = dir.path().join("a.jpg");
		std::fs::write(&thumb, b"jpeg").unwrap();

		let store = media_store();
		store.ensure_kinds().await.unwrap();

		let mut audio = item("a.mp3", "audio/mpeg", 1);
		audio.set_meta(MetaKey::Thumbnail, thumb.to_string_lossy().to_string());
		store.put_media_item(&audio, "file:///a.mp3").await.unwrap();

		store.request_delete(audio.uri()).await.unwrap();
		assert!(!thumb.exists());
		assert!(matches!(
			store.request_delete(audio.uri()).await,
			Err(StoreError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn listing_pages_and_collects() {
		let store = media_store();
		store.ensure_kinds().await.unwrap();

		for i in 0..5 {
			let audio = item(&format!("{i}.mp3"), "audio/mpeg", i);
			store.put_media_item(&audio, "").await.unwrap();
		}

		let page = store
			.media_list(MediaType::Audio, None, Some(2), None)
			.await
			.unwrap();
		assert_eq!(page.rows.len(), 2);
		assert!(page.next.is_some());

		let all = store.media_list_all(MediaType::Audio, None).await.unwrap();
		assert_eq!(all.len(), 5);

		let scoped = store
			.media_list_all(MediaType::Audio, Some("msc://OTHER"))
			.await
			.unwrap();
		assert!(scoped.is_empty());
	}
}
