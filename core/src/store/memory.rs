//! Bundled document store backend.
//!
//! Keeps every kind as an ordered uri → row map in memory and, when opened
//! with a backing file, persists the whole document set as JSON after each
//! mutation (write-to-temp then rename). This is not a competitive database
//! and does not try to be; it implements the [`StoreBackend`] contract the
//! daemon is written against.

use std::{
	collections::{BTreeMap, HashMap},
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
	Clause, PermissionGrant, Result, Row, SearchPage, SearchQuery, StoreBackend, StoreError,
};

/// DB8 caps result sets at 500 rows; mirror that as the default page size.
const DEFAULT_PAGE_LIMIT: usize = 500;

#[derive(Debug, Default, Serialize, Deserialize)]
struct KindTable {
	indexes: Vec<String>,
	rows: BTreeMap<String, Row>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
	kinds: HashMap<String, KindTable>,
	#[serde(default)]
	permissions: Vec<StoredGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGrant {
	kind: String,
	caller: String,
	operations: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryBackend {
	document: Mutex<Document>,
	backing: Option<PathBuf>,
}

impl Default for MemoryBackend {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryBackend {
	/// Volatile store, used by tests and by `--ephemeral` daemon runs.
	pub fn new() -> Self {
		Self {
			document: Mutex::new(Document::default()),
			backing: None,
		}
	}

	/// Store backed by a JSON document on disk. A missing or unreadable
	/// file starts empty; it will be (re)written on the first mutation.
	pub fn open(path: impl AsRef<Path>) -> Self {
		let path = path.as_ref().to_path_buf();

		let document = match std::fs::read(&path) {
			Ok(raw) => match serde_json::from_slice::<Document>(&raw) {
				Ok(doc) => doc,
				Err(e) => {
					warn!(path = %path.display(), error = %e, "index document corrupt, starting empty");
					Document::default()
				}
			},
			Err(_) => Document::default(),
		};

		debug!(
			path = %path.display(),
			kinds = document.kinds.len(),
			"index document opened"
		);

		Self {
			document: Mutex::new(document),
			backing: Some(path),
		}
	}

	async fn flush(&self, document: &Document) -> Result<()> {
		let Some(path) = &self.backing else {
			return Ok(());
		};

		let raw = serde_json::to_vec_pretty(document)
			.map_err(|e| StoreError::Transport(e.to_string()))?;
		let tmp = path.with_extension("tmp");

		tokio::fs::write(&tmp, raw)
			.await
			.map_err(|e| StoreError::Transport(e.to_string()))?;
		tokio::fs::rename(&tmp, path)
			.await
			.map_err(|e| StoreError::Transport(e.to_string()))?;
		Ok(())
	}
}

fn matches_all(row: &Row, clauses: &[Clause]) -> bool {
	clauses.iter().all(|c| c.matches(row))
}

fn project(row: &Row, select: &[String]) -> Row {
	if select.is_empty() {
		return row.clone();
	}
	row.iter()
		.filter(|(k, _)| select.iter().any(|s| s == *k))
		.map(|(k, v)| (k.clone(), v.clone()))
		.collect()
}

#[async_trait::async_trait]
impl StoreBackend for MemoryBackend {
	async fn ensure_kind(&self, kind: &str, indexes: &[&str]) -> Result<()> {
		let mut document = self.document.lock().await;
		let table = document.kinds.entry(kind.to_owned()).or_default();
		// idempotent: asserting the same schema twice changes nothing
		for index in indexes {
			if !table.indexes.iter().any(|i| i == index) {
				table.indexes.push((*index).to_owned());
			}
		}
		self.flush(&document).await
	}

	async fn merge_put(&self, kind: &str, uri: &str, mut props: Row) -> Result<()> {
		let mut document = self.document.lock().await;
		let table = document
			.kinds
			.get_mut(kind)
			.ok_or_else(|| StoreError::Schema(format!("unknown kind {kind}")))?;

		props.insert("_kind".into(), Value::from(kind));
		let row = table.rows.entry(uri.to_owned()).or_default();
		row.insert("uri".into(), Value::from(uri));
		for (key, value) in props {
			row.insert(key, value);
		}
		self.flush(&document).await
	}

	async fn merge_where(&self, kind: &str, where_: &[Clause], props: Row) -> Result<usize> {
		let mut document = self.document.lock().await;
		let table = document
			.kinds
			.get_mut(kind)
			.ok_or_else(|| StoreError::Schema(format!("unknown kind {kind}")))?;

		let mut touched = 0;
		for row in table.rows.values_mut() {
			if matches_all(row, where_) {
				for (key, value) in &props {
					row.insert(key.clone(), value.clone());
				}
				touched += 1;
			}
		}

		if touched > 0 {
			self.flush(&document).await?;
		}
		Ok(touched)
	}

	async fn find(&self, kind: &str, uri: &str, precise: bool) -> Result<Option<Row>> {
		let document = self.document.lock().await;
		let table = document
			.kinds
			.get(kind)
			.ok_or_else(|| StoreError::Schema(format!("unknown kind {kind}")))?;

		if precise {
			return Ok(table.rows.get(uri).cloned());
		}
		Ok(table
			.rows
			.range(uri.to_owned()..)
			.next()
			.filter(|(key, _)| key.starts_with(uri))
			.map(|(_, row)| row.clone()))
	}

	async fn search(&self, kind: &str, query: SearchQuery) -> Result<SearchPage> {
		let document = self.document.lock().await;
		let table = document
			.kinds
			.get(kind)
			.ok_or_else(|| StoreError::Schema(format!("unknown kind {kind}")))?;

		let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);
		let start = query.page.clone().unwrap_or_default();

		let mut rows = Vec::new();
		let mut next = None;

		for (uri, row) in table.rows.range(start..) {
			if !matches_all(row, &query.where_) || !matches_all(row, &query.filter) {
				continue;
			}
			if rows.len() == limit {
				next = Some(uri.clone());
				break;
			}
			rows.push(project(row, &query.select));
		}

		Ok(SearchPage { rows, next })
	}

	async fn del(&self, kind: &str, where_: &[Clause]) -> Result<usize> {
		let mut document = self.document.lock().await;
		let table = document
			.kinds
			.get_mut(kind)
			.ok_or_else(|| StoreError::Schema(format!("unknown kind {kind}")))?;

		let before = table.rows.len();
		table.rows.retain(|_, row| !matches_all(row, where_));
		let removed = before - table.rows.len();

		if removed > 0 {
			self.flush(&document).await?;
		}
		Ok(removed)
	}

	async fn put_permissions(&self, grants: &[PermissionGrant]) -> Result<()> {
		let mut document = self.document.lock().await;
		for grant in grants {
			let stored = StoredGrant {
				kind: grant.kind.clone(),
				caller: grant.caller.clone(),
				operations: grant.operations.clone(),
			};
			// re-granting replaces the previous grant for (kind, caller)
			document
				.permissions
				.retain(|g| !(g.kind == stored.kind && g.caller == stored.caller));
			document.permissions.push(stored);
		}
		self.flush(&document).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn row(pairs: &[(&str, Value)]) -> Row {
		pairs
			.iter()
			.map(|(k, v)| ((*k).to_owned(), v.clone()))
			.collect()
	}

	#[tokio::test]
	async fn ensure_kind_is_idempotent() {
		let store = MemoryBackend::new();
		store.ensure_kind("k:1", &["uri", "type"]).await.unwrap();
		store.ensure_kind("k:1", &["uri", "type"]).await.unwrap();

		let document = store.document.lock().await;
		assert_eq!(document.kinds["k:1"].indexes, vec!["uri", "type"]);
	}

	#[tokio::test]
	async fn merge_put_then_find_round_trips() {
		let store = MemoryBackend::new();
		store.ensure_kind("k:1", &["uri"]).await.unwrap();
		store
			.merge_put("k:1", "msc://A/a.mp3", row(&[("hash", json!(100))]))
			.await
			.unwrap();

		let found = store.find("k:1", "msc://A/a.mp3", true).await.unwrap().unwrap();
		assert_eq!(found["hash"], json!(100));
		assert_eq!(found["_kind"], json!("k:1"));
		assert_eq!(found["uri"], json!("msc://A/a.mp3"));

		// merge keeps unrelated columns
		store
			.merge_put("k:1", "msc://A/a.mp3", row(&[("dirty", json!(false))]))
			.await
			.unwrap();
		let found = store.find("k:1", "msc://A/a.mp3", true).await.unwrap().unwrap();
		assert_eq!(found["hash"], json!(100));
		assert_eq!(found["dirty"], json!(false));
	}

	#[tokio::test]
	async fn imprecise_find_matches_prefix() {
		let store = MemoryBackend::new();
		store.ensure_kind("k:1", &["uri"]).await.unwrap();
		store
			.merge_put("k:1", "msc://A/music/a.mp3", Row::new())
			.await
			.unwrap();

		assert!(store.find("k:1", "msc://A", false).await.unwrap().is_some());
		assert!(store.find("k:1", "msc://B", false).await.unwrap().is_none());
		assert!(store.find("k:1", "msc://A", true).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn merge_where_and_del() {
		let store = MemoryBackend::new();
		store.ensure_kind("k:1", &["uri", "dirty"]).await.unwrap();
		for uri in ["msc://A/a.mp3", "msc://A/b.mp3", "msc://B/c.mp3"] {
			store
				.merge_put("k:1", uri, row(&[("dirty", json!(false))]))
				.await
				.unwrap();
		}

		let touched = store
			.merge_where(
				"k:1",
				&[Clause::prefix("uri", "msc://A")],
				row(&[("dirty", json!(true))]),
			)
			.await
			.unwrap();
		assert_eq!(touched, 2);

		let removed = store
			.del(
				"k:1",
				&[Clause::prefix("uri", "msc://A"), Clause::eq("dirty", true)],
			)
			.await
			.unwrap();
		assert_eq!(removed, 2);
		assert!(store.find("k:1", "msc://B/c.mp3", true).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn search_paginates_with_cursor() {
		let store = MemoryBackend::new();
		store.ensure_kind("k:1", &["uri"]).await.unwrap();
		for i in 0..5 {
			store
				.merge_put("k:1", &format!("storage://f{i}.mp3"), Row::new())
				.await
				.unwrap();
		}

		let first = store
			.search(
				"k:1",
				SearchQuery {
					limit: Some(2),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert_eq!(first.rows.len(), 2);
		let cursor = first.next.clone().unwrap();

		let second = store
			.search(
				"k:1",
				SearchQuery {
					page: Some(cursor),
					limit: Some(2),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert_eq!(second.rows.len(), 2);

		let third = store
			.search(
				"k:1",
				SearchQuery {
					page: second.next.clone(),
					limit: Some(2),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert_eq!(third.rows.len(), 1);
		assert!(third.next.is_none());
	}

	#[tokio::test]
	async fn persistence_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("index.json");

		{
			let store = MemoryBackend::open(&path);
			store.ensure_kind("k:1", &["uri"]).await.unwrap();
			store
				.merge_put("k:1", "msc://A/a.mp3", row(&[("hash", json!(7))]))
				.await
				.unwrap();
		}

		let reopened = MemoryBackend::open(&path);
		let found = reopened
			.find("k:1", "msc://A/a.mp3", true)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(found["hash"], json!(7));
	}

	#[tokio::test]
	async fn unknown_kind_is_a_schema_error() {
		let store = MemoryBackend::new();
		let err = store.find("nope:1", "uri", true).await.unwrap_err();
		assert!(matches!(err, StoreError::Schema(_)));
	}
}
