//! Persistent index store.
//!
//! The store is an abstract document database sharded into *kinds*, one per
//! media type plus one for device records. Everything above the
//! [`StoreBackend`] trait is store-agnostic: the bundled backend is a
//! document file ([`memory::MemoryBackend`]), but the contract matches any
//! JSON document service.
//!
//! All requests funnel through a single-writer [`connection::DbConnection`]
//! task; callers receive their response through a typed oneshot channel
//! instead of a token → callback map.

pub mod connection;
pub mod device;
pub mod media;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::media_item::MediaType;

/// Kind id suffix, mirroring the `<owner>:<schema-version>` convention.
pub const KIND_SUFFIX: &str = ":1";

pub const AUDIO_KIND: &str = "com.mindex.media.audio:1";
pub const VIDEO_KIND: &str = "com.mindex.media.video:1";
pub const IMAGE_KIND: &str = "com.mindex.media.image:1";
pub const DEVICE_KIND: &str = "com.mindex.devices:1";

pub const MEDIA_KINDS: [&str; 3] = [AUDIO_KIND, VIDEO_KIND, IMAGE_KIND];

pub fn kind_for(media_type: MediaType) -> &'static str {
	match media_type {
		MediaType::Audio => AUDIO_KIND,
		MediaType::Video => VIDEO_KIND,
		MediaType::Image => IMAGE_KIND,
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store transport error: {0}")]
	Transport(String),
	#[error("store schema error: {0}")]
	Schema(String),
	#[error("not found: {0}")]
	NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored row: flat JSON properties keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Match operator for where/filter clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
	/// Exact value match.
	Eq,
	/// String prefix match ("starts with").
	Prefix,
}

/// One condition on a single property.
#[derive(Debug, Clone)]
pub struct Clause {
	pub prop: String,
	pub op: MatchOp,
	pub val: Value,
}

impl Clause {
	pub fn eq(prop: impl Into<String>, val: impl Into<Value>) -> Self {
		Self {
			prop: prop.into(),
			op: MatchOp::Eq,
			val: val.into(),
		}
	}

	pub fn prefix(prop: impl Into<String>, val: impl Into<Value>) -> Self {
		Self {
			prop: prop.into(),
			op: MatchOp::Prefix,
			val: val.into(),
		}
	}

	pub fn matches(&self, row: &Row) -> bool {
		let Some(value) = row.get(&self.prop) else {
			return false;
		};
		match self.op {
			MatchOp::Eq => *value == self.val,
			MatchOp::Prefix => match (value.as_str(), self.val.as_str()) {
				(Some(v), Some(p)) => v.starts_with(p),
				_ => false,
			},
		}
	}
}

/// Search request; `where_` is index-backed, `filter` is applied after.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
	pub select: Vec<String>,
	pub where_: Vec<Clause>,
	pub filter: Vec<Clause>,
	/// Resume cursor from a previous page.
	pub page: Option<String>,
	pub limit: Option<usize>,
}

/// One page of search results. `next` is present when more rows match;
/// callers re-issue the query with it until exhausted.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
	pub rows: Vec<Row>,
	pub next: Option<String>,
}

/// Read-grant request for external services.
#[derive(Debug, Clone)]
pub struct PermissionGrant {
	pub kind: String,
	pub caller: String,
	pub operations: Vec<String>,
}

/// The abstract document store the indexer persists into.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
	/// Idempotent schema assertion for one kind.
	async fn ensure_kind(&self, kind: &str, indexes: &[&str]) -> Result<()>;

	/// Upsert by exact uri; sets `_kind` on the written row.
	async fn merge_put(&self, kind: &str, uri: &str, props: Row) -> Result<()>;

	/// Bulk update of every row matching the clauses. Returns the number of
	/// rows touched.
	async fn merge_where(&self, kind: &str, where_: &[Clause], props: Row) -> Result<usize>;

	/// Exact (`precise`) or prefix lookup returning at most one row.
	async fn find(&self, kind: &str, uri: &str, precise: bool) -> Result<Option<Row>>;

	/// Paginated listing.
	async fn search(&self, kind: &str, query: SearchQuery) -> Result<SearchPage>;

	/// Delete every row matching the clauses. Returns the number removed.
	async fn del(&self, kind: &str, where_: &[Clause]) -> Result<usize>;

	/// Grant access to named callers.
	async fn put_permissions(&self, grants: &[PermissionGrant]) -> Result<()>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn clause_matching() {
		let mut row = Row::new();
		row.insert("uri".into(), json!("msc://A/x.mp3"));
		row.insert("dirty".into(), json!(true));

		assert!(Clause::eq("dirty", true).matches(&row));
		assert!(!Clause::eq("dirty", false).matches(&row));
		assert!(Clause::prefix("uri", "msc://A").matches(&row));
		assert!(!Clause::prefix("uri", "msc://B").matches(&row));
		assert!(!Clause::eq("missing", 1).matches(&row));
		// prefix on a non-string never matches
		assert!(!Clause::prefix("dirty", "t").matches(&row));
	}

	#[test]
	fn kind_mapping() {
		assert_eq!(kind_for(MediaType::Audio), AUDIO_KIND);
		assert_eq!(kind_for(MediaType::Video), VIDEO_KIND);
		assert_eq!(kind_for(MediaType::Image), IMAGE_KIND);
		assert!(AUDIO_KIND.ends_with(KIND_SUFFIX));
	}
}
