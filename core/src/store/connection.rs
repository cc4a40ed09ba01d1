//! Single-writer store connection.
//!
//! Every store call in the daemon funnels through one connection task that
//! owns the backend. A request carries a typed oneshot sender; the task
//! answers into it when the backend responds. The opaque token only exists
//! for log correlation; the continuation itself is the channel, so there
//! is no token → callback map to keep consistent.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::{
	Clause, PermissionGrant, Result, Row, SearchPage, SearchQuery, StoreBackend, StoreError,
};

/// Outstanding request depth before senders start waiting.
const REQUEST_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
enum Request {
	EnsureKind {
		kind: String,
		indexes: Vec<String>,
		reply: oneshot::Sender<Result<()>>,
	},
	MergePut {
		kind: String,
		uri: String,
		props: Row,
		reply: oneshot::Sender<Result<()>>,
	},
	MergeWhere {
		kind: String,
		where_: Vec<Clause>,
		props: Row,
		reply: oneshot::Sender<Result<usize>>,
	},
	Find {
		kind: String,
		uri: String,
		precise: bool,
		reply: oneshot::Sender<Result<Option<Row>>>,
	},
	Search {
		kind: String,
		query: SearchQuery,
		reply: oneshot::Sender<Result<SearchPage>>,
	},
	Del {
		kind: String,
		where_: Vec<Clause>,
		reply: oneshot::Sender<Result<usize>>,
	},
	PutPermissions {
		grants: Vec<PermissionGrant>,
		reply: oneshot::Sender<Result<()>>,
	},
}

/// Cloneable handle to the connection task.
#[derive(Debug, Clone)]
pub struct DbConnection {
	tx: mpsc::Sender<(u64, Request)>,
	next_token: Arc<AtomicU64>,
}

impl DbConnection {
	/// Spawn the connection task around a backend.
	pub fn spawn(backend: impl StoreBackend) -> Self {
		Self::spawn_boxed(Box::new(backend))
	}

	/// Same, for a backend chosen at runtime.
	pub fn spawn_boxed(backend: Box<dyn StoreBackend>) -> Self {
		let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
		tokio::spawn(run(Arc::from(backend), rx));
		Self {
			tx,
			next_token: Arc::new(AtomicU64::new(1)),
		}
	}

	async fn submit<T>(
		&self,
		make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
	) -> Result<T> {
		let (reply, response) = oneshot::channel();
		let token = self.next_token.fetch_add(1, Ordering::Relaxed);

		self.tx
			.send((token, make(reply)))
			.await
			.map_err(|_| StoreError::Transport("store connection closed".into()))?;

		response
			.await
			.map_err(|_| StoreError::Transport("store connection dropped reply".into()))?
	}

	pub async fn ensure_kind(&self, kind: &str, indexes: &[&str]) -> Result<()> {
		self.submit(|reply| Request::EnsureKind {
			kind: kind.to_owned(),
			indexes: indexes.iter().map(|s| (*s).to_owned()).collect(),
			reply,
		})
		.await
	}

	pub async fn merge_put(&self, kind: &str, uri: &str, props: Row) -> Result<()> {
		self.submit(|reply| Request::MergePut {
			kind: kind.to_owned(),
			uri: uri.to_owned(),
			props,
			reply,
		})
		.await
	}

	pub async fn merge_where(
		&self,
		kind: &str,
		where_: Vec<Clause>,
		props: Row,
	) -> Result<usize> {
		self.submit(|reply| Request::MergeWhere {
			kind: kind.to_owned(),
			where_,
			props,
			reply,
		})
		.await
	}

	pub async fn find(&self, kind: &str, uri: &str, precise: bool) -> Result<Option<Row>> {
		self.submit(|reply| Request::Find {
			kind: kind.to_owned(),
			uri: uri.to_owned(),
			precise,
			reply,
		})
		.await
	}

	pub async fn search(&self, kind: &str, query: SearchQuery) -> Result<SearchPage> {
		self.submit(|reply| Request::Search {
			kind: kind.to_owned(),
			query,
			reply,
		})
		.await
	}

	pub async fn del(&self, kind: &str, where_: Vec<Clause>) -> Result<usize> {
		self.submit(|reply| Request::Del {
			kind: kind.to_owned(),
			where_,
			reply,
		})
		.await
	}

	pub async fn put_permissions(&self, grants: Vec<PermissionGrant>) -> Result<()> {
		self.submit(|reply| Request::PutPermissions { grants, reply })
			.await
	}
}

async fn run(backend: Arc<dyn StoreBackend>, mut rx: mpsc::Receiver<(u64, Request)>) {
	while let Some((token, request)) = rx.recv().await {
		match request {
			Request::EnsureKind {
				kind,
				indexes,
				reply,
			} => {
				debug!(token, kind = %kind, "ensureKind");
				let indexes: Vec<&str> = indexes.iter().map(String::as_str).collect();
				answer(token, reply, backend.ensure_kind(&kind, &indexes).await);
			}
			Request::MergePut {
				kind,
				uri,
				props,
				reply,
			} => {
				debug!(token, kind = %kind, uri = %uri, "mergePut");
				answer(token, reply, backend.merge_put(&kind, &uri, props).await);
			}
			Request::MergeWhere {
				kind,
				where_,
				props,
				reply,
			} => {
				debug!(token, kind = %kind, "mergeWhere");
				answer(token, reply, backend.merge_where(&kind, &where_, props).await);
			}
			Request::Find {
				kind,
				uri,
				precise,
				reply,
			} => {
				debug!(token, kind = %kind, uri = %uri, precise, "find");
				answer(token, reply, backend.find(&kind, &uri, precise).await);
			}
			Request::Search { kind, query, reply } => {
				debug!(token, kind = %kind, "search");
				answer(token, reply, backend.search(&kind, query).await);
			}
			Request::Del {
				kind,
				where_,
				reply,
			} => {
				debug!(token, kind = %kind, "del");
				answer(token, reply, backend.del(&kind, &where_).await);
			}
			Request::PutPermissions { grants, reply } => {
				debug!(token, grants = grants.len(), "putPermissions");
				answer(token, reply, backend.put_permissions(&grants).await);
			}
		}
	}
	debug!("store connection task finished");
}

fn answer<T>(token: u64, reply: oneshot::Sender<Result<T>>, result: Result<T>) {
	if let Err(e) = &result {
		error!(token, error = %e, "store request failed");
	}
	if reply.send(result).is_err() {
		// requester went away mid-flight; nothing left to deliver to
		warn!(token, "store response had no receiver");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::memory::MemoryBackend;

	#[tokio::test]
	async fn requests_round_trip_through_the_task() {
		let conn = DbConnection::spawn(MemoryBackend::new());
		conn.ensure_kind("k:1", &["uri"]).await.unwrap();
		conn.merge_put("k:1", "storage://x.mp3", Row::new())
			.await
			.unwrap();

		let row = conn.find("k:1", "storage://x.mp3", true).await.unwrap();
		assert!(row.is_some());
	}

	#[tokio::test]
	async fn concurrent_requests_are_serialized_not_lost() {
		let conn = DbConnection::spawn(MemoryBackend::new());
		conn.ensure_kind("k:1", &["uri"]).await.unwrap();

		let writes: Vec<_> = (0..32)
			.map(|i| {
				let conn = conn.clone();
				tokio::spawn(async move {
					conn.merge_put("k:1", &format!("storage://f{i}"), Row::new())
						.await
				})
			})
			.collect();
		for write in writes {
			write.await.unwrap().unwrap();
		}

		let page = conn
			.search("k:1", SearchQuery::default())
			.await
			.unwrap();
		assert_eq!(page.rows.len(), 32);
	}
}
