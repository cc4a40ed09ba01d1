//! Subscription bookkeeping for the RPC service.
//!
//! Subscribers are tracked as `(sender, method, token)` triples; a sender
//! vanishing (disconnect) or cancelling drops its rows. Pushes go through
//! the per-connection writer channel kept alongside the triple.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Subscriber {
	pub sender: String,
	pub method: String,
	pub token: u64,
	line_tx: mpsc::UnboundedSender<String>,
}

impl Subscriber {
	pub fn push(&self, line: String) -> bool {
		self.line_tx.send(line).is_ok()
	}
}

#[derive(Debug, Default)]
pub struct SubscriptionTable {
	entries: Mutex<Vec<Subscriber>>,
}

impl SubscriptionTable {
	pub fn add(
		&self,
		sender: impl Into<String>,
		method: impl Into<String>,
		token: u64,
		line_tx: mpsc::UnboundedSender<String>,
	) {
		let subscriber = Subscriber {
			sender: sender.into(),
			method: method.into(),
			token,
			line_tx,
		};
		debug!(
			sender = %subscriber.sender,
			method = %subscriber.method,
			token,
			"subscriber added"
		);
		self.entries.lock().unwrap().push(subscriber);
	}

	/// Remove one subscription. True when it existed.
	pub fn remove(&self, sender: &str, method: &str, token: u64) -> bool {
		let mut entries = self.entries.lock().unwrap();
		let before = entries.len();
		entries.retain(|s| !(s.sender == sender && s.method == method && s.token == token));
		before != entries.len()
	}

	/// Drop everything a disconnected sender had.
	pub fn drop_sender(&self, sender: &str) {
		let mut entries = self.entries.lock().unwrap();
		let before = entries.len();
		entries.retain(|s| s.sender != sender);
		if before != entries.len() {
			debug!(sender, dropped = before - entries.len(), "subscriptions dropped");
		}
	}

	pub fn subscribers_of(&self, method: &str) -> Vec<Subscriber> {
		self.entries
			.lock()
			.unwrap()
			.iter()
			.filter(|s| s.method == method)
			.cloned()
			.collect()
	}

	pub fn is_subscribed(&self, sender: &str, method: &str, token: u64) -> bool {
		self.entries
			.lock()
			.unwrap()
			.iter()
			.any(|s| s.sender == sender && s.method == method && s.token == token)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn add_remove_and_drop() {
		let table = SubscriptionTable::default();
		let (tx, _rx) = mpsc::unbounded_channel();

		table.add("client-1", "getAudioList", 1, tx.clone());
		table.add("client-1", "getDeviceList", 2, tx.clone());
		table.add("client-2", "getAudioList", 1, tx);

		assert!(table.is_subscribed("client-1", "getAudioList", 1));
		assert_eq!(table.subscribers_of("getAudioList").len(), 2);

		assert!(table.remove("client-1", "getAudioList", 1));
		assert!(!table.remove("client-1", "getAudioList", 1));

		table.drop_sender("client-1");
		assert!(!table.is_subscribed("client-1", "getDeviceList", 2));
		assert_eq!(table.subscribers_of("getAudioList").len(), 1);
	}

	#[test]
	fn push_fails_after_receiver_drop() {
		let table = SubscriptionTable::default();
		let (tx, rx) = mpsc::unbounded_channel();
		table.add("client-1", "getAudioList", 1, tx);
		drop(rx);

		let subscriber = &table.subscribers_of("getAudioList")[0];
		assert!(!subscriber.push("{}".into()));
	}
}
