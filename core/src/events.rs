//! In-process event bus.
//!
//! Fans state changes out to whoever cares, mostly the RPC service, which
//! turns them into subscription pushes. Delivery is lossy: a slow
//! subscriber skips events rather than blocking the emitters.

use tokio::sync::broadcast;

use crate::media_item::MediaType;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
	/// A device appeared, disappeared or changed its metadata.
	DeviceListChanged,
	/// A scan cycle finished, including the dirty sweep.
	ScanCompleted { device_uri: String },
	/// Rows of this media type changed (writes or deletions).
	MediaUpdated { media_type: MediaType },
}

#[derive(Debug)]
pub struct EventBus {
	tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
	fn default() -> Self {
		let (tx, _) = broadcast::channel(BUS_CAPACITY);
		Self { tx }
	}
}

impl EventBus {
	pub fn emit(&self, event: Event) {
		// an error only means nobody is listening right now
		let _ = self.tx.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.tx.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn events_reach_subscribers() {
		let bus = EventBus::default();
		let mut rx = bus.subscribe();

		bus.emit(Event::ScanCompleted {
			device_uri: "msc://ABCD-1234".into(),
		});

		assert_eq!(
			rx.recv().await.unwrap(),
			Event::ScanCompleted {
				device_uri: "msc://ABCD-1234".into()
			}
		);
	}

	#[test]
	fn emit_without_subscribers_is_fine() {
		EventBus::default().emit(Event::DeviceListChanged);
	}
}
