//! Storage device representation and its scan lifecycle.
//!
//! A [`Device`] is created by a device source on appearance and shared as
//! `Arc<Device>` between the source, the indexer and in-flight pipeline
//! tasks. Counters are atomics so enumeration and write-back can run on
//! different tasks without locking.

use std::{
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
	sync::Mutex,
};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::media_item::MediaType;

/// Scan lifecycle states.
///
/// ```text
/// Discovered -> Scanning -> Processing -> Idle -> (Scanning | Gone)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
	/// Appearance event received, no scan started yet.
	Discovered,
	/// Enumeration in progress.
	Scanning,
	/// Enumeration done, items still in flight.
	Processing,
	/// Caught up.
	Idle,
	/// Disappearance received; purged after cleanup.
	Gone,
}

#[derive(Debug, Default, Clone)]
pub struct DeviceMeta {
	pub name: String,
	pub description: String,
}

#[derive(Debug)]
pub struct Device {
	uri: String,
	mountpoint: PathBuf,
	available: AtomicBool,
	/// Generation counter, incremented on every re-appearance.
	alive: AtomicI64,
	meta: Mutex<DeviceMeta>,
	last_seen: Mutex<DateTime<Utc>>,
	state: Mutex<DeviceState>,
	item_counts: [AtomicU64; 3],
	processed_counts: [AtomicU64; 3],
	/// Bumped on every scan start; stale in-flight work from an earlier
	/// cycle compares against it before touching the counters.
	scan_cycle: AtomicU64,
	/// Guards cleanup activation; set at most once per scan cycle.
	cleanup_fired: AtomicBool,
}

impl Device {
	pub fn new(uri: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
		Self {
			uri: uri.into(),
			mountpoint: mountpoint.into(),
			available: AtomicBool::new(true),
			alive: AtomicI64::new(1),
			meta: Mutex::new(DeviceMeta::default()),
			last_seen: Mutex::new(Utc::now()),
			state: Mutex::new(DeviceState::Discovered),
			item_counts: Default::default(),
			processed_counts: Default::default(),
			scan_cycle: AtomicU64::new(0),
			cleanup_fired: AtomicBool::new(false),
		}
	}

	pub fn uri(&self) -> &str {
		&self.uri
	}

	pub fn mountpoint(&self) -> &Path {
		&self.mountpoint
	}

	pub fn available(&self) -> bool {
		self.available.load(Ordering::Acquire)
	}

	pub fn alive(&self) -> i64 {
		self.alive.load(Ordering::Acquire)
	}

	pub fn last_seen(&self) -> DateTime<Utc> {
		*self.last_seen.lock().unwrap()
	}

	pub fn meta(&self) -> DeviceMeta {
		self.meta.lock().unwrap().clone()
	}

	pub fn set_meta(&self, meta: DeviceMeta) {
		*self.meta.lock().unwrap() = meta;
	}

	pub fn state(&self) -> DeviceState {
		*self.state.lock().unwrap()
	}

	/// Record a (re-)appearance: bumps the generation counter, refreshes
	/// the last-seen timestamp and re-enters the scan lifecycle.
	pub fn mark_appeared(&self) {
		self.available.store(true, Ordering::Release);
		self.alive.fetch_add(1, Ordering::AcqRel);
		*self.last_seen.lock().unwrap() = Utc::now();
		*self.state.lock().unwrap() = DeviceState::Discovered;
	}

	pub fn mark_gone(&self) {
		self.available.store(false, Ordering::Release);
		*self.state.lock().unwrap() = DeviceState::Gone;
	}

	/// Transition into `Scanning` and reset the per-cycle bookkeeping.
	///
	/// Returns `false` while a cycle is still underway (scanning or items
	/// in flight); the request coalesces into the running one.
	pub fn begin_scan(&self) -> bool {
		let mut state = self.state.lock().unwrap();
		match *state {
			DeviceState::Scanning | DeviceState::Processing | DeviceState::Gone => false,
			DeviceState::Discovered | DeviceState::Idle => {
				*state = DeviceState::Scanning;
				for counter in self.item_counts.iter().chain(&self.processed_counts) {
					counter.store(0, Ordering::Release);
				}
				self.scan_cycle.fetch_add(1, Ordering::AcqRel);
				self.cleanup_fired.store(false, Ordering::Release);
				debug!(uri = %self.uri, "scan started");
				true
			}
		}
	}

	/// Enumeration finished; in-flight items may still be processing.
	pub fn finish_enumeration(&self) {
		let mut state = self.state.lock().unwrap();
		if *state == DeviceState::Scanning {
			*state = DeviceState::Processing;
		}
	}

	pub fn increment_item_count(&self, media_type: MediaType) {
		self.item_counts[media_type as usize].fetch_add(1, Ordering::AcqRel);
	}

	pub fn increment_processed(&self, media_type: MediaType) {
		self.processed_counts[media_type as usize].fetch_add(1, Ordering::AcqRel);
	}

	/// The running cycle's generation, captured when work is dispatched.
	pub fn scan_cycle(&self) -> u64 {
		self.scan_cycle.load(Ordering::Acquire)
	}

	/// Count a write-back only when it belongs to the current cycle; work
	/// left over from a cancelled cycle must not skew the fresh counters.
	pub fn increment_processed_if_current(&self, media_type: MediaType, cycle: u64) -> bool {
		if self.scan_cycle() != cycle {
			return false;
		}
		self.increment_processed(media_type);
		true
	}

	pub fn item_count(&self, media_type: MediaType) -> u64 {
		self.item_counts[media_type as usize].load(Ordering::Acquire)
	}

	pub fn processed_count(&self, media_type: MediaType) -> u64 {
		self.processed_counts[media_type as usize].load(Ordering::Acquire)
	}

	/// Every type with at least one enumerated item has all its write-backs
	/// acknowledged. Only meaningful once enumeration finished.
	pub fn processing_done(&self) -> bool {
		MediaType::ALL.into_iter().all(|t| {
			let total = self.item_count(t);
			total == 0 || self.processed_count(t) >= total
		})
	}

	/// Claim the cleanup task for this scan cycle. Succeeds exactly once
	/// per cycle, and only after enumeration completed and every in-flight
	/// item was acknowledged.
	pub fn try_activate_cleanup(&self) -> bool {
		{
			let state = self.state.lock().unwrap();
			if *state != DeviceState::Processing {
				return false;
			}
		}
		if !self.processing_done() {
			return false;
		}
		let claimed = !self.cleanup_fired.swap(true, Ordering::AcqRel);
		if claimed {
			*self.state.lock().unwrap() = DeviceState::Idle;
			debug!(uri = %self.uri, "scan cycle complete, cleanup claimed");
		}
		claimed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scan_coalesces_while_cycle_is_underway() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		assert!(device.begin_scan());
		assert!(!device.begin_scan());
		device.increment_item_count(MediaType::Audio);
		device.finish_enumeration();
		assert_eq!(device.state(), DeviceState::Processing);
		// items still in flight: a rescan request keeps coalescing
		assert!(!device.begin_scan());
	}

	#[test]
	fn stale_cycle_work_does_not_count() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		device.begin_scan();
		let stale = device.scan_cycle();
		device.finish_enumeration();
		assert!(device.try_activate_cleanup());

		assert!(device.begin_scan());
		device.increment_item_count(MediaType::Audio);
		assert!(!device.increment_processed_if_current(MediaType::Audio, stale));
		assert_eq!(device.processed_count(MediaType::Audio), 0);
		assert!(device.increment_processed_if_current(
			MediaType::Audio,
			device.scan_cycle()
		));
		assert_eq!(device.processed_count(MediaType::Audio), 1);
	}

	#[test]
	fn processing_done_tracks_per_type_counts() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		device.begin_scan();
		device.increment_item_count(MediaType::Audio);
		device.increment_item_count(MediaType::Image);
		device.finish_enumeration();

		assert!(!device.processing_done());
		device.increment_processed(MediaType::Audio);
		assert!(!device.processing_done());
		device.increment_processed(MediaType::Image);
		assert!(device.processing_done());
	}

	#[test]
	fn cleanup_fires_exactly_once_per_cycle() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		device.begin_scan();
		device.increment_item_count(MediaType::Audio);

		// enumeration still running: never activate, even if counts match
		device.increment_processed(MediaType::Audio);
		assert!(!device.try_activate_cleanup());

		device.finish_enumeration();
		assert!(device.try_activate_cleanup());
		assert!(!device.try_activate_cleanup());
		assert_eq!(device.state(), DeviceState::Idle);

		// a new cycle re-arms the flag
		assert!(device.begin_scan());
		device.finish_enumeration();
		assert!(device.try_activate_cleanup());
	}

	#[test]
	fn empty_scan_completes_immediately() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		device.begin_scan();
		device.finish_enumeration();
		assert!(device.processing_done());
		assert!(device.try_activate_cleanup());
	}

	#[test]
	fn reappearance_bumps_generation() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		let before = device.alive();
		device.mark_gone();
		assert!(!device.available());
		device.mark_appeared();
		assert!(device.available());
		assert_eq!(device.alive(), before + 1);
		// back in the lifecycle: a new scan may start
		assert!(device.begin_scan());
	}

	#[test]
	fn gone_device_refuses_to_scan() {
		let device = Device::new("msc://ABCD-1234", "/tmp");
		device.mark_gone();
		assert!(!device.begin_scan());
	}
}
