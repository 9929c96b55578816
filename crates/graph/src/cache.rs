//! Creation-info-keyed caches with LRU-by-frame eviction.

use std::{
	hash::Hash,
	sync::{
		atomic::{AtomicU32, AtomicU64, Ordering},
		Arc,
	},
};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::Result;

/// Entries acquired with this frame never age out.
pub const UNBOUNDED: u64 = u64::MAX;

enum Slot<V> {
	/// Inserted by a miss but not yet populated; waiters park on the condvar.
	Disarmed,
	Ready(Arc<V>),
	Failed,
}

struct Entry<V> {
	slot: Mutex<Slot<V>>,
	ready: Condvar,
	last_use: AtomicU64,
	loads: AtomicU32,
}

/// A pool of values keyed by their creation info.
///
/// `acquire` is the hot path: a shared lock, one hash lookup and a relaxed
/// store. Misses upgrade to the unique lock just long enough to claim the key,
/// then construct the value outside any lock; concurrent misses for the same
/// key block until the constructor finishes.
pub struct Cache<K, V> {
	map: RwLock<FxHashMap<K, Arc<Entry<V>>>>,
	destroy: Box<dyn Fn(&V) + Send + Sync>,
}

impl<K: Clone + Eq + Hash, V> Cache<K, V> {
	pub fn new(destroy: impl Fn(&V) + Send + Sync + 'static) -> Self {
		Self {
			map: RwLock::new(FxHashMap::default()),
			destroy: Box::new(destroy),
		}
	}

	pub fn acquire(&self, key: &K, frame: u64, create: impl FnOnce() -> Result<V>) -> Result<Arc<V>> {
		loop {
			let entry = {
				let map = self.map.read();
				map.get(key).cloned()
			};

			let (entry, creator) = match entry {
				Some(entry) => (entry, false),
				None => {
					let mut map = self.map.write();
					match map.get(key) {
						// Someone else claimed it between our locks.
						Some(entry) => (entry.clone(), false),
						None => {
							let entry = Arc::new(Entry {
								slot: Mutex::new(Slot::Disarmed),
								ready: Condvar::new(),
								last_use: AtomicU64::new(frame),
								loads: AtomicU32::new(0),
							});
							map.insert(key.clone(), entry.clone());
							(entry, true)
						},
					}
				},
			};

			if creator {
				let value = match create() {
					Ok(value) => Arc::new(value),
					Err(err) => {
						// Unclaim the key and fail every waiter.
						self.map.write().remove(key);
						let mut slot = entry.slot.lock();
						*slot = Slot::Failed;
						entry.ready.notify_all();
						return Err(err);
					},
				};
				let mut slot = entry.slot.lock();
				*slot = Slot::Ready(value.clone());
				entry.loads.store(1, Ordering::Release);
				entry.ready.notify_all();
				return Ok(value);
			}

			let mut slot = entry.slot.lock();
			loop {
				match &*slot {
					Slot::Disarmed => entry.ready.wait(&mut slot),
					Slot::Ready(value) => {
						if entry.last_use.load(Ordering::Relaxed) != UNBOUNDED {
							entry.last_use.store(frame, Ordering::Relaxed);
						}
						entry.loads.fetch_add(1, Ordering::Relaxed);
						return Ok(value.clone());
					},
					// The creator failed; retry the whole acquire so one of the
					// waiters becomes the new creator.
					Slot::Failed => break,
				}
			}
		}
	}

	/// Insert a value that never ages out.
	pub fn insert_unbounded(&self, key: K, value: V) -> Arc<V> {
		let value = Arc::new(value);
		let entry = Arc::new(Entry {
			slot: Mutex::new(Slot::Ready(value.clone())),
			ready: Condvar::new(),
			last_use: AtomicU64::new(UNBOUNDED),
			loads: AtomicU32::new(1),
		});
		if let Some(old) = self.map.write().insert(key, entry) {
			if let Slot::Ready(old) = &*old.slot.lock() {
				(self.destroy)(old);
			}
		}
		value
	}

	pub fn get_if_cached(&self, key: &K) -> Option<Arc<V>> {
		let map = self.map.read();
		let entry = map.get(key)?;
		let result = match &*entry.slot.lock() {
			Slot::Ready(value) => Some(value.clone()),
			_ => None,
		};
		result
	}

	pub fn len(&self) -> usize { self.map.read().len() }

	pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

	/// Evict everything last used before `now - threshold`, invoking the
	/// destroy hook on each evicted value.
	pub fn collect(&self, now: u64, threshold: u64) {
		let cutoff = now.saturating_sub(threshold);
		let mut map = self.map.write();
		map.retain(|_, entry| {
			let last = entry.last_use.load(Ordering::Relaxed);
			if last == UNBOUNDED || last >= cutoff {
				return true;
			}
			if let Slot::Ready(value) = &*entry.slot.lock() {
				(self.destroy)(value);
			}
			false
		});
	}

	/// Destroy every entry. All handed-out values must be unused.
	pub fn clear(&self) {
		let mut map = self.map.write();
		for (_, entry) in map.drain() {
			if let Slot::Ready(value) = &*entry.slot.lock() {
				(self.destroy)(value);
			}
		}
	}
}

impl<K, V> Drop for Cache<K, V> {
	fn drop(&mut self) {
		for (_, entry) in self.map.get_mut().drain() {
			if let Slot::Ready(value) = &*entry.slot.lock() {
				(self.destroy)(value);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn hits_do_not_recreate() {
		let created = AtomicUsize::new(0);
		let cache = Cache::<u32, u32>::new(|_| {});
		for _ in 0..3 {
			let v = cache
				.acquire(&7, 0, || {
					created.fetch_add(1, Ordering::Relaxed);
					Ok(49)
				})
				.unwrap();
			assert_eq!(*v, 49);
		}
		assert_eq!(created.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn collect_evicts_stale_entries() {
		let destroyed = Arc::new(AtomicUsize::new(0));
		let d = destroyed.clone();
		let cache = Cache::<u32, u32>::new(move |_| {
			d.fetch_add(1, Ordering::Relaxed);
		});

		cache.acquire(&1, 0, || Ok(1)).unwrap();
		cache.acquire(&2, 10, || Ok(2)).unwrap();

		cache.collect(16, 8);
		assert_eq!(destroyed.load(Ordering::Relaxed), 1);
		assert!(cache.get_if_cached(&1).is_none());
		assert!(cache.get_if_cached(&2).is_some());

		// Touching an entry refreshes it.
		cache.acquire(&2, 20, || unreachable!()).unwrap();
		cache.collect(25, 8);
		assert_eq!(destroyed.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn unbounded_entries_survive_collection() {
		let destroyed = Arc::new(AtomicUsize::new(0));
		let d = destroyed.clone();
		let cache = Cache::<u32, u32>::new(move |_| {
			d.fetch_add(1, Ordering::Relaxed);
		});
		cache.insert_unbounded(1, 100);
		cache.collect(1_000_000, 1);
		assert_eq!(destroyed.load(Ordering::Relaxed), 0);
		assert_eq!(*cache.get_if_cached(&1).unwrap(), 100);
	}

	#[test]
	fn failed_creation_unclaims_the_key() {
		let cache = Cache::<u32, u32>::new(|_| {});
		assert!(cache.acquire(&1, 0, || Err(crate::Error::Message("nope".into()))).is_err());
		assert_eq!(*cache.acquire(&1, 0, || Ok(5)).unwrap(), 5);
	}

	#[test]
	fn concurrent_misses_converge() {
		let cache = Arc::new(Cache::<u32, u32>::new(|_| {}));
		let created = Arc::new(AtomicUsize::new(0));
		let threads: Vec<_> = (0..8)
			.map(|_| {
				let cache = cache.clone();
				let created = created.clone();
				std::thread::spawn(move || {
					let v = cache
						.acquire(&3, 0, || {
							created.fetch_add(1, Ordering::Relaxed);
							std::thread::sleep(std::time::Duration::from_millis(5));
							Ok(9)
						})
						.unwrap();
					assert_eq!(*v, 9);
				})
			})
			.collect();
		for t in threads {
			t.join().unwrap();
		}
		assert_eq!(created.load(Ordering::Relaxed), 1);
	}
}
