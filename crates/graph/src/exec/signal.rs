//! Re-armable tokens tying graph results to points on queue timelines.

use parking_lot::Mutex;

use crate::{ir::ConstantValue, sync::DomainFlags, sync::ResourceUse};

/// A point on one queue's timeline semaphore.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct SyncPoint {
	/// The queue that signals; a single-queue domain.
	pub domain: DomainFlags,
	pub value: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum SignalStatus {
	/// Not yet submitted; the producing graph must run first.
	#[default]
	Disarmed,
	/// Submitted; consumers synchronize against [`Signal::sync_point`].
	Synchronizable,
	/// The host has observed completion; values may be read directly.
	HostAvailable,
}

struct Inner {
	status: SignalStatus,
	source: SyncPoint,
	/// The values produced by the signalling node, one per result slot.
	values: Vec<ConstantValue>,
	/// How each result was last used, for the acquiring graph's first barrier.
	last_use: Vec<ResourceUse>,
}

/// The arming state shared between an `ExtNode`, the node that signals it, and
/// everything waiting on it.
pub struct Signal {
	inner: Mutex<Inner>,
}

impl Signal {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner {
				status: SignalStatus::Disarmed,
				source: SyncPoint::default(),
				values: Vec::new(),
				last_use: Vec::new(),
			}),
		}
	}

	pub fn status(&self) -> SignalStatus { self.inner.lock().status }

	pub fn sync_point(&self) -> SyncPoint { self.inner.lock().source }

	/// Stamp the submission point and the produced values; consumers may now
	/// synchronize.
	pub fn arm(&self, source: SyncPoint, values: Vec<ConstantValue>, last_use: Vec<ResourceUse>) {
		let mut inner = self.inner.lock();
		inner.status = SignalStatus::Synchronizable;
		inner.source = source;
		inner.values = values;
		inner.last_use = last_use;
	}

	/// Mark the point as host-observed.
	pub fn set_host_available(&self) {
		let mut inner = self.inner.lock();
		debug_assert!(inner.status != SignalStatus::Disarmed, "signal was never armed");
		inner.status = SignalStatus::HostAvailable;
	}

	/// Reset to disarmed for reuse by a new submission.
	pub fn disarm(&self) {
		let mut inner = self.inner.lock();
		inner.status = SignalStatus::Disarmed;
		inner.values.clear();
		inner.last_use.clear();
	}

	pub fn value(&self, index: usize) -> Option<ConstantValue> { self.inner.lock().values.get(index).cloned() }

	pub fn values(&self) -> Vec<ConstantValue> { self.inner.lock().values.clone() }

	pub fn last_use(&self, index: usize) -> Option<ResourceUse> { self.inner.lock().last_use.get(index).copied() }
}

impl Default for Signal {
	fn default() -> Self { Self::new() }
}
