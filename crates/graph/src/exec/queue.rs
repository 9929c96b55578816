//! Per-queue submission over timeline semaphores.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use tracing::{span, Level};

use crate::{exec::signal::SyncPoint, sync::DomainFlags, Result};

/// A semaphore wait or signal with the stages it gates.
#[derive(Copy, Clone, Debug)]
pub struct SemaphoreOp {
	pub semaphore: vk::Semaphore,
	/// Ignored for binary semaphores.
	pub value: u64,
	pub stages: vk::PipelineStageFlags2,
}

/// Owns one device queue: its handle, its timeline semaphore, and the
/// monotonically increasing submit counter.
pub struct QueueExecutor {
	domain: DomainFlags,
	family: u32,
	queue: Mutex<vk::Queue>,
	semaphore: vk::Semaphore,
	value: AtomicU64,
}

impl QueueExecutor {
	pub fn new(device: &ash::Device, domain: DomainFlags, family: u32) -> Result<Self> {
		unsafe {
			let queue = Mutex::new(device.get_device_queue(family, 0));
			let semaphore = device.create_semaphore(
				&vk::SemaphoreCreateInfo::default().push_next(
					&mut vk::SemaphoreTypeCreateInfo::default()
						.semaphore_type(vk::SemaphoreType::TIMELINE)
						.initial_value(0),
				),
				None,
			)?;

			Ok(Self {
				domain,
				family,
				queue,
				semaphore,
				value: AtomicU64::new(0),
			})
		}
	}

	pub fn domain(&self) -> DomainFlags { self.domain }

	pub fn family(&self) -> u32 { self.family }

	pub fn semaphore(&self) -> vk::Semaphore { self.semaphore }

	pub fn queue(&self) -> MutexGuard<'_, vk::Queue> { self.queue.lock() }

	/// The latest point this queue has been told to signal.
	pub fn current(&self) -> SyncPoint {
		SyncPoint {
			domain: self.domain,
			value: self.value.load(Ordering::Acquire),
		}
	}

	/// Whether work submitted up to `point` has completed on the device.
	pub fn is_complete(&self, device: &ash::Device, point: SyncPoint) -> Result<bool> {
		debug_assert_eq!(point.domain, self.domain);
		let value = unsafe { device.get_semaphore_counter_value(self.semaphore)? };
		Ok(value >= point.value)
	}

	/// Block the host until `point`.
	pub fn wait(&self, device: &ash::Device, point: SyncPoint) -> Result<()> {
		debug_assert_eq!(point.domain, self.domain);
		let span = span!(Level::TRACE, "wait sync point");
		let _e = span.enter();
		unsafe {
			device.wait_semaphores(
				&vk::SemaphoreWaitInfo::default()
					.semaphores(std::slice::from_ref(&self.semaphore))
					.values(std::slice::from_ref(&point.value)),
				u64::MAX,
			)?;
		}
		Ok(())
	}

	/// Submit command buffers, waiting and signalling the given semaphores.
	/// The queue's own timeline is always signalled; the returned point marks
	/// this submission.
	pub fn submit(
		&self, device: &ash::Device, waits: &[SemaphoreOp], bufs: &[vk::CommandBuffer], signals: &[SemaphoreOp],
		fence: vk::Fence,
	) -> Result<SyncPoint> {
		let span = span!(Level::TRACE, "gpu submit");
		let _e = span.enter();

		let wait_infos: Vec<_> = waits
			.iter()
			.map(|w| {
				vk::SemaphoreSubmitInfo::default()
					.semaphore(w.semaphore)
					.value(w.value)
					.stage_mask(w.stages)
			})
			.collect();
		let buf_infos: Vec<_> = bufs
			.iter()
			.map(|&b| vk::CommandBufferSubmitInfo::default().command_buffer(b))
			.collect();
		let value = self.value.fetch_add(1, Ordering::Release) + 1;
		let signal_infos: Vec<_> = std::iter::once(
			vk::SemaphoreSubmitInfo::default()
				.semaphore(self.semaphore)
				.value(value)
				.stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
		)
		.chain(signals.iter().map(|s| {
			vk::SemaphoreSubmitInfo::default()
				.semaphore(s.semaphore)
				.value(s.value)
				.stage_mask(s.stages)
		}))
		.collect();

		unsafe {
			let span = span!(Level::TRACE, "driver submit");
			let _e = span.enter();
			let queue = self.queue.lock();
			device.queue_submit2(
				*queue,
				&[vk::SubmitInfo2::default()
					.wait_semaphore_infos(&wait_infos)
					.command_buffer_infos(&buf_infos)
					.signal_semaphore_infos(&signal_infos)],
				fence,
			)?;
		}

		Ok(SyncPoint {
			domain: self.domain,
			value,
		})
	}

	pub unsafe fn destroy(&self, device: &ash::Device) { device.destroy_semaphore(self.semaphore, None); }
}
