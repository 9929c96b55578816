//! Per-frame resource recycling.
//!
//! Deallocation through a [`FrameResource`] is deferred: handles are parked in
//! the frame's queues and only released upstream once the frame comes around
//! again in the ring, by which point its submissions have completed on the GPU.

use ash::vk;
use parking_lot::Mutex;
use tracing::{span, Level};

use crate::{
	alloc::{
		AllocateResult,
		BufferCreateInfo,
		DeviceResource,
		LinearBufferAllocator,
		PersistentDescriptorSet,
		TimestampQueryPool,
	},
	resource::{Buffer, ImageView, MemoryUsage},
	runtime::Runtime,
	Result,
};

#[derive(Default)]
struct Deferred {
	semaphores: Vec<vk::Semaphore>,
	fences: Vec<vk::Fence>,
	command_pools: Vec<vk::CommandPool>,
	command_buffers: Vec<(vk::CommandPool, vk::CommandBuffer)>,
	buffers: Vec<Buffer>,
	images: Vec<vk::Image>,
	image_views: Vec<ImageView>,
	query_pools: Vec<TimestampQueryPool>,
	accels: Vec<vk::AccelerationStructureKHR>,
	pipelines: Vec<vk::Pipeline>,
	descriptor_sets: Vec<(vk::DescriptorPool, vk::DescriptorSet)>,
	persistent_sets: Vec<PersistentDescriptorSet>,
	swapchains: Vec<vk::SwapchainKHR>,
}

/// One slot of the frame ring.
///
/// Allocations forward upstream; deallocations are deferred until the slot is
/// recycled. Host-visible scratch comes from a per-frame linear allocator that
/// is reset wholesale on recycle.
pub struct FrameResource<'u> {
	upstream: &'u dyn DeviceResource,
	deferred: Mutex<Deferred>,
	/// Fences handed out this frame; waited before the slot is reused.
	inflight: Mutex<Vec<vk::Fence>>,
	free_fences: Mutex<Vec<vk::Fence>>,
	upload: LinearBufferAllocator<'u>,
}

impl<'u> FrameResource<'u> {
	fn new(upstream: &'u dyn DeviceResource) -> Self {
		Self {
			upstream,
			deferred: Mutex::new(Deferred::default()),
			inflight: Mutex::new(Vec::new()),
			free_fences: Mutex::new(Vec::new()),
			upload: LinearBufferAllocator::new(
				upstream,
				MemoryUsage::CpuToGpu,
				vk::BufferUsageFlags::TRANSFER_SRC
					| vk::BufferUsageFlags::STORAGE_BUFFER
					| vk::BufferUsageFlags::UNIFORM_BUFFER
					| vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
			),
		}
	}

	/// The frame's linear upload arena.
	pub fn upload(&self) -> &LinearBufferAllocator<'u> { &self.upload }

	fn wait_and_recycle(&self, runtime: Option<&Runtime>) -> Result<()> {
		let inflight = std::mem::take(&mut *self.inflight.lock());
		if let Some(runtime) = runtime {
			if !inflight.is_empty() {
				let span = span!(Level::TRACE, "wait frame fences");
				let _e = span.enter();
				unsafe {
					runtime.device().wait_for_fences(&inflight, true, u64::MAX)?;
					runtime.device().reset_fences(&inflight)?;
				}
			}
		}
		self.free_fences.lock().extend(inflight);

		let deferred = std::mem::take(&mut *self.deferred.lock());
		self.upstream.deallocate_semaphores(&deferred.semaphores);
		self.upstream.deallocate_fences(&deferred.fences);
		for (pool, buf) in deferred.command_buffers {
			self.upstream.deallocate_command_buffers(&[buf], pool);
		}
		self.upstream.deallocate_command_pools(&deferred.command_pools);
		self.upstream.deallocate_buffers(&deferred.buffers);
		self.upstream.deallocate_image_views(&deferred.image_views);
		self.upstream.deallocate_images(&deferred.images);
		self.upstream.deallocate_timestamp_query_pools(&deferred.query_pools);
		self.upstream.deallocate_acceleration_structures(&deferred.accels);
		self.upstream.deallocate_pipelines(&deferred.pipelines);
		for (pool, set) in deferred.descriptor_sets {
			self.upstream.deallocate_descriptor_sets(&[set], pool);
		}
		self.upstream.deallocate_persistent_descriptor_sets(&deferred.persistent_sets);
		self.upstream.deallocate_swapchains(&deferred.swapchains);

		self.upload.reset();
		Ok(())
	}

	fn release(&self) {
		// Final teardown: nothing is in flight anymore, release everything.
		let _ = self.wait_and_recycle(None);
		let fences = std::mem::take(&mut *self.free_fences.lock());
		self.upstream.deallocate_fences(&fences);
		self.upload.free();
	}
}

impl DeviceResource for FrameResource<'_> {
	fn upstream(&self) -> &dyn DeviceResource { self.upstream }

	fn allocate_fences(&self, dst: &mut [vk::Fence]) -> AllocateResult {
		let mut free = self.free_fences.lock();
		let reused = free.len().min(dst.len());
		let free_len = free.len();
		for (slot, fence) in dst[..reused].iter_mut().zip(free.drain(free_len - reused..)) {
			*slot = fence;
		}
		drop(free);
		self.upstream.allocate_fences(&mut dst[reused..])?;
		self.inflight.lock().extend_from_slice(dst);
		Ok(())
	}

	// The fence stays in the in-flight set; it is waited and recycled when the
	// frame comes around.
	fn deallocate_fences(&self, _src: &[vk::Fence]) {}

	fn deallocate_semaphores(&self, src: &[vk::Semaphore]) { self.deferred.lock().semaphores.extend_from_slice(src) }

	fn deallocate_timeline_semaphores(&self, src: &[vk::Semaphore]) { self.deallocate_semaphores(src) }

	fn deallocate_command_pools(&self, src: &[vk::CommandPool]) {
		self.deferred.lock().command_pools.extend_from_slice(src)
	}

	fn deallocate_command_buffers(&self, src: &[vk::CommandBuffer], pool: vk::CommandPool) {
		self.deferred
			.lock()
			.command_buffers
			.extend(src.iter().map(|&buf| (pool, buf)))
	}

	fn deallocate_buffers(&self, src: &[Buffer]) { self.deferred.lock().buffers.extend_from_slice(src) }

	fn deallocate_images(&self, src: &[vk::Image]) { self.deferred.lock().images.extend_from_slice(src) }

	fn deallocate_image_views(&self, src: &[ImageView]) { self.deferred.lock().image_views.extend_from_slice(src) }

	fn deallocate_timestamp_query_pools(&self, src: &[TimestampQueryPool]) {
		self.deferred.lock().query_pools.extend_from_slice(src)
	}

	fn deallocate_acceleration_structures(&self, src: &[vk::AccelerationStructureKHR]) {
		self.deferred.lock().accels.extend_from_slice(src)
	}

	fn deallocate_pipelines(&self, src: &[vk::Pipeline]) { self.deferred.lock().pipelines.extend_from_slice(src) }

	fn deallocate_descriptor_sets(&self, src: &[vk::DescriptorSet], pool: vk::DescriptorPool) {
		self.deferred
			.lock()
			.descriptor_sets
			.extend(src.iter().map(|&set| (pool, set)))
	}

	fn deallocate_persistent_descriptor_sets(&self, src: &[PersistentDescriptorSet]) {
		let mut deferred = self.deferred.lock();
		for set in src {
			deferred.persistent_sets.push(PersistentDescriptorSet {
				set: set.set,
				layout: set.layout,
				pool: set.pool,
				pending: Default::default(),
			});
		}
	}

	fn deallocate_swapchains(&self, src: &[vk::SwapchainKHR]) {
		self.deferred.lock().swapchains.extend_from_slice(src)
	}
}

/// `N` rotating [`FrameResource`]s.
pub struct SuperFrameResource<'u> {
	frames: Vec<FrameResource<'u>>,
	current: usize,
	counter: u64,
}

impl<'u> SuperFrameResource<'u> {
	pub fn new(upstream: &'u dyn DeviceResource, frames_in_flight: usize) -> Self {
		assert!(frames_in_flight >= 1, "need at least one frame in flight");
		Self {
			frames: (0..frames_in_flight).map(|_| FrameResource::new(upstream)).collect(),
			current: 0,
			counter: 0,
		}
	}

	pub fn frames_in_flight(&self) -> usize { self.frames.len() }

	/// Monotonic count of completed frame advances.
	pub fn frame_counter(&self) -> u64 { self.counter }

	/// The frame resource to allocate the current frame's work from.
	pub fn frame(&self) -> &FrameResource<'u> { &self.frames[self.current] }

	/// Advance the ring: wait for the oldest frame's fences, drain its deferred
	/// deallocations upstream, reset its linear allocators and hand it out as
	/// the new current frame.
	pub fn next_frame(&mut self, runtime: &Runtime) -> Result<&FrameResource<'u>> {
		self.advance(Some(runtime))
	}

	pub(crate) fn advance(&mut self, runtime: Option<&Runtime>) -> Result<&FrameResource<'u>> {
		self.current = (self.current + 1) % self.frames.len();
		self.counter += 1;
		self.frames[self.current].wait_and_recycle(runtime)?;
		Ok(&self.frames[self.current])
	}
}

impl Drop for SuperFrameResource<'_> {
	fn drop(&mut self) {
		for frame in &self.frames {
			frame.release();
		}
	}
}

impl DeviceResource for SuperFrameResource<'_> {
	fn upstream(&self) -> &dyn DeviceResource { self.frame() }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::alloc::tests::MockResource;

	#[test]
	fn deallocation_is_deferred_by_the_ring() {
		let mock = MockResource::default();
		let mut sf = SuperFrameResource::new(&mock, 2);

		let mut bufs = [Buffer::default()];
		sf.frame()
			.allocate_buffers(&mut bufs, &[BufferCreateInfo {
				size: 128,
				..BufferCreateInfo::default()
			}])
			.unwrap();
		assert_eq!(mock.live_buffers(), 1);

		sf.frame().deallocate_buffers(&bufs);
		// Still alive: the GPU may be reading it.
		assert_eq!(mock.live_buffers(), 1);

		sf.advance(None).unwrap();
		// One frame later it is still possibly in flight.
		assert_eq!(mock.live_buffers(), 1);

		sf.advance(None).unwrap();
		// The ring came around; now it is gone.
		assert_eq!(mock.live_buffers(), 0);
	}

	#[test]
	fn fences_are_recycled() {
		let mock = MockResource::default();
		let mut sf = SuperFrameResource::new(&mock, 2);

		let mut fences = [vk::Fence::null()];
		sf.frame().allocate_fences(&mut fences).unwrap();
		let first = fences[0];
		assert_eq!(mock.live_fences(), 1);

		sf.advance(None).unwrap();
		sf.advance(None).unwrap();

		let mut fences = [vk::Fence::null()];
		sf.frame().allocate_fences(&mut fences).unwrap();
		assert_eq!(fences[0], first);
		assert_eq!(mock.live_fences(), 1);
	}
}
