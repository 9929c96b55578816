//! The nested device resource hierarchy.
//!
//! A [`DeviceResource`] provides every kind of Vulkan object the runtime
//! allocates. Implementations nest: each one owns an upstream resource and
//! overrides only the capabilities it specializes, with the trait's default
//! methods forwarding everything else up the chain. The root of every chain is
//! a [`DeviceVkResource`], which calls Vulkan directly.
//!
//! The contract for nesting is lifetime-based: an allocator handed to a frame's
//! recording must keep the resources it hands out alive until that frame's
//! submission has completed on the GPU. [`SuperFrameResource`] implements this
//! by deferring deallocation across its frame ring.

use std::fmt::{self, Display};

use ash::vk;

pub use crate::alloc::{
	direct::DeviceVkResource,
	frame::{FrameResource, SuperFrameResource},
	linear::LinearBufferAllocator,
	suballoc::BufferSubAllocator,
};
use crate::resource::{Buffer, ImageView, MemoryUsage, Subrange};

mod direct;
mod frame;
mod linear;
mod suballoc;

/// A failed allocation, wrapping the underlying Vulkan error code.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocateError(pub vk::Result);

impl Display for AllocateError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<vk::Result> for AllocateError {
	fn from(result: vk::Result) -> Self { Self(result) }
}

pub type AllocateResult<T = ()> = std::result::Result<T, AllocateError>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BufferCreateInfo {
	pub size: u64,
	pub usage: vk::BufferUsageFlags,
	pub memory: MemoryUsage,
	pub alignment: u64,
}

impl Default for BufferCreateInfo {
	fn default() -> Self {
		Self {
			size: 0,
			usage: vk::BufferUsageFlags::empty(),
			memory: MemoryUsage::GpuOnly,
			alignment: 4,
		}
	}
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ImageCreateInfo {
	pub flags: vk::ImageCreateFlags,
	pub format: vk::Format,
	pub extent: vk::Extent3D,
	pub levels: u32,
	pub layers: u32,
	pub samples: vk::SampleCountFlags,
	pub usage: vk::ImageUsageFlags,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ImageViewCreateInfo {
	pub image: vk::Image,
	pub view_type: vk::ImageViewType,
	pub format: vk::Format,
	pub subrange: Subrange,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct CommandPoolCreateInfo {
	pub flags: vk::CommandPoolCreateFlags,
	pub queue_family: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct CommandBufferCreateInfo {
	pub pool: vk::CommandPool,
	pub level: vk::CommandBufferLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct TimestampQueryPoolCreateInfo {
	pub count: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct TimestampQueryPool {
	pub pool: vk::QueryPool,
	pub count: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct TimestampQuery {
	pub pool: vk::QueryPool,
	pub index: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct TimestampQueryCreateInfo {
	pub pool: TimestampQueryPool,
	pub index: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct AccelerationStructureCreateInfo {
	pub flags: vk::AccelerationStructureCreateFlagsKHR,
	pub ty: vk::AccelerationStructureTypeKHR,
	pub buffer: vk::Buffer,
	pub offset: u64,
	pub size: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DescriptorSetCreateInfo {
	pub pool: vk::DescriptorPool,
	pub layout: vk::DescriptorSetLayout,
}

#[derive(Clone, Debug, Default)]
pub struct PersistentDescriptorSetCreateInfo {
	pub layout: vk::DescriptorSetLayout,
	pub pool_sizes: Vec<vk::DescriptorPoolSize>,
}

/// A persistent descriptor set with its backing pool and pending write set.
#[derive(Debug, Default)]
pub struct PersistentDescriptorSet {
	pub set: vk::DescriptorSet,
	pub layout: vk::DescriptorSetLayout,
	pub pool: vk::DescriptorPool,
	pub(crate) pending: parking_lot::Mutex<Vec<crate::exec::descriptor::PendingWrite>>,
}

/// The full capability set of a resource provider.
///
/// Every `allocate_*` fills `dst` one-for-one from `cis` or fails, rolling back
/// anything it partially created. Every `deallocate_*` accepts only values the
/// same resource (or its chain) allocated.
pub trait DeviceResource {
	/// The next resource in the chain. The root implementation overrides every
	/// method, so the default bodies below never reach it.
	fn upstream(&self) -> &dyn DeviceResource;

	fn allocate_semaphores(&self, dst: &mut [vk::Semaphore]) -> AllocateResult {
		self.upstream().allocate_semaphores(dst)
	}

	fn deallocate_semaphores(&self, src: &[vk::Semaphore]) { self.upstream().deallocate_semaphores(src) }

	fn allocate_timeline_semaphores(&self, dst: &mut [vk::Semaphore], initial: &[u64]) -> AllocateResult {
		self.upstream().allocate_timeline_semaphores(dst, initial)
	}

	fn deallocate_timeline_semaphores(&self, src: &[vk::Semaphore]) {
		self.upstream().deallocate_timeline_semaphores(src)
	}

	fn allocate_fences(&self, dst: &mut [vk::Fence]) -> AllocateResult { self.upstream().allocate_fences(dst) }

	fn deallocate_fences(&self, src: &[vk::Fence]) { self.upstream().deallocate_fences(src) }

	fn allocate_command_pools(&self, dst: &mut [vk::CommandPool], cis: &[CommandPoolCreateInfo]) -> AllocateResult {
		self.upstream().allocate_command_pools(dst, cis)
	}

	fn deallocate_command_pools(&self, src: &[vk::CommandPool]) { self.upstream().deallocate_command_pools(src) }

	fn allocate_command_buffers(
		&self, dst: &mut [vk::CommandBuffer], cis: &[CommandBufferCreateInfo],
	) -> AllocateResult {
		self.upstream().allocate_command_buffers(dst, cis)
	}

	fn deallocate_command_buffers(&self, src: &[vk::CommandBuffer], pool: vk::CommandPool) {
		self.upstream().deallocate_command_buffers(src, pool)
	}

	fn allocate_buffers(&self, dst: &mut [Buffer], cis: &[BufferCreateInfo]) -> AllocateResult {
		self.upstream().allocate_buffers(dst, cis)
	}

	fn deallocate_buffers(&self, src: &[Buffer]) { self.upstream().deallocate_buffers(src) }

	fn allocate_images(&self, dst: &mut [vk::Image], cis: &[ImageCreateInfo]) -> AllocateResult {
		self.upstream().allocate_images(dst, cis)
	}

	fn deallocate_images(&self, src: &[vk::Image]) { self.upstream().deallocate_images(src) }

	fn allocate_image_views(&self, dst: &mut [ImageView], cis: &[ImageViewCreateInfo]) -> AllocateResult {
		self.upstream().allocate_image_views(dst, cis)
	}

	fn deallocate_image_views(&self, src: &[ImageView]) { self.upstream().deallocate_image_views(src) }

	fn allocate_timestamp_query_pools(
		&self, dst: &mut [TimestampQueryPool], cis: &[TimestampQueryPoolCreateInfo],
	) -> AllocateResult {
		self.upstream().allocate_timestamp_query_pools(dst, cis)
	}

	fn deallocate_timestamp_query_pools(&self, src: &[TimestampQueryPool]) {
		self.upstream().deallocate_timestamp_query_pools(src)
	}

	fn allocate_timestamp_queries(
		&self, dst: &mut [TimestampQuery], cis: &[TimestampQueryCreateInfo],
	) -> AllocateResult {
		self.upstream().allocate_timestamp_queries(dst, cis)
	}

	fn deallocate_timestamp_queries(&self, src: &[TimestampQuery]) {
		self.upstream().deallocate_timestamp_queries(src)
	}

	fn allocate_acceleration_structures(
		&self, dst: &mut [vk::AccelerationStructureKHR], cis: &[AccelerationStructureCreateInfo],
	) -> AllocateResult {
		self.upstream().allocate_acceleration_structures(dst, cis)
	}

	fn deallocate_acceleration_structures(&self, src: &[vk::AccelerationStructureKHR]) {
		self.upstream().deallocate_acceleration_structures(src)
	}

	fn allocate_graphics_pipelines(
		&self, dst: &mut [vk::Pipeline], cis: &[vk::GraphicsPipelineCreateInfo<'_>],
	) -> AllocateResult {
		self.upstream().allocate_graphics_pipelines(dst, cis)
	}

	fn allocate_compute_pipelines(
		&self, dst: &mut [vk::Pipeline], cis: &[vk::ComputePipelineCreateInfo<'_>],
	) -> AllocateResult {
		self.upstream().allocate_compute_pipelines(dst, cis)
	}

	fn allocate_ray_tracing_pipelines(
		&self, dst: &mut [vk::Pipeline], cis: &[vk::RayTracingPipelineCreateInfoKHR<'_>],
	) -> AllocateResult {
		self.upstream().allocate_ray_tracing_pipelines(dst, cis)
	}

	fn deallocate_pipelines(&self, src: &[vk::Pipeline]) { self.upstream().deallocate_pipelines(src) }

	fn allocate_descriptor_sets(
		&self, dst: &mut [vk::DescriptorSet], cis: &[DescriptorSetCreateInfo],
	) -> AllocateResult {
		self.upstream().allocate_descriptor_sets(dst, cis)
	}

	fn deallocate_descriptor_sets(&self, src: &[vk::DescriptorSet], pool: vk::DescriptorPool) {
		self.upstream().deallocate_descriptor_sets(src, pool)
	}

	fn allocate_persistent_descriptor_sets(
		&self, dst: &mut [PersistentDescriptorSet], cis: &[PersistentDescriptorSetCreateInfo],
	) -> AllocateResult {
		self.upstream().allocate_persistent_descriptor_sets(dst, cis)
	}

	fn deallocate_persistent_descriptor_sets(&self, src: &[PersistentDescriptorSet]) {
		self.upstream().deallocate_persistent_descriptor_sets(src)
	}

	fn allocate_swapchains(
		&self, dst: &mut [vk::SwapchainKHR], cis: &[vk::SwapchainCreateInfoKHR<'_>],
	) -> AllocateResult {
		self.upstream().allocate_swapchains(dst, cis)
	}

	fn deallocate_swapchains(&self, src: &[vk::SwapchainKHR]) { self.upstream().deallocate_swapchains(src) }
}

/// The façade applications hold; a thin handle over one resource chain.
#[derive(Copy, Clone)]
pub struct Allocator<'r> {
	resource: &'r dyn DeviceResource,
}

impl<'r> Allocator<'r> {
	pub fn new(resource: &'r dyn DeviceResource) -> Self { Self { resource } }

	pub fn resource(&self) -> &'r dyn DeviceResource { self.resource }

	pub fn allocate_buffer(&self, ci: BufferCreateInfo) -> AllocateResult<Buffer> {
		let mut dst = [Buffer::default()];
		self.resource.allocate_buffers(&mut dst, &[ci])?;
		Ok(dst[0])
	}

	pub fn deallocate_buffer(&self, buffer: Buffer) { self.resource.deallocate_buffers(&[buffer]) }

	pub fn allocate_image(&self, ci: ImageCreateInfo) -> AllocateResult<vk::Image> {
		let mut dst = [vk::Image::null()];
		self.resource.allocate_images(&mut dst, &[ci])?;
		Ok(dst[0])
	}

	pub fn deallocate_image(&self, image: vk::Image) { self.resource.deallocate_images(&[image]) }

	pub fn allocate_image_view(&self, ci: ImageViewCreateInfo) -> AllocateResult<ImageView> {
		let mut dst = [ImageView::default()];
		self.resource.allocate_image_views(&mut dst, &[ci])?;
		Ok(dst[0])
	}

	pub fn allocate_semaphore(&self) -> AllocateResult<vk::Semaphore> {
		let mut dst = [vk::Semaphore::null()];
		self.resource.allocate_semaphores(&mut dst)?;
		Ok(dst[0])
	}

	pub fn allocate_fence(&self) -> AllocateResult<vk::Fence> {
		let mut dst = [vk::Fence::null()];
		self.resource.allocate_fences(&mut dst)?;
		Ok(dst[0])
	}

	pub fn allocate_command_pool(&self, ci: CommandPoolCreateInfo) -> AllocateResult<vk::CommandPool> {
		let mut dst = [vk::CommandPool::null()];
		self.resource.allocate_command_pools(&mut dst, &[ci])?;
		Ok(dst[0])
	}

	pub fn allocate_command_buffer(&self, ci: CommandBufferCreateInfo) -> AllocateResult<vk::CommandBuffer> {
		let mut dst = [vk::CommandBuffer::null()];
		self.resource.allocate_command_buffers(&mut dst, &[ci])?;
		Ok(dst[0])
	}

	pub fn allocate_timestamp_query_pool(&self, ci: TimestampQueryPoolCreateInfo) -> AllocateResult<TimestampQueryPool> {
		let mut dst = [TimestampQueryPool::default()];
		self.resource.allocate_timestamp_query_pools(&mut dst, &[ci])?;
		Ok(dst[0])
	}
}

impl<'r> std::ops::Deref for Allocator<'r> {
	type Target = dyn DeviceResource + 'r;

	fn deref(&self) -> &Self::Target { self.resource }
}

#[cfg(test)]
pub(crate) mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};

	use ash::vk::Handle;
	use parking_lot::Mutex;
	use rustc_hash::FxHashSet;

	use super::*;

	/// A root resource that mints fake handles, for exercising the nested
	/// allocators without a device.
	#[derive(Default)]
	pub struct MockResource {
		next: AtomicU64,
		buffers: Mutex<FxHashSet<u64>>,
		fences: Mutex<FxHashSet<u64>>,
	}

	impl MockResource {
		fn fresh(&self) -> u64 { self.next.fetch_add(1, Ordering::Relaxed) + 1 }

		pub fn live_buffers(&self) -> usize { self.buffers.lock().len() }

		pub fn live_fences(&self) -> usize { self.fences.lock().len() }
	}

	impl DeviceResource for MockResource {
		fn upstream(&self) -> &dyn DeviceResource { self }

		fn allocate_buffers(&self, dst: &mut [Buffer], cis: &[BufferCreateInfo]) -> AllocateResult {
			for (slot, ci) in dst.iter_mut().zip(cis) {
				let raw = self.fresh();
				self.buffers.lock().insert(raw);
				*slot = Buffer {
					buffer: vk::Buffer::from_raw(raw),
					offset: 0,
					size: ci.size,
					device_address: raw << 32,
					mapped: std::ptr::null_mut(),
				};
			}
			Ok(())
		}

		fn deallocate_buffers(&self, src: &[Buffer]) {
			let mut buffers = self.buffers.lock();
			for buffer in src {
				buffers.remove(&buffer.buffer.as_raw());
			}
		}

		fn allocate_fences(&self, dst: &mut [vk::Fence]) -> AllocateResult {
			for slot in dst {
				let raw = self.fresh();
				self.fences.lock().insert(raw);
				*slot = vk::Fence::from_raw(raw);
			}
			Ok(())
		}

		fn deallocate_fences(&self, src: &[vk::Fence]) {
			let mut fences = self.fences.lock();
			for fence in src {
				fences.remove(&fence.as_raw());
			}
		}

		fn deallocate_semaphores(&self, _src: &[vk::Semaphore]) {}

		fn deallocate_command_pools(&self, _src: &[vk::CommandPool]) {}

		fn deallocate_command_buffers(&self, _src: &[vk::CommandBuffer], _pool: vk::CommandPool) {}

		fn deallocate_images(&self, _src: &[vk::Image]) {}

		fn deallocate_image_views(&self, _src: &[ImageView]) {}

		fn deallocate_timestamp_query_pools(&self, _src: &[TimestampQueryPool]) {}

		fn deallocate_acceleration_structures(&self, _src: &[vk::AccelerationStructureKHR]) {}

		fn deallocate_pipelines(&self, _src: &[vk::Pipeline]) {}

		fn deallocate_descriptor_sets(&self, _src: &[vk::DescriptorSet], _pool: vk::DescriptorPool) {}

		fn deallocate_persistent_descriptor_sets(&self, _src: &[PersistentDescriptorSet]) {}

		fn deallocate_swapchains(&self, _src: &[vk::SwapchainKHR]) {}
	}
}
