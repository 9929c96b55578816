//! The root of every resource chain: direct Vulkan allocation.

use ash::vk;
use gpu_allocator::{
	vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
	MemoryLocation,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{
	alloc::{
		AccelerationStructureCreateInfo,
		AllocateError,
		AllocateResult,
		BufferCreateInfo,
		CommandBufferCreateInfo,
		CommandPoolCreateInfo,
		DescriptorSetCreateInfo,
		DeviceResource,
		ImageCreateInfo,
		ImageViewCreateInfo,
		PersistentDescriptorSet,
		PersistentDescriptorSetCreateInfo,
		TimestampQuery,
		TimestampQueryCreateInfo,
		TimestampQueryPool,
		TimestampQueryPoolCreateInfo,
	},
	resource::{Buffer, ImageView, MemoryUsage},
	runtime::Runtime,
	types::format_to_aspect,
};

fn location(memory: MemoryUsage) -> MemoryLocation {
	match memory {
		MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
		MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
		MemoryUsage::GpuToCpu | MemoryUsage::CpuOnly => MemoryLocation::GpuToCpu,
	}
}

/// Calls Vulkan for every capability; memory comes from the runtime's
/// device-memory allocator.
pub struct DeviceVkResource {
	runtime: Runtime,
	buffer_allocs: Mutex<FxHashMap<vk::Buffer, Allocation>>,
	image_allocs: Mutex<FxHashMap<vk::Image, Allocation>>,
}

impl DeviceVkResource {
	pub fn new(runtime: &Runtime) -> Self {
		Self {
			runtime: runtime.clone(),
			buffer_allocs: Mutex::new(FxHashMap::default()),
			image_allocs: Mutex::new(FxHashMap::default()),
		}
	}

	pub fn runtime(&self) -> &Runtime { &self.runtime }

	unsafe fn create_buffer(&self, ci: &BufferCreateInfo) -> AllocateResult<Buffer> {
		let device = self.runtime.device();
		let buffer = device
			.create_buffer(
				&vk::BufferCreateInfo::default()
					.size(ci.size)
					.usage(ci.usage)
					.sharing_mode(vk::SharingMode::EXCLUSIVE),
				None,
			)
			.map_err(AllocateError)?;

		let requirements = device.get_buffer_memory_requirements(buffer);
		let alloc = self
			.runtime
			.memory()
			.allocate(&AllocationCreateDesc {
				name: "buffer",
				requirements: vk::MemoryRequirements {
					alignment: requirements.alignment.max(ci.alignment),
					..requirements
				},
				location: location(ci.memory),
				linear: true,
				allocation_scheme: AllocationScheme::GpuAllocatorManaged,
			})
			.map_err(|_| AllocateError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;

		if let Err(err) = device.bind_buffer_memory(buffer, alloc.memory(), alloc.offset()) {
			let _ = self.runtime.memory().free(alloc);
			device.destroy_buffer(buffer, None);
			return Err(AllocateError(err));
		}

		let device_address = if ci.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
			device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
		} else {
			0
		};
		let mapped = alloc
			.mapped_ptr()
			.map(|p| p.as_ptr() as *mut u8)
			.unwrap_or(std::ptr::null_mut());

		self.buffer_allocs.lock().insert(buffer, alloc);
		Ok(Buffer {
			buffer,
			offset: 0,
			size: ci.size,
			device_address,
			mapped,
		})
	}

	unsafe fn create_image(&self, ci: &ImageCreateInfo) -> AllocateResult<vk::Image> {
		let device = self.runtime.device();
		let image = device
			.create_image(
				&vk::ImageCreateInfo::default()
					.flags(ci.flags)
					.image_type(if ci.extent.depth > 1 {
						vk::ImageType::TYPE_3D
					} else {
						vk::ImageType::TYPE_2D
					})
					.format(ci.format)
					.extent(ci.extent)
					.mip_levels(ci.levels)
					.array_layers(ci.layers)
					.samples(ci.samples)
					.usage(ci.usage)
					.sharing_mode(vk::SharingMode::EXCLUSIVE)
					.initial_layout(vk::ImageLayout::UNDEFINED),
				None,
			)
			.map_err(AllocateError)?;

		let mut dedicated = vk::MemoryDedicatedRequirements::default();
		let mut out = vk::MemoryRequirements2::default().push_next(&mut dedicated);
		device.get_image_memory_requirements2(&vk::ImageMemoryRequirementsInfo2::default().image(image), &mut out);

		let alloc = self
			.runtime
			.memory()
			.allocate(&AllocationCreateDesc {
				name: "image",
				requirements: out.memory_requirements,
				location: MemoryLocation::GpuOnly,
				linear: false,
				allocation_scheme: if dedicated.prefers_dedicated_allocation != 0
					|| dedicated.requires_dedicated_allocation != 0
				{
					AllocationScheme::DedicatedImage(image)
				} else {
					AllocationScheme::GpuAllocatorManaged
				},
			})
			.map_err(|_| AllocateError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;

		if let Err(err) = device.bind_image_memory(image, alloc.memory(), alloc.offset()) {
			let _ = self.runtime.memory().free(alloc);
			device.destroy_image(image, None);
			return Err(AllocateError(err));
		}

		self.image_allocs.lock().insert(image, alloc);
		Ok(image)
	}
}

impl DeviceResource for DeviceVkResource {
	fn upstream(&self) -> &dyn DeviceResource { self }

	fn allocate_semaphores(&self, dst: &mut [vk::Semaphore]) -> AllocateResult {
		let device = self.runtime.device();
		for i in 0..dst.len() {
			match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
				Ok(sem) => dst[i] = sem,
				Err(err) => {
					self.deallocate_semaphores(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_semaphores(&self, src: &[vk::Semaphore]) {
		let device = self.runtime.device();
		for &sem in src {
			unsafe { device.destroy_semaphore(sem, None) };
		}
	}

	fn allocate_timeline_semaphores(&self, dst: &mut [vk::Semaphore], initial: &[u64]) -> AllocateResult {
		let device = self.runtime.device();
		for i in 0..dst.len() {
			let res = unsafe {
				device.create_semaphore(
					&vk::SemaphoreCreateInfo::default().push_next(
						&mut vk::SemaphoreTypeCreateInfo::default()
							.semaphore_type(vk::SemaphoreType::TIMELINE)
							.initial_value(initial.get(i).copied().unwrap_or(0)),
					),
					None,
				)
			};
			match res {
				Ok(sem) => dst[i] = sem,
				Err(err) => {
					self.deallocate_semaphores(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_timeline_semaphores(&self, src: &[vk::Semaphore]) { self.deallocate_semaphores(src) }

	fn allocate_fences(&self, dst: &mut [vk::Fence]) -> AllocateResult {
		let device = self.runtime.device();
		for i in 0..dst.len() {
			match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
				Ok(fence) => dst[i] = fence,
				Err(err) => {
					self.deallocate_fences(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_fences(&self, src: &[vk::Fence]) {
		let device = self.runtime.device();
		for &fence in src {
			unsafe { device.destroy_fence(fence, None) };
		}
	}

	fn allocate_command_pools(&self, dst: &mut [vk::CommandPool], cis: &[CommandPoolCreateInfo]) -> AllocateResult {
		let device = self.runtime.device();
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				device.create_command_pool(
					&vk::CommandPoolCreateInfo::default()
						.flags(ci.flags)
						.queue_family_index(ci.queue_family),
					None,
				)
			};
			match res {
				Ok(pool) => dst[i] = pool,
				Err(err) => {
					self.deallocate_command_pools(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_command_pools(&self, src: &[vk::CommandPool]) {
		let device = self.runtime.device();
		for &pool in src {
			unsafe { device.destroy_command_pool(pool, None) };
		}
	}

	fn allocate_command_buffers(
		&self, dst: &mut [vk::CommandBuffer], cis: &[CommandBufferCreateInfo],
	) -> AllocateResult {
		let device = self.runtime.device();
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				device.allocate_command_buffers(
					&vk::CommandBufferAllocateInfo::default()
						.command_pool(ci.pool)
						.level(ci.level)
						.command_buffer_count(1),
				)
			};
			match res {
				Ok(bufs) => dst[i] = bufs[0],
				Err(err) => return Err(AllocateError(err)),
			}
		}
		Ok(())
	}

	fn deallocate_command_buffers(&self, src: &[vk::CommandBuffer], pool: vk::CommandPool) {
		if !src.is_empty() {
			unsafe { self.runtime.device().free_command_buffers(pool, src) };
		}
	}

	fn allocate_buffers(&self, dst: &mut [Buffer], cis: &[BufferCreateInfo]) -> AllocateResult {
		for (i, ci) in cis.iter().enumerate() {
			match unsafe { self.create_buffer(ci) } {
				Ok(buffer) => dst[i] = buffer,
				Err(err) => {
					self.deallocate_buffers(&dst[..i]);
					return Err(err);
				},
			}
		}
		Ok(())
	}

	fn deallocate_buffers(&self, src: &[Buffer]) {
		let device = self.runtime.device();
		for buffer in src {
			if buffer.buffer == vk::Buffer::null() {
				continue;
			}
			if let Some(alloc) = self.buffer_allocs.lock().remove(&buffer.buffer) {
				let _ = self.runtime.memory().free(alloc);
				unsafe { device.destroy_buffer(buffer.buffer, None) };
			}
		}
	}

	fn allocate_images(&self, dst: &mut [vk::Image], cis: &[ImageCreateInfo]) -> AllocateResult {
		for (i, ci) in cis.iter().enumerate() {
			match unsafe { self.create_image(ci) } {
				Ok(image) => dst[i] = image,
				Err(err) => {
					self.deallocate_images(&dst[..i]);
					return Err(err);
				},
			}
		}
		Ok(())
	}

	fn deallocate_images(&self, src: &[vk::Image]) {
		let device = self.runtime.device();
		for &image in src {
			if image == vk::Image::null() {
				continue;
			}
			if let Some(alloc) = self.image_allocs.lock().remove(&image) {
				let _ = self.runtime.memory().free(alloc);
				unsafe { device.destroy_image(image, None) };
			}
		}
	}

	fn allocate_image_views(&self, dst: &mut [ImageView], cis: &[ImageViewCreateInfo]) -> AllocateResult {
		let device = self.runtime.device();
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				device.create_image_view(
					&vk::ImageViewCreateInfo::default()
						.image(ci.image)
						.view_type(ci.view_type)
						.format(ci.format)
						.subresource_range(ci.subrange.to_vk(format_to_aspect(ci.format))),
					None,
				)
			};
			match res {
				Ok(view) => {
					dst[i] = ImageView {
						view,
						image: ci.image,
						view_type: ci.view_type,
						format: ci.format,
						subrange: ci.subrange,
					}
				},
				Err(err) => {
					self.deallocate_image_views(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_image_views(&self, src: &[ImageView]) {
		let device = self.runtime.device();
		for view in src {
			if view.view != vk::ImageView::null() {
				unsafe { device.destroy_image_view(view.view, None) };
			}
		}
	}

	fn allocate_timestamp_query_pools(
		&self, dst: &mut [TimestampQueryPool], cis: &[TimestampQueryPoolCreateInfo],
	) -> AllocateResult {
		let device = self.runtime.device();
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				device.create_query_pool(
					&vk::QueryPoolCreateInfo::default()
						.query_type(vk::QueryType::TIMESTAMP)
						.query_count(ci.count),
					None,
				)
			};
			match res {
				Ok(pool) => {
					unsafe { device.reset_query_pool(pool, 0, ci.count) };
					dst[i] = TimestampQueryPool { pool, count: ci.count };
				},
				Err(err) => {
					self.deallocate_timestamp_query_pools(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_timestamp_query_pools(&self, src: &[TimestampQueryPool]) {
		let device = self.runtime.device();
		for pool in src {
			if pool.pool != vk::QueryPool::null() {
				unsafe { device.destroy_query_pool(pool.pool, None) };
			}
		}
	}

	fn allocate_timestamp_queries(
		&self, dst: &mut [TimestampQuery], cis: &[TimestampQueryCreateInfo],
	) -> AllocateResult {
		for (i, ci) in cis.iter().enumerate() {
			if ci.index >= ci.pool.count {
				return Err(AllocateError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
			}
			dst[i] = TimestampQuery {
				pool: ci.pool.pool,
				index: ci.index,
			};
		}
		Ok(())
	}

	fn deallocate_timestamp_queries(&self, _src: &[TimestampQuery]) {}

	fn allocate_acceleration_structures(
		&self, dst: &mut [vk::AccelerationStructureKHR], cis: &[AccelerationStructureCreateInfo],
	) -> AllocateResult {
		let Some(ext) = self.runtime.accel_ext() else {
			return Err(AllocateError(vk::Result::ERROR_EXTENSION_NOT_PRESENT));
		};
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				ext.create_acceleration_structure(
					&vk::AccelerationStructureCreateInfoKHR::default()
						.create_flags(ci.flags)
						.buffer(ci.buffer)
						.offset(ci.offset)
						.size(ci.size)
						.ty(ci.ty),
					None,
				)
			};
			match res {
				Ok(accel) => dst[i] = accel,
				Err(err) => {
					self.deallocate_acceleration_structures(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_acceleration_structures(&self, src: &[vk::AccelerationStructureKHR]) {
		if let Some(ext) = self.runtime.accel_ext() {
			for &accel in src {
				unsafe { ext.destroy_acceleration_structure(accel, None) };
			}
		}
	}

	fn allocate_graphics_pipelines(
		&self, dst: &mut [vk::Pipeline], cis: &[vk::GraphicsPipelineCreateInfo<'_>],
	) -> AllocateResult {
		let device = self.runtime.device();
		let pipelines = unsafe {
			device
				.create_graphics_pipelines(self.runtime.pipeline_cache(), cis, None)
				.map_err(|(_, err)| AllocateError(err))?
		};
		dst.copy_from_slice(&pipelines);
		Ok(())
	}

	fn allocate_compute_pipelines(
		&self, dst: &mut [vk::Pipeline], cis: &[vk::ComputePipelineCreateInfo<'_>],
	) -> AllocateResult {
		let device = self.runtime.device();
		let pipelines = unsafe {
			device
				.create_compute_pipelines(self.runtime.pipeline_cache(), cis, None)
				.map_err(|(_, err)| AllocateError(err))?
		};
		dst.copy_from_slice(&pipelines);
		Ok(())
	}

	fn allocate_ray_tracing_pipelines(
		&self, dst: &mut [vk::Pipeline], cis: &[vk::RayTracingPipelineCreateInfoKHR<'_>],
	) -> AllocateResult {
		let Some(ext) = self.runtime.rt_ext() else {
			return Err(AllocateError(vk::Result::ERROR_EXTENSION_NOT_PRESENT));
		};
		let pipelines = unsafe {
			ext.create_ray_tracing_pipelines(
				vk::DeferredOperationKHR::null(),
				self.runtime.pipeline_cache(),
				cis,
				None,
			)
			.map_err(|(_, err)| AllocateError(err))?
		};
		dst.copy_from_slice(&pipelines);
		Ok(())
	}

	fn deallocate_pipelines(&self, src: &[vk::Pipeline]) {
		let device = self.runtime.device();
		for &pipeline in src {
			unsafe { device.destroy_pipeline(pipeline, None) };
		}
	}

	fn allocate_descriptor_sets(
		&self, dst: &mut [vk::DescriptorSet], cis: &[DescriptorSetCreateInfo],
	) -> AllocateResult {
		let device = self.runtime.device();
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				device.allocate_descriptor_sets(
					&vk::DescriptorSetAllocateInfo::default()
						.descriptor_pool(ci.pool)
						.set_layouts(std::slice::from_ref(&ci.layout)),
				)
			};
			match res {
				Ok(sets) => dst[i] = sets[0],
				Err(err) => return Err(AllocateError(err)),
			}
		}
		Ok(())
	}

	fn deallocate_descriptor_sets(&self, src: &[vk::DescriptorSet], pool: vk::DescriptorPool) {
		if !src.is_empty() {
			let _ = unsafe { self.runtime.device().free_descriptor_sets(pool, src) };
		}
	}

	fn allocate_persistent_descriptor_sets(
		&self, dst: &mut [PersistentDescriptorSet], cis: &[PersistentDescriptorSetCreateInfo],
	) -> AllocateResult {
		let device = self.runtime.device();
		for (i, ci) in cis.iter().enumerate() {
			let res = unsafe {
				device.create_descriptor_pool(
					&vk::DescriptorPoolCreateInfo::default()
						.flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
						.max_sets(1)
						.pool_sizes(&ci.pool_sizes),
					None,
				)
			};
			let pool = match res {
				Ok(pool) => pool,
				Err(err) => {
					self.deallocate_persistent_descriptor_sets(&dst[..i]);
					return Err(AllocateError(err));
				},
			};
			let set = unsafe {
				device.allocate_descriptor_sets(
					&vk::DescriptorSetAllocateInfo::default()
						.descriptor_pool(pool)
						.set_layouts(std::slice::from_ref(&ci.layout)),
				)
			};
			match set {
				Ok(sets) => {
					dst[i] = PersistentDescriptorSet {
						set: sets[0],
						layout: ci.layout,
						pool,
						pending: Default::default(),
					}
				},
				Err(err) => {
					unsafe { device.destroy_descriptor_pool(pool, None) };
					self.deallocate_persistent_descriptor_sets(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_persistent_descriptor_sets(&self, src: &[PersistentDescriptorSet]) {
		let device = self.runtime.device();
		for set in src {
			if set.pool != vk::DescriptorPool::null() {
				unsafe { device.destroy_descriptor_pool(set.pool, None) };
			}
		}
	}

	fn allocate_swapchains(
		&self, dst: &mut [vk::SwapchainKHR], cis: &[vk::SwapchainCreateInfoKHR<'_>],
	) -> AllocateResult {
		let ext = self.runtime.swapchain_ext();
		for (i, ci) in cis.iter().enumerate() {
			match unsafe { ext.create_swapchain(ci, None) } {
				Ok(swapchain) => dst[i] = swapchain,
				Err(err) => {
					self.deallocate_swapchains(&dst[..i]);
					return Err(AllocateError(err));
				},
			}
		}
		Ok(())
	}

	fn deallocate_swapchains(&self, src: &[vk::SwapchainKHR]) {
		let ext = self.runtime.swapchain_ext();
		for &swapchain in src {
			unsafe { ext.destroy_swapchain(swapchain, None) };
		}
	}
}
