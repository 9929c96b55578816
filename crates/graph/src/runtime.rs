//! The runtime: a shared device wrapper holding the queue executors, the
//! creation-info caches, named pipelines, and the frame clock.

use std::{
	ffi::CStr,
	mem::ManuallyDrop,
	sync::{
		atomic::{AtomicU32, AtomicU64, Ordering},
		Arc,
	},
};

use ash::{ext, khr, vk, vk::Handle};
use gpu_allocator::vulkan::{Allocator as GpuAllocator, AllocatorCreateDesc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{span, Level};

use crate::{
	alloc::{Allocator, TimestampQuery, TimestampQueryPool},
	cache::Cache,
	exec::{cmd::GraphicsState, queue::QueueExecutor, signal::SyncPoint},
	pipeline::{PipelineBase, PipelineInstance, PipelineInstanceCreateInfo, ShaderStage},
	resource::{Sampler, SamplerCreateInfo},
	spirv::Program,
	sync::DomainFlags,
	types::hash_combine,
	Error,
	Result,
};

/// Vulkan 1.0 entry points the runtime requires, plus the 1.2 promotions it
/// depends on (timeline semaphores, buffer device address, indirect count) and
/// the 1.3 synchronization entry points.
const REQUIRED_PFNS: &[&CStr] = &[
	c"vkCmdBindDescriptorSets",
	c"vkCmdBindIndexBuffer",
	c"vkCmdBindPipeline",
	c"vkCmdBindVertexBuffers",
	c"vkCmdBlitImage",
	c"vkCmdClearColorImage",
	c"vkCmdClearDepthStencilImage",
	c"vkCmdCopyBuffer",
	c"vkCmdCopyBufferToImage",
	c"vkCmdCopyImageToBuffer",
	c"vkCmdFillBuffer",
	c"vkCmdUpdateBuffer",
	c"vkCmdResolveImage",
	c"vkCmdWriteTimestamp",
	c"vkCmdDraw",
	c"vkCmdDrawIndexed",
	c"vkCmdDrawIndexedIndirect",
	c"vkCmdDispatch",
	c"vkCmdDispatchIndirect",
	c"vkCmdPushConstants",
	c"vkCmdSetViewport",
	c"vkCmdSetScissor",
	c"vkCmdSetLineWidth",
	c"vkCmdSetDepthBias",
	c"vkCmdSetBlendConstants",
	c"vkCmdSetDepthBounds",
	c"vkCreateCommandPool",
	c"vkResetCommandPool",
	c"vkDestroyCommandPool",
	c"vkAllocateCommandBuffers",
	c"vkBeginCommandBuffer",
	c"vkEndCommandBuffer",
	c"vkFreeCommandBuffers",
	c"vkCreateDescriptorPool",
	c"vkResetDescriptorPool",
	c"vkDestroyDescriptorPool",
	c"vkAllocateDescriptorSets",
	c"vkUpdateDescriptorSets",
	c"vkCreateGraphicsPipelines",
	c"vkCreateComputePipelines",
	c"vkDestroyPipeline",
	c"vkCreateQueryPool",
	c"vkGetQueryPoolResults",
	c"vkDestroyQueryPool",
	c"vkResetQueryPool",
	c"vkCreatePipelineCache",
	c"vkGetPipelineCacheData",
	c"vkDestroyPipelineCache",
	c"vkCreateSampler",
	c"vkDestroySampler",
	c"vkCreateShaderModule",
	c"vkDestroyShaderModule",
	c"vkCreateImageView",
	c"vkDestroyImageView",
	c"vkCreateDescriptorSetLayout",
	c"vkDestroyDescriptorSetLayout",
	c"vkCreatePipelineLayout",
	c"vkDestroyPipelineLayout",
	c"vkCreateFence",
	c"vkWaitForFences",
	c"vkDestroyFence",
	c"vkCreateSemaphore",
	c"vkWaitSemaphores",
	c"vkGetSemaphoreCounterValue",
	c"vkDestroySemaphore",
	c"vkQueueSubmit2",
	c"vkCmdPipelineBarrier2",
	c"vkDeviceWaitIdle",
	c"vkGetBufferDeviceAddress",
	c"vkCmdDrawIndexedIndirectCount",
];

/// External handle for one timestamp query.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Query(u64);

/// A per-layout key for descriptor set layout interning.
type DsLayoutKey = Vec<(u32, i32, u32, u32)>;

struct ShaderModuleData {
	module: vk::ShaderModule,
	program: Arc<Program>,
}

struct Caches {
	shader_modules: Cache<u64, ShaderModuleData>,
	ds_layouts: Cache<DsLayoutKey, vk::DescriptorSetLayout>,
	pipeline_layouts: Cache<Vec<u64>, vk::PipelineLayout>,
	samplers: Cache<SamplerCreateInfo, Sampler>,
	descriptor_pools: Cache<u64, vk::DescriptorPool>,
	pipeline_instances: Cache<PipelineInstanceCreateInfo, vk::Pipeline>,
}

struct QueryState {
	pool: TimestampQueryPool,
	next: u32,
	queries: FxHashMap<Query, TimestampQuery>,
	results: FxHashMap<Query, u64>,
}

struct RuntimeInner {
	entry: ash::Entry,
	instance: ash::Instance,
	physical_device: vk::PhysicalDevice,
	device: ash::Device,
	swapchain_ext: khr::swapchain::Device,
	push_descriptor_ext: Option<khr::push_descriptor::Device>,
	accel_ext: Option<khr::acceleration_structure::Device>,
	rt_ext: Option<khr::ray_tracing_pipeline::Device>,
	debug_utils_ext: Option<ext::debug_utils::Device>,
	queues: Vec<QueueExecutor>,
	allocator: ManuallyDrop<Mutex<GpuAllocator>>,
	pipeline_cache: Mutex<vk::PipelineCache>,
	caches: Caches,
	named: RwLock<FxHashMap<String, Arc<PipelineBase>>>,
	shader_pipelines: Mutex<FxHashMap<u64, Arc<PipelineBase>>>,
	base_ids: AtomicU32,
	frame: AtomicU64,
	queries: Mutex<QueryState>,
	timestamp_period: f32,
	shader_compiler: Option<Box<dyn Fn(&str, &str) -> Result<Vec<u32>> + Send + Sync>>,
}

unsafe impl Send for RuntimeInner {}
unsafe impl Sync for RuntimeInner {}

/// Which queue family serves each domain. `None` aliases onto the graphics
/// family.
#[derive(Copy, Clone, Debug)]
pub struct QueueFamilies {
	pub graphics: u32,
	pub compute: Option<u32>,
	pub transfer: Option<u32>,
}

pub struct RuntimeCreateInfo {
	pub entry: ash::Entry,
	pub instance: ash::Instance,
	pub physical_device: vk::PhysicalDevice,
	pub device: ash::Device,
	pub queues: QueueFamilies,
	/// An optional front-end for [`Runtime::compile_shader`].
	pub shader_compiler: Option<Box<dyn Fn(&str, &str) -> Result<Vec<u32>> + Send + Sync>>,
}

const TIMESTAMP_POOL_SIZE: u32 = 1024;
/// Frames an unused cache entry survives before eviction.
const CACHE_EVICTION_LAG: u64 = 16;

/// Has everything you need to run graphs. Cheap to clone and share across
/// threads.
#[derive(Clone)]
pub struct Runtime {
	inner: Arc<RuntimeInner>,
}

impl Runtime {
	pub fn new(ci: RuntimeCreateInfo) -> Result<Self> {
		check_pfns(&ci.instance, &ci.device)?;

		let device = ci.device.clone();
		let d = device.clone();
		let allocator = GpuAllocator::new(&AllocatorCreateDesc {
			instance: ci.instance.clone(),
			device: ci.device.clone(),
			physical_device: ci.physical_device,
			debug_settings: Default::default(),
			buffer_device_address: true,
			allocation_sizes: Default::default(),
		})
		.map_err(|e| Error::Message(e.to_string()))?;

		let mut queues = vec![QueueExecutor::new(&device, DomainFlags::GRAPHICS_QUEUE, ci.queues.graphics)?];
		if let Some(family) = ci.queues.compute {
			queues.push(QueueExecutor::new(&device, DomainFlags::COMPUTE_QUEUE, family)?);
		}
		if let Some(family) = ci.queues.transfer {
			queues.push(QueueExecutor::new(&device, DomainFlags::TRANSFER_QUEUE, family)?);
		}

		let pipeline_cache =
			unsafe { device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)? };

		let query_pool = unsafe {
			let pool = device.create_query_pool(
				&vk::QueryPoolCreateInfo::default()
					.query_type(vk::QueryType::TIMESTAMP)
					.query_count(TIMESTAMP_POOL_SIZE),
				None,
			)?;
			device.reset_query_pool(pool, 0, TIMESTAMP_POOL_SIZE);
			pool
		};

		let timestamp_period = unsafe {
			ci.instance
				.get_physical_device_properties(ci.physical_device)
				.limits
				.timestamp_period
		};

		let has_ext = |name: &CStr| unsafe {
			ci.instance
				.enumerate_device_extension_properties(ci.physical_device)
				.map(|props| {
					props
						.iter()
						.any(|p| p.extension_name_as_c_str() == Ok(name))
				})
				.unwrap_or(false)
		};

		let caches = {
			let d0 = device.clone();
			let d1 = device.clone();
			let d2 = device.clone();
			let d3 = device.clone();
			let d4 = device.clone();
			let d5 = device.clone();
			Caches {
				shader_modules: Cache::new(move |m: &ShaderModuleData| unsafe {
					d0.destroy_shader_module(m.module, None)
				}),
				ds_layouts: Cache::new(move |&l: &vk::DescriptorSetLayout| unsafe {
					d1.destroy_descriptor_set_layout(l, None)
				}),
				pipeline_layouts: Cache::new(move |&l: &vk::PipelineLayout| unsafe {
					d2.destroy_pipeline_layout(l, None)
				}),
				samplers: Cache::new(move |s: &Sampler| unsafe { d3.destroy_sampler(s.sampler, None) }),
				descriptor_pools: Cache::new(move |&p: &vk::DescriptorPool| unsafe {
					d4.destroy_descriptor_pool(p, None)
				}),
				pipeline_instances: Cache::new(move |&p: &vk::Pipeline| unsafe { d5.destroy_pipeline(p, None) }),
			}
		};

		Ok(Self {
			inner: Arc::new(RuntimeInner {
				swapchain_ext: khr::swapchain::Device::new(&ci.instance, &device),
				push_descriptor_ext: has_ext(khr::push_descriptor::NAME)
					.then(|| khr::push_descriptor::Device::new(&ci.instance, &device)),
				accel_ext: has_ext(khr::acceleration_structure::NAME)
					.then(|| khr::acceleration_structure::Device::new(&ci.instance, &device)),
				rt_ext: has_ext(khr::ray_tracing_pipeline::NAME)
					.then(|| khr::ray_tracing_pipeline::Device::new(&ci.instance, &device)),
				debug_utils_ext: Some(ext::debug_utils::Device::new(&ci.instance, &device)),
				entry: ci.entry,
				instance: ci.instance,
				physical_device: ci.physical_device,
				device: d,
				queues,
				allocator: ManuallyDrop::new(Mutex::new(allocator)),
				pipeline_cache: Mutex::new(pipeline_cache),
				caches,
				named: RwLock::new(FxHashMap::default()),
				shader_pipelines: Mutex::new(FxHashMap::default()),
				base_ids: AtomicU32::new(1),
				frame: AtomicU64::new(0),
				queries: Mutex::new(QueryState {
					pool: TimestampQueryPool {
						pool: query_pool,
						count: TIMESTAMP_POOL_SIZE,
					},
					next: 0,
					queries: FxHashMap::default(),
					results: FxHashMap::default(),
				}),
				timestamp_period,
				shader_compiler: ci.shader_compiler,
			}),
		})
	}

	pub fn entry(&self) -> &ash::Entry { &self.inner.entry }

	pub fn instance(&self) -> &ash::Instance { &self.inner.instance }

	pub fn device(&self) -> &ash::Device { &self.inner.device }

	pub fn physical_device(&self) -> vk::PhysicalDevice { self.inner.physical_device }

	pub fn swapchain_ext(&self) -> &khr::swapchain::Device { &self.inner.swapchain_ext }

	pub fn push_descriptor_ext(&self) -> Option<&khr::push_descriptor::Device> {
		self.inner.push_descriptor_ext.as_ref()
	}

	pub fn accel_ext(&self) -> Option<&khr::acceleration_structure::Device> { self.inner.accel_ext.as_ref() }

	pub fn rt_ext(&self) -> Option<&khr::ray_tracing_pipeline::Device> { self.inner.rt_ext.as_ref() }

	pub fn debug_utils_ext(&self) -> Option<&ext::debug_utils::Device> { self.inner.debug_utils_ext.as_ref() }

	pub fn memory(&self) -> parking_lot::MutexGuard<'_, GpuAllocator> { self.inner.allocator.lock() }

	pub fn pipeline_cache(&self) -> vk::PipelineCache { *self.inner.pipeline_cache.lock() }

	/// The current frame number; advanced by [`Self::next_frame`].
	pub fn frame(&self) -> u64 { self.inner.frame.load(Ordering::Relaxed) }

	/// Advance the frame clock and evict stale cache entries.
	pub fn next_frame(&self) {
		let now = self.inner.frame.fetch_add(1, Ordering::Relaxed) + 1;
		self.inner.caches.samplers.collect(now, CACHE_EVICTION_LAG);
		self.inner.caches.pipeline_instances.collect(now, CACHE_EVICTION_LAG);
		self.inner.caches.descriptor_pools.collect(now, CACHE_EVICTION_LAG);
	}

	pub fn queue(&self, domain: DomainFlags) -> Option<&QueueExecutor> {
		self.inner
			.queues
			.iter()
			.find(|q| q.domain() == domain)
			.or_else(|| self.inner.queues.first())
	}

	/// Drain every queue; takes all queue locks.
	pub fn wait_idle(&self) -> Result<()> {
		let span = span!(Level::TRACE, "wait idle");
		let _e = span.enter();
		let _guards: Vec<_> = self.inner.queues.iter().map(|q| q.queue()).collect();
		unsafe { self.inner.device.device_wait_idle()? };
		Ok(())
	}

	/// Block until every given sync point has signalled, one wait per queue at
	/// the maximum requested value.
	pub fn wait_for_domains(&self, points: &[SyncPoint]) -> Result<()> {
		let mut semaphores = Vec::new();
		let mut values = Vec::new();
		for queue in &self.inner.queues {
			let max = points
				.iter()
				.filter(|p| p.domain == queue.domain())
				.map(|p| p.value)
				.max();
			if let Some(max) = max {
				semaphores.push(queue.semaphore());
				values.push(max);
			}
		}
		if semaphores.is_empty() {
			return Ok(());
		}
		unsafe {
			self.inner.device.wait_semaphores(
				&vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values),
				u64::MAX,
			)?;
		}
		Ok(())
	}

	/// Poll one sync point without blocking.
	pub fn sync_point_ready(&self, point: SyncPoint) -> Result<bool> {
		let queue = self
			.queue(point.domain)
			.ok_or_else(|| Error::Message("no queue for sync point".into()))?;
		queue.is_complete(&self.inner.device, point)
	}

	// Pipelines.

	/// Compile shader source through the registered front-end.
	pub fn compile_shader(&self, source: &str, path: &str) -> Result<Vec<u32>> {
		match &self.inner.shader_compiler {
			Some(compile) => compile(source, path),
			None => Err(Error::ShaderCompilation("no shader front-end registered".into())),
		}
	}

	fn shader_module(&self, spirv: &[u32]) -> Result<(vk::ShaderModule, Arc<Program>)> {
		let hash = spirv
			.iter()
			.fold(hash_combine(0, spirv.len() as u32), |h, &w| hash_combine(h, w)) as u64;
		let data = self.inner.caches.shader_modules.acquire(&hash, self.frame(), || {
			let program = Program::reflect(spirv)?;
			let module = unsafe {
				self.inner
					.device
					.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spirv), None)?
			};
			Ok(ShaderModuleData {
				module,
				program: Arc::new(program),
			})
		})?;
		Ok((data.module, data.program.clone()))
	}

	fn ds_layout(&self, program: &Program, set: u32) -> Result<vk::DescriptorSetLayout> {
		let key: DsLayoutKey = program
			.bindings
			.iter()
			.filter(|b| b.set == set)
			.map(|b| (b.binding, b.ty.as_raw(), b.count.max(1), b.stages.as_raw()))
			.collect();
		let layout = self.inner.caches.ds_layouts.acquire(&key, self.frame(), || {
			let bindings: Vec<_> = program
				.bindings
				.iter()
				.filter(|b| b.set == set)
				.map(|b| {
					vk::DescriptorSetLayoutBinding::default()
						.binding(b.binding)
						.descriptor_type(b.ty)
						.descriptor_count(b.count.max(1))
						.stage_flags(b.stages)
				})
				.collect();
			unsafe {
				Ok(self.inner.device.create_descriptor_set_layout(
					&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
					None,
				)?)
			}
		})?;
		Ok(*layout)
	}

	fn pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout], program: &Program) -> Result<vk::PipelineLayout> {
		let mut key: Vec<u64> = set_layouts.iter().map(|l| l.as_raw()).collect();
		for pc in &program.push_constants {
			key.push(((pc.offset as u64) << 32) | pc.size as u64);
		}
		let layout = self.inner.caches.pipeline_layouts.acquire(&key, self.frame(), || {
			let ranges: Vec<_> = program
				.push_constants
				.iter()
				.map(|pc| {
					vk::PushConstantRange::default()
						.offset(pc.offset)
						.size(pc.size)
						.stage_flags(pc.stages)
				})
				.collect();
			unsafe {
				Ok(self.inner.device.create_pipeline_layout(
					&vk::PipelineLayoutCreateInfo::default()
						.set_layouts(set_layouts)
						.push_constant_ranges(&ranges),
					None,
				)?)
			}
		})?;
		Ok(*layout)
	}

	/// Build a pipeline base from SPIR-V stages and register it under `name`.
	pub fn create_named_pipeline(
		&self, name: &str, bind_point: vk::PipelineBindPoint, spirv: &[&[u32]],
	) -> Result<Arc<PipelineBase>> {
		let base = self.create_pipeline_base(bind_point, spirv)?;
		self.inner.named.write().insert(name.to_string(), base.clone());
		Ok(base)
	}

	pub fn get_named_pipeline(&self, name: &str) -> Option<Arc<PipelineBase>> {
		self.inner.named.read().get(name).cloned()
	}

	fn create_pipeline_base(&self, bind_point: vk::PipelineBindPoint, spirv: &[&[u32]]) -> Result<Arc<PipelineBase>> {
		let mut shaders = Vec::with_capacity(spirv.len());
		let mut programs = Vec::with_capacity(spirv.len());
		for &words in spirv {
			let (module, program) = self.shader_module(words)?;
			shaders.push(ShaderStage {
				stage: program.stages,
				module,
				entry: program.entry.clone(),
				program: program.clone(),
			});
			programs.push(program);
		}
		let program = Arc::new(Program::merge(programs.iter().map(|p| p.as_ref())));
		let set_layouts: Vec<_> = (0..program.set_count())
			.map(|set| self.ds_layout(&program, set))
			.collect::<Result<_>>()?;
		let layout = self.pipeline_layout(&set_layouts, &program)?;

		Ok(Arc::new(PipelineBase {
			id: self.inner.base_ids.fetch_add(1, Ordering::Relaxed),
			bind_point,
			shaders,
			layout,
			set_layouts,
			program,
		}))
	}

	/// A compute pipeline base for a shader-fn callable, cached by the SPIR-V
	/// content hash.
	pub fn shader_fn_pipeline(&self, spirv: &[u32], _alloc: &Allocator) -> Result<Arc<PipelineBase>> {
		let hash = spirv
			.iter()
			.fold(hash_combine(0, spirv.len() as u32), |h, &w| hash_combine(h, w)) as u64;
		if let Some(base) = self.inner.shader_pipelines.lock().get(&hash) {
			return Ok(base.clone());
		}
		let base = self.create_pipeline_base(vk::PipelineBindPoint::COMPUTE, &[spirv])?;
		self.inner.shader_pipelines.lock().insert(hash, base.clone());
		Ok(base)
	}

	/// Acquire (building if needed) the pipeline instance for `key`.
	pub(crate) fn pipeline_instance(
		&self, key: &PipelineInstanceCreateInfo, base: &Arc<PipelineBase>, alloc: Allocator,
		state: &GraphicsState,
	) -> Result<PipelineInstance> {
		let pipeline = self.inner.caches.pipeline_instances.acquire(key, self.frame(), || {
			match base.bind_point {
				vk::PipelineBindPoint::COMPUTE => self.build_compute_pipeline(base, alloc, state),
				_ => self.build_graphics_pipeline(base, alloc, state),
			}
		})?;
		Ok(PipelineInstance {
			pipeline: *pipeline,
			layout: base.layout,
			bind_point: base.bind_point,
		})
	}

	fn spec_info(state: &GraphicsState) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
		let mut entries = Vec::with_capacity(state.spec_constants.len());
		let mut data = Vec::with_capacity(state.spec_constants.len() * 4);
		for &(id, value) in state.spec_constants {
			entries.push(
				vk::SpecializationMapEntry::default()
					.constant_id(id)
					.offset(data.len() as u32)
					.size(4),
			);
			data.extend_from_slice(&value.to_le_bytes());
		}
		(entries, data)
	}

	fn build_compute_pipeline(&self, base: &PipelineBase, alloc: Allocator, state: &GraphicsState) -> Result<vk::Pipeline> {
		let shader = &base.shaders[0];
		let entry = std::ffi::CString::new(shader.entry.as_str()).unwrap();
		let (entries, data) = Self::spec_info(state);
		let spec = vk::SpecializationInfo::default().map_entries(&entries).data(&data);
		let mut stage = vk::PipelineShaderStageCreateInfo::default()
			.stage(vk::ShaderStageFlags::COMPUTE)
			.module(shader.module)
			.name(&entry);
		if !entries.is_empty() {
			stage = stage.specialization_info(&spec);
		}

		let mut pipelines = [vk::Pipeline::null()];
		alloc.allocate_compute_pipelines(
			&mut pipelines,
			&[vk::ComputePipelineCreateInfo::default().stage(stage).layout(base.layout)],
		)?;
		Ok(pipelines[0])
	}

	fn build_graphics_pipeline(&self, base: &PipelineBase, alloc: Allocator, state: &GraphicsState) -> Result<vk::Pipeline> {
		let entries: Vec<_> = base
			.shaders
			.iter()
			.map(|s| std::ffi::CString::new(s.entry.as_str()).unwrap())
			.collect();
		let (spec_entries, spec_data) = Self::spec_info(state);
		let spec = vk::SpecializationInfo::default().map_entries(&spec_entries).data(&spec_data);
		let stages: Vec<_> = base
			.shaders
			.iter()
			.zip(&entries)
			.map(|(s, entry)| {
				let mut stage = vk::PipelineShaderStageCreateInfo::default()
					.stage(s.stage)
					.module(s.module)
					.name(entry);
				if !spec_entries.is_empty() {
					stage = stage.specialization_info(&spec);
				}
				stage
			})
			.collect();

		let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
			.vertex_binding_descriptions(state.vertex_bindings)
			.vertex_attribute_descriptions(state.vertex_attributes);
		let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
			.topology(vk::PrimitiveTopology::TRIANGLE_LIST);
		let viewport = vk::PipelineViewportStateCreateInfo::default()
			.viewports(state.viewports)
			.scissors(state.scissors);
		let multisample = vk::PipelineMultisampleStateCreateInfo::default()
			.rasterization_samples(if state.shape.samples.is_empty() {
				vk::SampleCountFlags::TYPE_1
			} else {
				state.shape.samples
			});
		let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(state.blend);
		let default_blend;
		let blend = if state.blend.is_empty() && state.shape.color_count > 0 {
			default_blend = vec![
				vk::PipelineColorBlendAttachmentState::default()
					.color_write_mask(vk::ColorComponentFlags::RGBA);
				state.shape.color_count as usize
			];
			vk::PipelineColorBlendStateCreateInfo::default().attachments(&default_blend)
		} else {
			blend
		};
		let dynamic_states = state.dynamic.to_states();
		let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

		let color_formats = &state.shape.color_formats[..state.shape.color_count as usize];
		let mut rendering = vk::PipelineRenderingCreateInfo::default()
			.color_attachment_formats(color_formats)
			.depth_attachment_format(state.shape.depth_format)
			.stencil_attachment_format(state.shape.stencil_format)
			.view_mask(state.shape.view_mask);

		let ci = vk::GraphicsPipelineCreateInfo::default()
			.stages(&stages)
			.vertex_input_state(&vertex_input)
			.input_assembly_state(&input_assembly)
			.viewport_state(&viewport)
			.rasterization_state(&state.raster)
			.multisample_state(&multisample)
			.depth_stencil_state(&state.depth)
			.color_blend_state(&blend)
			.dynamic_state(&dynamic)
			.layout(base.layout)
			.push_next(&mut rendering);

		let mut pipelines = [vk::Pipeline::null()];
		alloc.allocate_graphics_pipelines(&mut pipelines, &[ci])?;
		Ok(pipelines[0])
	}

	/// A transient descriptor pool serving `layout`.
	pub(crate) fn descriptor_pool_for(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorPool> {
		let key = layout.as_raw();
		let pool = self.inner.caches.descriptor_pools.acquire(&key, self.frame(), || {
			let sizes = [
				vk::DescriptorPoolSize::default()
					.ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
					.descriptor_count(4096),
				vk::DescriptorPoolSize::default()
					.ty(vk::DescriptorType::SAMPLED_IMAGE)
					.descriptor_count(4096),
				vk::DescriptorPoolSize::default()
					.ty(vk::DescriptorType::STORAGE_IMAGE)
					.descriptor_count(4096),
				vk::DescriptorPoolSize::default()
					.ty(vk::DescriptorType::SAMPLER)
					.descriptor_count(1024),
				vk::DescriptorPoolSize::default()
					.ty(vk::DescriptorType::UNIFORM_BUFFER)
					.descriptor_count(4096),
				vk::DescriptorPoolSize::default()
					.ty(vk::DescriptorType::STORAGE_BUFFER)
					.descriptor_count(4096),
			];
			unsafe {
				Ok(self.inner.device.create_descriptor_pool(
					&vk::DescriptorPoolCreateInfo::default()
						.flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
						.max_sets(4096)
						.pool_sizes(&sizes),
					None,
				)?)
			}
		})?;
		Ok(*pool)
	}

	pub fn sampler(&self, desc: SamplerCreateInfo) -> Result<Sampler> {
		let sampler = self.inner.caches.samplers.acquire(&desc, self.frame(), || unsafe {
			Ok(Sampler {
				sampler: self.inner.device.create_sampler(&desc.to_vk(), None)?,
			})
		})?;
		Ok(*sampler)
	}

	// Pipeline cache blob pass-through.

	pub fn load_pipeline_cache(&self, bytes: &[u8]) -> Result<()> {
		unsafe {
			let new = self.inner.device.create_pipeline_cache(
				&vk::PipelineCacheCreateInfo::default().initial_data(bytes),
				None,
			)?;
			let mut cache = self.inner.pipeline_cache.lock();
			self.inner.device.destroy_pipeline_cache(*cache, None);
			*cache = new;
		}
		Ok(())
	}

	pub fn save_pipeline_cache(&self) -> Result<Vec<u8>> {
		unsafe {
			let cache = self.inner.pipeline_cache.lock();
			Ok(self.inner.device.get_pipeline_cache_data(*cache)?)
		}
	}

	// Timestamp queries.

	pub fn create_timestamp_query(&self) -> Result<Query> {
		let mut state = self.inner.queries.lock();
		if state.next >= state.pool.count {
			return Err(Error::Message("timestamp query pool exhausted".into()));
		}
		let index = state.next;
		state.next += 1;
		let query = Query(((state.pool.pool.as_raw() as u64) << 16) | index as u64);
		let pool = state.pool;
		state.queries.insert(query, TimestampQuery { pool: pool.pool, index });
		Ok(query)
	}

	/// Write a timestamp for `query` at the given stage.
	pub fn write_timestamp(&self, buf: vk::CommandBuffer, query: Query, stage: vk::PipelineStageFlags) -> Result<()> {
		let state = self.inner.queries.lock();
		let q = state
			.queries
			.get(&query)
			.ok_or_else(|| Error::Message("unknown timestamp query".into()))?;
		unsafe {
			self.inner.device.cmd_write_timestamp(buf, stage, q.pool, q.index);
		}
		Ok(())
	}

	/// Read back every finished timestamp into the host-side results map.
	pub fn make_timestamp_results_available(&self) -> Result<()> {
		let mut state = self.inner.queries.lock();
		if state.next == 0 {
			return Ok(());
		}
		let mut results = vec![0u64; state.next as usize];
		unsafe {
			self.inner.device.get_query_pool_results(
				state.pool.pool,
				0,
				&mut results,
				vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
			)?;
		}
		let queries: Vec<(Query, u32)> = state.queries.iter().map(|(&q, t)| (q, t.index)).collect();
		for (query, index) in queries {
			state.results.insert(query, results[index as usize]);
		}
		Ok(())
	}

	/// The raw timestamp of `query`, if it has been made available.
	pub fn retrieve_timestamp(&self, query: Query) -> Option<u64> {
		self.inner.queries.lock().results.get(&query).copied()
	}

	/// Seconds elapsed between two queries.
	pub fn retrieve_duration(&self, from: Query, to: Query) -> Option<f64> {
		let state = self.inner.queries.lock();
		let from = *state.results.get(&from)?;
		let to = *state.results.get(&to)?;
		Some((to.saturating_sub(from)) as f64 * self.inner.timestamp_period as f64 * 1e-9)
	}

	// Debug labels; all no-ops without the extension.

	pub fn begin_label(&self, buf: vk::CommandBuffer, label: &str) {
		if let Some(ext) = &self.inner.debug_utils_ext {
			let name = std::ffi::CString::new(label).unwrap();
			unsafe {
				ext.cmd_begin_debug_utils_label(buf, &vk::DebugUtilsLabelEXT::default().label_name(&name));
			}
		}
	}

	pub fn end_label(&self, buf: vk::CommandBuffer) {
		if let Some(ext) = &self.inner.debug_utils_ext {
			unsafe { ext.cmd_end_debug_utils_label(buf) };
		}
	}
}

/// Verify the required entry points resolve, reporting the first missing name.
fn check_pfns(instance: &ash::Instance, device: &ash::Device) -> Result<()> {
	for &name in REQUIRED_PFNS {
		let pfn = unsafe {
			(instance.fp_v1_0().get_device_proc_addr)(device.handle(), name.as_ptr())
		};
		if pfn.is_none() {
			return Err(Error::MissingPfn(name.to_str().unwrap_or("?")));
		}
	}
	Ok(())
}

impl Drop for RuntimeInner {
	fn drop(&mut self) {
		unsafe {
			let _ = self.device.device_wait_idle();
			self.caches.pipeline_instances.clear();
			self.caches.shader_modules.clear();
			self.caches.pipeline_layouts.clear();
			self.caches.ds_layouts.clear();
			self.caches.samplers.clear();
			self.caches.descriptor_pools.clear();
			self.device.destroy_query_pool(self.queries.get_mut().pool.pool, None);
			self.device.destroy_pipeline_cache(*self.pipeline_cache.get_mut(), None);
			for queue in &self.queues {
				queue.destroy(&self.device);
			}
			// The device memory allocator must go before the device.
			ManuallyDrop::drop(&mut self.allocator);
			self.device.destroy_device(None);
			self.instance.destroy_instance(None);
		}
	}
}
