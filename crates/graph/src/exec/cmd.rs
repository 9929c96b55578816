//! The command recording state tracker.
//!
//! A [`CommandRecorder`] materializes one command buffer. Pipeline state is
//! tracked host-side; at each draw or dispatch the tracker folds the
//! non-default state into a pipeline instance key, acquires the instance from
//! the cache, validates and flushes descriptor sets, flushes dynamic state,
//! and records the command.

use std::sync::Arc;

use ash::vk;
use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::{
	alloc::{Allocator, DescriptorSetCreateInfo},
	exec::descriptor::{resolve_binding, Bound, ResolvedWrite},
	ir::ConstantValue,
	pipeline::{DynamicStateFlags, KeyWriter, PipelineBase, PipelineInstance, PipelineInstanceCreateInfo, RenderingShape},
	resource::{Buffer, ClearValue, ImageAttachment},
	runtime::Runtime,
	sync::DomainFlags,
	Error,
	Result,
};

/// How descriptor sets are allocated and bound.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum DescriptorSetStrategy {
	/// One transient set per layout, reused while undisturbed.
	PerLayout,
	/// Transient sets from a common per-frame pool.
	#[default]
	Common,
	/// `VK_KHR_push_descriptor`; no sets are allocated at all.
	PushDescriptor,
}

/// The callback executed by a `CALL` node.
pub type PassFn = dyn Fn(&mut PassContext<'_, '_>) -> Result<()> + Send + Sync;

/// What a pass callback sees: the recorder plus its argument values.
pub struct PassContext<'a, 'r> {
	pub cmd: &'a mut CommandRecorder<'r>,
	pub(crate) args: &'a [ConstantValue],
}

impl PassContext<'_, '_> {
	pub fn arg(&self, i: usize) -> &ConstantValue { &self.args[i] }

	pub fn arg_image(&self, i: usize) -> &ImageAttachment {
		self.args[i].as_image().expect("pass argument is not an image")
	}

	pub fn arg_buffer(&self, i: usize) -> &Buffer {
		self.args[i].as_buffer().expect("pass argument is not a buffer")
	}
}

#[derive(Default)]
struct SetState {
	bindings: FxHashMap<u32, Bound>,
	samplers: FxHashMap<u32, vk::Sampler>,
	/// Rebinding is required: bindings changed or the layout moved under us.
	disturbed: bool,
	bound_layout: vk::DescriptorSetLayout,
	current: vk::DescriptorSet,
}

#[derive(Copy, Clone, PartialEq)]
struct RasterState {
	polygon_mode: vk::PolygonMode,
	cull_mode: vk::CullModeFlags,
	front_face: vk::FrontFace,
	depth_bias_enable: bool,
	conservative: bool,
}

impl Default for RasterState {
	fn default() -> Self {
		Self {
			polygon_mode: vk::PolygonMode::FILL,
			cull_mode: vk::CullModeFlags::NONE,
			front_face: vk::FrontFace::COUNTER_CLOCKWISE,
			depth_bias_enable: false,
			conservative: false,
		}
	}
}

#[derive(Copy, Clone, PartialEq)]
struct DepthState {
	test: bool,
	write: bool,
	compare: vk::CompareOp,
}

impl Default for DepthState {
	fn default() -> Self {
		Self {
			test: false,
			write: false,
			compare: vk::CompareOp::ALWAYS,
		}
	}
}

/// One color attachment of a dynamic rendering pass.
pub struct RenderAttachment {
	pub image: ImageAttachment,
	pub load: vk::AttachmentLoadOp,
	pub clear: Option<ClearValue>,
}

pub struct CommandRecorder<'r> {
	runtime: &'r Runtime,
	alloc: Allocator<'r>,
	pub buf: vk::CommandBuffer,
	domain: DomainFlags,

	base: Option<Arc<PipelineBase>>,
	instance: Option<PipelineInstance>,
	dynamic: DynamicStateFlags,
	strategy: DescriptorSetStrategy,
	shape: RenderingShape,

	viewports: Vec<vk::Viewport>,
	scissors: Vec<vk::Rect2D>,
	line_width: f32,
	depth_bias: [f32; 3],
	blend_constants: [f32; 4],
	depth_bounds: [f32; 2],
	raster: RasterState,
	depth: DepthState,
	blend: Vec<vk::PipelineColorBlendAttachmentState>,
	vertex_bindings: Vec<vk::VertexInputBindingDescription>,
	vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
	spec_constants: Vec<(u32, u32)>,

	sets: FxHashMap<u32, SetState>,
}

impl<'r> CommandRecorder<'r> {
	pub fn new(runtime: &'r Runtime, alloc: Allocator<'r>, buf: vk::CommandBuffer, domain: DomainFlags) -> Self {
		Self {
			runtime,
			alloc,
			buf,
			domain,
			base: None,
			instance: None,
			dynamic: DynamicStateFlags::VIEWPORT | DynamicStateFlags::SCISSOR,
			strategy: DescriptorSetStrategy::default(),
			shape: RenderingShape::default(),
			viewports: Vec::new(),
			scissors: Vec::new(),
			line_width: 1.0,
			depth_bias: [0.0; 3],
			blend_constants: [0.0; 4],
			depth_bounds: [0.0, 1.0],
			raster: RasterState::default(),
			depth: DepthState::default(),
			blend: Vec::new(),
			vertex_bindings: Vec::new(),
			vertex_attributes: Vec::new(),
			spec_constants: Vec::new(),
			sets: FxHashMap::default(),
		}
	}

	pub fn runtime(&self) -> &'r Runtime { self.runtime }

	pub fn allocator(&self) -> Allocator<'r> { self.alloc }

	pub fn domain(&self) -> DomainFlags { self.domain }

	// State setters.

	pub fn bind_pipeline(&mut self, base: Arc<PipelineBase>) {
		if self.base.as_ref().map(|b| b.id) != Some(base.id) {
			self.instance = None;
			for set in self.sets.values_mut() {
				set.disturbed = true;
			}
		}
		self.base = Some(base);
	}

	pub fn bind_named_pipeline(&mut self, name: &str) -> Result<()> {
		let base = self
			.runtime
			.get_named_pipeline(name)
			.ok_or_else(|| Error::Message(format!("no pipeline named {:?}", name)))?;
		self.bind_pipeline(base);
		Ok(())
	}

	pub fn set_descriptor_set_strategy(&mut self, strategy: DescriptorSetStrategy) { self.strategy = strategy }

	pub fn set_dynamic_state(&mut self, dynamic: DynamicStateFlags) {
		if self.dynamic != dynamic {
			self.dynamic = dynamic;
			self.instance = None;
		}
	}

	pub fn set_viewport(&mut self, viewport: vk::Viewport) {
		self.viewports.clear();
		self.viewports.push(viewport);
	}

	pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
		self.scissors.clear();
		self.scissors.push(scissor);
	}

	pub fn set_line_width(&mut self, width: f32) { self.line_width = width }

	pub fn set_depth_bias(&mut self, constant: f32, clamp: f32, slope: f32) {
		self.depth_bias = [constant, clamp, slope];
		self.raster.depth_bias_enable = constant != 0.0 || slope != 0.0;
	}

	pub fn set_blend_constants(&mut self, constants: [f32; 4]) { self.blend_constants = constants }

	pub fn set_depth_bounds(&mut self, min: f32, max: f32) { self.depth_bounds = [min, max] }

	pub fn set_rasterization(&mut self, polygon_mode: vk::PolygonMode, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) {
		self.raster.polygon_mode = polygon_mode;
		self.raster.cull_mode = cull_mode;
		self.raster.front_face = front_face;
	}

	pub fn set_conservative_rasterization(&mut self, enable: bool) { self.raster.conservative = enable }

	pub fn set_depth(&mut self, test: bool, write: bool, compare: vk::CompareOp) {
		self.depth = DepthState { test, write, compare };
	}

	pub fn set_color_blend(&mut self, attachments: &[vk::PipelineColorBlendAttachmentState]) {
		self.blend.clear();
		self.blend.extend_from_slice(attachments);
	}

	pub fn set_vertex_input(
		&mut self, bindings: &[vk::VertexInputBindingDescription], attributes: &[vk::VertexInputAttributeDescription],
	) {
		self.vertex_bindings.clear();
		self.vertex_bindings.extend_from_slice(bindings);
		self.vertex_attributes.clear();
		self.vertex_attributes.extend_from_slice(attributes);
	}

	pub fn set_spec_constant(&mut self, id: u32, value: u32) {
		match self.spec_constants.iter_mut().find(|(i, _)| *i == id) {
			Some((_, v)) => *v = value,
			None => self.spec_constants.push((id, value)),
		}
	}

	fn set_state(&mut self, set: u32) -> &mut SetState { self.sets.entry(set).or_default() }

	fn bind(&mut self, set: u32, binding: u32, bound: Bound) {
		let state = self.set_state(set);
		if let Bound::Sampler(sampler) = bound {
			state.samplers.insert(binding, sampler);
		} else {
			state.bindings.insert(binding, bound);
		}
		state.disturbed = true;
	}

	pub fn bind_sampler(&mut self, set: u32, binding: u32, sampler: vk::Sampler) {
		self.bind(set, binding, Bound::Sampler(sampler))
	}

	pub fn bind_sampled_image(&mut self, set: u32, binding: u32, view: vk::ImageView, layout: vk::ImageLayout) {
		self.bind(set, binding, Bound::SampledImage { view, layout })
	}

	pub fn bind_combined_image_sampler(
		&mut self, set: u32, binding: u32, view: vk::ImageView, layout: vk::ImageLayout, sampler: vk::Sampler,
	) {
		self.bind(set, binding, Bound::CombinedImageSampler { view, layout, sampler })
	}

	pub fn bind_storage_image(&mut self, set: u32, binding: u32, view: vk::ImageView) {
		self.bind(set, binding, Bound::StorageImage {
			view,
			layout: vk::ImageLayout::GENERAL,
		})
	}

	pub fn bind_uniform_buffer(&mut self, set: u32, binding: u32, buffer: Buffer) {
		self.bind(set, binding, Bound::UniformBuffer(buffer))
	}

	pub fn bind_storage_buffer(&mut self, set: u32, binding: u32, buffer: Buffer) {
		self.bind(set, binding, Bound::StorageBuffer(buffer))
	}

	pub fn push_constants(&mut self, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) -> Result<()> {
		let layout = self
			.base
			.as_ref()
			.ok_or_else(|| Error::Message("push constants need a bound pipeline".into()))?
			.layout;
		unsafe {
			self.runtime.device().cmd_push_constants(self.buf, layout, stages, offset, data);
		}
		Ok(())
	}

	// Render passes.

	pub fn begin_rendering(&mut self, color: &[RenderAttachment], depth: Option<RenderAttachment>) {
		let mut shape = RenderingShape::default();
		let mut extent = vk::Extent2D::default();
		let color_infos: Vec<_> = color
			.iter()
			.enumerate()
			.map(|(i, att)| {
				shape.color_formats[i] = att.image.format;
				shape.samples = att.image.sample_count;
				extent = vk::Extent2D {
					width: att.image.extent.width,
					height: att.image.extent.height,
				};
				rendering_attachment(att)
			})
			.collect();
		shape.color_count = color.len() as u32;

		let depth_info = depth.as_ref().map(|att| {
			shape.depth_format = att.image.format;
			extent = vk::Extent2D {
				width: att.image.extent.width,
				height: att.image.extent.height,
			};
			rendering_attachment(att)
		});

		self.shape = shape;
		self.instance = None;

		let area = vk::Rect2D {
			offset: vk::Offset2D::default(),
			extent,
		};
		if self.viewports.is_empty() {
			self.viewports.push(vk::Viewport {
				x: 0.0,
				y: 0.0,
				width: extent.width as f32,
				height: extent.height as f32,
				min_depth: 0.0,
				max_depth: 1.0,
			});
		}
		if self.scissors.is_empty() {
			self.scissors.push(area);
		}

		let mut info = vk::RenderingInfo::default()
			.render_area(area)
			.layer_count(1)
			.color_attachments(&color_infos);
		if let Some(depth_info) = depth_info.as_ref() {
			info = info.depth_attachment(depth_info);
		}
		unsafe { self.runtime.device().cmd_begin_rendering(self.buf, &info) };
	}

	pub fn end_rendering(&mut self) {
		unsafe { self.runtime.device().cmd_end_rendering(self.buf) };
		self.shape = RenderingShape::default();
		self.viewports.clear();
		self.scissors.clear();
	}

	// Draws and dispatches.

	pub fn draw(&mut self, vertices: u32, instances: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
		self.flush(vk::PipelineBindPoint::GRAPHICS)?;
		unsafe {
			self.runtime
				.device()
				.cmd_draw(self.buf, vertices, instances, first_vertex, first_instance);
		}
		Ok(())
	}

	pub fn draw_indexed(
		&mut self, indices: u32, instances: u32, first_index: u32, vertex_offset: i32, first_instance: u32,
	) -> Result<()> {
		self.flush(vk::PipelineBindPoint::GRAPHICS)?;
		unsafe {
			self.runtime
				.device()
				.cmd_draw_indexed(self.buf, indices, instances, first_index, vertex_offset, first_instance);
		}
		Ok(())
	}

	pub fn bind_index_buffer(&mut self, buffer: Buffer, ty: vk::IndexType) {
		unsafe {
			self.runtime
				.device()
				.cmd_bind_index_buffer(self.buf, buffer.buffer, buffer.offset, ty);
		}
	}

	pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: Buffer) {
		unsafe {
			self.runtime
				.device()
				.cmd_bind_vertex_buffers(self.buf, binding, &[buffer.buffer], &[buffer.offset]);
		}
	}

	pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
		self.flush(vk::PipelineBindPoint::COMPUTE)?;
		unsafe { self.runtime.device().cmd_dispatch(self.buf, x, y, z) };
		Ok(())
	}

	/// Dispatch enough workgroups to cover `invocations`, using the shader's
	/// reflected local size.
	pub fn dispatch_invocations(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
		let local = self
			.base
			.as_ref()
			.and_then(|b| b.program.local_size)
			.unwrap_or([1, 1, 1]);
		self.dispatch(x.div_ceil(local[0]), y.div_ceil(local[1]), z.div_ceil(local[2]))
	}

	// Transfers; no pipeline state involved.

	pub fn copy_buffer(&mut self, src: Buffer, dst: Buffer, size: u64) {
		unsafe {
			self.runtime.device().cmd_copy_buffer(
				self.buf,
				src.buffer,
				dst.buffer,
				&[vk::BufferCopy {
					src_offset: src.offset,
					dst_offset: dst.offset,
					size,
				}],
			);
		}
	}

	pub fn copy_buffer_to_image(&mut self, src: Buffer, dst: &ImageAttachment, layout: vk::ImageLayout) {
		unsafe {
			self.runtime.device().cmd_copy_buffer_to_image(
				self.buf,
				src.buffer,
				dst.image,
				layout,
				&[buffer_image_copy(src, dst)],
			);
		}
	}

	pub fn copy_image_to_buffer(&mut self, src: &ImageAttachment, layout: vk::ImageLayout, dst: Buffer) {
		unsafe {
			self.runtime.device().cmd_copy_image_to_buffer(
				self.buf,
				src.image,
				layout,
				dst.buffer,
				&[buffer_image_copy(dst, src)],
			);
		}
	}

	pub fn clear_image(&mut self, image: &ImageAttachment, layout: vk::ImageLayout, value: ClearValue) {
		let range = image.subrange().to_vk(image.aspect());
		unsafe {
			match value {
				ClearValue::DepthStencil { depth, stencil } => {
					self.runtime.device().cmd_clear_depth_stencil_image(
						self.buf,
						image.image,
						layout,
						&vk::ClearDepthStencilValue { depth, stencil },
						&[range],
					);
				},
				_ => {
					let color = match value {
						ClearValue::ColorF(float32) => vk::ClearColorValue { float32 },
						ClearValue::ColorU(uint32) => vk::ClearColorValue { uint32 },
						ClearValue::ColorI(int32) => vk::ClearColorValue { int32 },
						ClearValue::DepthStencil { .. } => unreachable!(),
					};
					self.runtime
						.device()
						.cmd_clear_color_image(self.buf, image.image, layout, &color, &[range]);
				},
			}
		}
	}

	pub fn fill_buffer(&mut self, dst: Buffer, data: u32) {
		unsafe {
			self.runtime
				.device()
				.cmd_fill_buffer(self.buf, dst.buffer, dst.offset, dst.size, data);
		}
	}

	pub fn update_buffer(&mut self, dst: Buffer, data: &[u8]) {
		unsafe {
			self.runtime
				.device()
				.cmd_update_buffer(self.buf, dst.buffer, dst.offset, data);
		}
	}

	pub fn pipeline_barrier(
		&mut self, global: &[vk::MemoryBarrier2], image: &[vk::ImageMemoryBarrier2], buffer: &[vk::BufferMemoryBarrier2],
	) {
		if global.is_empty() && image.is_empty() && buffer.is_empty() {
			return;
		}
		unsafe {
			self.runtime.device().cmd_pipeline_barrier2(
				self.buf,
				&vk::DependencyInfo::default()
					.memory_barriers(global)
					.image_memory_barriers(image)
					.buffer_memory_barriers(buffer),
			);
		}
	}

	// Instance key assembly and the flush path.

	/// Fold the current fixed-function state into the instance key.
	fn instance_key(&self, base: &PipelineBase) -> PipelineInstanceCreateInfo {
		let mut w = KeyWriter::default();

		w.write_i32(self.raster.polygon_mode.as_raw());
		w.write_u32(self.raster.cull_mode.as_raw());
		w.write_i32(self.raster.front_face.as_raw());
		w.write_u32(u32::from(self.raster.depth_bias_enable) | (u32::from(self.raster.conservative) << 1));

		w.write_u32(u32::from(self.depth.test) | (u32::from(self.depth.write) << 1));
		w.write_i32(self.depth.compare.as_raw());

		w.write_u32(self.blend.len() as u32);
		for b in &self.blend {
			w.write_u32(b.blend_enable);
			w.write_i32(b.src_color_blend_factor.as_raw());
			w.write_i32(b.dst_color_blend_factor.as_raw());
			w.write_i32(b.color_blend_op.as_raw());
			w.write_i32(b.src_alpha_blend_factor.as_raw());
			w.write_i32(b.dst_alpha_blend_factor.as_raw());
			w.write_i32(b.alpha_blend_op.as_raw());
			w.write_u32(b.color_write_mask.as_raw());
		}

		w.write_u32(self.vertex_bindings.len() as u32);
		for b in &self.vertex_bindings {
			w.write_u32(b.binding);
			w.write_u32(b.stride);
			w.write_i32(b.input_rate.as_raw());
		}
		w.write_u32(self.vertex_attributes.len() as u32);
		for a in &self.vertex_attributes {
			w.write_u32(a.location);
			w.write_u32(a.binding);
			w.write_i32(a.format.as_raw());
			w.write_u32(a.offset);
		}

		if !self.dynamic.contains(DynamicStateFlags::VIEWPORT) {
			for v in &self.viewports {
				w.write_f32(v.x);
				w.write_f32(v.y);
				w.write_f32(v.width);
				w.write_f32(v.height);
				w.write_f32(v.min_depth);
				w.write_f32(v.max_depth);
			}
		}
		if !self.dynamic.contains(DynamicStateFlags::SCISSOR) {
			for s in &self.scissors {
				w.write_i32(s.offset.x);
				w.write_i32(s.offset.y);
				w.write_u32(s.extent.width);
				w.write_u32(s.extent.height);
			}
		}
		if !self.dynamic.contains(DynamicStateFlags::LINE_WIDTH) {
			w.write_f32(self.line_width);
		}
		if !self.dynamic.contains(DynamicStateFlags::DEPTH_BIAS) {
			for v in self.depth_bias {
				w.write_f32(v);
			}
		}
		if !self.dynamic.contains(DynamicStateFlags::BLEND_CONSTANTS) {
			for v in self.blend_constants {
				w.write_f32(v);
			}
		}
		if !self.dynamic.contains(DynamicStateFlags::DEPTH_BOUNDS) {
			for v in self.depth_bounds {
				w.write_f32(v);
			}
		}

		w.write_u32(self.spec_constants.len() as u32);
		for &(id, value) in &self.spec_constants {
			w.write_u32(id);
			w.write_u32(value);
		}

		PipelineInstanceCreateInfo {
			base: base.id,
			shape: self.shape,
			dynamic: self.dynamic,
			payload: w.finish(),
		}
	}

	fn flush(&mut self, bind_point: vk::PipelineBindPoint) -> Result<()> {
		let base = self
			.base
			.clone()
			.ok_or_else(|| Error::Message("draw or dispatch without a bound pipeline".into()))?;

		let key = self.instance_key(&base);
		let instance = {
			let state = self.graphics_state();
			self.runtime.pipeline_instance(&key, &base, self.alloc, &state)?
		};
		if self.instance != Some(instance) {
			unsafe {
				self.runtime.device().cmd_bind_pipeline(self.buf, bind_point, instance.pipeline);
			}
			self.instance = Some(instance);
		}

		self.flush_descriptor_sets(&base, bind_point)?;
		self.flush_dynamic_state(bind_point);
		Ok(())
	}

	/// Validate descriptor state and rebind disturbed sets.
	///
	/// A set that was flushed for a previous draw stays bound only if the
	/// layout it was written against is still the one the pipeline declares;
	/// otherwise it is disturbed and rebuilt.
	fn flush_descriptor_sets(&mut self, base: &PipelineBase, bind_point: vk::PipelineBindPoint) -> Result<()> {
		for (set_index, &layout) in base.set_layouts.iter().enumerate() {
			let set_index = set_index as u32;
			let strategy = self.strategy;
			let state = self.sets.entry(set_index).or_default();
			if !state.disturbed && state.bound_layout == layout && state.current != vk::DescriptorSet::null() {
				continue;
			}

			// Resolve every binding the program declares in this set.
			let mut writes = Vec::new();
			for refl in base.program.bindings.iter().filter(|b| b.set == set_index) {
				let bound = state.bindings.get(&refl.binding);
				let paired = state.samplers.get(&refl.binding).copied();
				let resolved = match (bound, paired) {
					(Some(bound), paired) => resolve_binding(refl.ty, bound, paired),
					// A bare sampler binding.
					(None, Some(sampler)) if refl.ty == vk::DescriptorType::SAMPLER => {
						resolve_binding(vk::DescriptorType::SAMPLER, &Bound::Sampler(sampler), None)
					},
					(None, _) => None,
				};
				match resolved {
					Some(write) => writes.push((refl.binding, write)),
					None if refl.optional => {
						trace!(set = set_index, binding = refl.binding, "optional binding left unset");
					},
					None => {
						error!(
							set = set_index,
							binding = refl.binding,
							expected = ?refl.ty,
							got = ?bound,
							"descriptor binding mismatch"
						);
						debug_assert!(false, "required descriptor binding mismatch");
					},
				}
			}

			match strategy {
				DescriptorSetStrategy::PushDescriptor => {
					push_descriptors(self.runtime, self.buf, bind_point, base.layout, set_index, &writes)?;
					let state = self.sets.get_mut(&set_index).unwrap();
					state.disturbed = false;
					state.bound_layout = layout;
				},
				DescriptorSetStrategy::Common | DescriptorSetStrategy::PerLayout => {
					let pool = self.runtime.descriptor_pool_for(layout)?;
					let mut sets = [vk::DescriptorSet::null()];
					self.alloc
						.allocate_descriptor_sets(&mut sets, &[DescriptorSetCreateInfo { pool, layout }])?;
					write_set(self.runtime, sets[0], &writes);
					unsafe {
						self.runtime.device().cmd_bind_descriptor_sets(
							self.buf,
							bind_point,
							base.layout,
							set_index,
							&sets,
							&[],
						);
					}
					let state = self.sets.get_mut(&set_index).unwrap();
					state.disturbed = false;
					state.bound_layout = layout;
					state.current = sets[0];
				},
			}
		}
		Ok(())
	}

	fn flush_dynamic_state(&mut self, bind_point: vk::PipelineBindPoint) {
		if bind_point != vk::PipelineBindPoint::GRAPHICS {
			return;
		}
		let device = self.runtime.device();
		unsafe {
			if self.dynamic.contains(DynamicStateFlags::VIEWPORT) && !self.viewports.is_empty() {
				device.cmd_set_viewport(self.buf, 0, &self.viewports);
			}
			if self.dynamic.contains(DynamicStateFlags::SCISSOR) && !self.scissors.is_empty() {
				device.cmd_set_scissor(self.buf, 0, &self.scissors);
			}
			if self.dynamic.contains(DynamicStateFlags::LINE_WIDTH) {
				device.cmd_set_line_width(self.buf, self.line_width);
			}
			if self.dynamic.contains(DynamicStateFlags::DEPTH_BIAS) {
				device.cmd_set_depth_bias(self.buf, self.depth_bias[0], self.depth_bias[1], self.depth_bias[2]);
			}
			if self.dynamic.contains(DynamicStateFlags::BLEND_CONSTANTS) {
				device.cmd_set_blend_constants(self.buf, &self.blend_constants);
			}
			if self.dynamic.contains(DynamicStateFlags::DEPTH_BOUNDS) {
				device.cmd_set_depth_bounds(self.buf, self.depth_bounds[0], self.depth_bounds[1]);
			}
		}
	}

	/// The current fixed-function state, for instance construction.
	pub(crate) fn graphics_state(&self) -> GraphicsState<'_> {
		GraphicsState {
			raster: vk::PipelineRasterizationStateCreateInfo::default()
				.polygon_mode(self.raster.polygon_mode)
				.cull_mode(self.raster.cull_mode)
				.front_face(self.raster.front_face)
				.depth_bias_enable(self.raster.depth_bias_enable)
				.depth_bias_constant_factor(self.depth_bias[0])
				.depth_bias_clamp(self.depth_bias[1])
				.depth_bias_slope_factor(self.depth_bias[2])
				.line_width(self.line_width),
			depth: vk::PipelineDepthStencilStateCreateInfo::default()
				.depth_test_enable(self.depth.test)
				.depth_write_enable(self.depth.write)
				.depth_compare_op(self.depth.compare)
				.min_depth_bounds(self.depth_bounds[0])
				.max_depth_bounds(self.depth_bounds[1]),
			blend: &self.blend,
			vertex_bindings: &self.vertex_bindings,
			vertex_attributes: &self.vertex_attributes,
			viewports: &self.viewports,
			scissors: &self.scissors,
			spec_constants: &self.spec_constants,
			dynamic: self.dynamic,
			shape: self.shape,
		}
	}
}

/// A borrowed snapshot of the recorder's fixed-function state.
pub(crate) struct GraphicsState<'a> {
	pub raster: vk::PipelineRasterizationStateCreateInfo<'static>,
	pub depth: vk::PipelineDepthStencilStateCreateInfo<'static>,
	pub blend: &'a [vk::PipelineColorBlendAttachmentState],
	pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
	pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
	pub viewports: &'a [vk::Viewport],
	pub scissors: &'a [vk::Rect2D],
	pub spec_constants: &'a [(u32, u32)],
	pub dynamic: DynamicStateFlags,
	pub shape: RenderingShape,
}

fn rendering_attachment(att: &RenderAttachment) -> vk::RenderingAttachmentInfo<'static> {
	let mut info = vk::RenderingAttachmentInfo::default()
		.image_view(att.image.view)
		.image_layout(if att.image.aspect().contains(vk::ImageAspectFlags::DEPTH) {
			vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
		} else {
			vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
		})
		.load_op(att.load)
		.store_op(vk::AttachmentStoreOp::STORE);
	if let Some(clear) = att.clear {
		info = info.clear_value(clear.to_vk());
	}
	info
}

fn buffer_image_copy(buffer: Buffer, image: &ImageAttachment) -> vk::BufferImageCopy {
	vk::BufferImageCopy {
		buffer_offset: buffer.offset,
		buffer_row_length: 0,
		buffer_image_height: 0,
		image_subresource: vk::ImageSubresourceLayers {
			aspect_mask: image.aspect(),
			mip_level: image.base_level,
			base_array_layer: image.base_layer,
			layer_count: if image.layer_count == vk::REMAINING_ARRAY_LAYERS {
				1
			} else {
				image.layer_count
			},
		},
		image_offset: vk::Offset3D::default(),
		image_extent: image.mip_extent(image.base_level),
	}
}

fn write_set(runtime: &Runtime, set: vk::DescriptorSet, writes: &[(u32, ResolvedWrite)]) {
	if writes.is_empty() {
		return;
	}
	let mut image_infos = Vec::new();
	let mut buffer_infos = Vec::new();
	for (_, write) in writes {
		match *write {
			ResolvedWrite::Image { view, layout, sampler, .. } => image_infos.push(
				vk::DescriptorImageInfo::default()
					.image_view(view)
					.image_layout(layout)
					.sampler(sampler),
			),
			ResolvedWrite::Buffer { buffer, offset, range, .. } => buffer_infos.push(
				vk::DescriptorBufferInfo::default()
					.buffer(buffer)
					.offset(offset)
					.range(range),
			),
		}
	}
	let (mut image_i, mut buffer_i) = (0, 0);
	let vk_writes: Vec<_> = writes
		.iter()
		.map(|&(binding, write)| {
			let w = vk::WriteDescriptorSet::default().dst_set(set).dst_binding(binding);
			match write {
				ResolvedWrite::Image { ty, .. } => {
					let info = &image_infos[image_i..image_i + 1];
					image_i += 1;
					w.descriptor_type(ty).image_info(info)
				},
				ResolvedWrite::Buffer { ty, .. } => {
					let info = &buffer_infos[buffer_i..buffer_i + 1];
					buffer_i += 1;
					w.descriptor_type(ty).buffer_info(info)
				},
			}
		})
		.collect();
	unsafe { runtime.device().update_descriptor_sets(&vk_writes, &[]) };
}

fn push_descriptors(
	runtime: &Runtime, buf: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, layout: vk::PipelineLayout,
	set: u32, writes: &[(u32, ResolvedWrite)],
) -> Result<()> {
	let Some(ext) = runtime.push_descriptor_ext() else {
		return Err(Error::Message("push descriptors are not supported by the device".into()));
	};
	if writes.is_empty() {
		return Ok(());
	}
	let mut image_infos = Vec::new();
	let mut buffer_infos = Vec::new();
	for (_, write) in writes {
		match *write {
			ResolvedWrite::Image { view, layout, sampler, .. } => image_infos.push(
				vk::DescriptorImageInfo::default()
					.image_view(view)
					.image_layout(layout)
					.sampler(sampler),
			),
			ResolvedWrite::Buffer { buffer, offset, range, .. } => buffer_infos.push(
				vk::DescriptorBufferInfo::default()
					.buffer(buffer)
					.offset(offset)
					.range(range),
			),
		}
	}
	let (mut image_i, mut buffer_i) = (0, 0);
	let vk_writes: Vec<_> = writes
		.iter()
		.map(|&(binding, write)| {
			let w = vk::WriteDescriptorSet::default().dst_binding(binding);
			match write {
				ResolvedWrite::Image { ty, .. } => {
					let info = &image_infos[image_i..image_i + 1];
					image_i += 1;
					w.descriptor_type(ty).image_info(info)
				},
				ResolvedWrite::Buffer { ty, .. } => {
					let info = &buffer_infos[buffer_i..buffer_i + 1];
					buffer_i += 1;
					w.descriptor_type(ty).buffer_info(info)
				},
			}
		})
		.collect();
	unsafe { ext.cmd_push_descriptor_set(buf, bind_point, layout, set, &vk_writes) };
	Ok(())
}
