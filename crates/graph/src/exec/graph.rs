//! Execution of a compiled graph: resource materialization, recording,
//! per-queue submission, and signal arming.

use ash::vk;
use rustc_hash::FxHashMap;
use tracing::{span, Level};

use crate::{
	alloc::{
		Allocator,
		BufferCreateInfo,
		CommandBufferCreateInfo,
		CommandPoolCreateInfo,
		ImageCreateInfo,
		ImageViewCreateInfo,
	},
	compile::{Compiler, LinkId, ScheduledItem},
	exec::{
		cmd::{CommandRecorder, PassContext},
		queue::SemaphoreOp,
		signal::SyncPoint,
	},
	ir::{ConstantValue, IRModule, ModuleRef, NodeId, NodeKind, Ref, TypeKind},
	resource::{ImageAttachment, MemoryUsage, Subrange},
	sync::{Access, DomainFlags, ResourceUse},
	Error,
	Result,
};

/// A compiled graph ready to record and submit.
pub struct ExecutableRenderGraph<'c> {
	compiler: &'c mut Compiler,
	module: ModuleRef,
}

#[derive(Default)]
struct QueueBatch {
	pool: vk::CommandPool,
	buf: vk::CommandBuffer,
	waits: Vec<SemaphoreOp>,
	/// Timeline waits on other queues of this submission, resolved to concrete
	/// values at submit time.
	cross: Vec<(DomainFlags, vk::PipelineStageFlags2)>,
	/// Signals to arm with this queue's sync point.
	arm: Vec<(std::sync::Arc<crate::exec::signal::Signal>, Vec<ConstantValue>, Vec<ResourceUse>)>,
	used: bool,
}

struct ExecState<'r> {
	alloc: Allocator<'r>,
	/// Last observed use per image and buffer, for barrier synthesis.
	image_state: FxHashMap<vk::Image, ResourceUse>,
	buffer_state: FxHashMap<vk::Buffer, ResourceUse>,
	/// Read barriers already emitted, one per link.
	read_done: FxHashMap<LinkId, ()>,
	/// Which queue executed each node.
	queue_of: FxHashMap<NodeId, DomainFlags>,
}

impl<'c> ExecutableRenderGraph<'c> {
	pub fn new(compiler: &'c mut Compiler, module: ModuleRef) -> Self { Self { compiler, module } }

	pub fn compiler(&self) -> &Compiler { self.compiler }

	/// Record every scheduled pass and submit per queue, arming the signals of
	/// everything this graph releases.
	pub fn execute(self, runtime: &crate::runtime::Runtime, alloc: &Allocator<'_>) -> Result<()> {
		let span = span!(Level::TRACE, "execute graph");
		let _e = span.enter();

		let mut m = self.module.lock();
		self.materialize(&mut m, alloc)?;

		let mut state = ExecState {
			alloc: *alloc,
			image_state: FxHashMap::default(),
			buffer_state: FxHashMap::default(),
			read_done: FxHashMap::default(),
			queue_of: FxHashMap::default(),
		};

		let parts = self.compiler.partitions().clone();
		let order = [
			(DomainFlags::TRANSFER_QUEUE, parts.transfer.clone()),
			(DomainFlags::COMPUTE_QUEUE, parts.compute.clone()),
			(DomainFlags::GRAPHICS_QUEUE, parts.graphics.clone()),
		];

		let mut batches: FxHashMap<u32, QueueBatch> = FxHashMap::default();
		for (domain, range) in order.iter().cloned() {
			let items: Vec<ScheduledItem> = self.compiler.partition(range).copied().collect();
			if items.is_empty() {
				continue;
			}
			let Some(queue) = runtime.queue(domain) else {
				return Err(Error::Message(format!("no queue for domain {:?}", domain)));
			};

			// Domains sharing one family (no dedicated queue) share a batch.
			if !batches.contains_key(&queue.family()) {
				let mut batch = QueueBatch::default();
				batch.pool = alloc.allocate_command_pool(CommandPoolCreateInfo {
					flags: vk::CommandPoolCreateFlags::TRANSIENT,
					queue_family: queue.family(),
				})?;
				batch.buf = alloc.allocate_command_buffer(CommandBufferCreateInfo {
					pool: batch.pool,
					level: vk::CommandBufferLevel::PRIMARY,
				})?;
				unsafe {
					runtime.device().begin_command_buffer(
						batch.buf,
						&vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
					)?;
				}
				batches.insert(queue.family(), batch);
			}
			let batch = batches.get_mut(&queue.family()).unwrap();

			let mut recorder = CommandRecorder::new(runtime, *alloc, batch.buf, domain);
			for item in &items {
				self.record_item(&mut m, &mut state, &mut recorder, batch, domain, item)?;
				state.queue_of.insert(item.node, domain);
			}
			batch.used = true;
		}

		for batch in batches.values() {
			unsafe { runtime.device().end_command_buffer(batch.buf)? };
		}

		// Submit in partition order; later queues wait on the points the
		// earlier submissions returned.
		let mut points: FxHashMap<u32, SyncPoint> = FxHashMap::default();
		for (domain, _) in order.iter() {
			let Some(queue) = runtime.queue(*domain) else { continue };
			let Some(batch) = batches.remove(&queue.family()) else { continue };
			if !batch.used {
				continue;
			}

			let mut waits = batch.waits.clone();
			for (dep_domain, stages) in &batch.cross {
				let Some(dep_queue) = runtime.queue(*dep_domain) else { continue };
				if dep_queue.family() == queue.family() {
					continue;
				}
				let value = match points.get(&dep_queue.family()) {
					Some(point) => point.value,
					// The dependency submits after us in partition order; that
					// would deadlock a single-batch submission.
					None => return Err(Error::Message("cross-queue dependency against submission order".into())),
				};
				waits.push(SemaphoreOp {
					semaphore: dep_queue.semaphore(),
					value,
					stages: *stages,
				});
			}

			let point = queue.submit(runtime.device(), &waits, &[batch.buf], &[], vk::Fence::null())?;
			points.insert(queue.family(), point);

			for (signal, values, last_use) in batch.arm {
				signal.arm(point, values, last_use);
			}

			alloc.deallocate_command_buffers(&[batch.buf], batch.pool);
			alloc.deallocate_command_pools(&[batch.pool]);
		}

		Ok(())
	}

	/// Allocate every construct-declared image and buffer that has no handle
	/// yet, writing the handles back into the construct payloads.
	fn materialize(&self, m: &mut IRModule, alloc: &Allocator) -> Result<()> {
		for idx in 0..self.compiler.nodes.len() {
			let id = self.compiler.nodes[idx];
			if !matches!(m.node(id).kind, NodeKind::Construct) {
				continue;
			}
			let this = Ref::new(id, 0);
			let is_image = m.node(id).types[0].is_image();
			let is_buffer = m.node(id).types[0].is_buffer();
			if !is_image && !is_buffer {
				continue;
			}

			let value = m
				.eval(this)
				.map_err(|e| crate::compile::GraphError::CannotInfer {
					node: m.node(e.0.node).index,
				})?;
			let usage = self.chain_usage(this);

			if is_image {
				let ia = *value.as_image().unwrap();
				if ia.image != vk::Image::null() {
					continue;
				}
				let image = alloc.allocate_image(ImageCreateInfo {
					flags: vk::ImageCreateFlags::empty(),
					format: ia.format,
					extent: ia.extent,
					levels: ia.level_count,
					layers: ia.layer_count,
					samples: ia.sample_count,
					usage: usage.0,
				})?;
				let view = alloc.allocate_image_view(ImageViewCreateInfo {
					image,
					view_type: ia.view_type,
					format: ia.format,
					subrange: Subrange::default(),
				})?;
				let arg0 = m.node(id).args.as_slice()[0];
				if let Some(payload) = m.node_mut(arg0.node).constant_mut().and_then(|v| v.as_image_mut()) {
					payload.image = image;
					payload.view = view.view;
					payload.usage = usage.0;
					payload.extent = ia.extent;
					payload.format = ia.format;
					payload.sample_count = ia.sample_count;
					payload.level_count = ia.level_count;
					payload.layer_count = ia.layer_count;
				}
			} else {
				let buffer = *value.as_buffer().unwrap();
				if buffer.buffer != vk::Buffer::null() {
					continue;
				}
				let allocated = alloc.allocate_buffer(BufferCreateInfo {
					size: buffer.size,
					usage: usage.1,
					memory: usage.2,
					alignment: 256,
				})?;
				let arg0 = m.node(id).args.as_slice()[0];
				if let Some(payload) = m.node_mut(arg0.node).constant_mut().and_then(|v| v.as_buffer_mut()) {
					*payload = allocated;
				}
			}
		}
		Ok(())
	}

	/// Derive creation usage from every use along the resource's chain,
	/// including sub-chains.
	fn chain_usage(&self, construct: Ref) -> (vk::ImageUsageFlags, vk::BufferUsageFlags, MemoryUsage) {
		let mut image = vk::ImageUsageFlags::empty();
		let mut buffer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
		let mut memory = MemoryUsage::GpuOnly;

		let mut stack = vec![self.compiler.link_id(construct)];
		while let Some(link_id) = stack.pop() {
			let link = self.compiler.chain(link_id);
			for sync in link.read_sync.iter().chain(link.undef_sync.iter()) {
				image |= layout_usage(sync.layout);
				buffer |= stage_buffer_usage(sync.stages);
				if sync.stages.contains(vk::PipelineStageFlags2::HOST) {
					memory = MemoryUsage::CpuToGpu;
				}
			}
			stack.extend(link.child_chains.iter().copied());
			if let Some(next) = link.next {
				stack.push(next);
			}
		}
		if image.is_empty() {
			image = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
		} else {
			image |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
		}
		(image, buffer, memory)
	}

	fn record_item(
		&self, m: &mut IRModule, state: &mut ExecState, recorder: &mut CommandRecorder, batch: &mut QueueBatch,
		domain: DomainFlags, item: &ScheduledItem,
	) -> Result<()> {
		let id = item.node;
		let args: Vec<Ref> = m.node(id).args.as_slice().to_vec();
		match &m.node(id).kind {
			NodeKind::Clear { value } => {
				let value = *value;
				let ia = resolve_image(m, args[0])?;
				let use_ = self
					.compiler
					.chain_of(args[0])
					.undef_sync
					.unwrap_or(crate::sync::to_use(Access::TransferClear));
				self.barrier_to(state, recorder, &ia, use_, args[0], None)?;
				recorder.clear_image(&ia, use_.layout, value);
			},

			NodeKind::Call => {
				let callee_ty = m.ref_type(args[0]);
				let fn_args = callee_ty.fn_args().unwrap().to_vec();

				// Barriers first, then the callback records freely.
				for (i, &parm) in args[1..].iter().enumerate() {
					let access = fn_args[i].imbued_access().unwrap();
					let link_id = self.compiler.link_id(parm);
					let link = self.compiler.chain(link_id);
					let sync = if crate::sync::is_write_access(access) || access == Access::Consume {
						link.undef_sync
					} else {
						// One merged barrier for all parallel readers.
						if state.read_done.insert(link_id, ()).is_some() {
							None
						} else {
							link.read_sync
						}
					};
					if let Some(sync) = sync {
						match resolve_value(m, parm)? {
							ConstantValue::Image(ia) => {
								self.barrier_to(state, recorder, &ia, sync, parm, None)?
							},
							ConstantValue::Buffer(buffer) => {
								let prev = state
									.buffer_state
									.insert(buffer.buffer, sync)
									.unwrap_or_default();
								recorder.pipeline_barrier(
									&[vk::MemoryBarrier2::default()
										.src_stage_mask(prev.stages)
										.src_access_mask(prev.access)
										.dst_stage_mask(sync.stages)
										.dst_access_mask(sync.access)],
									&[],
									&[],
								);
							},
							_ => {},
						}
					}
					// Reads of values produced on another queue wait on that
					// queue's timeline.
					if let Some(def) = link.urdef {
						if let Some(&dep_domain) = state.queue_of.get(&def.node) {
							if dep_domain != domain {
								batch.cross.push((dep_domain, crate::sync::to_use(access).stages));
							}
						}
					}
				}

				let values: Result<Vec<ConstantValue>> =
					args[1..].iter().map(|&parm| resolve_value(m, parm)).collect();
				let values = values?;

				match &callee_ty.kind {
					TypeKind::OpaqueFn(f) => {
						let execute = f.execute.clone();
						let mut ctx = PassContext {
							cmd: recorder,
							args: &values,
						};
						execute(&mut ctx)?;
					},
					TypeKind::ShaderFn(f) => {
						let base = recorder.runtime().shader_fn_pipeline(&f.spirv, &state.alloc)?;
						recorder.bind_pipeline(base);
						for (i, value) in values.iter().enumerate() {
							match value {
								ConstantValue::Image(ia) => recorder.bind_storage_image(0, i as u32, ia.view),
								ConstantValue::Buffer(b) => recorder.bind_storage_buffer(0, i as u32, *b),
								_ => {},
							}
						}
						let (x, y, z) = values
							.iter()
							.find_map(|v| match v {
								ConstantValue::Image(ia) => Some((ia.extent.width, ia.extent.height, ia.extent.depth)),
								ConstantValue::Buffer(b) => Some(((b.size / 4) as u32, 1, 1)),
								_ => None,
							})
							.unwrap_or((1, 1, 1));
						recorder.dispatch_invocations(x, y, z)?;
					},
					_ => return Err(Error::Message("call of a non-callable value".into())),
				}
			},

			NodeKind::AcquireNextImage => {
				let ConstantValue::Swapchain(handle) = m.eval(args[0]).map_err(|_| {
					Error::Message("swapchain must be known at execution".into())
				})? else {
					return Err(Error::Message("acquire_next_image on a non-swapchain".into()));
				};
				let (image, available) = handle.lock().acquire_next_image(recorder.runtime())?;
				batch.waits.push(SemaphoreOp {
					semaphore: available,
					value: 0,
					stages: vk::PipelineStageFlags2::ALL_COMMANDS,
				});
				// Later consumers resolve through the node's value.
				m.node_mut(id).kind = NodeKind::Acquire {
					values: vec![ConstantValue::Image(image)],
				};
			},

			NodeKind::Acquire { .. } => {
				// Work from a previous submission: import its last uses and
				// wait for its sync point.
				if let Some(signal) = m.node(id).acqrel.clone() {
					let point = signal.sync_point();
					if point.domain.is_single_queue() && point.domain != domain {
						batch.cross.push((point.domain, vk::PipelineStageFlags2::ALL_COMMANDS));
					}
					for (i, value) in signal.values().into_iter().enumerate() {
						if let Some(last) = signal.last_use(i) {
							match value {
								ConstantValue::Image(ia) => {
									state.image_state.insert(ia.image, last);
								},
								ConstantValue::Buffer(b) => {
									state.buffer_state.insert(b.buffer, last);
								},
								_ => {},
							}
						}
					}
				}
			},

			NodeKind::Splice | NodeKind::Release { .. } => {
				// Final-state barrier for releases with a destination access.
				if let NodeKind::Release { dst_access, .. } = m.node(id).kind {
					if dst_access != Access::None {
						if let Ok(ConstantValue::Image(ia)) = resolve_value(m, args[0]) {
							let use_ = crate::sync::to_use(dst_access);
							self.barrier_to(state, recorder, &ia, use_, args[0], None)?;
						}
					}
				}
				if let Some(signal) = m.node(id).acqrel.clone() {
					let values: Result<Vec<ConstantValue>> = args.iter().map(|&r| resolve_value(m, r)).collect();
					let values = values?;
					let last_use: Vec<ResourceUse> = values
						.iter()
						.map(|v| match v {
							ConstantValue::Image(ia) => {
								state.image_state.get(&ia.image).copied().unwrap_or_default()
							},
							ConstantValue::Buffer(b) => {
								state.buffer_state.get(&b.buffer).copied().unwrap_or_default()
							},
							_ => ResourceUse::default(),
						})
						.collect();
					batch.arm.push((signal, values, last_use));
				}
			},

			NodeKind::Converge { .. } | NodeKind::MathBinary { .. } | NodeKind::Construct => {},

			other => {
				return Err(Error::Message(format!("cannot execute node kind {}", other.name())));
			},
		}
		Ok(())
	}

	/// Transition an image to `use_`, batching against its tracked state.
	fn barrier_to(
		&self, state: &mut ExecState, recorder: &mut CommandRecorder, ia: &ImageAttachment, use_: ResourceUse,
		_at: Ref, subrange: Option<Subrange>,
	) -> Result<()> {
		let prev = state.image_state.insert(ia.image, use_).unwrap_or(ResourceUse {
			stages: vk::PipelineStageFlags2::TOP_OF_PIPE,
			access: vk::AccessFlags2::empty(),
			layout: vk::ImageLayout::UNDEFINED,
		});
		if prev == use_ {
			return Ok(());
		}
		let range = subrange.unwrap_or_default();
		recorder.pipeline_barrier(
			&[],
			&[vk::ImageMemoryBarrier2::default()
				.src_stage_mask(prev.stages)
				.src_access_mask(prev.access)
				.old_layout(prev.layout)
				.dst_stage_mask(use_.stages)
				.dst_access_mask(use_.access)
				.new_layout(use_.layout)
				.image(ia.image)
				.subresource_range(range.to_vk(ia.aspect()))],
			&[],
		);
		Ok(())
	}
}

/// The runtime value on `r`, resolving through execution-only nodes that plain
/// evaluation cannot see.
fn resolve_value(m: &IRModule, r: Ref) -> Result<ConstantValue> {
	let node = m.node(r.node);
	let args = node.args.as_slice();
	match &node.kind {
		NodeKind::Call => {
			let arg = node.types[r.index as usize]
				.aliased_arg()
				.ok_or_else(|| Error::Message("call result does not alias an argument".into()))? as usize;
			resolve_value(m, args[arg])
		},
		NodeKind::Clear { .. } => resolve_value(m, args[0]),
		NodeKind::Splice | NodeKind::Release { .. } => resolve_value(m, args[r.index as usize]),
		NodeKind::Converge { .. } => resolve_value(m, args[0]),
		NodeKind::IndirectDepend => resolve_value(m, args[0]),
		NodeKind::Slice { .. } | NodeKind::Construct | NodeKind::Constant { .. } | NodeKind::Import { .. }
		| NodeKind::Acquire { .. } | NodeKind::Extract | NodeKind::MathBinary { .. } | NodeKind::Cast => m
			.eval(r)
			.map_err(|e| Error::Message(format!("value of {:?} is not resolvable at execution", e.0))),
		other => Err(Error::Message(format!("cannot resolve value of {}", other.name()))),
	}
}

fn layout_usage(layout: vk::ImageLayout) -> vk::ImageUsageFlags {
	match layout {
		vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::ImageUsageFlags::COLOR_ATTACHMENT,
		vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
			vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
		},
		vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL | vk::ImageLayout::READ_ONLY_OPTIMAL => vk::ImageUsageFlags::SAMPLED,
		vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::ImageUsageFlags::TRANSFER_SRC,
		vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::ImageUsageFlags::TRANSFER_DST,
		vk::ImageLayout::GENERAL => vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
		_ => vk::ImageUsageFlags::empty(),
	}
}

fn stage_buffer_usage(stages: vk::PipelineStageFlags2) -> vk::BufferUsageFlags {
	let mut usage = vk::BufferUsageFlags::empty();
	if stages.intersects(
		vk::PipelineStageFlags2::VERTEX_SHADER
			| vk::PipelineStageFlags2::FRAGMENT_SHADER
			| vk::PipelineStageFlags2::COMPUTE_SHADER
			| vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
	) {
		usage |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER;
	}
	if stages.intersects(vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT) {
		usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
	}
	if stages.intersects(vk::PipelineStageFlags2::INDEX_INPUT) {
		usage |= vk::BufferUsageFlags::INDEX_BUFFER;
	}
	if stages.intersects(vk::PipelineStageFlags2::DRAW_INDIRECT) {
		usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
	}
	usage
}

fn resolve_image(m: &IRModule, r: Ref) -> Result<ImageAttachment> {
	match resolve_value(m, r)? {
		ConstantValue::Image(ia) => Ok(ia),
		_ => Err(Error::Message("expected an image value".into())),
	}
}
