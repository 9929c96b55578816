//! The IR module: interned types, the node arena, and builders for every op.

use std::sync::{
	atomic::{AtomicU32, Ordering},
	Arc,
	Weak,
};

use ash::vk;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub use crate::ir::{
	node::{Args, Axis, BinOp, ConstantValue, Node, NodeDebugInfo, NodeId, NodeKind, Ref, SchedulingInfo},
	ty::{tag, OpaqueFn, ShaderFn, Type, TypeKind},
	value::{ExtNode, Value},
};
use crate::{
	exec::{cmd::PassFn, signal::Signal},
	resource::{Buffer, ClearValue, ImageAttachment},
	swapchain::SwapchainHandle,
	sync::{Access, DomainFlags},
};

pub mod node;
pub mod ty;
pub mod value;

/// A module shared between the values built on it and the compiler.
pub type ModuleRef = Arc<Mutex<IRModule>>;

/// Field indices of the arguments of an image `CONSTRUCT`.
pub mod img_field {
	pub const WIDTH: usize = 1;
	pub const HEIGHT: usize = 2;
	pub const DEPTH: usize = 3;
	pub const FORMAT: usize = 4;
	pub const SAMPLES: usize = 5;
	pub const BASE_LAYER: usize = 6;
	pub const LAYER_COUNT: usize = 7;
	pub const BASE_LEVEL: usize = 8;
	pub const LEVEL_COUNT: usize = 9;
	pub const COUNT: usize = 10;
}

/// Field indices of the arguments of a buffer `CONSTRUCT`.
pub mod buf_field {
	pub const SIZE: usize = 1;
	pub const COUNT: usize = 2;
}

/// Raised inside inference when a ref has no compile-time value; converted to a
/// graph error at pass boundaries.
#[derive(Copy, Clone, Debug)]
pub struct CannotBeConstantEvaluated(pub Ref);

pub type EvalResult<T = ConstantValue> = std::result::Result<T, CannotBeConstantEvaluated>;

static MODULE_IDS: AtomicU32 = AtomicU32::new(1);

#[derive(Default)]
struct TypeTable {
	by_hash: FxHashMap<u32, Vec<Weak<Type>>>,
}

impl TypeTable {
	fn intern(&mut self, kind: TypeKind) -> Arc<Type> {
		let ty = Type::new(kind);
		let bucket = self.by_hash.entry(ty.hash32()).or_default();
		bucket.retain(|weak| weak.strong_count() > 0);
		for weak in bucket.iter() {
			if let Some(existing) = weak.upgrade() {
				if ty::structurally_equal(&existing, &ty) {
					return existing;
				}
			}
		}
		let ty = Arc::new(ty);
		bucket.push(Arc::downgrade(&ty));
		ty
	}
}

/// Owns the node arena and the interned type table of one graph-building
/// context.
pub struct IRModule {
	id: u32,
	nodes: Vec<Node>,
	free: Vec<NodeId>,
	counter: u64,
	aux_order: u32,
	types: TypeTable,

	pub ty_u32: Arc<Type>,
	pub ty_u64: Arc<Type>,
	pub ty_format: Arc<Type>,
	pub ty_sample_count: Arc<Type>,
	pub builtin_image: Arc<Type>,
	pub builtin_buffer: Arc<Type>,
	pub builtin_swapchain: Arc<Type>,
	pub builtin_sampler: Arc<Type>,
	pub builtin_sampled_image: Arc<Type>,
}

impl IRModule {
	pub fn new() -> Self {
		let mut types = TypeTable::default();
		let ty_u32 = types.intern(TypeKind::Integer { width: 32 });
		let ty_u64 = types.intern(TypeKind::Integer { width: 64 });
		let ty_format = types.intern(TypeKind::Enum {
			tag: tag::FORMAT,
			format: Some(|v| format!("{:?}", vk::Format::from_raw(v as i32))),
		});
		let ty_sample_count = types.intern(TypeKind::Enum {
			tag: tag::SAMPLE_COUNT,
			format: Some(|v| format!("{}x", v)),
		});
		// Field 0 is the opaque payload; the remaining fields line up with the
		// construct's argument indices.
		let image_payload = types.intern(TypeKind::Memory {
			size: std::mem::size_of::<ImageAttachment>() as u64,
		});
		let builtin_image = types.intern(TypeKind::Composite {
			fields: vec![
				image_payload,
				ty_u32.clone(),
				ty_u32.clone(),
				ty_u32.clone(),
				ty_format.clone(),
				ty_sample_count.clone(),
				ty_u32.clone(),
				ty_u32.clone(),
				ty_u32.clone(),
				ty_u32.clone(),
			],
			tag: tag::IMAGE,
		});
		let buffer_payload = types.intern(TypeKind::Memory {
			size: std::mem::size_of::<Buffer>() as u64,
		});
		let builtin_buffer = types.intern(TypeKind::Composite {
			fields: vec![buffer_payload, ty_u64.clone()],
			tag: tag::BUFFER,
		});
		let builtin_swapchain = types.intern(TypeKind::Opaque { tag: tag::SWAPCHAIN });
		let builtin_sampler = types.intern(TypeKind::Opaque { tag: tag::SAMPLER });
		let builtin_sampled_image = types.intern(TypeKind::Composite {
			fields: vec![builtin_image.clone(), builtin_sampler.clone()],
			tag: tag::SAMPLED_IMAGE,
		});

		Self {
			id: MODULE_IDS.fetch_add(1, Ordering::Relaxed),
			nodes: Vec::new(),
			free: Vec::new(),
			counter: 0,
			aux_order: 0,
			types,
			ty_u32,
			ty_u64,
			ty_format,
			ty_sample_count,
			builtin_image,
			builtin_buffer,
			builtin_swapchain,
			builtin_sampler,
			builtin_sampled_image,
		}
	}

	pub fn new_shared() -> ModuleRef { Arc::new(Mutex::new(Self::new())) }

	pub fn id(&self) -> u32 { self.id }

	/// Intern a type; equal types come back pointer-equal.
	pub fn emplace_type(&mut self, kind: TypeKind) -> Arc<Type> { self.types.intern(kind) }

	pub fn node(&self, id: NodeId) -> &Node { &self.nodes[id.index()] }

	pub fn node_mut(&mut self, id: NodeId) -> &mut Node { &mut self.nodes[id.index()] }

	pub fn ref_type(&self, r: Ref) -> Arc<Type> { self.node(r.node).types[r.index as usize].clone() }

	/// Every live (non-garbage) node id, in arena order.
	pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
		self.nodes
			.iter()
			.enumerate()
			.filter(|(_, n)| !matches!(n.kind, NodeKind::Garbage))
			.map(|(i, _)| NodeId(i as u32))
	}

	pub fn live_node_count(&self) -> usize {
		self.nodes
			.iter()
			.filter(|n| !matches!(n.kind, NodeKind::Garbage))
			.count()
	}

	fn next_aux_order(&mut self) -> u32 {
		self.aux_order += 1;
		self.aux_order
	}

	pub fn emplace(&mut self, kind: NodeKind, args: Args, types: Vec<Arc<Type>>) -> NodeId {
		self.counter += 1;
		let node = Node {
			kind,
			args,
			types,
			index: ((self.id as u64) << 32) | self.counter,
			flag: 0,
			held: false,
			compute_class: DomainFlags::DEVICE,
			scheduling: None,
			debug: None,
			acqrel: None,
		};
		match self.free.pop() {
			Some(id) => {
				self.nodes[id.index()] = node;
				id
			},
			None => {
				self.nodes.push(node);
				NodeId(self.nodes.len() as u32 - 1)
			},
		}
	}

	pub fn make_placeholder(&mut self, ty: Arc<Type>) -> Ref {
		let id = self.emplace(NodeKind::Placeholder, Args::default(), vec![ty]);
		self.node_mut(id).compute_class = DomainFlags::PLACEHOLDER;
		Ref::new(id, 0)
	}

	pub fn make_constant(&mut self, value: ConstantValue, ty: Arc<Type>) -> Ref {
		let id = self.emplace(NodeKind::Constant { value }, Args::default(), vec![ty]);
		self.node_mut(id).compute_class = DomainFlags::CONSTANT;
		Ref::new(id, 0)
	}

	pub fn make_u32(&mut self, v: u32) -> Ref {
		let ty = self.ty_u32.clone();
		self.make_constant(ConstantValue::U32(v), ty)
	}

	pub fn make_u64(&mut self, v: u64) -> Ref {
		let ty = self.ty_u64.clone();
		self.make_constant(ConstantValue::U64(v), ty)
	}

	fn image_field(&mut self, known: bool, value: ConstantValue, ty: Arc<Type>) -> Ref {
		if known {
			self.make_constant(value, ty)
		} else {
			self.make_placeholder(ty)
		}
	}

	/// Declare an image attachment; unknown fields become placeholders for
	/// inference to fill.
	pub fn declare_image(&mut self, ia: ImageAttachment) -> Ref {
		let (u32t, fmt, smp, image_ty) = (
			self.ty_u32.clone(),
			self.ty_format.clone(),
			self.ty_sample_count.clone(),
			self.builtin_image.clone(),
		);
		let args = [
			self.make_constant(ConstantValue::Image(ia), image_ty.clone()),
			self.image_field(ia.extent.width > 0, ConstantValue::U32(ia.extent.width), u32t.clone()),
			self.image_field(ia.extent.height > 0, ConstantValue::U32(ia.extent.height), u32t.clone()),
			self.image_field(ia.extent.depth > 0, ConstantValue::U32(ia.extent.depth), u32t.clone()),
			self.image_field(ia.format != vk::Format::UNDEFINED, ConstantValue::Format(ia.format), fmt),
			self.image_field(!ia.sample_count.is_empty(), ConstantValue::Samples(ia.sample_count), smp),
			self.make_constant(ConstantValue::U32(ia.base_layer), u32t.clone()),
			self.image_field(
				ia.layer_count != vk::REMAINING_ARRAY_LAYERS,
				ConstantValue::U32(ia.layer_count),
				u32t.clone(),
			),
			self.make_constant(ConstantValue::U32(ia.base_level), u32t.clone()),
			self.image_field(
				ia.level_count != vk::REMAINING_MIP_LEVELS,
				ConstantValue::U32(ia.level_count),
				u32t,
			),
		];
		let id = self.emplace(NodeKind::Construct, Args::new(&args), vec![image_ty]);
		Ref::new(id, 0)
	}

	/// Declare a buffer; an unknown size becomes a placeholder.
	pub fn declare_buffer(&mut self, buffer: Buffer) -> Ref {
		let (u64t, buffer_ty) = (self.ty_u64.clone(), self.builtin_buffer.clone());
		let args = [
			self.make_constant(ConstantValue::Buffer(buffer), buffer_ty.clone()),
			if buffer.size != u64::MAX {
				self.make_constant(ConstantValue::U64(buffer.size), u64t)
			} else {
				self.make_placeholder(u64t)
			},
		];
		let id = self.emplace(NodeKind::Construct, Args::new(&args), vec![buffer_ty]);
		Ref::new(id, 0)
	}

	/// Declare an array over existing values of one element type.
	pub fn declare_array(&mut self, elem: Arc<Type>, elems: &[Ref]) -> Ref {
		debug_assert!(
			elems.iter().all(|&e| Arc::ptr_eq(&self.ref_type(e).stripped(), &elem.stripped())),
			"array elements must share the element type"
		);
		let ty = self.emplace_type(TypeKind::Array {
			elem,
			count: elems.len() as u32,
			stride: 0,
		});
		let mut args = Vec::with_capacity(elems.len() + 1);
		args.push(self.make_constant(ConstantValue::Array(Vec::new()), ty.clone()));
		args.extend_from_slice(elems);
		let id = self.emplace(NodeKind::Construct, Args::new(&args), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn declare_swapchain(&mut self, swapchain: SwapchainHandle) -> Ref {
		let ty = self.builtin_swapchain.clone();
		self.make_constant(ConstantValue::Swapchain(swapchain), ty)
	}

	pub fn make_acquire_next_image(&mut self, swapchain: Ref) -> Ref {
		debug_assert!(matches!(
			self.ref_type(swapchain).kind,
			TypeKind::Opaque { tag: tag::SWAPCHAIN }
		));
		let ty = self.builtin_image.clone();
		let id = self.emplace(NodeKind::AcquireNextImage, Args::new(&[swapchain]), vec![ty]);
		Ref::new(id, 0)
	}

	/// Read one field out of a composite or one element out of an array.
	pub fn make_extract(&mut self, base: Ref, field: u64) -> Ref {
		let base_ty = self.ref_type(base).stripped();
		let result = match &base_ty.kind {
			TypeKind::Composite { fields, .. } => fields
				.get(field as usize)
				.unwrap_or_else(|| panic!("extract index {} out of bounds", field))
				.clone(),
			TypeKind::Array { elem, count, .. } => {
				assert!(field < *count as u64, "extract index {} out of bounds", field);
				elem.clone()
			},
			_ => panic!("extract base must be a composite or array, got {:?}", base_ty),
		};
		let index = self.make_u64(field);
		let id = self.emplace(NodeKind::Extract, Args::new(&[base, index]), vec![result]);
		Ref::new(id, 0)
	}

	/// Cut a mip/layer subrange out of an image.
	pub fn make_slice(&mut self, src: Ref, axis: Axis, start: Ref, count: Ref) -> Ref {
		let src_ty = self.ref_type(src);
		assert!(src_ty.is_image(), "slice source must be an image, got {:?}", src_ty);
		let id = self.emplace(NodeKind::Slice { axis }, Args::new(&[src, start, count]), vec![src_ty]);
		Ref::new(id, 0)
	}

	/// Rejoin diverged subranges onto their base.
	pub fn make_converge(&mut self, base: Ref, tails: &[Ref], write: &[bool]) -> Ref {
		assert_eq!(tails.len(), write.len(), "one write flag per diverged tail");
		let ty = self.ref_type(base);
		let mut args = Vec::with_capacity(tails.len() + 1);
		args.push(base);
		args.extend_from_slice(tails);
		let id = self.emplace(
			NodeKind::Converge { write: write.to_vec() },
			Args::new(&args),
			vec![ty],
		);
		Ref::new(id, 0)
	}

	/// Depend on "whoever last used" the value consumed by `user` at `arg`.
	pub fn make_indirect_depend(&mut self, user: NodeId, arg: usize) -> Ref {
		let target = self.node(user).args.as_slice()[arg];
		let ty = self.ref_type(target);
		let id = self.emplace(NodeKind::IndirectDepend, Args::new(&[target]), vec![ty]);
		Ref::new(id, 0)
	}

	/// Create an opaque callable value.
	pub fn make_opaque_fn(
		&mut self, args: Vec<Arc<Type>>, returns: Vec<Arc<Type>>, domain: DomainFlags, execute: Arc<PassFn>,
	) -> Ref {
		let hash = {
			let mut h = crate::types::hash_combine(0, args.len() as u32);
			for a in args.iter().chain(returns.iter()) {
				h = crate::types::hash_combine(h, a.hash32());
			}
			crate::types::hash_combine(h, Arc::as_ptr(&execute) as *const () as usize as u32)
		};
		let ty = self.emplace_type(TypeKind::OpaqueFn(Arc::new(OpaqueFn {
			args,
			returns,
			domain,
			execute,
			hash,
		})));
		self.make_constant(ConstantValue::Unit, ty)
	}

	/// An externally-provided value the graph does not own.
	pub fn make_import(&mut self, value: ConstantValue, ty: Arc<Type>) -> Ref {
		let id = self.emplace(NodeKind::Import { value }, Args::default(), vec![ty]);
		self.node_mut(id).compute_class = DomainFlags::CONSTANT;
		Ref::new(id, 0)
	}

	/// Create a shader-backed callable value; the pipeline is compiled on
	/// demand at execution.
	pub fn make_shader_fn(
		&mut self, args: Vec<Arc<Type>>, returns: Vec<Arc<Type>>, domain: DomainFlags, spirv: Arc<[u32]>,
	) -> Ref {
		let ty = self.emplace_type(TypeKind::ShaderFn(Arc::new(ShaderFn {
			args,
			returns,
			domain,
			spirv,
		})));
		self.make_constant(ConstantValue::Unit, ty)
	}

	/// Invoke a callable. Result types come from the callable's returns.
	pub fn make_call(&mut self, callee: Ref, params: &[Ref]) -> NodeId {
		let callee_ty = self.ref_type(callee);
		let returns = callee_ty
			.fn_returns()
			.expect("call callee must be a callable")
			.to_vec();
		let fn_args = callee_ty.fn_args().unwrap();
		assert_eq!(fn_args.len(), params.len(), "call arity mismatch");
		if cfg!(debug_assertions) {
			for (expect, &got) in fn_args.iter().zip(params) {
				let got_ty = self.ref_type(got);
				debug_assert!(
					Arc::ptr_eq(&expect.stripped(), &got_ty.stripped()),
					"call argument type mismatch: expected {:?}, got {:?}",
					expect,
					got_ty,
				);
			}
		}
		let domain = callee_ty.fn_domain().unwrap();
		let mut args = Vec::with_capacity(params.len() + 1);
		args.push(callee);
		args.extend_from_slice(params);
		let id = self.emplace(NodeKind::Call, Args::new(&args), returns);
		let aux = self.next_aux_order();
		self.node_mut(id).scheduling = Some(SchedulingInfo {
			required_domains: domain,
			auxiliary_order: aux,
		});
		id
	}

	pub fn make_clear(&mut self, dst: Ref, value: ClearValue) -> Ref {
		let ty = self.ref_type(dst);
		assert!(ty.is_image(), "clear target must be an image");
		let id = self.emplace(NodeKind::Clear { value }, Args::new(&[dst]), vec![ty]);
		let aux = self.next_aux_order();
		self.node_mut(id).scheduling = Some(SchedulingInfo {
			required_domains: DomainFlags::DEVICE,
			auxiliary_order: aux,
		});
		Ref::new(id, 0)
	}

	pub fn make_acquire(&mut self, ty: Arc<Type>, signal: Arc<Signal>, values: Vec<ConstantValue>) -> Ref {
		let id = self.emplace(NodeKind::Acquire { values }, Args::default(), vec![ty]);
		self.node_mut(id).acqrel = Some(signal);
		Ref::new(id, 0)
	}

	pub fn make_release(
		&mut self, src: Ref, dst_access: Access, dst_domain: DomainFlags, signal: Arc<Signal>,
	) -> NodeId {
		let ty = self.ref_type(src);
		let id = self.emplace(
			NodeKind::Release { dst_access, dst_domain },
			Args::new(&[src]),
			vec![ty],
		);
		self.node_mut(id).acqrel = Some(signal);
		id
	}

	/// Bridge `srcs` through `signal` so a later graph can pick the values up.
	pub fn make_splice(&mut self, srcs: &[Ref], signal: Option<Arc<Signal>>) -> NodeId {
		let types = srcs.iter().map(|&r| self.ref_type(r)).collect();
		let id = self.emplace(NodeKind::Splice, Args::new(srcs), types);
		self.node_mut(id).acqrel = signal;
		id
	}

	pub fn make_use(&mut self, src: Ref, access: Access) -> Ref {
		let ty = self.ref_type(src);
		let id = self.emplace(NodeKind::Use { access }, Args::new(&[src]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_logical_copy(&mut self, src: Ref) -> Ref {
		let ty = self.ref_type(src);
		let id = self.emplace(NodeKind::LogicalCopy, Args::new(&[src]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_cast(&mut self, src: Ref, to: Arc<Type>) -> Ref {
		let id = self.emplace(NodeKind::Cast, Args::new(&[src]), vec![to]);
		Ref::new(id, 0)
	}

	pub fn make_math_binary(&mut self, a: Ref, b: Ref, op: BinOp) -> Ref {
		let ty = self.ref_type(a);
		debug_assert!(Arc::ptr_eq(&ty, &self.ref_type(b)), "binary op operand types differ");
		let id = self.emplace(NodeKind::MathBinary { op }, Args::new(&[a, b]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_compile_pipeline(&mut self, src: Ref) -> Ref {
		let ty = self.ref_type(src);
		assert!(ty.shader_fn().is_some(), "compile_pipeline takes a shader fn");
		let id = self.emplace(NodeKind::CompilePipeline, Args::new(&[src]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_allocate(&mut self, src: Ref) -> Ref {
		let ty = self.ref_type(src);
		let id = self.emplace(NodeKind::Allocate, Args::new(&[src]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_get_allocation_size(&mut self, ptr: Ref) -> Ref {
		let ty = self.ty_u64.clone();
		let id = self.emplace(NodeKind::GetAllocationSize, Args::new(&[ptr]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_get_ci(&mut self, src: Ref) -> Ref {
		let ty = self.ref_type(src);
		let id = self.emplace(NodeKind::GetCi, Args::new(&[src]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_set(&mut self, dst: Ref, value: Ref, field: u16, on_allocate: bool) -> Ref {
		let ty = self.ref_type(dst);
		let id = self.emplace(NodeKind::Set { field, on_allocate }, Args::new(&[dst, value]), vec![ty]);
		Ref::new(id, 0)
	}

	pub fn make_nop(&mut self, src: Ref) -> Ref {
		let ty = self.ref_type(src);
		let id = self.emplace(NodeKind::Nop, Args::new(&[src]), vec![ty]);
		Ref::new(id, 0)
	}

	/// Rewire one argument of a `CONSTRUCT`; used by the typed inference
	/// setters.
	pub fn set_construct_arg(&mut self, construct: Ref, field: usize, to: Ref) {
		let node = self.node_mut(construct.node);
		debug_assert!(matches!(node.kind, NodeKind::Construct));
		node.args.as_mut_slice()[field] = to;
	}

	/// Release per-kind owned storage and mark the slot for reuse.
	pub fn destroy_node(&mut self, id: NodeId) {
		let node = self.node_mut(id);
		node.kind = NodeKind::Garbage;
		node.args = Args::default();
		node.types = Vec::new();
		node.debug = None;
		node.scheduling = None;
		node.acqrel = None;
		self.free.push(id);
	}

	/// Sweep nodes unreachable from any held root. Args reaching through `NOP`
	/// bridges are rewritten to their sources first.
	pub fn collect_garbage(&mut self) {
		// Bypass NOP bridges.
		for i in 0..self.nodes.len() {
			let arg_count = self.nodes[i].args.len();
			for a in 0..arg_count {
				let mut target = self.nodes[i].args.as_slice()[a];
				while matches!(self.node(target.node).kind, NodeKind::Nop) {
					target = self.node(target.node).args.as_slice()[0];
				}
				self.nodes[i].args.as_mut_slice()[a] = target;
			}
		}

		// Mark from held roots.
		let mut stack: Vec<NodeId> = self
			.live_nodes()
			.filter(|&id| self.node(id).held)
			.collect();
		for node in self.nodes.iter_mut() {
			node.flag = 0;
		}
		while let Some(id) = stack.pop() {
			if std::mem::replace(&mut self.node_mut(id).flag, 1) == 1 {
				continue;
			}
			stack.extend(self.node(id).args.as_slice().iter().map(|r| r.node));
		}

		// Sweep.
		for i in 0..self.nodes.len() {
			let node = &self.nodes[i];
			if node.flag == 0 && !matches!(node.kind, NodeKind::Garbage) {
				self.destroy_node(NodeId(i as u32));
			}
		}
		for node in self.nodes.iter_mut() {
			node.flag = 0;
		}
	}

	/// Constant-fold the value on `r`.
	pub fn eval(&self, r: Ref) -> EvalResult {
		let node = self.node(r.node);
		let args = node.args.as_slice();
		match &node.kind {
			NodeKind::Constant { value } | NodeKind::Import { value } => Ok(value.clone()),
			NodeKind::Acquire { values } => values
				.get(r.index as usize)
				.cloned()
				.ok_or(CannotBeConstantEvaluated(r)),
			NodeKind::Extract => {
				let base = self.eval(args[0])?;
				let index = self
					.eval(args[1])?
					.as_u64()
					.ok_or(CannotBeConstantEvaluated(r))?;
				match base {
					ConstantValue::Image(ia) => Ok(match index as usize {
						img_field::WIDTH => ConstantValue::U32(ia.extent.width),
						img_field::HEIGHT => ConstantValue::U32(ia.extent.height),
						img_field::DEPTH => ConstantValue::U32(ia.extent.depth),
						img_field::FORMAT => ConstantValue::Format(ia.format),
						img_field::SAMPLES => ConstantValue::Samples(ia.sample_count),
						img_field::BASE_LAYER => ConstantValue::U32(ia.base_layer),
						img_field::LAYER_COUNT => ConstantValue::U32(ia.layer_count),
						img_field::BASE_LEVEL => ConstantValue::U32(ia.base_level),
						img_field::LEVEL_COUNT => ConstantValue::U32(ia.level_count),
						_ => return Err(CannotBeConstantEvaluated(r)),
					}),
					ConstantValue::Buffer(b) if index as usize == buf_field::SIZE => Ok(ConstantValue::U64(b.size)),
					ConstantValue::Array(values) => {
						values.get(index as usize).cloned().ok_or(CannotBeConstantEvaluated(r))
					},
					_ => Err(CannotBeConstantEvaluated(r)),
				}
			},
			NodeKind::Construct if node.types[0].is_image() => {
				let mut ia = *self
					.eval(args[0])?
					.as_image()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.extent.width = self.eval(args[img_field::WIDTH])?.as_u32().ok_or(CannotBeConstantEvaluated(r))?;
				ia.extent.height = self
					.eval(args[img_field::HEIGHT])?
					.as_u32()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.extent.depth = self.eval(args[img_field::DEPTH])?.as_u32().ok_or(CannotBeConstantEvaluated(r))?;
				ia.format = self
					.eval(args[img_field::FORMAT])?
					.as_format()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.sample_count = self
					.eval(args[img_field::SAMPLES])?
					.as_samples()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.base_layer = self
					.eval(args[img_field::BASE_LAYER])?
					.as_u32()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.layer_count = self
					.eval(args[img_field::LAYER_COUNT])?
					.as_u32()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.base_level = self
					.eval(args[img_field::BASE_LEVEL])?
					.as_u32()
					.ok_or(CannotBeConstantEvaluated(r))?;
				ia.level_count = self
					.eval(args[img_field::LEVEL_COUNT])?
					.as_u32()
					.ok_or(CannotBeConstantEvaluated(r))?;
				Ok(ConstantValue::Image(ia))
			},
			NodeKind::Construct if matches!(node.types[0].kind, TypeKind::Array { .. }) => {
				let values: EvalResult<Vec<ConstantValue>> = args[1..].iter().map(|&e| self.eval(e)).collect();
				Ok(ConstantValue::Array(values?))
			},
			NodeKind::Construct if node.types[0].is_buffer() => {
				let mut buffer = *self
					.eval(args[0])?
					.as_buffer()
					.ok_or(CannotBeConstantEvaluated(r))?;
				buffer.size = self
					.eval(args[buf_field::SIZE])?
					.as_u64()
					.ok_or(CannotBeConstantEvaluated(r))?;
				Ok(ConstantValue::Buffer(buffer))
			},
			NodeKind::MathBinary { op } => {
				let a = self.eval(args[0])?.as_u64().ok_or(CannotBeConstantEvaluated(r))?;
				let b = self.eval(args[1])?.as_u64().ok_or(CannotBeConstantEvaluated(r))?;
				let v = match op {
					BinOp::Add => a.wrapping_add(b),
					BinOp::Sub => a.wrapping_sub(b),
					BinOp::Mul => a.wrapping_mul(b),
					BinOp::Div => a.checked_div(b).ok_or(CannotBeConstantEvaluated(r))?,
					BinOp::Mod => a.checked_rem(b).ok_or(CannotBeConstantEvaluated(r))?,
				};
				match self.eval(args[0])? {
					ConstantValue::U32(_) => Ok(ConstantValue::U32(v as u32)),
					_ => Ok(ConstantValue::U64(v)),
				}
			},
			NodeKind::Slice { axis } => {
				let mut ia = *self
					.eval(args[0])?
					.as_image()
					.ok_or(CannotBeConstantEvaluated(r))?;
				let start = self.eval(args[1])?.as_u32().ok_or(CannotBeConstantEvaluated(r))?;
				let count = self.eval(args[2])?.as_u32().ok_or(CannotBeConstantEvaluated(r))?;
				match axis {
					Axis::Mip => {
						ia.base_level += start;
						ia.level_count = count;
					},
					Axis::Layer => {
						ia.base_layer += start;
						ia.layer_count = count;
					},
				}
				Ok(ConstantValue::Image(ia))
			},
			NodeKind::Cast | NodeKind::Use { .. } | NodeKind::LogicalCopy | NodeKind::Nop => self.eval(args[0]),
			NodeKind::Splice | NodeKind::Release { .. } => self.eval(args[r.index as usize]),
			NodeKind::Converge { .. } => self.eval(args[0]),
			_ => Err(CannotBeConstantEvaluated(r)),
		}
	}
}

impl Default for IRModule {
	fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn types_intern_to_pointer_equality() {
		let mut m = IRModule::new();
		let a = m.emplace_type(TypeKind::Integer { width: 32 });
		let b = m.emplace_type(TypeKind::Integer { width: 32 });
		assert!(Arc::ptr_eq(&a, &b));
		assert!(Arc::ptr_eq(&a, &m.ty_u32));

		let arr_a = m.emplace_type(TypeKind::Array {
			elem: a.clone(),
			count: 4,
			stride: 4,
		});
		let arr_b = m.emplace_type(TypeKind::Array {
			elem: b,
			count: 4,
			stride: 4,
		});
		assert!(Arc::ptr_eq(&arr_a, &arr_b));

		let arr_c = m.emplace_type(TypeKind::Array {
			elem: a,
			count: 5,
			stride: 4,
		});
		assert!(!Arc::ptr_eq(&arr_a, &arr_c));
	}

	#[test]
	fn imbued_types_strip_to_their_base() {
		let mut m = IRModule::new();
		let base = m.builtin_image.clone();
		let imbued = m.emplace_type(TypeKind::Imbued {
			base: base.clone(),
			access: Access::ColorWrite,
		});
		assert!(Arc::ptr_eq(&imbued.stripped(), &base));
		assert_eq!(imbued.imbued_access(), Some(Access::ColorWrite));
	}

	#[test]
	fn declared_image_evaluates_back() {
		let mut m = IRModule::new();
		let ia = ImageAttachment {
			extent: vk::Extent3D {
				width: 16,
				height: 16,
				depth: 1,
			},
			format: vk::Format::R8G8B8A8_UNORM,
			sample_count: vk::SampleCountFlags::TYPE_1,
			level_count: 4,
			layer_count: 1,
			..ImageAttachment::default()
		};
		let r = m.declare_image(ia);
		let out = m.eval(r).unwrap();
		assert_eq!(out.as_image().unwrap(), &ia);
	}

	#[test]
	fn partially_unknown_image_fails_eval() {
		let mut m = IRModule::new();
		let r = m.declare_image(ImageAttachment::default());
		assert!(m.eval(r).is_err());
	}

	#[test]
	fn extract_and_math_fold() {
		let mut m = IRModule::new();
		let ia = ImageAttachment {
			extent: vk::Extent3D {
				width: 32,
				height: 8,
				depth: 1,
			},
			format: vk::Format::R8G8B8A8_UNORM,
			sample_count: vk::SampleCountFlags::TYPE_1,
			level_count: 1,
			layer_count: 1,
			..ImageAttachment::default()
		};
		let img = m.declare_image(ia);
		let w = m.make_extract(img, img_field::WIDTH as u64);
		let h = m.make_extract(img, img_field::HEIGHT as u64);
		let sum = m.make_math_binary(w, h, BinOp::Add);
		assert_eq!(m.eval(sum).unwrap().as_u32(), Some(40));
	}

	#[test]
	fn slice_narrows_the_subrange() {
		let mut m = IRModule::new();
		let ia = ImageAttachment {
			extent: vk::Extent3D {
				width: 16,
				height: 16,
				depth: 1,
			},
			format: vk::Format::R8G8B8A8_UNORM,
			sample_count: vk::SampleCountFlags::TYPE_1,
			level_count: 4,
			layer_count: 1,
			..ImageAttachment::default()
		};
		let img = m.declare_image(ia);
		let start = m.make_u32(1);
		let count = m.make_u32(1);
		let mip1 = m.make_slice(img, Axis::Mip, start, count);
		let out = m.eval(mip1).unwrap();
		let out = out.as_image().unwrap();
		assert_eq!(out.base_level, 1);
		assert_eq!(out.level_count, 1);
	}

	#[test]
	fn garbage_collection_sweeps_unheld_subgraphs() {
		let mut m = IRModule::new();
		let kept = m.declare_image(ImageAttachment::default());
		m.node_mut(kept.node).held = true;

		let dead = m.declare_buffer(Buffer::default());
		let _ = m.make_extract(dead, buf_field::SIZE as u64);

		let before = m.live_node_count();
		m.collect_garbage();
		let after = m.live_node_count();
		// The construct, its initial constant and its size placeholder, the
		// extract and its index vanish; the held image subgraph stays.
		assert!(after < before);
		assert!(m.node(kept.node).held);
		assert!(matches!(m.node(kept.node).kind, NodeKind::Construct));

		// Slots are recycled.
		let free_before = m.nodes.len();
		let _ = m.make_u32(7);
		assert_eq!(m.nodes.len(), free_before);
	}

	#[test]
	fn nop_bridges_are_bypassed() {
		let mut m = IRModule::new();
		let v = m.make_u32(3);
		let nop = m.make_nop(v);
		let doubled = m.make_math_binary(nop, nop, BinOp::Add);
		m.node_mut(doubled.node).held = true;
		m.collect_garbage();
		assert_eq!(m.node(doubled.node).args.as_slice()[0], v);
		assert!(matches!(m.node(v.node).kind, NodeKind::Constant { .. }));
	}
}
