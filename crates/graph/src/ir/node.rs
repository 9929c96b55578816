//! Arena nodes and the references between them.

use std::{fmt, panic::Location, sync::Arc};

use ash::vk;

use crate::{
	exec::signal::Signal,
	ir::ty::Type,
	resource::{Buffer, ClearValue, ImageAttachment, SamplerCreateInfo},
	swapchain::SwapchainHandle,
	sync::{Access, DomainFlags},
};

pub const MAX_INLINE_ARGS: usize = 5;

/// A slot in a module's node arena. Addresses are stable for the life of the
/// node.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
	pub fn index(self) -> usize { self.0 as usize }
}

/// A value on an IR edge: one result slot of one node.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref {
	pub node: NodeId,
	pub index: u16,
}

impl Ref {
	pub fn new(node: NodeId, index: u16) -> Self { Self { node, index } }
}

impl fmt::Debug for Ref {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "%{}.{}", self.node.0, self.index) }
}

/// Argument storage: inline up to [`MAX_INLINE_ARGS`], heap beyond.
#[derive(Clone)]
pub enum Args {
	Fixed { len: u8, refs: [Ref; MAX_INLINE_ARGS] },
	Var(Vec<Ref>),
}

impl Args {
	pub fn new(args: &[Ref]) -> Self {
		if args.len() <= MAX_INLINE_ARGS {
			let mut refs = [Ref::new(NodeId(u32::MAX), 0); MAX_INLINE_ARGS];
			refs[..args.len()].copy_from_slice(args);
			Args::Fixed {
				len: args.len() as u8,
				refs,
			}
		} else {
			Args::Var(args.to_vec())
		}
	}

	pub fn as_slice(&self) -> &[Ref] {
		match self {
			Args::Fixed { len, refs } => &refs[..*len as usize],
			Args::Var(refs) => refs,
		}
	}

	pub fn as_mut_slice(&mut self) -> &mut [Ref] {
		match self {
			Args::Fixed { len, refs } => &mut refs[..*len as usize],
			Args::Var(refs) => refs,
		}
	}

	pub fn len(&self) -> usize { self.as_slice().len() }

	pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Default for Args {
	fn default() -> Self { Args::new(&[]) }
}

/// The binary operators of `MATH_BINARY`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
	Add,
	Sub,
	Mul,
	Div,
	Mod,
}

/// The axis a `SLICE` node cuts along.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Axis {
	Mip,
	Layer,
}

/// An owned runtime value carried by `CONSTANT` and `ACQUIRE` nodes, and
/// produced by evaluation.
#[derive(Clone)]
pub enum ConstantValue {
	/// Payload-free; carried by callable constants.
	Unit,
	U32(u32),
	U64(u64),
	F32(f32),
	Bool(bool),
	Format(vk::Format),
	Samples(vk::SampleCountFlags),
	Image(ImageAttachment),
	Buffer(Buffer),
	Swapchain(SwapchainHandle),
	Sampler(SamplerCreateInfo),
	Bytes(Arc<[u8]>),
	Array(Vec<ConstantValue>),
}

impl ConstantValue {
	pub fn as_u32(&self) -> Option<u32> {
		match self {
			ConstantValue::U32(v) => Some(*v),
			ConstantValue::U64(v) => u32::try_from(*v).ok(),
			_ => None,
		}
	}

	pub fn as_u64(&self) -> Option<u64> {
		match self {
			ConstantValue::U32(v) => Some(*v as u64),
			ConstantValue::U64(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_format(&self) -> Option<vk::Format> {
		match self {
			ConstantValue::Format(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_samples(&self) -> Option<vk::SampleCountFlags> {
		match self {
			ConstantValue::Samples(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_image(&self) -> Option<&ImageAttachment> {
		match self {
			ConstantValue::Image(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_image_mut(&mut self) -> Option<&mut ImageAttachment> {
		match self {
			ConstantValue::Image(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_buffer(&self) -> Option<&Buffer> {
		match self {
			ConstantValue::Buffer(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_buffer_mut(&mut self) -> Option<&mut Buffer> {
		match self {
			ConstantValue::Buffer(v) => Some(v),
			_ => None,
		}
	}
}

impl fmt::Debug for ConstantValue {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ConstantValue::Unit => write!(f, "()"),
			ConstantValue::U32(v) => write!(f, "{}u32", v),
			ConstantValue::U64(v) => write!(f, "{}u64", v),
			ConstantValue::F32(v) => write!(f, "{}f32", v),
			ConstantValue::Bool(v) => write!(f, "{}", v),
			ConstantValue::Format(v) => write!(f, "{:?}", v),
			ConstantValue::Samples(v) => write!(f, "{:?}", v),
			ConstantValue::Image(v) => write!(f, "image({:?})", v.image),
			ConstantValue::Buffer(v) => write!(f, "buffer({:?})", v.buffer),
			ConstantValue::Swapchain(_) => write!(f, "swapchain"),
			ConstantValue::Sampler(_) => write!(f, "sampler"),
			ConstantValue::Bytes(v) => write!(f, "bytes[{}]", v.len()),
			ConstantValue::Array(v) => write!(f, "array[{}]", v.len()),
		}
	}
}

/// Per-kind payloads. Argument layout is documented per variant; `args` on the
/// node holds the refs in that order.
pub enum NodeKind {
	/// A hole to be filled by inference. No args.
	Placeholder,
	/// An owned constant. No args.
	Constant { value: ConstantValue },
	/// Builds a value; args: `[initial, fields...]`. The first arg is the
	/// initial payload constant, the rest override its fields.
	Construct,
	/// Cuts a subrange along `axis`; args: `[src, start, count]`.
	Slice { axis: Axis },
	/// Rejoins diverged subranges; args: `[base, tails...]`; `write[i]` says
	/// whether tail `i` was written.
	Converge { write: Vec<bool> },
	/// An externally-provided value. No args.
	Import { value: ConstantValue },
	/// Invokes a callable; args: `[callee, params...]`.
	Call,
	/// Clears an image; args: `[dst]`.
	Clear { value: ClearValue },
	/// A value entering this graph from a previous submission. No args.
	Acquire { values: Vec<ConstantValue> },
	/// A value leaving the graph; args: `[src...]`.
	Release { dst_access: Access, dst_domain: DomainFlags },
	/// Materializes the swapchain's current image at execution; args:
	/// `[swapchain]`.
	AcquireNextImage,
	/// Tags a use without transforming the value; args: `[src]`.
	Use { access: Access },
	/// args: `[src]`.
	LogicalCopy,
	/// Deferred field set; args: `[dst, value]`.
	Set { field: u16, on_allocate: bool },
	/// args: `[src]`.
	Cast,
	/// args: `[a, b]`.
	MathBinary { op: BinOp },
	/// args: `[src]` (a shader fn value).
	CompilePipeline,
	/// args: `[src]`.
	Allocate,
	/// args: `[ptr]`.
	GetAllocationSize,
	/// args: `[src]`.
	GetCi,
	/// Bridge between producer and consumer graphs through a signal; args:
	/// `[src...]`, one result per source.
	Splice,
	/// "After whoever last used this" edge; args: `[target]` where target is
	/// the consumed value of the user it orders after.
	IndirectDepend,
	/// Reads one field out of a composite; args: `[base, index]`.
	Extract,
	/// A destroyed node whose slot awaits reuse.
	Garbage,
	Nop,
}

impl NodeKind {
	pub fn name(&self) -> &'static str {
		match self {
			NodeKind::Placeholder => "placeholder",
			NodeKind::Constant { .. } => "constant",
			NodeKind::Construct => "construct",
			NodeKind::Slice { .. } => "slice",
			NodeKind::Converge { .. } => "converge",
			NodeKind::Import { .. } => "import",
			NodeKind::Call => "call",
			NodeKind::Clear { .. } => "clear",
			NodeKind::Acquire { .. } => "acquire",
			NodeKind::Release { .. } => "release",
			NodeKind::AcquireNextImage => "acquire_next_image",
			NodeKind::Use { .. } => "use",
			NodeKind::LogicalCopy => "lcopy",
			NodeKind::Set { .. } => "set",
			NodeKind::Cast => "cast",
			NodeKind::MathBinary { .. } => "math_b",
			NodeKind::CompilePipeline => "compile_pipeline",
			NodeKind::Allocate => "allocate",
			NodeKind::GetAllocationSize => "get_allocation_size",
			NodeKind::GetCi => "get_ci",
			NodeKind::Splice => "splice",
			NodeKind::IndirectDepend => "indirect_depend",
			NodeKind::Extract => "extract",
			NodeKind::Garbage => "garbage",
			NodeKind::Nop => "nop",
		}
	}
}

/// Scheduling constraints attached to a node.
#[derive(Copy, Clone, Debug, Default)]
pub struct SchedulingInfo {
	pub required_domains: DomainFlags,
	/// Breaks ties between otherwise-independent passes.
	pub auxiliary_order: u32,
}

#[derive(Default)]
pub struct NodeDebugInfo {
	pub result_names: Vec<String>,
	pub trace: Vec<&'static Location<'static>>,
}

pub struct Node {
	pub kind: NodeKind,
	pub args: Args,
	/// One type per result slot.
	pub types: Vec<Arc<Type>>,
	/// Monotonic per-module index; the top 32 bits carry the module id.
	pub index: u64,
	/// Scratch for graph traversals.
	pub flag: u8,
	/// Kept alive by an external holder; never collected.
	pub held: bool,
	pub compute_class: DomainFlags,
	pub scheduling: Option<SchedulingInfo>,
	pub debug: Option<Box<NodeDebugInfo>>,
	/// The signal armed when this node's values become available.
	pub acqrel: Option<Arc<Signal>>,
}

impl Node {
	pub fn result_count(&self) -> usize { self.types.len() }

	pub fn first(&self, id: NodeId) -> Ref { Ref::new(id, 0) }

	pub fn constant(&self) -> Option<&ConstantValue> {
		match &self.kind {
			NodeKind::Constant { value } | NodeKind::Import { value } => Some(value),
			_ => None,
		}
	}

	pub fn constant_mut(&mut self) -> Option<&mut ConstantValue> {
		match &mut self.kind {
			NodeKind::Constant { value } | NodeKind::Import { value } => Some(value),
			_ => None,
		}
	}
}
