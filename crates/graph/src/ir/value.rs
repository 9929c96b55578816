//! Reference-counted handles keeping IR alive across the module boundary, and
//! the typed values applications hold.

use std::{marker::PhantomData, sync::Arc};

use parking_lot::Mutex;

use crate::{
	alloc::Allocator,
	compile::Compiler,
	exec::signal::{Signal, SignalStatus},
	ir::{buf_field, img_field, ConstantValue, ModuleRef, NodeId, NodeKind, Ref},
	resource::{Buffer, ImageAttachment},
	runtime::Runtime,
	sync::Access,
	Error,
	Result,
};

/// Keeps a node (and, transitively, its producers) alive outside the module
/// arena.
pub struct ExtNode {
	module: ModuleRef,
	node: NodeId,
	acqrel: Arc<Signal>,
	deps: Mutex<Vec<Arc<ExtNode>>>,
}

impl ExtNode {
	/// Mark `node` held. The node's signal is shared with this holder.
	pub fn new(module: ModuleRef, node: NodeId, deps: Vec<Arc<ExtNode>>) -> Self {
		let acqrel = {
			let mut m = module.lock();
			let n = m.node_mut(node);
			n.held = true;
			match &n.acqrel {
				Some(signal) => signal.clone(),
				None => {
					let signal = Arc::new(Signal::new());
					n.acqrel = Some(signal.clone());
					signal
				},
			}
		};
		Self {
			module,
			node,
			acqrel,
			deps: Mutex::new(deps),
		}
	}

	pub fn node(&self) -> NodeId { self.node }

	pub fn module(&self) -> &ModuleRef { &self.module }

	pub fn signal(&self) -> &Arc<Signal> { &self.acqrel }

	pub fn add_dep(&self, dep: Arc<ExtNode>) { self.deps.lock().push(dep) }

	/// Drain the transitive holders this node depends on; used by the compiler
	/// to snapshot a submission.
	pub fn take_deps(&self) -> Vec<Arc<ExtNode>> { std::mem::take(&mut *self.deps.lock()) }

	pub fn deps(&self) -> Vec<Arc<ExtNode>> { self.deps.lock().clone() }
}

impl Drop for ExtNode {
	fn drop(&mut self) { self.module.lock().node_mut(self.node).held = false; }
}

/// Conversion out of an evaluated graph result.
pub trait FromConstant: Sized {
	fn from_constant(value: ConstantValue) -> Option<Self>;
}

impl FromConstant for ImageAttachment {
	fn from_constant(value: ConstantValue) -> Option<Self> { value.as_image().copied() }
}

impl FromConstant for Buffer {
	fn from_constant(value: ConstantValue) -> Option<Self> { value.as_buffer().copied() }
}

impl FromConstant for u32 {
	fn from_constant(value: ConstantValue) -> Option<Self> { value.as_u32() }
}

impl FromConstant for u64 {
	fn from_constant(value: ConstantValue) -> Option<Self> { value.as_u64() }
}

/// An untyped graph value: one result slot of a held node.
#[derive(Clone)]
pub struct AnyValue {
	pub(crate) ext: Arc<ExtNode>,
	pub(crate) index: u16,
}

impl AnyValue {
	pub fn ext(&self) -> &Arc<ExtNode> { &self.ext }

	/// The ref other ops consume this value through.
	pub fn as_ref(&self) -> Ref { Ref::new(self.ext.node(), self.index) }

	pub fn typed<T: ?Sized>(self) -> Value<T> {
		Value {
			inner: self,
			_marker: PhantomData,
		}
	}
}

/// A typed handle on a graph value. Wraps the value's `ExtNode` so it stays
/// alive until dropped or submitted.
///
/// `T` may be a slice type: a `Value<[T]>` is an array-typed graph value whose
/// elements are reachable through [`Value::index`].
pub struct Value<T: ?Sized> {
	inner: AnyValue,
	_marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized> Clone for Value<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
			_marker: PhantomData,
		}
	}
}

fn hold(module: &ModuleRef, producer: Ref, deps: Vec<Arc<ExtNode>>) -> AnyValue {
	let splice = module.lock().make_splice(&[producer], Some(Arc::new(Signal::new())));
	AnyValue {
		ext: Arc::new(ExtNode::new(module.clone(), splice, deps)),
		index: 0,
	}
}

/// Declare an image attachment as a graph value.
pub fn declare_image(module: &ModuleRef, ia: ImageAttachment) -> Value<ImageAttachment> {
	let r = module.lock().declare_image(ia);
	hold(module, r, Vec::new()).typed()
}

/// Declare a buffer as a graph value.
pub fn declare_buffer(module: &ModuleRef, buffer: Buffer) -> Value<Buffer> {
	let r = module.lock().declare_buffer(buffer);
	hold(module, r, Vec::new()).typed()
}

/// Gather existing values into one array-typed graph value.
pub fn declare_array<T>(module: &ModuleRef, elems: &[Value<T>]) -> Value<[T]> {
	assert!(!elems.is_empty(), "cannot declare an empty array");
	let refs: Vec<Ref> = elems.iter().map(|v| v.as_ref()).collect();
	let r = {
		let mut m = module.lock();
		let elem_ty = m.ref_type(refs[0]);
		m.declare_array(elem_ty, &refs)
	};
	hold(module, r, elems.iter().map(|v| v.ext().clone()).collect()).typed()
}

/// Invoke a callable over graph values; returns one value per result.
pub fn call(module: &ModuleRef, callee: Ref, args: &[AnyValue]) -> Vec<AnyValue> {
	let mut m = module.lock();
	let refs: Vec<Ref> = args.iter().map(|a| a.as_ref()).collect();
	let call = m.make_call(callee, &refs);
	let results: Vec<Ref> = (0..m.node(call).result_count())
		.map(|i| Ref::new(call, i as u16))
		.collect();
	let splice = m.make_splice(&results, Some(Arc::new(Signal::new())));
	let result_count = results.len();
	drop(m);

	let deps: Vec<_> = args.iter().map(|a| a.ext.clone()).collect();
	let ext = Arc::new(ExtNode::new(module.clone(), splice, deps));
	(0..result_count)
		.map(|i| AnyValue {
			ext: ext.clone(),
			index: i as u16,
		})
		.collect()
}

impl<T: ?Sized> Value<T> {
	pub fn untyped(&self) -> &AnyValue { &self.inner }

	pub fn as_ref(&self) -> Ref { self.inner.as_ref() }

	pub fn ext(&self) -> &Arc<ExtNode> { self.inner.ext() }

	pub fn module(&self) -> &ModuleRef { self.inner.ext.module() }

	/// Walk from this value's ref to the `CONSTRUCT` that declares it.
	fn find_construct(&self) -> Ref {
		let m = self.module().lock();
		let mut r = self.as_ref();
		loop {
			let node = m.node(r.node);
			match &node.kind {
				NodeKind::Construct => return r,
				NodeKind::Splice | NodeKind::Release { .. } => r = node.args.as_slice()[r.index as usize],
				NodeKind::Use { .. } | NodeKind::LogicalCopy | NodeKind::Cast | NodeKind::Nop => {
					r = node.args.as_slice()[0]
				},
				_ => panic!("value is not backed by a construct; cannot rewrite inference fields"),
			}
		}
	}

	/// Point `field` of our construct at `src`'s corresponding field: a folded
	/// constant when the source is known, an extract otherwise.
	fn infer_field_from(&self, src: &AnyValue, field: usize) {
		let construct = self.find_construct();
		let mut m = self.module().lock();
		let extract = m.make_extract(src.as_ref(), field as u64);
		let arg = match m.eval(extract) {
			Ok(value) => {
				let ty = m.ref_type(extract);
				// Fold eagerly; the extract itself becomes garbage.
				let c = m.make_constant(value, ty);
				m.destroy_node(extract.node);
				c
			},
			Err(_) => extract,
		};
		m.set_construct_arg(construct, field, arg);
		drop(m);
		self.inner.ext.add_dep(src.ext.clone());
	}

	fn set_field_constant(&self, field: usize, value: ConstantValue) {
		let construct = self.find_construct();
		let mut m = self.module().lock();
		let old = m.node(construct.node).args.as_slice()[field];
		let ty = m.ref_type(old);
		let c = m.make_constant(value, ty);
		m.set_construct_arg(construct, field, c);
	}

	/// Submit the producing graph if it has not been submitted yet.
	pub fn submit(&self, runtime: &Runtime, alloc: &Allocator, compiler: &mut Compiler) -> Result<()> {
		if self.ext().signal().status() != SignalStatus::Disarmed {
			return Ok(());
		}
		let graph = compiler.link(self.module(), std::slice::from_ref(self.ext()))?;
		graph.execute(runtime, alloc)
	}

	/// Submit if needed, then block until the value is host-observable.
	pub fn wait(&self, runtime: &Runtime, alloc: &Allocator, compiler: &mut Compiler) -> Result<()> {
		self.submit(runtime, alloc, compiler)?;
		let signal = self.ext().signal();
		match signal.status() {
			SignalStatus::Disarmed => Err(Error::Message("value was not submitted".into())),
			SignalStatus::Synchronizable => {
				runtime.wait_for_domains(&[signal.sync_point()])?;
				signal.set_host_available();
				Ok(())
			},
			SignalStatus::HostAvailable => Ok(()),
		}
	}

	/// Drop the external hold without submitting.
	pub fn release(self) {}
}

impl<T: FromConstant> Value<T> {
	/// Wait, then read the produced value back.
	pub fn get(&self, runtime: &Runtime, alloc: &Allocator, compiler: &mut Compiler) -> Result<T> {
		self.wait(runtime, alloc, compiler)?;
		let value = self
			.ext()
			.signal()
			.value(self.inner.index as usize)
			.or_else(|| self.module().lock().eval(self.as_ref()).ok())
			.ok_or_else(|| Error::Message("value is not host readable".into()))?;
		T::from_constant(value).ok_or_else(|| Error::Message("value has an unexpected type".into()))
	}
}

impl Value<ImageAttachment> {
	pub fn same_extent_as(&self, src: &Value<ImageAttachment>) {
		self.infer_field_from(src.untyped(), img_field::WIDTH);
		self.infer_field_from(src.untyped(), img_field::HEIGHT);
		self.infer_field_from(src.untyped(), img_field::DEPTH);
	}

	pub fn same_2d_extent_as(&self, src: &Value<ImageAttachment>) {
		self.infer_field_from(src.untyped(), img_field::WIDTH);
		self.infer_field_from(src.untyped(), img_field::HEIGHT);
		self.set_field_constant(img_field::DEPTH, ConstantValue::U32(1));
	}

	pub fn same_format_as(&self, src: &Value<ImageAttachment>) {
		self.infer_field_from(src.untyped(), img_field::FORMAT);
	}

	/// Extent, sample count and layer shape.
	pub fn same_shape_as(&self, src: &Value<ImageAttachment>) {
		self.same_extent_as(src);
		self.infer_field_from(src.untyped(), img_field::SAMPLES);
		self.infer_field_from(src.untyped(), img_field::BASE_LAYER);
		self.infer_field_from(src.untyped(), img_field::LAYER_COUNT);
		self.infer_field_from(src.untyped(), img_field::BASE_LEVEL);
		self.infer_field_from(src.untyped(), img_field::LEVEL_COUNT);
	}

	/// Shape and format.
	pub fn similar_to(&self, src: &Value<ImageAttachment>) {
		self.same_shape_as(src);
		self.same_format_as(src);
	}

	/// A value for one mip level of this image.
	pub fn mip(&self, level: u32) -> Value<ImageAttachment> {
		self.slice(super::Axis::Mip, level)
	}

	/// A value for one array layer of this image.
	pub fn layer(&self, layer: u32) -> Value<ImageAttachment> {
		self.slice(super::Axis::Layer, layer)
	}

	fn slice(&self, axis: super::Axis, at: u32) -> Value<ImageAttachment> {
		let module = self.module().clone();
		let sliced = {
			let mut m = module.lock();
			let start = m.make_u32(at);
			let count = m.make_u32(1);
			m.make_slice(self.as_ref(), axis, start, count)
		};
		hold(&module, sliced, vec![self.ext().clone()]).typed()
	}

	/// Release this image to be consumed outside the graph under `access`.
	pub fn as_released(&self, access: Access, domain: crate::sync::DomainFlags) -> Value<ImageAttachment> {
		let module = self.module().clone();
		let released = {
			let mut m = module.lock();
			let release = m.make_release(self.as_ref(), access, domain, Arc::new(Signal::new()));
			Ref::new(release, 0)
		};
		AnyValue {
			ext: Arc::new(ExtNode::new(module, released.node, vec![self.ext().clone()])),
			index: 0,
		}
		.typed()
	}
}

impl<T> Value<[T]> {
	/// The element count, from the array type.
	pub fn len(&self) -> u32 {
		let m = self.module().lock();
		let ty = m.ref_type(self.as_ref()).stripped();
		match &ty.kind {
			crate::ir::TypeKind::Array { count, .. } => *count,
			_ => panic!("value is not an array, got {:?}", ty),
		}
	}

	pub fn is_empty(&self) -> bool { self.len() == 0 }

	/// One element of the array, read through an extract.
	pub fn index(&self, index: u32) -> Value<T> {
		assert!(index < self.len(), "array index {} out of bounds", index);
		let module = self.module().clone();
		let extracted = module.lock().make_extract(self.as_ref(), index as u64);
		hold(&module, extracted, vec![self.ext().clone()]).typed()
	}
}

impl Value<Buffer> {
	pub fn same_size(&self, src: &Value<Buffer>) { self.infer_field_from(src.untyped(), buf_field::SIZE) }

	pub fn set_size(&self, size: u64) { self.set_field_constant(buf_field::SIZE, ConstantValue::U64(size)) }

	/// The size if it is already known at build time.
	pub fn get_size(&self) -> Option<u64> {
		let construct = self.find_construct();
		let m = self.module().lock();
		let size_arg = m.node(construct.node).args.as_slice()[buf_field::SIZE];
		m.eval(size_arg).ok().and_then(|v| v.as_u64())
	}
}

#[cfg(test)]
mod tests {
	use ash::vk;

	use super::*;
	use crate::ir::IRModule;

	fn image_16x16() -> ImageAttachment {
		ImageAttachment {
			extent: vk::Extent3D {
				width: 16,
				height: 16,
				depth: 1,
			},
			format: vk::Format::R8G8B8A8_UNORM,
			sample_count: vk::SampleCountFlags::TYPE_1,
			level_count: 1,
			layer_count: 1,
			..ImageAttachment::default()
		}
	}

	#[test]
	fn values_keep_nodes_alive() {
		let module = IRModule::new_shared();
		let img = declare_image(&module, image_16x16());
		{
			let mut m = module.lock();
			let before = m.live_node_count();
			m.collect_garbage();
			assert_eq!(m.live_node_count(), before);
		}
		drop(img);
		{
			let mut m = module.lock();
			m.collect_garbage();
			assert_eq!(m.live_node_count(), 0);
		}
	}

	#[test]
	fn same_extent_folds_known_sources() {
		let module = IRModule::new_shared();
		let known = declare_image(&module, image_16x16());
		let unknown = declare_image(&module, ImageAttachment {
			format: vk::Format::R16G16B16A16_SFLOAT,
			..ImageAttachment::default()
		});

		unknown.same_extent_as(&known);

		// The extent now folds during evaluation even though it was declared
		// unknown.
		let construct = unknown.find_construct();
		let m = module.lock();
		let w = m.node(construct.node).args.as_slice()[img_field::WIDTH];
		assert_eq!(m.eval(w).unwrap().as_u32(), Some(16));
	}

	#[test]
	fn same_extent_links_unknown_sources() {
		let module = IRModule::new_shared();
		let a = declare_image(&module, ImageAttachment::default());
		let b = declare_image(&module, ImageAttachment::default());
		b.same_extent_as(&a);

		let construct = b.find_construct();
		let m = module.lock();
		let w = m.node(construct.node).args.as_slice()[img_field::WIDTH];
		assert!(matches!(m.node(w.node).kind, NodeKind::Extract));
	}

	#[test]
	fn mip_slices_narrow() {
		let module = IRModule::new_shared();
		let img = declare_image(&module, ImageAttachment {
			level_count: 4,
			..image_16x16()
		});
		let mip2 = img.mip(2);
		let m = module.lock();
		let out = m.eval(mip2.as_ref()).unwrap();
		let out = out.as_image().unwrap();
		assert_eq!(out.base_level, 2);
		assert_eq!(out.level_count, 1);
	}

	#[test]
	fn arrays_index_through_extracts() {
		let module = IRModule::new_shared();
		let a = declare_image(&module, image_16x16());
		let b = declare_image(&module, ImageAttachment {
			extent: vk::Extent3D {
				width: 8,
				height: 8,
				depth: 1,
			},
			..image_16x16()
		});
		let arr = declare_array(&module, &[a, b]);
		assert_eq!(arr.len(), 2);

		let second = arr.index(1);
		let m = module.lock();
		// The element is read through an extract on the array.
		let mut r = second.as_ref();
		while matches!(m.node(r.node).kind, NodeKind::Splice) {
			r = m.node(r.node).args.as_slice()[r.index as usize];
		}
		assert!(matches!(m.node(r.node).kind, NodeKind::Extract));

		let out = m.eval(second.as_ref()).unwrap();
		assert_eq!(out.as_image().unwrap().extent.width, 8);
	}

	#[test]
	fn buffer_size_setters() {
		let module = IRModule::new_shared();
		let buf = declare_buffer(&module, Buffer::default());
		assert_eq!(buf.get_size(), None);
		buf.set_size(64);
		assert_eq!(buf.get_size(), Some(64));
	}
}
