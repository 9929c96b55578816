use std::sync::Arc;

use ash::vk;

use super::*;
use crate::{
	exec::signal::{Signal, SyncPoint},
	ir::{img_field, ConstantValue, ExtNode, IRModule, TypeKind},
	resource::ImageAttachment,
	sync::Access,
	Error,
};

fn image_2d(width: u32, height: u32) -> ImageAttachment {
	ImageAttachment {
		extent: vk::Extent3D { width, height, depth: 1 },
		format: vk::Format::R8G8B8A8_UNORM,
		sample_count: vk::SampleCountFlags::TYPE_1,
		level_count: 1,
		layer_count: 1,
		..ImageAttachment::default()
	}
}

/// Build an opaque pass over `accesses`; written arguments come back as
/// aliased results.
fn pass(m: &mut IRModule, accesses: &[(Access, Arc<crate::ir::Type>)], domain: DomainFlags, aliased: bool) -> Ref {
	let args = accesses
		.iter()
		.map(|(access, ty)| {
			m.emplace_type(TypeKind::Imbued {
				base: ty.clone(),
				access: *access,
			})
		})
		.collect();
	let returns = if aliased {
		accesses
			.iter()
			.enumerate()
			.filter(|(_, (access, _))| crate::sync::is_write_access(*access))
			.map(|(i, (_, ty))| {
				m.emplace_type(TypeKind::Aliased {
					base: ty.clone(),
					arg: (i + 1) as u16,
				})
			})
			.collect()
	} else {
		Vec::new()
	};
	m.make_opaque_fn(args, returns, domain, Arc::new(|_| Ok(())))
}

fn hold(module: &ModuleRef, node: crate::ir::NodeId) -> Arc<ExtNode> {
	Arc::new(ExtNode::new(module.clone(), node, Vec::new()))
}

fn position(c: &Compiler, node: crate::ir::NodeId) -> Option<usize> {
	c.scheduled().iter().position(|item| item.node == node)
}

#[test]
fn chain_invariants_hold() {
	let module = IRModule::new_shared();
	let (img, clear, reader_a, reader_b, writer) = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img = m.declare_image(image_2d(4, 4));
		let clear = m.make_clear(img, crate::resource::ClearValue::ColorF([1.0, 0.0, 0.0, 1.0]));
		let read = pass(&mut m, &[(Access::FragmentSampled, image_ty.clone())], DomainFlags::DEVICE, false);
		let reader_a = m.make_call(read, &[clear]);
		let reader_b = m.make_call(read, &[clear]);
		let write = pass(&mut m, &[(Access::ColorWrite, image_ty)], DomainFlags::DEVICE, true);
		let writer = m.make_call(write, &[clear]);
		(img, clear, reader_a, reader_b, writer)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, reader_a), hold(&module, reader_b), hold(&module, writer)];
	c.compile(&module, &roots).unwrap();

	// Doubly-linked chain structure.
	for (i, link) in c.links.iter().enumerate() {
		let id = LinkId(i as u32);
		if let Some(prev) = link.prev {
			assert_eq!(c.chain(prev).next, Some(id));
		}
		if let Some(next) = link.next {
			assert_eq!(c.chain(next).prev, Some(id));
		}
	}

	// urdef is the head def along the whole chain.
	for &head in c.chains() {
		let urdef = c.chain(head).def;
		if urdef.is_none() {
			continue;
		}
		let mut l = Some(head);
		while let Some(id) = l {
			assert_eq!(c.chain(id).urdef, urdef);
			l = c.chain(id).next;
		}
	}

	// The cleared value is read twice, then invalidated by the writer.
	let clear_link = c.chain_of(clear);
	assert_eq!(clear_link.reads.len(), 2);
	assert!(clear_link.reads.iter().all(|r| r.node == reader_a || r.node == reader_b));
	assert_eq!(clear_link.undef.map(|u| u.node), Some(writer));
	let _ = img;
}

#[test]
fn schedule_respects_def_read_undef_edges() {
	let module = IRModule::new_shared();
	let (clear, reader_a, reader_b, writer) = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img = m.declare_image(image_2d(4, 4));
		let clear = m.make_clear(img, crate::resource::ClearValue::ColorF([0.0; 4]));
		let read = pass(&mut m, &[(Access::FragmentSampled, image_ty.clone())], DomainFlags::DEVICE, false);
		let reader_a = m.make_call(read, &[clear]);
		let reader_b = m.make_call(read, &[clear]);
		let write = pass(&mut m, &[(Access::ColorWrite, image_ty)], DomainFlags::DEVICE, true);
		let writer = m.make_call(write, &[clear]);
		(clear.node, reader_a, reader_b, writer)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, reader_a), hold(&module, reader_b), hold(&module, writer)];
	c.compile(&module, &roots).unwrap();

	let clear_pos = position(&c, clear).unwrap();
	let a_pos = position(&c, reader_a).unwrap();
	let b_pos = position(&c, reader_b).unwrap();
	let w_pos = position(&c, writer).unwrap();
	assert!(clear_pos < a_pos && clear_pos < b_pos);
	assert!(a_pos < w_pos && b_pos < w_pos);
}

#[test]
fn independent_calls_break_ties_on_auxiliary_order() {
	let module = IRModule::new_shared();
	let (first, second) = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img_a = m.declare_image(image_2d(4, 4));
		let img_b = m.declare_image(image_2d(4, 4));
		let write = pass(&mut m, &[(Access::ColorWrite, image_ty)], DomainFlags::DEVICE, false);
		// Creation order is the auxiliary order.
		let first = m.make_call(write, &[img_a]);
		let second = m.make_call(write, &[img_b]);
		(first, second)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, second), hold(&module, first)];
	c.compile(&module, &roots).unwrap();
	assert!(position(&c, first).unwrap() < position(&c, second).unwrap());
}

#[test]
fn parallel_reads_share_one_merged_sync() {
	let module = IRModule::new_shared();
	let clear = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img = m.declare_image(image_2d(4, 4));
		let clear = m.make_clear(img, crate::resource::ClearValue::ColorF([0.0; 4]));
		let sampled = pass(&mut m, &[(Access::FragmentSampled, image_ty.clone())], DomainFlags::DEVICE, false);
		let transfer = pass(&mut m, &[(Access::TransferRead, image_ty.clone())], DomainFlags::DEVICE, false);
		let write = pass(&mut m, &[(Access::ColorWrite, image_ty)], DomainFlags::DEVICE, true);
		let a = m.make_call(sampled, &[clear]);
		let b = m.make_call(transfer, &[clear]);
		let w = m.make_call(write, &[clear]);
		drop((a, b, w));
		clear
	};

	let mut c = Compiler::new();
	let roots: Vec<_> = {
		let m = module.lock();
		m.live_nodes()
			.filter(|&id| matches!(m.node(id).kind, crate::ir::NodeKind::Call))
			.collect()
	}
	.into_iter()
	.map(|id| hold(&module, id))
	.collect();
	c.compile(&module, &roots).unwrap();

	let link = c.chain_of(clear);
	// One merged read barrier for both readers, and a separate undef barrier
	// for the writer.
	let read_sync = link.read_sync.expect("reads must merge into one sync");
	assert_eq!(read_sync.layout, vk::ImageLayout::GENERAL);
	assert!(read_sync.stages.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
	assert!(read_sync.stages.contains(vk::PipelineStageFlags2::ALL_TRANSFER));
	let undef_sync = link.undef_sync.expect("the writer needs its own sync");
	assert_eq!(undef_sync.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
}

#[test]
fn slice_and_converge_schedule_after_both_writers() {
	let module = IRModule::new_shared();
	let (img, pa, pb, pc) = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img = m.declare_image(ImageAttachment {
			level_count: 2,
			..image_2d(8, 8)
		});
		let start0 = m.make_u32(0);
		let start1 = m.make_u32(1);
		let count = m.make_u32(1);
		let mip0 = m.make_slice(img, crate::ir::Axis::Mip, start0, count);
		let mip1 = m.make_slice(img, crate::ir::Axis::Mip, start1, count);
		let write = pass(&mut m, &[(Access::ComputeWrite, image_ty.clone())], DomainFlags::DEVICE, false);
		let read = pass(&mut m, &[(Access::ComputeSampled, image_ty)], DomainFlags::DEVICE, false);
		let pa = m.make_call(write, &[mip0]);
		let pb = m.make_call(write, &[mip1]);
		let pc = m.make_call(read, &[img]);
		(img, pa, pb, pc)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, pa), hold(&module, pb), hold(&module, pc)];
	c.compile(&module, &roots).unwrap();

	// The read was rewritten onto an implicit converge with one indirect
	// dependency per diverged subrange.
	let m = module.lock();
	let pc_arg = m.node(pc).args.as_slice()[1];
	assert!(matches!(m.node(pc_arg.node).kind, crate::ir::NodeKind::Converge { .. }));
	assert_ne!(pc_arg, img);
	let converge_args = m.node(pc_arg.node).args.as_slice();
	let indirect = converge_args[1..]
		.iter()
		.filter(|t| matches!(m.node(t.node).kind, crate::ir::NodeKind::IndirectDepend))
		.count();
	assert_eq!(indirect, 2);
	drop(m);

	let pa_pos = position(&c, pa).unwrap();
	let pb_pos = position(&c, pb).unwrap();
	let pc_pos = position(&c, pc).unwrap();
	assert!(pa_pos < pc_pos && pb_pos < pc_pos);
}

#[test]
fn framebuffer_inference_fills_unknown_attachments() {
	let module = IRModule::new_shared();
	let (unknown, call) = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let known = m.declare_image(image_2d(32, 32));
		let unknown = m.declare_image(ImageAttachment::default());
		let draw = pass(
			&mut m,
			&[
				(Access::ColorWrite, image_ty.clone()),
				(Access::ColorWrite, image_ty),
			],
			DomainFlags::GRAPHICS_QUEUE,
			false,
		);
		let call = m.make_call(draw, &[known, unknown]);
		(unknown, call)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, call)];
	c.compile(&module, &roots).unwrap();

	let m = module.lock();
	let out = m.eval(unknown);
	// Format stays unknown (inference does not invent formats), but the shared
	// framebuffer shape is now fixed.
	assert!(out.is_err());
	let cargs: Vec<Ref> = m.node(unknown.node).args.as_slice().to_vec();
	assert_eq!(m.eval(cargs[img_field::WIDTH]).unwrap().as_u32(), Some(32));
	assert_eq!(m.eval(cargs[img_field::HEIGHT]).unwrap().as_u32(), Some(32));
	assert_eq!(m.eval(cargs[img_field::DEPTH]).unwrap().as_u32(), Some(1));
	assert_eq!(
		m.eval(cargs[img_field::SAMPLES]).unwrap().as_samples(),
		Some(vk::SampleCountFlags::TYPE_1)
	);
	assert_eq!(m.eval(cargs[img_field::LAYER_COUNT]).unwrap().as_u32(), Some(1));
	assert_eq!(m.eval(cargs[img_field::LEVEL_COUNT]).unwrap().as_u32(), Some(1));
}

#[test]
fn queue_inference_partitions_across_queues() {
	let module = IRModule::new_shared();
	let (p1, p2) = {
		let mut m = module.lock();
		let buffer_ty = m.builtin_buffer.clone();
		let buf = m.declare_buffer(crate::resource::Buffer {
			size: 64,
			..crate::resource::Buffer::default()
		});
		let upload = pass(&mut m, &[(Access::TransferWrite, buffer_ty.clone())], DomainFlags::TRANSFER_QUEUE, true);
		let consume = pass(&mut m, &[(Access::VertexRead, buffer_ty)], DomainFlags::GRAPHICS_QUEUE, false);
		let p1 = m.make_call(upload, &[buf]);
		let written = Ref::new(p1, 0);
		let p2 = m.make_call(consume, &[written]);
		(p1, p2)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, p2), hold(&module, p1)];
	c.compile(&module, &roots).unwrap();

	let parts = c.partitions().clone();
	let transfer: Vec<_> = c.partition(parts.transfer).map(|i| i.node).collect();
	let graphics: Vec<_> = c.partition(parts.graphics).map(|i| i.node).collect();
	assert!(transfer.contains(&p1));
	assert!(graphics.contains(&p2));
	assert!(!graphics.contains(&p1));
}

#[test]
fn undecided_passes_default_to_graphics() {
	let module = IRModule::new_shared();
	let call = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img = m.declare_image(image_2d(4, 4));
		let any = pass(&mut m, &[(Access::ColorWrite, image_ty)], DomainFlags::DEVICE, false);
		m.make_call(any, &[img])
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, call)];
	c.compile(&module, &roots).unwrap();

	let item = c.scheduled().iter().find(|i| i.node == call).unwrap();
	assert_eq!(item.domain, DomainFlags::GRAPHICS_QUEUE);
}

#[test]
fn armed_splices_become_acquires() {
	let module = IRModule::new_shared();
	let (splice, consumer) = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let img = m.declare_image(image_2d(4, 4));
		let signal = Arc::new(Signal::new());
		signal.arm(
			SyncPoint {
				domain: DomainFlags::GRAPHICS_QUEUE,
				value: 3,
			},
			vec![ConstantValue::Image(image_2d(4, 4))],
			vec![crate::sync::to_use(Access::ColorWrite)],
		);
		let splice = m.make_splice(&[img], Some(signal));
		let read = pass(&mut m, &[(Access::FragmentSampled, image_ty)], DomainFlags::DEVICE, false);
		let consumer = m.make_call(read, &[Ref::new(splice, 0)]);
		(splice, consumer)
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, consumer)];
	c.compile(&module, &roots).unwrap();

	let m = module.lock();
	let arg = m.node(consumer).args.as_slice()[1];
	assert!(matches!(m.node(arg.node).kind, crate::ir::NodeKind::Acquire { .. }));
	assert_ne!(arg.node, splice);
}

#[test]
fn unattached_arguments_are_rejected() {
	let module = IRModule::new_shared();
	let call = {
		let mut m = module.lock();
		let image_ty = m.builtin_image.clone();
		let dangling = m.make_placeholder(image_ty.clone());
		let read = pass(&mut m, &[(Access::FragmentSampled, image_ty)], DomainFlags::DEVICE, false);
		m.make_call(read, &[dangling])
	};

	let mut c = Compiler::new();
	let roots = [hold(&module, call)];
	let err = c.compile(&module, &roots).unwrap_err();
	assert!(matches!(
		err,
		Error::RenderGraph(GraphError::UnattachedResource { .. })
	));
}
