//! Reify inference: fill construct placeholders from known payloads, then fix
//! framebuffer-coupled fields to a fixed point.

use ash::vk;

use crate::{
	compile::Compiler,
	ir::{buf_field, img_field, ConstantValue, IRModule, NodeId, NodeKind, Ref},
	sync::is_framebuffer_attachment,
	Result,
};

fn is_placeholder(m: &IRModule, r: Ref) -> bool { matches!(m.node(r.node).kind, NodeKind::Placeholder) }

/// Turn a placeholder node into a constant in place. Returns whether anything
/// changed.
fn placeholder_to_constant(m: &mut IRModule, r: Ref, value: ConstantValue) -> bool {
	if !is_placeholder(m, r) {
		return false;
	}
	let node = m.node_mut(r.node);
	node.kind = NodeKind::Constant { value };
	node.compute_class = crate::sync::DomainFlags::CONSTANT;
	true
}

impl Compiler {
	pub(crate) fn reify_inference(&mut self, m: &mut IRModule) -> Result<()> {
		// Construct payloads that already know a field override the field's
		// placeholder.
		for &id in &self.nodes {
			if !matches!(m.node(id).kind, NodeKind::Construct) {
				continue;
			}
			let args: Vec<Ref> = m.node(id).args.as_slice().to_vec();
			if m.node(id).types[0].is_image() {
				let Ok(payload) = m.eval(args[0]) else { continue };
				let Some(ia) = payload.as_image().copied() else { continue };
				if ia.extent.width > 0 {
					placeholder_to_constant(m, args[img_field::WIDTH], ConstantValue::U32(ia.extent.width));
				}
				if ia.extent.height > 0 {
					placeholder_to_constant(m, args[img_field::HEIGHT], ConstantValue::U32(ia.extent.height));
				}
				if ia.extent.depth > 0 {
					placeholder_to_constant(m, args[img_field::DEPTH], ConstantValue::U32(ia.extent.depth));
				}
				if ia.format != vk::Format::UNDEFINED {
					placeholder_to_constant(m, args[img_field::FORMAT], ConstantValue::Format(ia.format));
				}
				if !ia.sample_count.is_empty() {
					placeholder_to_constant(m, args[img_field::SAMPLES], ConstantValue::Samples(ia.sample_count));
				}
				if ia.layer_count != vk::REMAINING_ARRAY_LAYERS {
					placeholder_to_constant(m, args[img_field::LAYER_COUNT], ConstantValue::U32(ia.layer_count));
				}
				if ia.level_count != vk::REMAINING_MIP_LEVELS {
					placeholder_to_constant(m, args[img_field::LEVEL_COUNT], ConstantValue::U32(ia.level_count));
				}
			} else if m.node(id).types[0].is_buffer() {
				let Ok(payload) = m.eval(args[0]) else { continue };
				let Some(buffer) = payload.as_buffer() else { continue };
				if buffer.size != u64::MAX {
					let size = buffer.size;
					placeholder_to_constant(m, args[buf_field::SIZE], ConstantValue::U64(size));
				}
			}
		}

		// Framebuffer inference: every image bound as an attachment of one call
		// shares its sample count, 2D extent and layer count. Propagate until
		// nothing changes.
		loop {
			let mut progress = false;
			for &id in &self.nodes {
				if !matches!(m.node(id).kind, NodeKind::Call) {
					continue;
				}
				progress |= self.infer_framebuffer_of(m, id);
			}
			if !progress {
				break;
			}
		}

		Ok(())
	}

	fn infer_framebuffer_of(&self, m: &mut IRModule, id: NodeId) -> bool {
		let args: Vec<Ref> = m.node(id).args.as_slice().to_vec();
		let callee_ty = m.ref_type(args[0]);
		let Some(fn_args) = callee_ty.fn_args().map(|a| a.to_vec()) else {
			return false;
		};

		let mut progress = false;
		let mut extent: Option<(u32, u32)> = None;
		let mut samples: Option<vk::SampleCountFlags> = None;
		let mut layer_count: Option<u32> = None;

		// Constructs backing the framebuffer args of this call.
		let mut attachments = Vec::new();
		for (i, &parm) in args[1..].iter().enumerate() {
			let Some(access) = fn_args[i].imbued_access() else { continue };
			if !is_framebuffer_attachment(access) {
				continue;
			}
			let Some(urdef) = self.chain_of(parm).urdef else { continue };
			match m.node(urdef.node).kind {
				NodeKind::Construct => {
					let cargs: Vec<Ref> = m.node(urdef.node).args.as_slice().to_vec();
					// Attachments render to a single mip, depth 1.
					progress |= placeholder_to_constant(m, cargs[img_field::LEVEL_COUNT], ConstantValue::U32(1));
					progress |= placeholder_to_constant(m, cargs[img_field::DEPTH], ConstantValue::U32(1));

					if samples.is_none() {
						samples = m.eval(cargs[img_field::SAMPLES]).ok().and_then(|v| v.as_samples());
					}
					if extent.is_none() {
						let w = m.eval(cargs[img_field::WIDTH]).ok().and_then(|v| v.as_u32());
						let h = m.eval(cargs[img_field::HEIGHT]).ok().and_then(|v| v.as_u32());
						extent = w.zip(h);
					}
					if layer_count.is_none() {
						layer_count = m.eval(cargs[img_field::LAYER_COUNT]).ok().and_then(|v| v.as_u32());
					}
					attachments.push(urdef.node);
				},
				NodeKind::AcquireNextImage => {
					let swapchain = m.node(urdef.node).args.as_slice()[0];
					if let Ok(ConstantValue::Swapchain(handle)) = m.eval(swapchain) {
						let swapchain = handle.lock();
						if let Some(image) = swapchain.images.first() {
							extent = Some((image.extent.width, image.extent.height));
							layer_count = Some(image.layer_count);
							samples = Some(vk::SampleCountFlags::TYPE_1);
						}
					}
				},
				_ => {},
			}
		}

		for construct in attachments {
			let cargs: Vec<Ref> = m.node(construct).args.as_slice().to_vec();
			if let Some(samples) = samples {
				progress |= placeholder_to_constant(m, cargs[img_field::SAMPLES], ConstantValue::Samples(samples));
			}
			if let Some((w, h)) = extent {
				progress |= placeholder_to_constant(m, cargs[img_field::WIDTH], ConstantValue::U32(w));
				progress |= placeholder_to_constant(m, cargs[img_field::HEIGHT], ConstantValue::U32(h));
			}
			if let Some(layer_count) = layer_count {
				progress |= placeholder_to_constant(m, cargs[img_field::LAYER_COUNT], ConstantValue::U32(layer_count));
			}
		}

		progress
	}
}
