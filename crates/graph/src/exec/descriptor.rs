//! Descriptor binding state, type resolution, and persistent set commits.

use ash::vk;

use crate::{alloc::PersistentDescriptorSet, resource::Buffer, runtime::Runtime};

/// What the application bound to one (set, binding, element) slot.
#[derive(Copy, Clone, Debug)]
pub enum Bound {
	Sampler(vk::Sampler),
	SampledImage {
		view: vk::ImageView,
		layout: vk::ImageLayout,
	},
	CombinedImageSampler {
		view: vk::ImageView,
		layout: vk::ImageLayout,
		sampler: vk::Sampler,
	},
	StorageImage {
		view: vk::ImageView,
		layout: vk::ImageLayout,
	},
	UniformBuffer(Buffer),
	StorageBuffer(Buffer),
}

/// A fully resolved write for one slot.
#[derive(Copy, Clone, Debug)]
pub enum ResolvedWrite {
	Image {
		ty: vk::DescriptorType,
		view: vk::ImageView,
		layout: vk::ImageLayout,
		sampler: vk::Sampler,
	},
	Buffer {
		ty: vk::DescriptorType,
		buffer: vk::Buffer,
		offset: u64,
		range: u64,
	},
}

/// Match what the application bound against what the shader declares,
/// upgrading where the combination is well-defined:
/// a sampled image plus a sampler satisfies a combined-image-sampler binding,
/// and a uniform buffer satisfies a storage-buffer binding.
pub fn resolve_binding(declared: vk::DescriptorType, bound: &Bound, paired_sampler: Option<vk::Sampler>) -> Option<ResolvedWrite> {
	use vk::DescriptorType as D;
	let image = |ty, view, layout, sampler| Some(ResolvedWrite::Image { ty, view, layout, sampler });
	let buffer = |ty, b: &Buffer| {
		Some(ResolvedWrite::Buffer {
			ty,
			buffer: b.buffer,
			offset: b.offset,
			range: b.size,
		})
	};
	match (declared, bound) {
		(D::SAMPLER, Bound::Sampler(sampler)) => image(D::SAMPLER, vk::ImageView::null(), vk::ImageLayout::UNDEFINED, *sampler),
		(D::SAMPLED_IMAGE, Bound::SampledImage { view, layout }) => image(D::SAMPLED_IMAGE, *view, *layout, vk::Sampler::null()),
		(D::COMBINED_IMAGE_SAMPLER, Bound::CombinedImageSampler { view, layout, sampler }) => {
			image(D::COMBINED_IMAGE_SAMPLER, *view, *layout, *sampler)
		},
		// Sampler + SampledImage upgrade to a combined binding.
		(D::COMBINED_IMAGE_SAMPLER, Bound::SampledImage { view, layout }) => {
			image(D::COMBINED_IMAGE_SAMPLER, *view, *layout, paired_sampler?)
		},
		(D::STORAGE_IMAGE, Bound::StorageImage { view, layout }) => image(D::STORAGE_IMAGE, *view, *layout, vk::Sampler::null()),
		(D::UNIFORM_BUFFER, Bound::UniformBuffer(b)) => buffer(D::UNIFORM_BUFFER, b),
		(D::STORAGE_BUFFER, Bound::StorageBuffer(b)) => buffer(D::STORAGE_BUFFER, b),
		// The shader wants storage; a uniform binding upgrades.
		(D::STORAGE_BUFFER, Bound::UniformBuffer(b)) => buffer(D::STORAGE_BUFFER, b),
		_ => None,
	}
}

/// A deferred descriptor write on a persistent set.
#[derive(Copy, Clone, Debug)]
pub struct PendingWrite {
	pub binding: u32,
	pub element: u32,
	pub write: ResolvedWrite,
}

impl PersistentDescriptorSet {
	pub fn update(&self, binding: u32, element: u32, write: ResolvedWrite) {
		self.pending.lock().push(PendingWrite { binding, element, write });
	}

	pub fn update_sampled_image(&self, binding: u32, element: u32, view: vk::ImageView, layout: vk::ImageLayout) {
		self.update(binding, element, ResolvedWrite::Image {
			ty: vk::DescriptorType::SAMPLED_IMAGE,
			view,
			layout,
			sampler: vk::Sampler::null(),
		});
	}

	pub fn update_storage_image(&self, binding: u32, element: u32, view: vk::ImageView) {
		self.update(binding, element, ResolvedWrite::Image {
			ty: vk::DescriptorType::STORAGE_IMAGE,
			view,
			layout: vk::ImageLayout::GENERAL,
			sampler: vk::Sampler::null(),
		});
	}

	pub fn update_combined_image_sampler(
		&self, binding: u32, element: u32, view: vk::ImageView, layout: vk::ImageLayout, sampler: vk::Sampler,
	) {
		self.update(binding, element, ResolvedWrite::Image {
			ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
			view,
			layout,
			sampler,
		});
	}

	pub fn update_uniform_buffer(&self, binding: u32, element: u32, buffer: Buffer) {
		self.update(binding, element, ResolvedWrite::Buffer {
			ty: vk::DescriptorType::UNIFORM_BUFFER,
			buffer: buffer.buffer,
			offset: buffer.offset,
			range: buffer.size,
		});
	}

	pub fn update_storage_buffer(&self, binding: u32, element: u32, buffer: Buffer) {
		self.update(binding, element, ResolvedWrite::Buffer {
			ty: vk::DescriptorType::STORAGE_BUFFER,
			buffer: buffer.buffer,
			offset: buffer.offset,
			range: buffer.size,
		});
	}

	/// Drain the pending writes and apply them on the caller thread.
	pub fn commit(&self, runtime: &Runtime) {
		let pending = std::mem::take(&mut *self.pending.lock());
		if pending.is_empty() {
			return;
		}

		let mut image_infos = Vec::new();
		let mut buffer_infos = Vec::new();
		for write in &pending {
			match write.write {
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
		let writes: Vec<vk::WriteDescriptorSet> = pending
			.iter()
			.map(|w| {
				let write = vk::WriteDescriptorSet::default()
					.dst_set(self.set)
					.dst_binding(w.binding)
					.dst_array_element(w.element);
				match w.write {
					ResolvedWrite::Image { ty, .. } => {
						let info = &image_infos[image_i..image_i + 1];
						image_i += 1;
						write.descriptor_type(ty).image_info(info)
					},
					ResolvedWrite::Buffer { ty, .. } => {
						let info = &buffer_infos[buffer_i..buffer_i + 1];
						buffer_i += 1;
						write.descriptor_type(ty).buffer_info(info)
					},
				}
			})
			.collect();

		unsafe { runtime.device().update_descriptor_sets(&writes, &[]) };
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bindings_resolve_and_upgrade() {
		use vk::DescriptorType as D;

		let view = vk::ImageView::null();
		let sampler = vk::Sampler::null();
		let layout = vk::ImageLayout::READ_ONLY_OPTIMAL;

		// Exact matches pass through.
		assert!(resolve_binding(D::SAMPLED_IMAGE, &Bound::SampledImage { view, layout }, None).is_some());

		// Sampler + SampledImage upgrades to combined.
		let combined = resolve_binding(D::COMBINED_IMAGE_SAMPLER, &Bound::SampledImage { view, layout }, Some(sampler));
		assert!(matches!(
			combined,
			Some(ResolvedWrite::Image {
				ty: D::COMBINED_IMAGE_SAMPLER,
				..
			})
		));
		// Without a paired sampler the upgrade is impossible.
		assert!(resolve_binding(D::COMBINED_IMAGE_SAMPLER, &Bound::SampledImage { view, layout }, None).is_none());

		// Uniform upgrades to storage when the shader wants storage.
		let buffer = Buffer::default();
		let upgraded = resolve_binding(D::STORAGE_BUFFER, &Bound::UniformBuffer(buffer), None);
		assert!(matches!(
			upgraded,
			Some(ResolvedWrite::Buffer { ty: D::STORAGE_BUFFER, .. })
		));

		// Mismatches are rejected.
		assert!(resolve_binding(D::STORAGE_IMAGE, &Bound::SampledImage { view, layout }, None).is_none());
	}
}
