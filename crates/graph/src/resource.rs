//! Typed handles for device resources flowing through the graph.

use std::hash::{Hash, Hasher};

use ash::vk;

use crate::types::format_to_aspect;

/// Where a buffer's memory lives.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum MemoryUsage {
	#[default]
	GpuOnly,
	CpuToGpu,
	GpuToCpu,
	CpuOnly,
}

/// A subrange of an image or buffer resource.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Subrange {
	pub base_level: u32,
	pub level_count: u32,
	pub base_layer: u32,
	pub layer_count: u32,
}

impl Default for Subrange {
	fn default() -> Self {
		Self {
			base_level: 0,
			level_count: vk::REMAINING_MIP_LEVELS,
			base_layer: 0,
			layer_count: vk::REMAINING_ARRAY_LAYERS,
		}
	}
}

impl Subrange {
	pub fn to_vk(self, aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
		vk::ImageSubresourceRange {
			aspect_mask: aspect,
			base_mip_level: self.base_level,
			level_count: self.level_count,
			base_array_layer: self.base_layer,
			layer_count: self.layer_count,
		}
	}

	/// Whether `self` lies entirely within `other`.
	pub fn within(self, other: Subrange) -> bool {
		let level_end = |s: Subrange| {
			if s.level_count == vk::REMAINING_MIP_LEVELS {
				u32::MAX
			} else {
				s.base_level + s.level_count
			}
		};
		let layer_end = |s: Subrange| {
			if s.layer_count == vk::REMAINING_ARRAY_LAYERS {
				u32::MAX
			} else {
				s.base_layer + s.layer_count
			}
		};
		self.base_level >= other.base_level
			&& level_end(self) <= level_end(other)
			&& self.base_layer >= other.base_layer
			&& layer_end(self) <= layer_end(other)
	}
}

/// An image plus the view metadata the graph needs to attach, sample or store
/// into it.
///
/// Fields that an application leaves at their defaults (zero extent,
/// `UNDEFINED` format, empty sample counts, `REMAINING_*` counts) are inference
/// slots the compiler fills from chain ancestors.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ImageAttachment {
	pub image: vk::Image,
	pub view: vk::ImageView,
	pub usage: vk::ImageUsageFlags,
	pub view_type: vk::ImageViewType,
	pub format: vk::Format,
	pub extent: vk::Extent3D,
	/// Empty means "infer".
	pub sample_count: vk::SampleCountFlags,
	pub base_level: u32,
	pub level_count: u32,
	pub base_layer: u32,
	pub layer_count: u32,
}

impl Default for ImageAttachment {
	fn default() -> Self {
		Self {
			image: vk::Image::null(),
			view: vk::ImageView::null(),
			usage: vk::ImageUsageFlags::empty(),
			view_type: vk::ImageViewType::TYPE_2D,
			format: vk::Format::UNDEFINED,
			extent: vk::Extent3D::default(),
			sample_count: vk::SampleCountFlags::empty(),
			base_level: 0,
			level_count: vk::REMAINING_MIP_LEVELS,
			base_layer: 0,
			layer_count: vk::REMAINING_ARRAY_LAYERS,
		}
	}
}

impl ImageAttachment {
	pub fn aspect(&self) -> vk::ImageAspectFlags { format_to_aspect(self.format) }

	pub fn subrange(&self) -> Subrange {
		Subrange {
			base_level: self.base_level,
			level_count: self.level_count,
			base_layer: self.base_layer,
			layer_count: self.layer_count,
		}
	}

	/// Whether every field needed to create the image is known.
	pub fn is_fully_specified(&self) -> bool {
		self.extent.width > 0
			&& self.extent.height > 0
			&& self.extent.depth > 0
			&& self.format != vk::Format::UNDEFINED
			&& !self.sample_count.is_empty()
			&& self.level_count != vk::REMAINING_MIP_LEVELS
			&& self.layer_count != vk::REMAINING_ARRAY_LAYERS
	}

	pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
		vk::Extent3D {
			width: (self.extent.width >> level).max(1),
			height: (self.extent.height >> level).max(1),
			depth: (self.extent.depth >> level).max(1),
		}
	}
}

impl Hash for ImageAttachment {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.image.hash(state);
		self.view.hash(state);
		self.usage.hash(state);
		self.view_type.hash(state);
		self.format.hash(state);
		(self.extent.width, self.extent.height, self.extent.depth).hash(state);
		self.sample_count.hash(state);
		(self.base_level, self.level_count, self.base_layer, self.layer_count).hash(state);
	}
}

/// A buffer range, possibly sub-allocated out of a larger allocation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Buffer {
	pub buffer: vk::Buffer,
	pub offset: u64,
	/// `u64::MAX` means "infer".
	pub size: u64,
	/// Base device address of the range; 0 when the buffer was created without
	/// `SHADER_DEVICE_ADDRESS`.
	pub device_address: u64,
	/// Host mapping of the range; null for device-local memory.
	pub mapped: *mut u8,
}

impl Default for Buffer {
	fn default() -> Self {
		Self {
			buffer: vk::Buffer::null(),
			offset: 0,
			size: u64::MAX,
			device_address: 0,
			mapped: std::ptr::null_mut(),
		}
	}
}

// The mapped pointer targets host-visible device memory; races on its contents
// are governed by GPU synchronization, not the handle.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
	pub fn is_fully_specified(&self) -> bool { self.size != u64::MAX }

	/// The host view of this buffer, if it is mapped.
	pub fn mapped_slice(&self) -> Option<&mut [u8]> {
		(!self.mapped.is_null() && self.size != u64::MAX)
			.then(|| unsafe { std::slice::from_raw_parts_mut(self.mapped, self.size as usize) })
	}

	#[cfg(feature = "bytemuck")]
	pub fn write_pod<T: bytemuck::NoUninit>(&self, data: &[T]) {
		let bytes = bytemuck::cast_slice(data);
		let dst = self.mapped_slice().expect("buffer is not host mapped");
		dst[..bytes.len()].copy_from_slice(bytes);
	}

	#[cfg(feature = "bytemuck")]
	pub fn read_pod<T: bytemuck::AnyBitPattern + Copy>(&self) -> Vec<T> {
		let src = self.mapped_slice().expect("buffer is not host mapped");
		bytemuck::cast_slice(&src[..src.len() - src.len() % std::mem::size_of::<T>()]).to_vec()
	}
}

impl Hash for Buffer {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.buffer.hash(state);
		self.offset.hash(state);
		self.size.hash(state);
	}
}

/// A formatted view over a buffer range.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct BufferView {
	pub handle: vk::BufferView,
	pub buffer: vk::Buffer,
	pub format: vk::Format,
	pub offset: u64,
	pub range: u64,
}

/// A standalone image view with its identifying metadata.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ImageView {
	pub view: vk::ImageView,
	pub image: vk::Image,
	pub view_type: vk::ImageViewType,
	pub format: vk::Format,
	pub subrange: Subrange,
}

/// Hashable sampler state; the cache key for sampler objects.
#[derive(Copy, Clone, Debug)]
pub struct SamplerCreateInfo {
	pub mag_filter: vk::Filter,
	pub min_filter: vk::Filter,
	pub mipmap_mode: vk::SamplerMipmapMode,
	pub address_mode_u: vk::SamplerAddressMode,
	pub address_mode_v: vk::SamplerAddressMode,
	pub address_mode_w: vk::SamplerAddressMode,
	pub mip_lod_bias: f32,
	pub anisotropy_enable: bool,
	pub max_anisotropy: f32,
	pub compare_enable: bool,
	pub compare_op: vk::CompareOp,
	pub min_lod: f32,
	pub max_lod: f32,
	pub border_color: vk::BorderColor,
	pub unnormalized_coordinates: bool,
}

impl Default for SamplerCreateInfo {
	fn default() -> Self {
		Self {
			mag_filter: vk::Filter::NEAREST,
			min_filter: vk::Filter::NEAREST,
			mipmap_mode: vk::SamplerMipmapMode::NEAREST,
			address_mode_u: vk::SamplerAddressMode::REPEAT,
			address_mode_v: vk::SamplerAddressMode::REPEAT,
			address_mode_w: vk::SamplerAddressMode::REPEAT,
			mip_lod_bias: 0.0,
			anisotropy_enable: false,
			max_anisotropy: 0.0,
			compare_enable: false,
			compare_op: vk::CompareOp::NEVER,
			min_lod: 0.0,
			max_lod: vk::LOD_CLAMP_NONE,
			border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
			unnormalized_coordinates: false,
		}
	}
}

impl PartialEq for SamplerCreateInfo {
	fn eq(&self, other: &Self) -> bool {
		self.mag_filter == other.mag_filter
			&& self.min_filter == other.min_filter
			&& self.mipmap_mode == other.mipmap_mode
			&& self.address_mode_u == other.address_mode_u
			&& self.address_mode_v == other.address_mode_v
			&& self.address_mode_w == other.address_mode_w
			&& self.mip_lod_bias.to_bits() == other.mip_lod_bias.to_bits()
			&& self.anisotropy_enable == other.anisotropy_enable
			&& self.max_anisotropy.to_bits() == other.max_anisotropy.to_bits()
			&& self.compare_enable == other.compare_enable
			&& self.compare_op == other.compare_op
			&& self.min_lod.to_bits() == other.min_lod.to_bits()
			&& self.max_lod.to_bits() == other.max_lod.to_bits()
			&& self.border_color == other.border_color
			&& self.unnormalized_coordinates == other.unnormalized_coordinates
	}
}

impl Eq for SamplerCreateInfo {}

impl Hash for SamplerCreateInfo {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.mag_filter.hash(state);
		self.min_filter.hash(state);
		self.mipmap_mode.hash(state);
		self.address_mode_u.hash(state);
		self.address_mode_v.hash(state);
		self.address_mode_w.hash(state);
		self.mip_lod_bias.to_bits().hash(state);
		self.anisotropy_enable.hash(state);
		self.max_anisotropy.to_bits().hash(state);
		self.compare_enable.hash(state);
		self.compare_op.hash(state);
		self.min_lod.to_bits().hash(state);
		self.max_lod.to_bits().hash(state);
		self.border_color.hash(state);
		self.unnormalized_coordinates.hash(state);
	}
}

impl SamplerCreateInfo {
	pub fn to_vk(&self) -> vk::SamplerCreateInfo<'static> {
		vk::SamplerCreateInfo::default()
			.mag_filter(self.mag_filter)
			.min_filter(self.min_filter)
			.mipmap_mode(self.mipmap_mode)
			.address_mode_u(self.address_mode_u)
			.address_mode_v(self.address_mode_v)
			.address_mode_w(self.address_mode_w)
			.mip_lod_bias(self.mip_lod_bias)
			.anisotropy_enable(self.anisotropy_enable)
			.max_anisotropy(self.max_anisotropy)
			.compare_enable(self.compare_enable)
			.compare_op(self.compare_op)
			.min_lod(self.min_lod)
			.max_lod(self.max_lod)
			.border_color(self.border_color)
			.unnormalized_coordinates(self.unnormalized_coordinates)
	}
}

/// A sampler object together with the state it was created from.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Sampler {
	pub sampler: vk::Sampler,
}

/// The value a `CLEAR` node writes.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ClearValue {
	ColorF([f32; 4]),
	ColorU([u32; 4]),
	ColorI([i32; 4]),
	DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
	pub fn to_vk(self) -> vk::ClearValue {
		match self {
			ClearValue::ColorF(float32) => vk::ClearValue {
				color: vk::ClearColorValue { float32 },
			},
			ClearValue::ColorU(uint32) => vk::ClearValue {
				color: vk::ClearColorValue { uint32 },
			},
			ClearValue::ColorI(int32) => vk::ClearValue {
				color: vk::ClearColorValue { int32 },
			},
			ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
				depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subrange_containment() {
		let whole = Subrange::default();
		let mip1 = Subrange {
			base_level: 1,
			level_count: 1,
			..Subrange::default()
		};
		assert!(mip1.within(whole));
		assert!(!whole.within(mip1));
		assert!(mip1.within(mip1));
	}

	#[test]
	fn attachment_inference_slots() {
		let mut img = ImageAttachment::default();
		assert!(!img.is_fully_specified());
		img.extent = vk::Extent3D {
			width: 16,
			height: 16,
			depth: 1,
		};
		img.format = vk::Format::R8G8B8A8_UNORM;
		img.sample_count = vk::SampleCountFlags::TYPE_1;
		img.level_count = 4;
		img.layer_count = 1;
		assert!(img.is_fully_specified());
		assert_eq!(img.mip_extent(3).width, 2);
		assert_eq!(img.mip_extent(5).width, 1);
	}
}
