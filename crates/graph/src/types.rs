//! Format tables and hashing helpers.

use ash::vk;

/// Combine a hash into a running seed. Matches the canonical boost-style mix so
/// type hashes are stable across runs.
pub fn hash_combine(seed: u32, v: u32) -> u32 {
	seed ^ (v
		.wrapping_add(0x9e37_79b9)
		.wrapping_add(seed << 6)
		.wrapping_add(seed >> 2))
}

/// Size in bytes of one texel block of `format`.
///
/// For uncompressed formats this is the texel size; for block-compressed formats
/// it is the size of one compressed block.
pub fn format_to_texel_block_size(format: vk::Format) -> u32 {
	use vk::Format as F;
	match format {
		F::R4G4_UNORM_PACK8 | F::R8_UNORM | F::R8_SNORM | F::R8_USCALED | F::R8_SSCALED | F::R8_UINT | F::R8_SINT
		| F::R8_SRGB | F::S8_UINT => 1,
		F::R4G4B4A4_UNORM_PACK16
		| F::B4G4R4A4_UNORM_PACK16
		| F::R5G6B5_UNORM_PACK16
		| F::B5G6R5_UNORM_PACK16
		| F::R5G5B5A1_UNORM_PACK16
		| F::B5G5R5A1_UNORM_PACK16
		| F::A1R5G5B5_UNORM_PACK16
		| F::R8G8_UNORM
		| F::R8G8_SNORM
		| F::R8G8_UINT
		| F::R8G8_SINT
		| F::R8G8_SRGB
		| F::R16_UNORM
		| F::R16_SNORM
		| F::R16_UINT
		| F::R16_SINT
		| F::R16_SFLOAT
		| F::D16_UNORM => 2,
		F::R8G8B8_UNORM | F::R8G8B8_SRGB | F::B8G8R8_UNORM | F::B8G8R8_SRGB | F::D16_UNORM_S8_UINT => 3,
		F::R8G8B8A8_UNORM
		| F::R8G8B8A8_SNORM
		| F::R8G8B8A8_UINT
		| F::R8G8B8A8_SINT
		| F::R8G8B8A8_SRGB
		| F::B8G8R8A8_UNORM
		| F::B8G8R8A8_SRGB
		| F::A8B8G8R8_UNORM_PACK32
		| F::A8B8G8R8_SRGB_PACK32
		| F::A2R10G10B10_UNORM_PACK32
		| F::A2B10G10R10_UNORM_PACK32
		| F::B10G11R11_UFLOAT_PACK32
		| F::E5B9G9R9_UFLOAT_PACK32
		| F::R16G16_UNORM
		| F::R16G16_SNORM
		| F::R16G16_UINT
		| F::R16G16_SINT
		| F::R16G16_SFLOAT
		| F::R32_UINT
		| F::R32_SINT
		| F::R32_SFLOAT
		| F::D32_SFLOAT
		| F::D24_UNORM_S8_UINT => 4,
		F::D32_SFLOAT_S8_UINT => 5,
		F::R16G16B16_SFLOAT => 6,
		F::R16G16B16A16_UNORM
		| F::R16G16B16A16_SNORM
		| F::R16G16B16A16_UINT
		| F::R16G16B16A16_SINT
		| F::R16G16B16A16_SFLOAT
		| F::R32G32_UINT
		| F::R32G32_SINT
		| F::R32G32_SFLOAT
		| F::R64_UINT
		| F::R64_SINT
		| F::R64_SFLOAT
		| F::BC1_RGB_UNORM_BLOCK
		| F::BC1_RGB_SRGB_BLOCK
		| F::BC1_RGBA_UNORM_BLOCK
		| F::BC1_RGBA_SRGB_BLOCK
		| F::BC4_UNORM_BLOCK
		| F::BC4_SNORM_BLOCK => 8,
		F::R32G32B32_UINT | F::R32G32B32_SINT | F::R32G32B32_SFLOAT => 12,
		F::R32G32B32A32_UINT
		| F::R32G32B32A32_SINT
		| F::R32G32B32A32_SFLOAT
		| F::R64G64_UINT
		| F::R64G64_SINT
		| F::R64G64_SFLOAT
		| F::BC2_UNORM_BLOCK
		| F::BC2_SRGB_BLOCK
		| F::BC3_UNORM_BLOCK
		| F::BC3_SRGB_BLOCK
		| F::BC5_UNORM_BLOCK
		| F::BC5_SNORM_BLOCK
		| F::BC6H_UFLOAT_BLOCK
		| F::BC6H_SFLOAT_BLOCK
		| F::BC7_UNORM_BLOCK
		| F::BC7_SRGB_BLOCK => 16,
		F::R64G64B64_UINT | F::R64G64B64_SINT | F::R64G64B64_SFLOAT => 24,
		F::R64G64B64A64_UINT | F::R64G64B64A64_SINT | F::R64G64B64A64_SFLOAT => 32,
		_ => panic!("texel block size not tabulated for {:?}", format),
	}
}

/// The dimensions of one texel block. `(1, 1)` for everything uncompressed.
pub fn format_to_texel_block_extent(format: vk::Format) -> (u32, u32) {
	use vk::Format as F;
	match format {
		F::BC1_RGB_UNORM_BLOCK
		| F::BC1_RGB_SRGB_BLOCK
		| F::BC1_RGBA_UNORM_BLOCK
		| F::BC1_RGBA_SRGB_BLOCK
		| F::BC2_UNORM_BLOCK
		| F::BC2_SRGB_BLOCK
		| F::BC3_UNORM_BLOCK
		| F::BC3_SRGB_BLOCK
		| F::BC4_UNORM_BLOCK
		| F::BC4_SNORM_BLOCK
		| F::BC5_UNORM_BLOCK
		| F::BC5_SNORM_BLOCK
		| F::BC6H_UFLOAT_BLOCK
		| F::BC6H_SFLOAT_BLOCK
		| F::BC7_UNORM_BLOCK
		| F::BC7_SRGB_BLOCK => (4, 4),
		_ => (1, 1),
	}
}

/// Number of components stored by `format`.
pub fn format_to_components(format: vk::Format) -> u32 {
	use vk::Format as F;
	match format {
		F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB | F::R16_UNORM | F::R16_SNORM
		| F::R16_UINT | F::R16_SINT | F::R16_SFLOAT | F::R32_UINT | F::R32_SINT | F::R32_SFLOAT | F::R64_UINT
		| F::R64_SINT | F::R64_SFLOAT | F::D16_UNORM | F::D32_SFLOAT | F::S8_UINT | F::BC4_UNORM_BLOCK
		| F::BC4_SNORM_BLOCK => 1,
		F::R4G4_UNORM_PACK8
		| F::R8G8_UNORM
		| F::R8G8_SNORM
		| F::R8G8_UINT
		| F::R8G8_SINT
		| F::R8G8_SRGB
		| F::R16G16_UNORM
		| F::R16G16_SNORM
		| F::R16G16_UINT
		| F::R16G16_SINT
		| F::R16G16_SFLOAT
		| F::R32G32_UINT
		| F::R32G32_SINT
		| F::R32G32_SFLOAT
		| F::R64G64_UINT
		| F::R64G64_SINT
		| F::R64G64_SFLOAT
		| F::D16_UNORM_S8_UINT
		| F::D24_UNORM_S8_UINT
		| F::D32_SFLOAT_S8_UINT
		| F::BC5_UNORM_BLOCK
		| F::BC5_SNORM_BLOCK => 2,
		F::R5G6B5_UNORM_PACK16
		| F::B5G6R5_UNORM_PACK16
		| F::R8G8B8_UNORM
		| F::R8G8B8_SRGB
		| F::B8G8R8_UNORM
		| F::B8G8R8_SRGB
		| F::R16G16B16_SFLOAT
		| F::R32G32B32_UINT
		| F::R32G32B32_SINT
		| F::R32G32B32_SFLOAT
		| F::R64G64B64_UINT
		| F::R64G64B64_SINT
		| F::R64G64B64_SFLOAT
		| F::B10G11R11_UFLOAT_PACK32
		| F::E5B9G9R9_UFLOAT_PACK32
		| F::BC1_RGB_UNORM_BLOCK
		| F::BC1_RGB_SRGB_BLOCK
		| F::BC6H_UFLOAT_BLOCK
		| F::BC6H_SFLOAT_BLOCK => 3,
		_ => 4,
	}
}

/// Bits stored for the widest component of `format`.
pub fn format_to_bits_per_component(format: vk::Format) -> u32 {
	use vk::Format as F;
	match format {
		F::R4G4_UNORM_PACK8 | F::R4G4B4A4_UNORM_PACK16 | F::B4G4R4A4_UNORM_PACK16 => 4,
		F::R5G6B5_UNORM_PACK16
		| F::B5G6R5_UNORM_PACK16
		| F::R5G5B5A1_UNORM_PACK16
		| F::B5G5R5A1_UNORM_PACK16
		| F::A1R5G5B5_UNORM_PACK16 => 6,
		F::R16_UNORM | F::R16_SNORM | F::R16_UINT | F::R16_SINT | F::R16_SFLOAT | F::R16G16_UNORM
		| F::R16G16_SNORM | F::R16G16_UINT | F::R16G16_SINT | F::R16G16_SFLOAT | F::R16G16B16_SFLOAT
		| F::R16G16B16A16_UNORM | F::R16G16B16A16_SNORM | F::R16G16B16A16_UINT | F::R16G16B16A16_SINT
		| F::R16G16B16A16_SFLOAT | F::D16_UNORM | F::D16_UNORM_S8_UINT | F::E5B9G9R9_UFLOAT_PACK32 => 16,
		F::R32_UINT | F::R32_SINT | F::R32_SFLOAT | F::R32G32_UINT | F::R32G32_SINT | F::R32G32_SFLOAT
		| F::R32G32B32_UINT | F::R32G32B32_SINT | F::R32G32B32_SFLOAT | F::R32G32B32A32_UINT
		| F::R32G32B32A32_SINT | F::R32G32B32A32_SFLOAT | F::D32_SFLOAT | F::D32_SFLOAT_S8_UINT
		| F::BC6H_UFLOAT_BLOCK | F::BC6H_SFLOAT_BLOCK => 32,
		F::R64_UINT | F::R64_SINT | F::R64_SFLOAT | F::R64G64_UINT | F::R64G64_SINT | F::R64G64_SFLOAT
		| F::R64G64B64_UINT | F::R64G64B64_SINT | F::R64G64B64_SFLOAT | F::R64G64B64A64_UINT
		| F::R64G64B64A64_SINT | F::R64G64B64A64_SFLOAT => 64,
		F::A2R10G10B10_UNORM_PACK32 | F::A2B10G10R10_UNORM_PACK32 | F::B10G11R11_UFLOAT_PACK32 => 11,
		F::D24_UNORM_S8_UINT => 24,
		_ => 8,
	}
}

/// The aspects an image of `format` carries.
pub fn format_to_aspect(format: vk::Format) -> vk::ImageAspectFlags {
	use vk::Format as F;
	match format {
		F::D16_UNORM | F::D32_SFLOAT | F::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
		F::D16_UNORM_S8_UINT | F::D24_UNORM_S8_UINT | F::D32_SFLOAT_S8_UINT => {
			vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
		},
		F::S8_UINT => vk::ImageAspectFlags::STENCIL,
		_ => vk::ImageAspectFlags::COLOR,
	}
}

fn is_compressed(format: vk::Format) -> bool { format_to_texel_block_extent(format) != (1, 1) }

/// Whether two formats may alias the same memory for graph resource merging.
pub fn compatible_formats(a: vk::Format, b: vk::Format) -> bool {
	a == b
		|| (format_to_texel_block_size(a) == format_to_texel_block_size(b)
			&& is_compressed(a) == is_compressed(b)
			&& format_to_aspect(a) == format_to_aspect(b))
}

/// Encode a normalized float into an 8-bit unorm texel component.
pub fn unorm_to_u8(v: f32) -> u8 { (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8 }

/// Decode an 8-bit unorm texel component.
pub fn u8_to_unorm(v: u8) -> f32 { v as f32 / 255.0 }

#[cfg(test)]
mod tests {
	use super::*;

	const TABULATED: &[vk::Format] = &[
		vk::Format::R8_UNORM,
		vk::Format::R8G8_UNORM,
		vk::Format::R8G8B8A8_UNORM,
		vk::Format::R8G8B8A8_SRGB,
		vk::Format::B8G8R8A8_UNORM,
		vk::Format::R16_SFLOAT,
		vk::Format::R16G16_SFLOAT,
		vk::Format::R16G16B16A16_SFLOAT,
		vk::Format::R32_SFLOAT,
		vk::Format::R32G32_SFLOAT,
		vk::Format::R32G32B32A32_SFLOAT,
		vk::Format::A2B10G10R10_UNORM_PACK32,
		vk::Format::B10G11R11_UFLOAT_PACK32,
		vk::Format::D16_UNORM,
		vk::Format::D24_UNORM_S8_UINT,
		vk::Format::D32_SFLOAT,
		vk::Format::D32_SFLOAT_S8_UINT,
		vk::Format::BC1_RGB_UNORM_BLOCK,
		vk::Format::BC3_UNORM_BLOCK,
		vk::Format::BC5_UNORM_BLOCK,
		vk::Format::BC7_UNORM_BLOCK,
	];

	#[test]
	fn block_sizes_cover_components() {
		for &f in TABULATED {
			let block_bits = format_to_texel_block_size(f) * 8;
			assert!(
				block_bits >= format_to_bits_per_component(f) * format_to_components(f),
				"{f:?} block too small"
			);
			assert_ne!(format_to_aspect(f), vk::ImageAspectFlags::empty(), "{f:?} has no aspect");
		}
	}

	#[test]
	fn compatibility_is_by_block_size_and_class() {
		assert!(compatible_formats(vk::Format::R8G8B8A8_UNORM, vk::Format::R8G8B8A8_SRGB));
		assert!(compatible_formats(vk::Format::R8G8B8A8_UNORM, vk::Format::R32_SFLOAT));
		assert!(!compatible_formats(vk::Format::R8G8B8A8_UNORM, vk::Format::R16G16B16A16_SFLOAT));
		assert!(!compatible_formats(vk::Format::R8G8B8A8_UNORM, vk::Format::D32_SFLOAT));
		assert!(!compatible_formats(vk::Format::BC1_RGBA_UNORM_BLOCK, vk::Format::R64_UINT));
	}

	#[test]
	fn unorm8_round_trip() {
		assert_eq!(unorm_to_u8(1.0), 255);
		assert_eq!(unorm_to_u8(0.5), 128);
		assert!((u8_to_unorm(unorm_to_u8(1.0)) - 1.0).abs() < 1e-6);
		assert!((u8_to_unorm(unorm_to_u8(0.5)) - 0.502).abs() < 1e-3);
	}

	#[test]
	fn hash_combine_mixes() {
		let a = hash_combine(hash_combine(0, 1), 2);
		let b = hash_combine(hash_combine(0, 2), 1);
		assert_ne!(a, b);
	}
}
