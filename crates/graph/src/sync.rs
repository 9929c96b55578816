//! Named accesses and their mapping onto Vulkan synchronization state.

use std::{
	fmt,
	ops::{BitAnd, BitOr, BitOrAssign},
};

use ash::vk;

/// Everything a value can be used *as* by a pass.
///
/// A named access fully determines the pipeline stages, the access mask and, for
/// images, the layout the resource must be in.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum Access {
	#[default]
	None,
	/// Consumed by a pass that takes ownership; the value ends here.
	Consume,
	Clear,
	TransferClear,
	ColorWrite,
	ColorRead,
	ColorRW,
	ColorResolveRead,
	ColorResolveWrite,
	DepthStencilRead,
	DepthStencilWrite,
	DepthStencilRW,
	VertexSampled,
	VertexRead,
	AttributeRead,
	IndexRead,
	IndirectRead,
	FragmentSampled,
	FragmentRead,
	FragmentWrite,
	FragmentRW,
	TransferRead,
	TransferWrite,
	TransferRW,
	ComputeRead,
	ComputeWrite,
	ComputeRW,
	ComputeSampled,
	RayTracingRead,
	RayTracingWrite,
	RayTracingRW,
	RayTracingSampled,
	AccelBuildRead,
	AccelBuildWrite,
	AccelBuildRW,
	CopyRead,
	CopyWrite,
	CopyRW,
	BlitRead,
	BlitWrite,
	BlitRW,
	ResolveRead,
	ResolveWrite,
	ResolveRW,
	HostRead,
	HostWrite,
	HostRW,
	MemoryRead,
	MemoryWrite,
	MemoryRW,
}

/// The synchronization state a resource must be put into for one use.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ResourceUse {
	pub stages: vk::PipelineStageFlags2,
	pub access: vk::AccessFlags2,
	/// Ignored for buffers.
	pub layout: vk::ImageLayout,
}

pub fn to_use(access: Access) -> ResourceUse {
	use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};
	let (stages, access, layout) = match access {
		Access::None => (S::TOP_OF_PIPE, A::empty(), L::UNDEFINED),
		Access::Consume => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE, L::GENERAL),
		Access::Clear => (S::CLEAR, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
		Access::TransferClear => (S::ALL_TRANSFER, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
		Access::ColorWrite | Access::ColorResolveWrite => {
			(S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE, L::COLOR_ATTACHMENT_OPTIMAL)
		},
		Access::ColorRead | Access::ColorResolveRead => {
			(S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_READ, L::COLOR_ATTACHMENT_OPTIMAL)
		},
		Access::ColorRW => (
			S::COLOR_ATTACHMENT_OUTPUT,
			A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
			L::COLOR_ATTACHMENT_OPTIMAL,
		),
		Access::DepthStencilRead => (
			S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
			A::DEPTH_STENCIL_ATTACHMENT_READ,
			L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
		),
		Access::DepthStencilWrite => (
			S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
			A::DEPTH_STENCIL_ATTACHMENT_WRITE,
			L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
		),
		Access::DepthStencilRW => (
			S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
			A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
			L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
		),
		Access::VertexSampled => (S::VERTEX_SHADER, A::SHADER_SAMPLED_READ, L::SHADER_READ_ONLY_OPTIMAL),
		Access::VertexRead => (S::VERTEX_SHADER, A::SHADER_READ, L::GENERAL),
		Access::AttributeRead => (S::VERTEX_ATTRIBUTE_INPUT, A::VERTEX_ATTRIBUTE_READ, L::GENERAL),
		Access::IndexRead => (S::INDEX_INPUT, A::INDEX_READ, L::GENERAL),
		Access::IndirectRead => (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::GENERAL),
		Access::FragmentSampled => (S::FRAGMENT_SHADER, A::SHADER_SAMPLED_READ, L::SHADER_READ_ONLY_OPTIMAL),
		Access::FragmentRead => (S::FRAGMENT_SHADER, A::SHADER_READ, L::SHADER_READ_ONLY_OPTIMAL),
		Access::FragmentWrite => (S::FRAGMENT_SHADER, A::SHADER_WRITE, L::GENERAL),
		Access::FragmentRW => (S::FRAGMENT_SHADER, A::SHADER_READ | A::SHADER_WRITE, L::GENERAL),
		Access::TransferRead => (S::ALL_TRANSFER, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
		Access::TransferWrite => (S::ALL_TRANSFER, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
		Access::TransferRW => (S::ALL_TRANSFER, A::TRANSFER_READ | A::TRANSFER_WRITE, L::GENERAL),
		Access::ComputeRead => (S::COMPUTE_SHADER, A::SHADER_READ, L::GENERAL),
		Access::ComputeWrite => (S::COMPUTE_SHADER, A::SHADER_WRITE, L::GENERAL),
		Access::ComputeRW => (S::COMPUTE_SHADER, A::SHADER_READ | A::SHADER_WRITE, L::GENERAL),
		Access::ComputeSampled => (S::COMPUTE_SHADER, A::SHADER_SAMPLED_READ, L::SHADER_READ_ONLY_OPTIMAL),
		Access::RayTracingRead => (S::RAY_TRACING_SHADER_KHR, A::SHADER_READ, L::GENERAL),
		Access::RayTracingWrite => (S::RAY_TRACING_SHADER_KHR, A::SHADER_WRITE, L::GENERAL),
		Access::RayTracingRW => (S::RAY_TRACING_SHADER_KHR, A::SHADER_READ | A::SHADER_WRITE, L::GENERAL),
		Access::RayTracingSampled => (S::RAY_TRACING_SHADER_KHR, A::SHADER_SAMPLED_READ, L::SHADER_READ_ONLY_OPTIMAL),
		Access::AccelBuildRead => (
			S::ACCELERATION_STRUCTURE_BUILD_KHR,
			A::ACCELERATION_STRUCTURE_READ_KHR,
			L::GENERAL,
		),
		Access::AccelBuildWrite => (
			S::ACCELERATION_STRUCTURE_BUILD_KHR,
			A::ACCELERATION_STRUCTURE_WRITE_KHR,
			L::GENERAL,
		),
		Access::AccelBuildRW => (
			S::ACCELERATION_STRUCTURE_BUILD_KHR,
			A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
			L::GENERAL,
		),
		Access::CopyRead => (S::COPY, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
		Access::CopyWrite => (S::COPY, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
		Access::CopyRW => (S::COPY, A::TRANSFER_READ | A::TRANSFER_WRITE, L::GENERAL),
		Access::BlitRead => (S::BLIT, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
		Access::BlitWrite => (S::BLIT, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
		Access::BlitRW => (S::BLIT, A::TRANSFER_READ | A::TRANSFER_WRITE, L::GENERAL),
		Access::ResolveRead => (S::RESOLVE, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
		Access::ResolveWrite => (S::RESOLVE, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
		Access::ResolveRW => (S::RESOLVE, A::TRANSFER_READ | A::TRANSFER_WRITE, L::GENERAL),
		Access::HostRead => (S::HOST, A::HOST_READ, L::GENERAL),
		Access::HostWrite => (S::HOST, A::HOST_WRITE, L::GENERAL),
		Access::HostRW => (S::HOST, A::HOST_READ | A::HOST_WRITE, L::GENERAL),
		Access::MemoryRead => (S::BOTTOM_OF_PIPE, A::MEMORY_READ, L::GENERAL),
		Access::MemoryWrite => (S::BOTTOM_OF_PIPE, A::MEMORY_WRITE, L::GENERAL),
		Access::MemoryRW => (S::BOTTOM_OF_PIPE, A::MEMORY_READ | A::MEMORY_WRITE, L::GENERAL),
	};
	ResourceUse { stages, access, layout }
}

pub fn is_write_access(access: Access) -> bool {
	use Access::*;
	matches!(
		access,
		Clear | TransferClear
			| ColorWrite | ColorRW
			| ColorResolveWrite
			| DepthStencilWrite | DepthStencilRW
			| FragmentWrite | FragmentRW
			| TransferWrite | TransferRW
			| ComputeWrite | ComputeRW
			| RayTracingWrite | RayTracingRW
			| AccelBuildWrite | AccelBuildRW
			| CopyWrite | CopyRW
			| BlitWrite | BlitRW
			| ResolveWrite | ResolveRW
			| HostWrite | HostRW
			| MemoryWrite | MemoryRW
	)
}

pub fn is_read_access(access: Access) -> bool {
	use Access::*;
	matches!(
		access,
		ColorRead | ColorRW
			| ColorResolveRead
			| DepthStencilRead | DepthStencilRW
			| VertexSampled | VertexRead
			| AttributeRead | IndexRead | IndirectRead
			| FragmentSampled | FragmentRead | FragmentRW
			| TransferRead | TransferRW
			| ComputeRead | ComputeRW | ComputeSampled
			| RayTracingRead | RayTracingRW | RayTracingSampled
			| AccelBuildRead | AccelBuildRW
			| CopyRead | CopyRW
			| BlitRead | BlitRW
			| ResolveRead | ResolveRW
			| HostRead | HostRW
			| MemoryRead | MemoryRW
	)
}

pub fn is_readonly_access(access: Access) -> bool { is_read_access(access) && !is_write_access(access) }

/// Accesses that bind the image as a framebuffer attachment.
pub fn is_framebuffer_attachment(access: Access) -> bool {
	use Access::*;
	matches!(
		access,
		ColorWrite | ColorRead | ColorRW | ColorResolveRead | ColorResolveWrite | DepthStencilRead
			| DepthStencilWrite | DepthStencilRW
	)
}

/// Shader accesses that require the `GENERAL` layout.
pub fn is_storage_access(access: Access) -> bool {
	use Access::*;
	matches!(
		access,
		VertexRead | FragmentWrite | FragmentRW | ComputeRead | ComputeWrite | ComputeRW | RayTracingRead
			| RayTracingWrite | RayTracingRW
	)
}

pub fn is_transfer_access(access: Access) -> bool {
	use Access::*;
	matches!(
		access,
		TransferClear | TransferRead | TransferWrite | TransferRW | CopyRead | CopyWrite | CopyRW | BlitRead
			| BlitWrite | BlitRW | ResolveRead | ResolveWrite | ResolveRW
	)
}

/// Merge a group of parallel reads into one use.
///
/// All readers between a def and the next undef share a single barrier, so the
/// layout must satisfy every one of them: `TRANSFER_SRC_OPTIMAL` if they are all
/// transfer reads, `GENERAL` if any needs storage or transfer and shader reads
/// mix, `READ_ONLY_OPTIMAL` otherwise.
pub fn merge_read_uses(accesses: impl IntoIterator<Item = Access>) -> ResourceUse {
	let mut out = ResourceUse {
		layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
		..ResourceUse::default()
	};
	let (mut transfer, mut storage, mut read_only) = (false, false, false);
	for access in accesses {
		transfer |= is_transfer_access(access);
		storage |= is_storage_access(access);
		read_only |= is_readonly_access(access) && !is_transfer_access(access) && !is_storage_access(access);
		let use_ = to_use(access);
		out.stages |= use_.stages;
		out.access |= use_.access;
	}
	if transfer && !read_only {
		out.layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
	}
	if storage || (transfer && read_only) {
		out.layout = vk::ImageLayout::GENERAL;
	}
	out
}

/// Where work (or a value) lives: one or more device queues, the host, or the
/// compile-time pseudo-domains.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainFlags(u32);

impl DomainFlags {
	pub const ANY: Self = Self(Self::DEVICE.0 | Self::HOST.0);
	pub const COMPUTE_QUEUE: Self = Self(1 << 2);
	pub const CONSTANT: Self = Self(1 << 5);
	/// Any device queue.
	pub const DEVICE: Self = Self(Self::GRAPHICS_QUEUE.0 | Self::COMPUTE_QUEUE.0 | Self::TRANSFER_QUEUE.0);
	pub const GRAPHICS_QUEUE: Self = Self(1 << 1);
	pub const HOST: Self = Self(1 << 0);
	pub const NONE: Self = Self(0);
	pub const PLACEHOLDER: Self = Self(1 << 4);
	pub const TRANSFER_QUEUE: Self = Self(1 << 3);

	pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

	pub fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

	pub fn is_empty(self) -> bool { self.0 == 0 }

	/// Whether this names exactly one device queue.
	pub fn is_single_queue(self) -> bool {
		let q = self.0 & Self::DEVICE.0;
		q != 0 && q & (q - 1) == 0 && self.0 & !Self::DEVICE.0 == 0
	}

	/// Whether this is decided, i.e. neither the wildcard device/any domains nor
	/// a pseudo-domain.
	pub fn is_decided(self) -> bool {
		self != Self::DEVICE && self != Self::ANY && !self.intersects(Self::PLACEHOLDER | Self::CONSTANT) && !self.is_empty()
	}
}

impl BitOr for DomainFlags {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

impl BitOrAssign for DomainFlags {
	fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl BitAnd for DomainFlags {
	type Output = Self;

	fn bitand(self, rhs: Self) -> Self { Self(self.0 & rhs.0) }
}

impl fmt::Debug for DomainFlags {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let mut first = true;
		let mut put = |f: &mut fmt::Formatter, s| {
			if !std::mem::take(&mut first) {
				write!(f, "|")?;
			}
			write!(f, "{}", s)
		};
		if *self == Self::ANY {
			return write!(f, "any");
		}
		if *self == Self::DEVICE {
			return write!(f, "device");
		}
		if self.contains(Self::HOST) {
			put(f, "host")?;
		}
		if self.contains(Self::GRAPHICS_QUEUE) {
			put(f, "graphics")?;
		}
		if self.contains(Self::COMPUTE_QUEUE) {
			put(f, "compute")?;
		}
		if self.contains(Self::TRANSFER_QUEUE) {
			put(f, "transfer")?;
		}
		if self.contains(Self::PLACEHOLDER) {
			put(f, "placeholder")?;
		}
		if self.contains(Self::CONSTANT) {
			put(f, "constant")?;
		}
		if first {
			write!(f, "none")?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_and_reads_are_disjoint_from_readonly() {
		for access in [Access::ColorWrite, Access::TransferWrite, Access::ComputeWrite] {
			assert!(is_write_access(access));
			assert!(!is_readonly_access(access));
		}
		for access in [Access::FragmentSampled, Access::TransferRead, Access::IndexRead] {
			assert!(is_readonly_access(access));
		}
		assert!(is_write_access(Access::ComputeRW) && is_read_access(Access::ComputeRW));
	}

	#[test]
	fn merged_reads_pick_the_weakest_common_layout() {
		let all_transfer = merge_read_uses([Access::TransferRead, Access::CopyRead]);
		assert_eq!(all_transfer.layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

		let sampled_only = merge_read_uses([Access::FragmentSampled, Access::ComputeSampled]);
		assert_eq!(sampled_only.layout, vk::ImageLayout::READ_ONLY_OPTIMAL);

		let mixed = merge_read_uses([Access::TransferRead, Access::FragmentSampled]);
		assert_eq!(mixed.layout, vk::ImageLayout::GENERAL);

		let storage = merge_read_uses([Access::ComputeRead]);
		assert_eq!(storage.layout, vk::ImageLayout::GENERAL);
	}

	#[test]
	fn merged_reads_or_stages_and_access() {
		let merged = merge_read_uses([Access::FragmentSampled, Access::ComputeSampled]);
		assert!(merged.stages.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
		assert!(merged.stages.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));
		assert!(merged.access.contains(vk::AccessFlags2::SHADER_SAMPLED_READ));
	}

	#[test]
	fn domain_flags() {
		assert!(DomainFlags::DEVICE.contains(DomainFlags::TRANSFER_QUEUE));
		assert!(!DomainFlags::TRANSFER_QUEUE.contains(DomainFlags::DEVICE));
		assert!(DomainFlags::GRAPHICS_QUEUE.is_single_queue());
		assert!(!DomainFlags::DEVICE.is_single_queue());
		assert!(!DomainFlags::ANY.is_decided());
		assert!(DomainFlags::COMPUTE_QUEUE.is_decided());
	}
}
