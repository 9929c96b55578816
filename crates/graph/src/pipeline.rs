//! Pipeline descriptions and the instance key the recorder builds per draw.

use std::{
	hash::{Hash, Hasher},
	ops::{BitOr, BitOrAssign},
	sync::Arc,
};

use ash::vk;
use static_assertions::const_assert;

use crate::spirv::Program;

/// Inline capacity of a pipeline instance key.
///
/// Sized so the serialized state of the overwhelming majority of pipelines fits
/// without touching the heap; bigger states spill to an owned heap payload.
pub const INLINE_KEY_SIZE: usize = 128;

const_assert!(INLINE_KEY_SIZE >= 96);

/// Dynamic state the recorder flushes at draw time instead of baking into the
/// pipeline.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DynamicStateFlags(u32);

impl DynamicStateFlags {
	pub const BLEND_CONSTANTS: Self = Self(1 << 4);
	pub const DEPTH_BIAS: Self = Self(1 << 3);
	pub const DEPTH_BOUNDS: Self = Self(1 << 5);
	pub const LINE_WIDTH: Self = Self(1 << 2);
	pub const NONE: Self = Self(0);
	pub const SCISSOR: Self = Self(1 << 1);
	pub const VIEWPORT: Self = Self(1 << 0);

	pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

	pub fn to_states(self) -> Vec<vk::DynamicState> {
		let mut states = Vec::new();
		if self.contains(Self::VIEWPORT) {
			states.push(vk::DynamicState::VIEWPORT);
		}
		if self.contains(Self::SCISSOR) {
			states.push(vk::DynamicState::SCISSOR);
		}
		if self.contains(Self::LINE_WIDTH) {
			states.push(vk::DynamicState::LINE_WIDTH);
		}
		if self.contains(Self::DEPTH_BIAS) {
			states.push(vk::DynamicState::DEPTH_BIAS);
		}
		if self.contains(Self::BLEND_CONSTANTS) {
			states.push(vk::DynamicState::BLEND_CONSTANTS);
		}
		if self.contains(Self::DEPTH_BOUNDS) {
			states.push(vk::DynamicState::DEPTH_BOUNDS);
		}
		states
	}
}

impl BitOr for DynamicStateFlags {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

impl BitOrAssign for DynamicStateFlags {
	fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

enum KeyData {
	Inline([u8; INLINE_KEY_SIZE]),
	Heap(Box<[u8]>),
}

/// A byte payload that stays inline up to [`INLINE_KEY_SIZE`] and spills to an
/// owned heap buffer beyond it. Cloning a spilled key deep-copies the payload.
pub struct SmallKeyBuf {
	len: u32,
	data: KeyData,
}

impl SmallKeyBuf {
	pub fn as_bytes(&self) -> &[u8] {
		match &self.data {
			KeyData::Inline(data) => &data[..self.len as usize],
			KeyData::Heap(data) => data,
		}
	}

	pub fn is_inline(&self) -> bool { matches!(self.data, KeyData::Inline(_)) }
}

impl Default for SmallKeyBuf {
	fn default() -> Self {
		Self {
			len: 0,
			data: KeyData::Inline([0; INLINE_KEY_SIZE]),
		}
	}
}

impl Clone for SmallKeyBuf {
	fn clone(&self) -> Self {
		Self {
			len: self.len,
			data: match &self.data {
				KeyData::Inline(data) => KeyData::Inline(*data),
				KeyData::Heap(data) => KeyData::Heap(data.clone()),
			},
		}
	}
}

impl PartialEq for SmallKeyBuf {
	fn eq(&self, other: &Self) -> bool { self.as_bytes() == other.as_bytes() }
}

impl Eq for SmallKeyBuf {}

impl Hash for SmallKeyBuf {
	fn hash<H: Hasher>(&self, state: &mut H) { self.as_bytes().hash(state) }
}

impl std::fmt::Debug for SmallKeyBuf {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "SmallKeyBuf({} bytes, inline={})", self.len, self.is_inline())
	}
}

/// Serializes pipeline state into a [`SmallKeyBuf`].
#[derive(Default)]
pub struct KeyWriter {
	buf: Vec<u8>,
}

impl KeyWriter {
	pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes) }

	pub fn write_u32(&mut self, v: u32) { self.write_bytes(&v.to_le_bytes()) }

	pub fn write_i32(&mut self, v: i32) { self.write_bytes(&v.to_le_bytes()) }

	pub fn write_u64(&mut self, v: u64) { self.write_bytes(&v.to_le_bytes()) }

	pub fn write_f32(&mut self, v: f32) { self.write_bytes(&v.to_bits().to_le_bytes()) }

	pub fn finish(self) -> SmallKeyBuf {
		let len = self.buf.len();
		if len <= INLINE_KEY_SIZE {
			let mut data = [0; INLINE_KEY_SIZE];
			data[..len].copy_from_slice(&self.buf);
			SmallKeyBuf {
				len: len as u32,
				data: KeyData::Inline(data),
			}
		} else {
			SmallKeyBuf {
				len: len as u32,
				data: KeyData::Heap(self.buf.into_boxed_slice()),
			}
		}
	}
}

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// The attachment shapes a graphics pipeline instance renders into.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RenderingShape {
	pub color_formats: [vk::Format; MAX_COLOR_ATTACHMENTS],
	pub color_count: u32,
	pub depth_format: vk::Format,
	pub stencil_format: vk::Format,
	pub samples: vk::SampleCountFlags,
	pub view_mask: u32,
}

impl Default for RenderingShape {
	fn default() -> Self {
		Self {
			color_formats: [vk::Format::UNDEFINED; MAX_COLOR_ATTACHMENTS],
			color_count: 0,
			depth_format: vk::Format::UNDEFINED,
			stencil_format: vk::Format::UNDEFINED,
			samples: vk::SampleCountFlags::TYPE_1,
			view_mask: 0,
		}
	}
}

/// One shader stage of a pipeline.
#[derive(Clone)]
pub struct ShaderStage {
	pub stage: vk::ShaderStageFlags,
	pub module: vk::ShaderModule,
	pub entry: String,
	pub program: Arc<Program>,
}

/// A named pipeline: its shader stages, layout, and merged reflection.
///
/// Instances are specialized from this at draw time by the recorder.
pub struct PipelineBase {
	/// Stable id used in instance keys.
	pub id: u32,
	pub bind_point: vk::PipelineBindPoint,
	pub shaders: Vec<ShaderStage>,
	pub layout: vk::PipelineLayout,
	pub set_layouts: Vec<vk::DescriptorSetLayout>,
	pub program: Arc<Program>,
}

/// A compiled pipeline handle plus what is needed to bind it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PipelineInstance {
	pub pipeline: vk::Pipeline,
	pub layout: vk::PipelineLayout,
	pub bind_point: vk::PipelineBindPoint,
}

/// The cache key for one pipeline instance.
///
/// `payload` carries the serialized non-default fixed-function state; see
/// [`KeyWriter`]. The key hashes and compares by content, so logically equal
/// states built on different frames land on the same instance.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct PipelineInstanceCreateInfo {
	pub base: u32,
	pub shape: RenderingShape,
	pub dynamic: DynamicStateFlags,
	pub payload: SmallKeyBuf,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key_of(n: usize) -> SmallKeyBuf {
		let mut w = KeyWriter::default();
		for i in 0..n {
			w.write_u32(i as u32);
		}
		w.finish()
	}

	#[test]
	fn small_payloads_stay_inline() {
		let key = key_of(INLINE_KEY_SIZE / 4);
		assert!(key.is_inline());
		assert_eq!(key.as_bytes().len(), INLINE_KEY_SIZE);
	}

	#[test]
	fn large_payloads_spill_and_deep_copy() {
		let key = key_of(64);
		assert!(!key.is_inline());
		let copy = key.clone();
		assert_eq!(key, copy);
		assert_ne!(key.as_bytes().as_ptr(), copy.as_bytes().as_ptr());
	}

	#[test]
	fn equality_is_by_content_not_storage() {
		use std::hash::{BuildHasher, RandomState};

		let a = key_of(8);
		let b = key_of(8);
		assert_eq!(a, b);

		let s = RandomState::new();
		assert_eq!(s.hash_one(&a), s.hash_one(&b));
		assert_ne!(key_of(8), key_of(9));
	}
}
