//! Virtual-block sub-allocation atop large upstream buffers.

use ash::vk;
use parking_lot::Mutex;
use range_alloc::RangeAllocator;
use rustc_hash::FxHashMap;

use crate::{
	alloc::{AllocateError, AllocateResult, BufferCreateInfo, DeviceResource},
	resource::{Buffer, MemoryUsage},
};

pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

struct Block {
	buffer: Buffer,
	ranges: RangeAllocator<u64>,
	live: u32,
}

#[derive(Default)]
struct Inner {
	blocks: Vec<Block>,
	// Aligned view offset within a block -> the raw range that backs it.
	views: FxHashMap<(vk::Buffer, u64), std::ops::Range<u64>>,
}

/// Sub-allocates buffer ranges out of a small number of large upstream buffers.
///
/// Unlike [`super::LinearBufferAllocator`] this supports true deallocation:
/// freed ranges return to their block, and [`trim`] releases blocks that have
/// emptied out.
///
/// [`trim`]: BufferSubAllocator::trim
pub struct BufferSubAllocator<'u> {
	upstream: &'u dyn DeviceResource,
	memory: MemoryUsage,
	usage: vk::BufferUsageFlags,
	block_size: u64,
	inner: Mutex<Inner>,
}

impl<'u> BufferSubAllocator<'u> {
	pub fn new(upstream: &'u dyn DeviceResource, memory: MemoryUsage, usage: vk::BufferUsageFlags) -> Self {
		Self::with_block_size(upstream, memory, usage, DEFAULT_BLOCK_SIZE)
	}

	pub fn with_block_size(
		upstream: &'u dyn DeviceResource, memory: MemoryUsage, usage: vk::BufferUsageFlags, block_size: u64,
	) -> Self {
		Self {
			upstream,
			memory,
			usage,
			block_size,
			inner: Mutex::new(Inner::default()),
		}
	}

	fn grow(&self, size: u64) -> AllocateResult<Block> {
		let mut dst = [Buffer::default()];
		self.upstream.allocate_buffers(
			&mut dst,
			&[BufferCreateInfo {
				size,
				usage: self.usage,
				memory: self.memory,
				alignment: 256,
			}],
		)?;
		Ok(Block {
			buffer: dst[0],
			ranges: RangeAllocator::new(0..size),
			live: 0,
		})
	}

	pub fn allocate(&self, size: u64, alignment: u64) -> AllocateResult<Buffer> {
		let alignment = alignment.max(1);
		// Over-allocate so the start can always be aligned within the range.
		let padded = size + alignment - 1;
		if padded > self.block_size {
			return Err(AllocateError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
		}

		let mut inner = self.inner.lock();
		let inner = &mut *inner;
		for block in inner.blocks.iter_mut() {
			if let Ok(range) = block.ranges.allocate_range(padded) {
				block.live += 1;
				return Ok(finish(&mut inner.views, block, range, alignment, size));
			}
		}

		let mut block = self.grow(self.block_size)?;
		let range = block
			.ranges
			.allocate_range(padded)
			.map_err(|_| AllocateError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;
		block.live += 1;
		let buffer = finish(&mut inner.views, &mut block, range, alignment, size);
		inner.blocks.push(block);
		Ok(buffer)
	}

	pub fn deallocate(&self, buffer: Buffer) {
		let mut inner = self.inner.lock();
		let inner = &mut *inner;
		for block in inner.blocks.iter_mut() {
			if block.buffer.buffer == buffer.buffer {
				let aligned = buffer.offset - block.buffer.offset;
				if let Some(range) = inner.views.remove(&(buffer.buffer, aligned)) {
					block.ranges.free_range(range);
					block.live -= 1;
				}
				return;
			}
		}
	}

	/// Release blocks with nothing live in them.
	pub fn trim(&self) {
		let mut inner = self.inner.lock();
		let mut keep = Vec::with_capacity(inner.blocks.len());
		for block in inner.blocks.drain(..) {
			if block.live == 0 {
				self.upstream.deallocate_buffers(&[block.buffer]);
			} else {
				keep.push(block);
			}
		}
		inner.blocks = keep;
	}

	pub fn free(&self) {
		let mut inner = self.inner.lock();
		inner.views.clear();
		for block in inner.blocks.drain(..) {
			self.upstream.deallocate_buffers(&[block.buffer]);
		}
	}
}

fn finish(
	views: &mut FxHashMap<(vk::Buffer, u64), std::ops::Range<u64>>, block: &mut Block, range: std::ops::Range<u64>,
	alignment: u64, size: u64,
) -> Buffer {
	let aligned = range.start.next_multiple_of(alignment);
	debug_assert!(aligned + size <= range.end);
	views.insert((block.buffer.buffer, aligned), range);
	Buffer {
		buffer: block.buffer.buffer,
		offset: block.buffer.offset + aligned,
		size,
		device_address: if block.buffer.device_address == 0 {
			0
		} else {
			block.buffer.device_address + aligned
		},
		mapped: if block.buffer.mapped.is_null() {
			std::ptr::null_mut()
		} else {
			unsafe { block.buffer.mapped.add(aligned as usize) }
		},
	}
}

impl Drop for BufferSubAllocator<'_> {
	fn drop(&mut self) { self.free() }
}

impl DeviceResource for BufferSubAllocator<'_> {
	fn upstream(&self) -> &dyn DeviceResource { self.upstream }

	fn allocate_buffers(&self, dst: &mut [Buffer], cis: &[BufferCreateInfo]) -> AllocateResult {
		for (i, ci) in cis.iter().enumerate() {
			dst[i] = self.allocate(ci.size, ci.alignment)?;
		}
		Ok(())
	}

	fn deallocate_buffers(&self, src: &[Buffer]) {
		for &buffer in src {
			self.deallocate(buffer);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::alloc::tests::MockResource;

	#[test]
	fn reuses_freed_ranges() {
		let mock = MockResource::default();
		let sub =
			BufferSubAllocator::with_block_size(&mock, MemoryUsage::GpuOnly, vk::BufferUsageFlags::STORAGE_BUFFER, 1024);

		let a = sub.allocate(256, 16).unwrap();
		let b = sub.allocate(256, 16).unwrap();
		assert_eq!(a.buffer, b.buffer);
		assert_eq!(mock.live_buffers(), 1);

		sub.deallocate(a);
		let c = sub.allocate(256, 16).unwrap();
		assert_eq!(c.offset, 0);
		assert_eq!(mock.live_buffers(), 1);
	}

	#[test]
	fn trim_releases_empty_blocks() {
		let mock = MockResource::default();
		let sub =
			BufferSubAllocator::with_block_size(&mock, MemoryUsage::GpuOnly, vk::BufferUsageFlags::STORAGE_BUFFER, 512);

		let a = sub.allocate(400, 16).unwrap();
		let b = sub.allocate(400, 16).unwrap();
		assert_ne!(a.buffer, b.buffer);
		assert_eq!(mock.live_buffers(), 2);

		sub.deallocate(a);
		sub.trim();
		assert_eq!(mock.live_buffers(), 1);

		sub.deallocate(b);
		sub.free();
		assert_eq!(mock.live_buffers(), 0);
	}

	#[test]
	fn alignment_padding_round_trips() {
		let mock = MockResource::default();
		let sub =
			BufferSubAllocator::with_block_size(&mock, MemoryUsage::GpuOnly, vk::BufferUsageFlags::STORAGE_BUFFER, 4096);

		let a = sub.allocate(10, 1).unwrap();
		let b = sub.allocate(100, 256).unwrap();
		assert_eq!(b.offset % 256, 0);
		assert_eq!(b.size, 100);
		sub.deallocate(b);
		sub.deallocate(a);
		sub.trim();
		assert_eq!(mock.live_buffers(), 0);
	}
}
