//! Arena-bumping buffer allocation for per-frame scratch memory.

use ash::vk;
use parking_lot::Mutex;

use crate::{
	alloc::{AllocateResult, BufferCreateInfo, DeviceResource},
	resource::{Buffer, MemoryUsage},
};

pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

struct Block {
	buffer: Buffer,
	needle: u64,
}

#[derive(Default)]
struct Inner {
	used: Vec<Block>,
	available: Vec<Block>,
}

/// Bump allocation out of large upstream blocks.
///
/// `deallocate_buffers` is a no-op; memory comes back only through [`reset`],
/// which recycles every block, or [`free`], which returns them upstream.
///
/// [`reset`]: LinearBufferAllocator::reset
/// [`free`]: LinearBufferAllocator::free
pub struct LinearBufferAllocator<'u> {
	upstream: &'u dyn DeviceResource,
	memory: MemoryUsage,
	usage: vk::BufferUsageFlags,
	block_size: u64,
	inner: Mutex<Inner>,
}

impl<'u> LinearBufferAllocator<'u> {
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
			needle: 0,
		})
	}

	pub fn allocate(&self, size: u64, alignment: u64) -> AllocateResult<Buffer> {
		let mut inner = self.inner.lock();

		// Oversized requests get a dedicated block.
		if size > self.block_size {
			let mut block = self.grow(size)?;
			block.needle = size;
			let buffer = block.buffer;
			inner.used.push(block);
			return Ok(buffer);
		}

		if let Some(block) = inner.used.last_mut() {
			let offset = block.needle.next_multiple_of(alignment.max(1));
			if offset + size <= block.buffer.size {
				block.needle = offset + size;
				return Ok(suballocation(&block.buffer, offset, size));
			}
		}

		let mut block = match inner.available.pop() {
			Some(block) => block,
			None => self.grow(self.block_size)?,
		};
		block.needle = size;
		let buffer = suballocation(&block.buffer, 0, size);
		inner.used.push(block);
		Ok(buffer)
	}

	/// Recycle every block. Everything handed out before this call is invalid.
	pub fn reset(&self) {
		let mut inner = self.inner.lock();
		let mut used = std::mem::take(&mut inner.used);
		for block in used.iter_mut() {
			block.needle = 0;
		}
		inner.available.append(&mut used);
	}

	/// Return every block upstream.
	pub fn free(&self) {
		let mut inner = self.inner.lock();
		let used = std::mem::take(&mut inner.used);
		let available = std::mem::take(&mut inner.available);
		for block in used.into_iter().chain(available) {
			self.upstream.deallocate_buffers(&[block.buffer]);
		}
	}

	/// Drop unused blocks, keeping only what is currently allocated.
	pub fn trim(&self) {
		let mut inner = self.inner.lock();
		for block in inner.available.drain(..) {
			self.upstream.deallocate_buffers(&[block.buffer]);
		}
	}
}

fn suballocation(block: &Buffer, offset: u64, size: u64) -> Buffer {
	Buffer {
		buffer: block.buffer,
		offset: block.offset + offset,
		size,
		device_address: if block.device_address == 0 {
			0
		} else {
			block.device_address + offset
		},
		mapped: if block.mapped.is_null() {
			std::ptr::null_mut()
		} else {
			unsafe { block.mapped.add(offset as usize) }
		},
	}
}

impl Drop for LinearBufferAllocator<'_> {
	fn drop(&mut self) { self.free() }
}

impl DeviceResource for LinearBufferAllocator<'_> {
	fn upstream(&self) -> &dyn DeviceResource { self.upstream }

	fn allocate_buffers(&self, dst: &mut [Buffer], cis: &[BufferCreateInfo]) -> AllocateResult {
		for (i, ci) in cis.iter().enumerate() {
			dst[i] = self.allocate(ci.size, ci.alignment)?;
		}
		Ok(())
	}

	// Individual frees are meaningless in an arena; the memory comes back on
	// `reset`.
	fn deallocate_buffers(&self, _src: &[Buffer]) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::alloc::tests::MockResource;

	#[test]
	fn bumps_within_a_block() {
		let mock = MockResource::default();
		let linear =
			LinearBufferAllocator::with_block_size(&mock, MemoryUsage::CpuToGpu, vk::BufferUsageFlags::TRANSFER_SRC, 1024);

		let a = linear.allocate(100, 4).unwrap();
		let b = linear.allocate(100, 256).unwrap();
		assert_eq!(a.offset, 0);
		assert_eq!(b.offset, 256);
		assert_eq!(a.buffer, b.buffer);
		assert_eq!(mock.live_buffers(), 1);
	}

	#[test]
	fn grows_and_recycles() {
		let mock = MockResource::default();
		let linear =
			LinearBufferAllocator::with_block_size(&mock, MemoryUsage::CpuToGpu, vk::BufferUsageFlags::TRANSFER_SRC, 256);

		let a = linear.allocate(200, 4).unwrap();
		let b = linear.allocate(200, 4).unwrap();
		assert_ne!(a.buffer, b.buffer);
		assert_eq!(mock.live_buffers(), 2);

		// A no-op by design.
		linear.deallocate_buffers(&[a]);
		assert_eq!(mock.live_buffers(), 2);

		linear.reset();
		let c = linear.allocate(200, 4).unwrap();
		assert_eq!(c.offset, 0);
		assert_eq!(mock.live_buffers(), 2);

		linear.free();
		assert_eq!(mock.live_buffers(), 0);
	}

	#[test]
	fn oversized_requests_get_dedicated_blocks() {
		let mock = MockResource::default();
		let linear =
			LinearBufferAllocator::with_block_size(&mock, MemoryUsage::CpuToGpu, vk::BufferUsageFlags::TRANSFER_SRC, 256);
		let big = linear.allocate(4096, 4).unwrap();
		assert_eq!(big.size, 4096);
		assert_eq!(big.offset, 0);
	}
}
