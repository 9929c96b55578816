//! Swapchain ownership and per-image present synchronization.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::{
	alloc::{Allocator, ImageViewCreateInfo},
	resource::{ImageAttachment, Subrange},
	runtime::Runtime,
	Result,
};

/// Shared handle the IR carries; the swapchain itself is owned by the
/// allocator that created it.
pub type SwapchainHandle = Arc<Mutex<Swapchain>>;

/// The semaphore pair of one swapchain image slot.
#[derive(Copy, Clone, Debug, Default)]
pub struct PresentSemaphores {
	/// Signalled by the acquire; rendering waits on it.
	pub available: vk::Semaphore,
	/// Signalled by rendering; present waits on it.
	pub rendered: vk::Semaphore,
}

pub struct Swapchain {
	pub handle: vk::SwapchainKHR,
	pub surface: vk::SurfaceKHR,
	pub images: Vec<ImageAttachment>,
	/// Two semaphores per image, indexed in lockstep with `images`.
	pub semaphores: Vec<PresentSemaphores>,
	/// The image the last acquire returned.
	pub image_index: u32,
	/// The result of the last acquire; `SUBOPTIMAL_KHR` asks for a recreate.
	pub acquire_result: vk::Result,
}

impl Swapchain {
	pub fn new(
		handle: vk::SwapchainKHR, surface: vk::SurfaceKHR, images: Vec<ImageAttachment>,
		semaphores: Vec<PresentSemaphores>,
	) -> SwapchainHandle {
		Arc::new(Mutex::new(Self {
			handle,
			surface,
			images,
			semaphores,
			image_index: 0,
			acquire_result: vk::Result::SUCCESS,
		}))
	}

	/// The attachment for the currently acquired image.
	pub fn current_image(&self) -> ImageAttachment { self.images[self.image_index as usize] }

	pub fn current_semaphores(&self) -> PresentSemaphores { self.semaphores[self.image_index as usize] }

	/// Acquire the next image, rotating the semaphore ring. Returns the
	/// attachment and the semaphore the acquire signals.
	pub fn acquire_next_image(&mut self, runtime: &Runtime) -> Result<(ImageAttachment, vk::Semaphore)> {
		let slot = (self.image_index as usize + 1) % self.semaphores.len();
		let available = self.semaphores[slot].available;
		let (index, suboptimal) = unsafe {
			runtime
				.swapchain_ext()
				.acquire_next_image(self.handle, u64::MAX, available, vk::Fence::null())?
		};
		self.image_index = index;
		self.acquire_result = if suboptimal {
			vk::Result::SUBOPTIMAL_KHR
		} else {
			vk::Result::SUCCESS
		};
		// The ring slot travels with the image from here on.
		self.semaphores.swap(slot, index as usize);
		Ok((self.images[index as usize], available))
	}

	/// Present the currently acquired image on the given queue, waiting on the
	/// render-complete semaphore.
	pub fn present(&mut self, runtime: &Runtime, queue: vk::Queue) -> Result<()> {
		let rendered = self.current_semaphores().rendered;
		unsafe {
			runtime.swapchain_ext().queue_present(
				queue,
				&vk::PresentInfoKHR::default()
					.wait_semaphores(std::slice::from_ref(&rendered))
					.swapchains(std::slice::from_ref(&self.handle))
					.image_indices(std::slice::from_ref(&self.image_index)),
			)?;
		}
		Ok(())
	}
}

/// Create a swapchain through `alloc`, which then owns it: the handle, the
/// per-image views and the semaphore ring all release through the same chain.
pub fn create_swapchain(
	runtime: &Runtime, alloc: &Allocator, surface: vk::SurfaceKHR, ci: &vk::SwapchainCreateInfoKHR<'_>,
) -> Result<SwapchainHandle> {
	let mut handles = [vk::SwapchainKHR::null()];
	alloc.allocate_swapchains(&mut handles, std::slice::from_ref(ci))?;
	let handle = handles[0];

	let raw_images = unsafe { runtime.swapchain_ext().get_swapchain_images(handle)? };
	let mut images = Vec::with_capacity(raw_images.len());
	let mut semaphores = Vec::with_capacity(raw_images.len());
	for &image in &raw_images {
		let view = alloc.allocate_image_view(ImageViewCreateInfo {
			image,
			view_type: vk::ImageViewType::TYPE_2D,
			format: ci.image_format,
			subrange: Subrange::default(),
		})?;
		images.push(ImageAttachment {
			image,
			view: view.view,
			usage: ci.image_usage,
			view_type: vk::ImageViewType::TYPE_2D,
			format: ci.image_format,
			extent: vk::Extent3D {
				width: ci.image_extent.width,
				height: ci.image_extent.height,
				depth: 1,
			},
			sample_count: vk::SampleCountFlags::TYPE_1,
			base_level: 0,
			level_count: 1,
			base_layer: 0,
			layer_count: ci.image_array_layers,
		});

		let mut pair = [vk::Semaphore::null(); 2];
		alloc.allocate_semaphores(&mut pair)?;
		semaphores.push(PresentSemaphores {
			available: pair[0],
			rendered: pair[1],
		});
	}

	Ok(Swapchain::new(handle, surface, images, semaphores))
}
