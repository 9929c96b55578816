//! A deferred-execution Vulkan rendering runtime.
//!
//! Applications build an IR of GPU work (passes, resources, dependencies) as a DAG.
//! The compiler infers missing attachment fields, linearizes execution across the
//! device queues, computes exact synchronization and records command buffers.

use std::fmt::{Debug, Display};

pub use ash;
pub use gpu_allocator::MemoryLocation;

pub use crate::{
	alloc::AllocateError,
	compile::GraphError,
	sync::{Access, DomainFlags},
};

pub mod alloc;
pub mod cache;
pub mod compile;
pub mod exec;
pub mod ir;
pub mod pipeline;
pub mod resource;
pub mod runtime;
pub mod spirv;
pub mod swapchain;
pub mod sync;
pub mod types;

#[derive(Clone)]
pub enum Error {
	Message(String),
	Vulkan(ash::vk::Result),
	Allocate(AllocateError),
	MissingPfn(&'static str),
	RenderGraph(GraphError),
	ShaderCompilation(String),
}

impl Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::Message(msg) => write!(f, "{}", msg),
			Error::Vulkan(res) => write!(f, "Vulkan error: {}", res),
			Error::Allocate(err) => write!(f, "allocation failed: {}", err),
			Error::MissingPfn(name) => write!(f, "required Vulkan function pointer missing: {}", name),
			Error::RenderGraph(err) => write!(f, "render graph error: {}", err),
			Error::ShaderCompilation(msg) => write!(f, "shader compilation failed: {}", msg),
		}
	}
}

impl Debug for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { <Self as Display>::fmt(self, f) }
}

impl From<String> for Error {
	fn from(message: String) -> Self { Error::Message(message) }
}

impl From<ash::vk::Result> for Error {
	fn from(result: ash::vk::Result) -> Self { Error::Vulkan(result) }
}

impl From<AllocateError> for Error {
	fn from(err: AllocateError) -> Self { Error::Allocate(err) }
}

impl From<GraphError> for Error {
	fn from(err: GraphError) -> Self { Error::RenderGraph(err) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
