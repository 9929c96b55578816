//! Execution: command recording, per-queue submission, and signal arming.

pub use crate::exec::{
	cmd::{CommandRecorder, DescriptorSetStrategy, PassContext, PassFn},
	graph::ExecutableRenderGraph,
	queue::QueueExecutor,
	signal::{Signal, SignalStatus, SyncPoint},
};

pub mod cmd;
pub mod descriptor;
pub mod graph;
pub mod queue;
pub mod signal;
