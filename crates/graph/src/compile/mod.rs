//! The render graph compiler.
//!
//! Given a set of held roots, [`Compiler::compile`] converges sliced
//! subresources, collects the reachable node set, eliminates resolved bridges,
//! builds def/use/undef chains, runs inference to a fixed point, schedules
//! nodes within and across queues, and synthesizes the synchronization each
//! use needs. [`Compiler::link`] wraps the result into an executable graph.

use std::{
	fmt::{self, Display},
	sync::Arc,
};

use rustc_hash::FxHashMap;
use tracing::{span, Level};

use crate::{
	exec::graph::ExecutableRenderGraph,
	exec::signal::SignalStatus,
	ir::{ExtNode, IRModule, ModuleRef, NodeId, NodeKind, Ref},
	sync::{DomainFlags, ResourceUse},
	Result,
};

mod infer;
mod links;
mod schedule;
mod sync;
#[cfg(test)]
mod test;

/// Compiler-time violations.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum GraphError {
	/// A pass consumes a value that nothing defines.
	UnattachedResource { node: u64, arg: usize },
	/// A ref escaped the compiled node set.
	UndeclaredRef,
	/// A converge consumer runs before one of the diverged tails.
	ConvergenceNotDominated,
	/// The graph edges do not form a partial order.
	NotPartiallyOrdered,
	/// Inference needed a value that cannot be constant-evaluated.
	CannotInfer { node: u64 },
}

impl Display for GraphError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			GraphError::UnattachedResource { node, arg } => {
				write!(f, "node {:#x} consumes unattached resource (arg {})", node, arg)
			},
			GraphError::UndeclaredRef => write!(f, "reference to a node outside the compiled set"),
			GraphError::ConvergenceNotDominated => write!(f, "converge is not dominated by its diverged tails"),
			GraphError::NotPartiallyOrdered => write!(f, "graph edges do not form a partial order"),
			GraphError::CannotInfer { node } => write!(f, "node {:#x} has fields that cannot be inferred", node),
		}
	}
}

/// Index of a [`ChainLink`] in the compiler's link arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LinkId(pub(crate) u32);

impl LinkId {
	fn index(self) -> usize { self.0 as usize }
}

/// Per-result-slot record of the def/reads/undef tree for one contiguous
/// resource subrange.
#[derive(Default)]
pub struct ChainLink {
	/// The previous write's link, when this value was produced from it.
	pub prev: Option<LinkId>,
	/// The link of the next write of the same subrange.
	pub next: Option<LinkId>,
	pub def: Option<Ref>,
	/// The chain-head definition, stable along the whole chain.
	pub urdef: Option<Ref>,
	/// Parallel reads between the def and the next undef.
	pub reads: Vec<Ref>,
	/// The consumer that invalidates this value.
	pub undef: Option<Ref>,
	/// Sub-chains hanging off this subrange, created by `SLICE`.
	pub child_chains: Vec<LinkId>,
	/// Merged barrier parameters for all reads.
	pub read_sync: Option<ResourceUse>,
	/// Barrier parameters for the undef.
	pub undef_sync: Option<ResourceUse>,
}

/// One unit of work after scheduling.
#[derive(Copy, Clone, Debug)]
pub struct ScheduledItem {
	pub node: NodeId,
	pub domain: DomainFlags,
}

/// Contiguous spans of `partitioned` per queue, in submission order.
#[derive(Clone, Debug, Default)]
pub struct Partitions {
	pub transfer: std::ops::Range<usize>,
	pub compute: std::ops::Range<usize>,
	pub graphics: std::ops::Range<usize>,
}

/// Deferred-execution graph compiler. Reusable across compilations; state is
/// reset each time.
#[derive(Default)]
pub struct Compiler {
	/// Reachable nodes, in discovery order.
	pub(crate) nodes: Vec<NodeId>,
	pub(crate) links: Vec<ChainLink>,
	pub(crate) link_of: FxHashMap<Ref, LinkId>,
	/// Heads of every chain (links without a previous write).
	pub(crate) chains: Vec<LinkId>,
	/// Topologically scheduled items.
	pub(crate) scheduled: Vec<ScheduledItem>,
	/// Indices into `scheduled`, grouped by queue.
	pub(crate) partitioned: Vec<usize>,
	pub(crate) partitions: Partitions,
	/// Holders snapshotted for this compilation.
	pub(crate) depnodes: Vec<Arc<ExtNode>>,
}

impl Compiler {
	pub fn new() -> Self { Self::default() }

	pub(crate) fn link_id(&self, r: Ref) -> LinkId { self.link_of[&r] }

	pub(crate) fn chain(&self, id: LinkId) -> &ChainLink { &self.links[id.index()] }

	pub(crate) fn chain_mut(&mut self, id: LinkId) -> &mut ChainLink { &mut self.links[id.index()] }

	pub(crate) fn chain_of(&self, r: Ref) -> &ChainLink { self.chain(self.link_id(r)) }

	pub fn chains(&self) -> &[LinkId] { &self.chains }

	pub fn scheduled(&self) -> &[ScheduledItem] { &self.scheduled }

	pub fn partitions(&self) -> &Partitions { &self.partitions }

	/// Scheduled items on one queue, in order.
	pub fn partition(&self, range: std::ops::Range<usize>) -> impl Iterator<Item = &ScheduledItem> + '_ {
		self.partitioned[range].iter().map(move |&i| &self.scheduled[i])
	}

	fn reset(&mut self) {
		self.nodes.clear();
		self.links.clear();
		self.link_of.clear();
		self.chains.clear();
		self.scheduled.clear();
		self.partitioned.clear();
		self.partitions = Partitions::default();
		self.depnodes.clear();
	}

	/// Run every compiler pass over the graphs rooted at `roots`.
	pub fn compile(&mut self, module: &ModuleRef, roots: &[Arc<ExtNode>]) -> Result<()> {
		let compile_span = span!(Level::TRACE, "compile graph");
		let _e = compile_span.enter();

		self.reset();

		// Snapshot the holders this submission depends on. This happens before
		// the module lock is taken: dropping a filtered-out holder re-locks the
		// module to clear its held flag.
		let mut work: Vec<Arc<ExtNode>> = roots.to_vec();
		while let Some(ext) = work.pop() {
			work.extend(ext.take_deps());
			self.depnodes.push(ext);
		}
		self.depnodes.sort_by_key(|e| Arc::as_ptr(e) as usize);
		self.depnodes.dedup_by(|a, b| Arc::ptr_eq(a, b));

		// A value that was never submitted and lost its last holder decays
		// silently.
		self.depnodes
			.retain(|e| Arc::strong_count(e) > 1 || e.signal().status() != SignalStatus::Disarmed || roots.iter().any(|r| Arc::ptr_eq(r, e)));

		let mut m = module.lock();
		self.converge_slices(&mut m)?;
		self.build_nodes(&m);
		self.eliminate_bridges(&mut m);
		self.build_nodes(&m);
		self.build_links(&m);
		self.reify_inference(&mut m)?;
		self.collect_chains(&m);
		self.schedule_intra_queue(&m)?;
		self.queue_inference(&mut m);
		self.pass_partitioning();
		self.build_sync(&m)?;

		Ok(())
	}

	/// Compile and wrap into an executable graph.
	pub fn link_graph(&mut self, module: &ModuleRef, roots: &[Arc<ExtNode>]) -> Result<ExecutableRenderGraph<'_>> {
		self.compile(module, roots)?;
		Ok(ExecutableRenderGraph::new(self, module.clone()))
	}

	/// Alias for [`Self::link_graph`], the application-facing entry point.
	pub fn link(&mut self, module: &ModuleRef, roots: &[Arc<ExtNode>]) -> Result<ExecutableRenderGraph<'_>> {
		self.link_graph(module, roots)
	}

	/// Insert implicit `CONVERGE` nodes for every base image with outstanding
	/// slices, and rewrite downstream uses of the base onto the converged
	/// value.
	fn converge_slices(&mut self, m: &mut IRModule) -> Result<()> {
		let all: Vec<NodeId> = m.live_nodes().collect();

		let mut slices: FxHashMap<Ref, Vec<Ref>> = FxHashMap::default();
		for &id in &all {
			if let NodeKind::Slice { .. } = m.node(id).kind {
				let base = m.node(id).args.as_slice()[0];
				slices.entry(base).or_default().push(Ref::new(id, 0));
			}
		}
		if slices.is_empty() {
			return Ok(());
		}

		// Links over the full module so the sub-chain tails are visible.
		self.build_links_for(m, &all);

		let mut by_base: Vec<(Ref, Vec<Ref>)> = slices.into_iter().collect();
		by_base.sort_by_key(|(base, _)| *base);
		for (base, sliced) in by_base {
			let mut tails = Vec::with_capacity(sliced.len());
			let mut write = Vec::with_capacity(sliced.len());
			// The arena index of the latest actual user of any sub-chain; a
			// consumer of the converged base must come after all of them.
			let mut last_user_index = 0;
			for s in sliced {
				let mut l = self.link_id(s);
				while let Some(next) = self.chain(l).next {
					l = next;
				}
				let link = self.chain(l);
				if let Some(undef) = link.undef {
					last_user_index = last_user_index.max(m.node(undef.node).index);
					// Depend on the undef indirectly, without binding to it.
					tails.push(m.make_indirect_depend(undef.node, undef.index as usize));
					write.push(false);
				} else {
					let def = link.def.ok_or(GraphError::UndeclaredRef)?;
					for read in &link.reads {
						last_user_index = last_user_index.max(m.node(read.node).index);
					}
					last_user_index = last_user_index.max(m.node(def.node).index);
					tails.push(def);
					write.push(!link.reads.is_empty());
				}
			}

			let converged = m.make_converge(base, &tails, &write);

			for &id in &all {
				let node = m.node(id);
				if matches!(node.kind, NodeKind::Slice { .. }) {
					continue;
				}
				if !node.args.as_slice().contains(&base) {
					continue;
				}
				// Every diverged tail must dominate the consumer.
				if m.node(id).index < last_user_index {
					return Err(GraphError::ConvergenceNotDominated.into());
				}
				for arg in m.node_mut(id).args.as_mut_slice() {
					if *arg == base {
						*arg = converged;
					}
				}
			}
		}

		// The link state built here covered the whole module; the real link
		// pass rebuilds it over the reachable set.
		self.links.clear();
		self.link_of.clear();
		Ok(())
	}

	/// Collect the reachable node set from the held roots.
	fn build_nodes(&mut self, m: &IRModule) {
		self.nodes.clear();
		let mut visited = rustc_hash::FxHashSet::default();
		let mut stack: Vec<NodeId> = self.depnodes.iter().map(|e| e.node()).collect();
		while let Some(id) = stack.pop() {
			if !visited.insert(id) {
				continue;
			}
			self.nodes.push(id);
			stack.extend(m.node(id).args.as_slice().iter().map(|r| r.node));
		}
	}

	/// Rewrite useless and resolved bridges.
	///
	/// A `SPLICE` without a signal forwards its sources. A splice whose signal
	/// has already been armed is an acquire in disguise: the values were
	/// produced by an earlier submission, so consumers attach to an `ACQUIRE`
	/// carrying the signalled values instead.
	fn eliminate_bridges(&mut self, m: &mut IRModule) {
		let mut replaces: FxHashMap<Ref, Ref> = FxHashMap::default();

		for &id in &self.nodes {
			match &m.node(id).kind {
				NodeKind::Splice => {
					let signal = m.node(id).acqrel.clone();
					match signal {
						None => {
							let srcs: Vec<Ref> = m.node(id).args.as_slice().to_vec();
							for (i, &src) in srcs.iter().enumerate() {
								replaces.insert(Ref::new(id, i as u16), src);
							}
						},
						Some(signal) => match signal.status() {
							// Still to be signalled by this submission; keep.
							SignalStatus::Disarmed => {},
							SignalStatus::Synchronizable | SignalStatus::HostAvailable => {
								for i in 0..m.node(id).result_count() {
									let ty = m.node(id).types[i].clone();
									let values = signal.value(i).into_iter().collect();
									let acquire = m.make_acquire(ty, signal.clone(), values);
									replaces.insert(Ref::new(id, i as u16), acquire);
								}
							},
						},
					}
				},
				NodeKind::Release { .. } => {},
				_ => {},
			}
		}

		if replaces.is_empty() {
			return;
		}
		// Resolve chains of replacements, then rewrite every collected arg.
		for &id in &self.nodes {
			for arg in m.node_mut(id).args.as_mut_slice() {
				let mut r = *arg;
				while let Some(&to) = replaces.get(&r) {
					r = to;
				}
				*arg = r;
			}
		}
	}
}
