//! Intra-queue topological scheduling, queue inference, and partitioning.

use std::{cmp::Reverse, collections::BinaryHeap};

use rustc_hash::FxHashMap;

use crate::{
	compile::{Compiler, GraphError, ScheduledItem},
	ir::{IRModule, NodeId, NodeKind},
	sync::DomainFlags,
	Result,
};

fn schedulable(kind: &NodeKind) -> bool {
	matches!(
		kind,
		NodeKind::Construct
			| NodeKind::Call
			| NodeKind::Clear { .. }
			| NodeKind::Acquire { .. }
			| NodeKind::AcquireNextImage
			| NodeKind::MathBinary { .. }
			| NodeKind::Splice
			| NodeKind::Release { .. }
			| NodeKind::Converge { .. }
	)
}

impl Compiler {
	/// Kahn's algorithm over the def -> read -> undef edges of every chain.
	///
	/// `CONSTRUCT` nodes participate as dependency sources but are not emitted;
	/// their execution order does not matter. Ties between independent items
	/// break on the user-supplied auxiliary order.
	pub(crate) fn schedule_intra_queue(&mut self, m: &IRModule) -> Result<()> {
		let mut items: Vec<NodeId> = Vec::new();
		let mut index_of: FxHashMap<NodeId, usize> = FxHashMap::default();
		for &id in &self.nodes {
			if schedulable(&m.node(id).kind) {
				index_of.insert(id, items.len());
				items.push(id);
			}
		}

		let size = items.len();
		let mut indegree = vec![0usize; size];
		let mut adjacency = vec![0u8; size * size];
		let edge = |adjacency: &mut Vec<u8>, indegree: &mut Vec<usize>, from: usize, to: usize| {
			indegree[to] += 1;
			adjacency[from * size + to] += 1;
		};

		for link in &self.links {
			let def = link.def.and_then(|d| index_of.get(&d.node).copied());
			let undef = link.undef.and_then(|u| index_of.get(&u.node).copied());
			if let (Some(def), Some(undef)) = (def, undef) {
				edge(&mut adjacency, &mut indegree, def, undef);
			}
			for read in &link.reads {
				let Some(read) = index_of.get(&read.node).copied() else { continue };
				// A read only depends on a def that exists in this graph.
				if let Some(def) = def {
					edge(&mut adjacency, &mut indegree, def, read);
				}
				if let Some(undef) = undef {
					edge(&mut adjacency, &mut indegree, read, undef);
				}
			}

			// When the next link's def is a bridge that is not itself scheduled
			// (a slice or indirect depend), this link's last user must still
			// order before the next link's users.
			let Some(next) = link.next else { continue };
			let Some(from) = undef.or(def) else { continue };
			let next = self.chain(next);
			if next.def.and_then(|d| index_of.get(&d.node)).is_none() {
				for to in next
					.reads
					.iter()
					.chain(next.undef.iter())
					.filter_map(|r| index_of.get(&r.node).copied())
				{
					if to != from {
						edge(&mut adjacency, &mut indegree, from, to);
					}
				}
			}
		}

		let key = |m: &IRModule, id: NodeId| {
			let node = m.node(id);
			let aux = node.scheduling.map(|s| s.auxiliary_order).unwrap_or(u32::MAX);
			(aux, node.index)
		};

		let mut queue = BinaryHeap::new();
		for (i, &id) in items.iter().enumerate() {
			if indegree[i] == 0 {
				queue.push(Reverse((key(m, id), i)));
			}
		}

		let mut emitted = 0;
		while let Some(Reverse((_, i))) = queue.pop() {
			let id = items[i];
			emitted += 1;
			let node = m.node(id);
			if !matches!(node.kind, NodeKind::Construct) {
				self.scheduled.push(ScheduledItem {
					node: id,
					domain: node
						.scheduling
						.map(|s| s.required_domains)
						.unwrap_or(DomainFlags::ANY),
				});
			}
			for j in 0..size {
				let weight = adjacency[i * size + j] as usize;
				if weight > 0 {
					indegree[j] -= weight;
					if indegree[j] == 0 {
						queue.push(Reverse((key(m, items[j]), j)));
					}
				}
			}
		}

		if emitted != size {
			return Err(GraphError::NotPartiallyOrdered.into());
		}
		Ok(())
	}

	/// Propagate decided queue domains along every chain, forward and
	/// backward, defaulting what remains to the graphics queue, then propagate
	/// once more to stabilize.
	pub(crate) fn queue_inference(&mut self, m: &mut IRModule) {
		self.propagate_domains(m);

		for i in 0..self.scheduled.len() {
			let item = self.scheduled[i];
			let domain = m
				.node(item.node)
				.scheduling
				.map(|s| s.required_domains)
				.unwrap_or(item.domain);
			let decided = if domain.is_decided() {
				domain
			} else {
				DomainFlags::GRAPHICS_QUEUE
			};
			self.scheduled[i].domain = decided;
			let node = m.node_mut(item.node);
			match node.scheduling.as_mut() {
				Some(s) => s.required_domains = decided,
				None => {
					node.scheduling = Some(crate::ir::SchedulingInfo {
						required_domains: decided,
						auxiliary_order: u32::MAX,
					})
				},
			}
		}

		self.propagate_domains(m);

		for i in 0..self.scheduled.len() {
			let node = self.scheduled[i].node;
			if let Some(s) = m.node(node).scheduling {
				if s.required_domains.is_decided() {
					self.scheduled[i].domain = s.required_domains;
				}
			}
		}
	}

	fn propagate_domains(&self, m: &mut IRModule) {
		let propagate = |m: &mut IRModule, last: &mut DomainFlags, node: NodeId| {
			let Some(sched) = m.node_mut(node).scheduling.as_mut() else { return };
			let domain = sched.required_domains;
			if domain != *last && domain.is_decided() {
				*last = domain;
			}
			if last.is_decided() && !domain.is_decided() {
				sched.required_domains = *last;
			}
		};

		// Forward along every chain.
		for &head in &self.chains {
			let mut last = DomainFlags::DEVICE;
			let mut l = Some(head);
			while let Some(id) = l {
				let link = self.chain(id);
				if let Some(def) = link.def {
					propagate(m, &mut last, def.node);
				}
				for read in link.reads.clone() {
					propagate(m, &mut last, read.node);
				}
				if let Some(undef) = link.undef {
					propagate(m, &mut last, undef.node);
				}
				l = link.next;
			}
		}

		// Backward from every chain tail.
		for &head in &self.chains {
			let mut tail = head;
			while let Some(next) = self.chain(tail).next {
				tail = next;
			}
			let mut last = DomainFlags::DEVICE;
			let mut l = Some(tail);
			while let Some(id) = l {
				let link = self.chain(id);
				if let Some(undef) = link.undef {
					propagate(m, &mut last, undef.node);
				}
				for read in link.reads.clone() {
					propagate(m, &mut last, read.node);
				}
				if let Some(def) = link.def {
					propagate(m, &mut last, def.node);
				}
				l = link.prev;
			}
		}
	}

	/// Split the schedule into contiguous per-queue spans: transfer, compute,
	/// then graphics.
	pub(crate) fn pass_partitioning(&mut self) {
		self.partitioned.clear();

		let start = 0;
		for (i, item) in self.scheduled.iter().enumerate() {
			if item.domain.contains(DomainFlags::TRANSFER_QUEUE) {
				self.partitioned.push(i);
			}
		}
		self.partitions.transfer = start..self.partitioned.len();

		let start = self.partitioned.len();
		for (i, item) in self.scheduled.iter().enumerate() {
			if item.domain.contains(DomainFlags::COMPUTE_QUEUE) && !item.domain.contains(DomainFlags::TRANSFER_QUEUE) {
				self.partitioned.push(i);
			}
		}
		self.partitions.compute = start..self.partitioned.len();

		let start = self.partitioned.len();
		for (i, item) in self.scheduled.iter().enumerate() {
			if item.domain.contains(DomainFlags::GRAPHICS_QUEUE)
				&& !item.domain.contains(DomainFlags::TRANSFER_QUEUE)
				&& !item.domain.contains(DomainFlags::COMPUTE_QUEUE)
			{
				self.partitioned.push(i);
			}
		}
		self.partitions.graphics = start..self.partitioned.len();
	}
}
