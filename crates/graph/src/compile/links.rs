//! Chain construction: def/use/undef assignment per node kind.

use crate::{
	compile::{ChainLink, Compiler, LinkId},
	ir::{IRModule, NodeId, NodeKind, Ref},
	sync::is_write_access,
	sync::Access,
};

impl Compiler {
	pub(crate) fn build_links(&mut self, m: &IRModule) {
		let nodes = std::mem::take(&mut self.nodes);
		self.build_links_for(m, &nodes);
		self.nodes = nodes;
	}

	/// Assign def/use/undef over `nodes`.
	///
	/// The running example:
	/// ```text
	/// declare -> clear -> call(R) -> call(W) -> release
	///    A    ->   B   ->   B     ->    C    ->   X
	/// ```
	/// declare defs A; clear undefs A and defs B; the reading call appends to
	/// B's reads; the writing call undefs B and defs C; release undefs C.
	pub(crate) fn build_links_for(&mut self, m: &IRModule, nodes: &[NodeId]) {
		self.links.clear();
		self.link_of.clear();

		for &id in nodes {
			for i in 0..m.node(id).result_count() {
				let link = LinkId(self.links.len() as u32);
				self.links.push(ChainLink::default());
				self.link_of.insert(Ref::new(id, i as u16), link);
			}
		}

		for &id in nodes {
			let node = m.node(id);
			let args: Vec<Ref> = node.args.as_slice().to_vec();
			let this = |i: u16| Ref::new(id, i);
			match &node.kind {
				NodeKind::Nop
				| NodeKind::Constant { .. }
				| NodeKind::Import { .. }
				| NodeKind::Placeholder
				| NodeKind::MathBinary { .. }
				| NodeKind::Garbage => {},

				NodeKind::Construct => {
					self.set_def(this(0), this(0));
					for (i, &arg) in args.iter().enumerate() {
						self.set_undef(arg, Ref::new(id, i as u16));
					}
					if matches!(
						m.node(id).types[0].kind,
						crate::ir::TypeKind::Array { .. }
					) {
						let result = self.link_id(this(0));
						for &arg in &args[1..] {
							self.chain_at(arg).next = Some(result);
						}
					}
				},

				NodeKind::Splice => {
					let disarmed = node
						.acqrel
						.as_ref()
						.map(|s| s.status() == crate::exec::signal::SignalStatus::Disarmed)
						.unwrap_or(true);
					for (i, &src) in args.iter().enumerate() {
						let result = this(i as u16);
						self.set_def(result, result);
						if disarmed {
							debug_assert!(self.chain_at(src).undef.is_none(), "splice source already consumed");
							self.set_undef(src, result);
							let result_link = self.link_id(result);
							self.chain_at(src).next = Some(result_link);
							let src_link = self.link_id(src);
							self.chain_mut(result_link).prev = Some(src_link);
						}
					}
				},

				NodeKind::Acquire { .. } | NodeKind::AcquireNextImage | NodeKind::Extract => {
					self.set_def(this(0), this(0));
				},

				NodeKind::Call => {
					let callee_ty = m.ref_type(args[0]);
					let fn_args = callee_ty.fn_args().expect("call callee must be callable").to_vec();
					for (i, &parm) in args[1..].iter().enumerate() {
						let access = fn_args[i]
							.imbued_access()
							.expect("call arguments must carry imbued access");
						let user = Ref::new(id, (i + 1) as u16);
						if is_write_access(access) || access == Access::Consume {
							self.set_undef(parm, user);
						}
						if !is_write_access(access) && access != Access::Consume {
							self.chain_at(parm).reads.push(user);
						}
					}
					for (ret, ty) in node.types.iter().enumerate() {
						let arg_idx = ty.aliased_arg().expect("call returns must alias an argument") as usize;
						let result = this(ret as u16);
						self.set_def(result, result);
						let result_link = self.link_id(result);
						let arg_link = self.link_id(args[arg_idx]);
						self.chain_mut(arg_link).next = Some(result_link);
						self.chain_mut(result_link).prev = Some(arg_link);
					}
				},

				NodeKind::Clear { .. } => {
					self.set_def(this(0), this(0));
					self.set_undef(args[0], this(0));
					let result_link = self.link_id(this(0));
					let dst_link = self.link_id(args[0]);
					self.chain_mut(dst_link).next = Some(result_link);
					self.chain_mut(result_link).prev = Some(dst_link);
				},

				NodeKind::Release { .. } => {
					self.set_undef(args[0], this(0));
					let result_link = self.link_id(this(0));
					let src_link = self.link_id(args[0]);
					self.chain_mut(result_link).prev = Some(src_link);
				},

				NodeKind::Slice { .. } => {
					self.set_def(this(0), this(0));
					let child = self.link_id(this(0));
					self.chain_at(args[0]).child_chains.push(child);
				},

				NodeKind::Converge { write } => {
					let write = write.clone();
					self.set_undef(args[0], this(0));
					self.set_def(this(0), this(0));
					let result_link = self.link_id(this(0));
					let base_link = self.link_id(args[0]);
					self.chain_mut(base_link).next = Some(result_link);
					self.chain_mut(result_link).prev = Some(base_link);
					for (i, &tail) in args[1..].iter().enumerate() {
						let user = Ref::new(id, (i + 1) as u16);
						if write[i] {
							self.set_undef(tail, user);
						} else {
							self.chain_at(tail).reads.push(user);
						}
					}
				},

				NodeKind::IndirectDepend => {
					self.set_def(this(0), this(0));
					let true_ref = args[0];
					debug_assert!(
						self.chain_at(true_ref).next.is_none(),
						"indirect depend target already continued"
					);
					let result_link = self.link_id(this(0));
					let target_link = self.link_id(true_ref);
					self.chain_mut(target_link).next = Some(result_link);
					self.chain_mut(result_link).prev = Some(target_link);
				},

				NodeKind::Use { access } => {
					let access = *access;
					self.set_def(this(0), this(0));
					if is_write_access(access) || access == Access::Consume {
						self.set_undef(args[0], this(0));
						let result_link = self.link_id(this(0));
						let src_link = self.link_id(args[0]);
						self.chain_mut(src_link).next = Some(result_link);
						self.chain_mut(result_link).prev = Some(src_link);
					} else {
						self.chain_at(args[0]).reads.push(this(0));
					}
				},

				NodeKind::Set { .. } => {
					self.set_def(this(0), this(0));
					self.set_undef(args[0], this(0));
					let result_link = self.link_id(this(0));
					let dst_link = self.link_id(args[0]);
					self.chain_mut(dst_link).next = Some(result_link);
					self.chain_mut(result_link).prev = Some(dst_link);
				},

				NodeKind::LogicalCopy
				| NodeKind::Cast
				| NodeKind::CompilePipeline
				| NodeKind::Allocate
				| NodeKind::GetAllocationSize
				| NodeKind::GetCi => {
					self.set_def(this(0), this(0));
				},
			}
		}

		// Propagate the chain-head definition from every head to its tail.
		for i in 0..self.links.len() {
			if self.links[i].prev.is_some() || self.links[i].urdef.is_some() {
				continue;
			}
			let urdef = self.links[i].def;
			let mut l = Some(LinkId(i as u32));
			while let Some(id) = l {
				self.chain_mut(id).urdef = urdef;
				l = self.chain(id).next;
			}
		}
	}

	pub(crate) fn collect_chains(&mut self, _m: &IRModule) {
		self.chains.clear();
		for i in 0..self.links.len() {
			if self.links[i].prev.is_none() {
				self.chains.push(LinkId(i as u32));
			}
		}
	}

	fn chain_at(&mut self, r: Ref) -> &mut ChainLink {
		let id = self.link_id(r);
		self.chain_mut(id)
	}

	fn set_def(&mut self, r: Ref, def: Ref) { self.chain_at(r).def = Some(def) }

	fn set_undef(&mut self, r: Ref, undef: Ref) {
		let link = self.chain_at(r);
		debug_assert!(link.undef.is_none(), "a subrange has at most one undef");
		link.undef = Some(undef);
	}
}
