//! Sync synthesis: resolve barrier parameters for every consuming edge.

use crate::{
	compile::{Compiler, GraphError},
	ir::{IRModule, NodeKind, Ref},
	sync::{is_write_access, merge_read_uses, to_use, Access},
	Result,
};

impl Compiler {
	/// For every write, record the half-barrier that puts the resource into
	/// the writer's state. For reads, record one merged half-barrier shared by
	/// all parallel readers, so read-to-read edges never cost a barrier.
	pub(crate) fn build_sync(&mut self, m: &IRModule) -> Result<()> {
		for idx in 0..self.nodes.len() {
			let id = self.nodes[idx];
			let node = m.node(id);
			let args: Vec<Ref> = node.args.as_slice().to_vec();
			match &node.kind {
				NodeKind::Call => {
					let callee_ty = m.ref_type(args[0]);
					let fn_args = callee_ty.fn_args().expect("call callee must be callable").to_vec();
					for (i, &parm) in args[1..].iter().enumerate() {
						let access = fn_args[i]
							.imbued_access()
							.expect("call arguments must carry imbued access");
						let link_id = self.link_id(parm);
						if self.chain(link_id).urdef.is_none() {
							return Err(GraphError::UnattachedResource {
								node: m.node(id).index,
								arg: i + 1,
							}
							.into());
						}
						if is_write_access(access) || access == Access::Consume {
							let link = self.chain_mut(link_id);
							debug_assert!(link.undef_sync.is_none(), "two writers of one subrange");
							link.undef_sync = Some(to_use(access));
						} else if self.chain(link_id).read_sync.is_none() {
							let read_use = self.merged_read_use(m, link_id);
							self.chain_mut(link_id).read_sync = Some(read_use);
						}
					}
				},
				NodeKind::Clear { .. } => {
					let link_id = self.link_id(args[0]);
					self.chain_mut(link_id).undef_sync = Some(to_use(Access::TransferClear));
				},
				NodeKind::Release { dst_access, .. } => {
					if *dst_access != Access::None {
						let access = *dst_access;
						let link_id = self.link_id(args[0]);
						self.chain_mut(link_id).undef_sync = Some(to_use(access));
					}
				},
				NodeKind::Use { access } => {
					let access = *access;
					let link_id = self.link_id(args[0]);
					if is_write_access(access) {
						self.chain_mut(link_id).undef_sync = Some(to_use(access));
					} else if self.chain(link_id).read_sync.is_none() {
						let read_use = self.merged_read_use(m, link_id);
						self.chain_mut(link_id).read_sync = Some(read_use);
					}
				},
				_ => {},
			}
		}
		Ok(())
	}

	/// Merge every parallel reader of one link into a single use.
	fn merged_read_use(&self, m: &IRModule, link: super::LinkId) -> crate::sync::ResourceUse {
		let accesses: Vec<Access> = self
			.chain(link)
			.reads
			.iter()
			.filter_map(|read| {
				let node = m.node(read.node);
				match &node.kind {
					NodeKind::Call => {
						let callee = node.args.as_slice()[0];
						let fn_args = m.ref_type(callee).fn_args()?.to_vec();
						fn_args.get(read.index as usize - 1).and_then(|t| t.imbued_access())
					},
					NodeKind::Use { access } => Some(*access),
					// Converges order, they do not touch memory.
					NodeKind::Converge { .. } => None,
					_ => None,
				}
			})
			.collect();
		merge_read_uses(accesses)
	}
}
