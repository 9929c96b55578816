//! Structurally-interned types for IR edges.

use std::{fmt, sync::Arc};

use crate::{
	exec::cmd::PassFn,
	sync::{Access, DomainFlags},
	types::hash_combine,
};

/// Tags for the builtin composite/opaque types.
pub mod tag {
	pub const IMAGE: u32 = 1;
	pub const BUFFER: u32 = 2;
	pub const SWAPCHAIN: u32 = 3;
	pub const SAMPLER: u32 = 4;
	pub const SAMPLED_IMAGE: u32 = 5;
	pub const FORMAT: u32 = 6;
	pub const SAMPLE_COUNT: u32 = 7;
	pub const CLEAR_VALUE: u32 = 8;
	/// First tag available to user composites.
	pub const USER: u32 = 256;
}

/// An opaque callable executed by the command recorder.
pub struct OpaqueFn {
	pub args: Vec<Arc<Type>>,
	pub returns: Vec<Arc<Type>>,
	pub domain: DomainFlags,
	pub execute: Arc<PassFn>,
	/// Identity for interning; two opaque fns with equal hashes are the same
	/// callable.
	pub hash: u32,
}

/// A callable backed by a compute shader; the pipeline is compiled on demand.
pub struct ShaderFn {
	pub args: Vec<Arc<Type>>,
	pub returns: Vec<Arc<Type>>,
	pub domain: DomainFlags,
	pub spirv: Arc<[u32]>,
}

pub enum TypeKind {
	Void,
	Integer { width: u8 },
	Float { width: u8 },
	/// Opaque memory of a known size.
	Memory { size: u64 },
	Array { elem: Arc<Type>, count: u32, stride: u32 },
	Composite { fields: Vec<Arc<Type>>, tag: u32 },
	Union { variants: Vec<Arc<Type>>, tag: u32 },
	Pointer { pointee: Arc<Type> },
	Image { texel: Arc<Type> },
	Opaque { tag: u32 },
	Enum { tag: u32, format: Option<fn(u64) -> String> },
	EnumValue { of: Arc<Type>, value: u64 },
	/// A type qualified with the access a call will use it under.
	Imbued { base: Arc<Type>, access: Access },
	/// A return type that aliases the argument at `arg`.
	Aliased { base: Arc<Type>, arg: u16 },
	OpaqueFn(Arc<OpaqueFn>),
	ShaderFn(Arc<ShaderFn>),
}

/// An interned type. Equal types within one module are pointer-equal.
pub struct Type {
	pub kind: TypeKind,
	hash: u32,
}

impl Type {
	pub(super) fn new(kind: TypeKind) -> Self {
		let hash = hash_of(&kind);
		Self { kind, hash }
	}

	/// The canonical structural hash, combining the kind and child type hashes.
	pub fn hash32(&self) -> u32 { self.hash }

	/// Strip `Imbued`/`Aliased` qualifiers.
	pub fn stripped(self: &Arc<Type>) -> Arc<Type> {
		match &self.kind {
			TypeKind::Imbued { base, .. } => base.stripped(),
			TypeKind::Aliased { base, .. } => base.stripped(),
			_ => self.clone(),
		}
	}

	pub fn imbued_access(&self) -> Option<Access> {
		match &self.kind {
			TypeKind::Imbued { access, .. } => Some(*access),
			_ => None,
		}
	}

	pub fn aliased_arg(&self) -> Option<u16> {
		match &self.kind {
			TypeKind::Aliased { arg, .. } => Some(*arg),
			_ => None,
		}
	}

	pub fn is_composite_with_tag(&self, want: u32) -> bool {
		matches!(&self.kind, TypeKind::Composite { tag, .. } if *tag == want)
	}

	pub fn is_image(&self) -> bool { self.is_composite_with_tag(tag::IMAGE) }

	pub fn is_buffer(&self) -> bool { self.is_composite_with_tag(tag::BUFFER) }

	pub fn opaque_fn(&self) -> Option<&Arc<OpaqueFn>> {
		match &self.kind {
			TypeKind::OpaqueFn(f) => Some(f),
			_ => None,
		}
	}

	pub fn shader_fn(&self) -> Option<&Arc<ShaderFn>> {
		match &self.kind {
			TypeKind::ShaderFn(f) => Some(f),
			_ => None,
		}
	}

	/// Callable argument types, for either callable kind.
	pub fn fn_args(&self) -> Option<&[Arc<Type>]> {
		match &self.kind {
			TypeKind::OpaqueFn(f) => Some(&f.args),
			TypeKind::ShaderFn(f) => Some(&f.args),
			_ => None,
		}
	}

	pub fn fn_returns(&self) -> Option<&[Arc<Type>]> {
		match &self.kind {
			TypeKind::OpaqueFn(f) => Some(&f.returns),
			TypeKind::ShaderFn(f) => Some(&f.returns),
			_ => None,
		}
	}

	pub fn fn_domain(&self) -> Option<DomainFlags> {
		match &self.kind {
			TypeKind::OpaqueFn(f) => Some(f.domain),
			TypeKind::ShaderFn(f) => Some(f.domain),
			_ => None,
		}
	}
}

fn kind_discriminant(kind: &TypeKind) -> u32 {
	match kind {
		TypeKind::Void => 0,
		TypeKind::Integer { .. } => 1,
		TypeKind::Float { .. } => 2,
		TypeKind::Memory { .. } => 3,
		TypeKind::Array { .. } => 4,
		TypeKind::Composite { .. } => 5,
		TypeKind::Union { .. } => 6,
		TypeKind::Pointer { .. } => 7,
		TypeKind::Image { .. } => 8,
		TypeKind::Opaque { .. } => 9,
		TypeKind::Enum { .. } => 10,
		TypeKind::EnumValue { .. } => 11,
		TypeKind::Imbued { .. } => 12,
		TypeKind::Aliased { .. } => 13,
		TypeKind::OpaqueFn(_) => 14,
		TypeKind::ShaderFn(_) => 15,
	}
}

fn hash_of(kind: &TypeKind) -> u32 {
	let mut h = hash_combine(0, kind_discriminant(kind));
	match kind {
		TypeKind::Void => {},
		TypeKind::Integer { width } | TypeKind::Float { width } => h = hash_combine(h, *width as u32),
		TypeKind::Memory { size } => {
			h = hash_combine(h, *size as u32);
			h = hash_combine(h, (*size >> 32) as u32);
		},
		TypeKind::Array { elem, count, stride } => {
			h = hash_combine(h, elem.hash32());
			h = hash_combine(h, *count);
			h = hash_combine(h, *stride);
		},
		TypeKind::Composite { fields, tag } | TypeKind::Union { variants: fields, tag } => {
			for field in fields {
				h = hash_combine(h, field.hash32());
			}
			h = hash_combine(h, *tag);
		},
		TypeKind::Pointer { pointee } => h = hash_combine(h, pointee.hash32()),
		TypeKind::Image { texel } => h = hash_combine(h, texel.hash32()),
		TypeKind::Opaque { tag } => h = hash_combine(h, *tag),
		TypeKind::Enum { tag, .. } => h = hash_combine(h, *tag),
		TypeKind::EnumValue { of, value } => {
			h = hash_combine(h, of.hash32());
			h = hash_combine(h, *value as u32);
			h = hash_combine(h, (*value >> 32) as u32);
		},
		TypeKind::Imbued { base, access } => {
			h = hash_combine(h, base.hash32());
			h = hash_combine(h, *access as u32);
		},
		TypeKind::Aliased { base, arg } => {
			h = hash_combine(h, base.hash32());
			h = hash_combine(h, *arg as u32);
		},
		TypeKind::OpaqueFn(f) => h = hash_combine(h, f.hash),
		TypeKind::ShaderFn(f) => {
			h = hash_combine(h, f.spirv.len() as u32);
			for &word in f.spirv.iter().take(16) {
				h = hash_combine(h, word);
			}
		},
	}
	h
}

/// Structural equality, used to resolve intern-table hash collisions.
pub(super) fn structurally_equal(a: &Type, b: &Type) -> bool {
	if a.hash != b.hash {
		return false;
	}
	match (&a.kind, &b.kind) {
		(TypeKind::Void, TypeKind::Void) => true,
		(TypeKind::Integer { width: a }, TypeKind::Integer { width: b }) => a == b,
		(TypeKind::Float { width: a }, TypeKind::Float { width: b }) => a == b,
		(TypeKind::Memory { size: a }, TypeKind::Memory { size: b }) => a == b,
		(
			TypeKind::Array {
				elem: ae,
				count: ac,
				stride: as_,
			},
			TypeKind::Array {
				elem: be,
				count: bc,
				stride: bs,
			},
		) => ac == bc && as_ == bs && Arc::ptr_eq(ae, be),
		(TypeKind::Composite { fields: af, tag: at }, TypeKind::Composite { fields: bf, tag: bt })
		| (TypeKind::Union { variants: af, tag: at }, TypeKind::Union { variants: bf, tag: bt }) => {
			at == bt && af.len() == bf.len() && af.iter().zip(bf).all(|(a, b)| Arc::ptr_eq(a, b))
		},
		(TypeKind::Pointer { pointee: a }, TypeKind::Pointer { pointee: b }) => Arc::ptr_eq(a, b),
		(TypeKind::Image { texel: a }, TypeKind::Image { texel: b }) => Arc::ptr_eq(a, b),
		(TypeKind::Opaque { tag: a }, TypeKind::Opaque { tag: b }) => a == b,
		(TypeKind::Enum { tag: a, .. }, TypeKind::Enum { tag: b, .. }) => a == b,
		(TypeKind::EnumValue { of: ao, value: av }, TypeKind::EnumValue { of: bo, value: bv }) => {
			av == bv && Arc::ptr_eq(ao, bo)
		},
		(TypeKind::Imbued { base: ab, access: aa }, TypeKind::Imbued { base: bb, access: ba }) => {
			aa == ba && Arc::ptr_eq(ab, bb)
		},
		(TypeKind::Aliased { base: ab, arg: aa }, TypeKind::Aliased { base: bb, arg: ba }) => {
			aa == ba && Arc::ptr_eq(ab, bb)
		},
		(TypeKind::OpaqueFn(a), TypeKind::OpaqueFn(b)) => Arc::ptr_eq(a, b) || a.hash == b.hash,
		(TypeKind::ShaderFn(a), TypeKind::ShaderFn(b)) => Arc::ptr_eq(a, b) || a.spirv == b.spirv,
		_ => false,
	}
}

impl fmt::Debug for Type {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match &self.kind {
			TypeKind::Void => write!(f, "void"),
			TypeKind::Integer { width } => write!(f, "i{}", width),
			TypeKind::Float { width } => write!(f, "f{}", width),
			TypeKind::Memory { size } => write!(f, "mem[{}]", size),
			TypeKind::Array { elem, count, .. } => write!(f, "{:?}[{}]", elem, count),
			TypeKind::Composite { tag: tag::IMAGE, .. } => write!(f, "image"),
			TypeKind::Composite { tag: tag::BUFFER, .. } => write!(f, "buffer"),
			TypeKind::Composite { tag, .. } => write!(f, "composite:{}", tag),
			TypeKind::Union { tag, .. } => write!(f, "union:{}", tag),
			TypeKind::Pointer { pointee } => write!(f, "{:?}*", pointee),
			TypeKind::Image { texel } => write!(f, "image<{:?}>", texel),
			TypeKind::Opaque { tag: tag::SWAPCHAIN } => write!(f, "swapchain"),
			TypeKind::Opaque { tag: tag::SAMPLER } => write!(f, "sampler"),
			TypeKind::Opaque { tag } => write!(f, "opaque:{}", tag),
			TypeKind::Enum { tag, .. } => write!(f, "enum:{}", tag),
			TypeKind::EnumValue { value, of } => match &of.kind {
				TypeKind::Enum {
					format: Some(format), ..
				} => write!(f, "{}", format(*value)),
				_ => write!(f, "{}", value),
			},
			TypeKind::Imbued { base, access } => write!(f, "{:?}:{:?}", base, access),
			TypeKind::Aliased { base, arg } => write!(f, "{:?}@{}", base, arg),
			TypeKind::OpaqueFn(_) => write!(f, "ofn"),
			TypeKind::ShaderFn(_) => write!(f, "sfn"),
		}
	}
}
