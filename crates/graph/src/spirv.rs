//! SPIR-V reflection.
//!
//! The runtime consumes shader modules as 32-bit word streams; this module
//! extracts the interface the pipeline layer needs: entry stage, descriptor
//! bindings, push constant ranges, vertex inputs, specialization constants and
//! the compute local size. Source-language compilation is out of scope.

use ash::vk;
use rspirv::{
	dr::{Instruction, Module, Operand},
	spirv::{Decoration, ExecutionMode, ExecutionModel, Op, StorageClass, Word},
};
use rustc_hash::FxHashMap;

use crate::{Error, Result};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BindingReflection {
	pub set: u32,
	pub binding: u32,
	pub ty: vk::DescriptorType,
	/// 0 for runtime-sized arrays.
	pub count: u32,
	pub stages: vk::ShaderStageFlags,
	/// Unset optional bindings are skipped instead of diagnosed.
	pub optional: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PushConstantReflection {
	pub offset: u32,
	pub size: u32,
	pub stages: vk::ShaderStageFlags,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VertexInputReflection {
	pub location: u32,
	pub format: vk::Format,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SpecConstantReflection {
	pub id: u32,
	pub default: u32,
}

/// Everything reflected out of one shader module, or merged across the stages
/// of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct Program {
	pub stages: vk::ShaderStageFlags,
	pub entry: String,
	pub bindings: Vec<BindingReflection>,
	pub push_constants: Vec<PushConstantReflection>,
	pub vertex_inputs: Vec<VertexInputReflection>,
	pub spec_constants: Vec<SpecConstantReflection>,
	pub local_size: Option<[u32; 3]>,
}

impl Program {
	pub fn reflect(words: &[u32]) -> Result<Program> {
		let module =
			rspirv::dr::load_words(words).map_err(|e| Error::ShaderCompilation(format!("invalid SPIR-V: {:?}", e)))?;
		Reflector::new(&module).run()
	}

	/// Union the interfaces of several stages into one pipeline-wide program.
	/// Bindings shared between stages OR their stage masks.
	pub fn merge<'a>(programs: impl IntoIterator<Item = &'a Program>) -> Program {
		let mut out = Program::default();
		for p in programs {
			out.stages |= p.stages;
			if out.entry.is_empty() {
				out.entry = p.entry.clone();
			}
			for &b in &p.bindings {
				match out.bindings.iter_mut().find(|o| o.set == b.set && o.binding == b.binding) {
					Some(existing) => existing.stages |= b.stages,
					None => out.bindings.push(b),
				}
			}
			for &pc in &p.push_constants {
				match out
					.push_constants
					.iter_mut()
					.find(|o| o.offset == pc.offset && o.size == pc.size)
				{
					Some(existing) => existing.stages |= pc.stages,
					None => out.push_constants.push(pc),
				}
			}
			out.vertex_inputs.extend(p.vertex_inputs.iter().copied());
			for &sc in &p.spec_constants {
				if !out.spec_constants.iter().any(|o| o.id == sc.id) {
					out.spec_constants.push(sc);
				}
			}
			if p.local_size.is_some() {
				out.local_size = p.local_size;
			}
		}
		out.bindings.sort_by_key(|b| (b.set, b.binding));
		out.vertex_inputs.sort_by_key(|v| v.location);
		out
	}

	/// The layouts of every descriptor set this program uses, densely indexed.
	pub fn set_count(&self) -> u32 { self.bindings.iter().map(|b| b.set + 1).max().unwrap_or(0) }

	pub fn mark_optional(&mut self, set: u32, binding: u32) {
		if let Some(b) = self.bindings.iter_mut().find(|b| b.set == set && b.binding == binding) {
			b.optional = true;
		}
	}
}

struct Reflector<'a> {
	module: &'a Module,
	types: FxHashMap<Word, &'a Instruction>,
	decorations: FxHashMap<Word, Vec<(Decoration, Option<u32>)>>,
	member_offsets: FxHashMap<Word, Vec<u32>>,
}

fn literal(op: &Operand) -> Option<u32> {
	match op {
		Operand::LiteralBit32(v) => Some(*v),
		_ => None,
	}
}

fn id(op: &Operand) -> Option<Word> {
	match op {
		Operand::IdRef(v) => Some(*v),
		_ => None,
	}
}

impl<'a> Reflector<'a> {
	fn new(module: &'a Module) -> Self {
		let mut types = FxHashMap::default();
		for inst in &module.types_global_values {
			if let Some(result) = inst.result_id {
				types.insert(result, inst);
			}
		}

		let mut decorations: FxHashMap<Word, Vec<(Decoration, Option<u32>)>> = FxHashMap::default();
		let mut member_offsets: FxHashMap<Word, Vec<u32>> = FxHashMap::default();
		for inst in &module.annotations {
			match inst.class.opcode {
				Op::Decorate => {
					let (Some(target), Some(Operand::Decoration(dec))) = (id(&inst.operands[0]), inst.operands.get(1))
					else {
						continue;
					};
					let value = inst.operands.get(2).and_then(literal);
					decorations.entry(target).or_default().push((*dec, value));
				},
				Op::MemberDecorate => {
					let (Some(target), Some(member), Some(Operand::Decoration(Decoration::Offset))) =
						(id(&inst.operands[0]), inst.operands.get(1).and_then(literal), inst.operands.get(2))
					else {
						continue;
					};
					let offsets = member_offsets.entry(target).or_default();
					if offsets.len() <= member as usize {
						offsets.resize(member as usize + 1, 0);
					}
					if let Some(value) = inst.operands.get(3).and_then(literal) {
						offsets[member as usize] = value;
					}
				},
				_ => {},
			}
		}

		Self {
			module,
			types,
			decorations,
			member_offsets,
		}
	}

	fn decoration(&self, target: Word, which: Decoration) -> Option<u32> {
		self.decorations
			.get(&target)?
			.iter()
			.find(|(d, _)| *d == which)
			.and_then(|(_, v)| *v)
	}

	fn has_decoration(&self, target: Word, which: Decoration) -> bool {
		self.decorations
			.get(&target)
			.map(|ds| ds.iter().any(|(d, _)| *d == which))
			.unwrap_or(false)
	}

	fn run(self) -> Result<Program> {
		let entry = self
			.module
			.entry_points
			.first()
			.ok_or_else(|| Error::ShaderCompilation("module has no entry point".into()))?;
		let Some(Operand::ExecutionModel(model)) = entry.operands.first() else {
			return Err(Error::ShaderCompilation("malformed entry point".into()));
		};
		let stages = match *model {
			ExecutionModel::Vertex => vk::ShaderStageFlags::VERTEX,
			ExecutionModel::Fragment => vk::ShaderStageFlags::FRAGMENT,
			ExecutionModel::GLCompute => vk::ShaderStageFlags::COMPUTE,
			ExecutionModel::Geometry => vk::ShaderStageFlags::GEOMETRY,
			ExecutionModel::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
			ExecutionModel::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
			ExecutionModel::RayGenerationKHR => vk::ShaderStageFlags::RAYGEN_KHR,
			ExecutionModel::ClosestHitKHR => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
			ExecutionModel::MissKHR => vk::ShaderStageFlags::MISS_KHR,
			ExecutionModel::AnyHitKHR => vk::ShaderStageFlags::ANY_HIT_KHR,
			ExecutionModel::IntersectionKHR => vk::ShaderStageFlags::INTERSECTION_KHR,
			ExecutionModel::CallableKHR => vk::ShaderStageFlags::CALLABLE_KHR,
			other => {
				return Err(Error::ShaderCompilation(format!("unsupported execution model {:?}", other)));
			},
		};
		let entry_name = entry
			.operands
			.iter()
			.find_map(|op| match op {
				Operand::LiteralString(s) => Some(s.clone()),
				_ => None,
			})
			.unwrap_or_else(|| "main".into());

		let mut program = Program {
			stages,
			entry: entry_name,
			..Program::default()
		};

		for mode in &self.module.execution_modes {
			if let Some(Operand::ExecutionMode(ExecutionMode::LocalSize)) = mode.operands.get(1) {
				let x = mode.operands.get(2).and_then(literal).unwrap_or(1);
				let y = mode.operands.get(3).and_then(literal).unwrap_or(1);
				let z = mode.operands.get(4).and_then(literal).unwrap_or(1);
				program.local_size = Some([x, y, z]);
			}
		}

		for inst in &self.module.types_global_values {
			match inst.class.opcode {
				Op::Variable => self.reflect_variable(inst, stages, &mut program)?,
				Op::SpecConstant | Op::SpecConstantTrue | Op::SpecConstantFalse => {
					let Some(result) = inst.result_id else { continue };
					let Some(spec_id) = self.decoration(result, Decoration::SpecId) else {
						continue;
					};
					let default = match inst.class.opcode {
						Op::SpecConstantTrue => 1,
						Op::SpecConstantFalse => 0,
						_ => inst.operands.first().and_then(literal).unwrap_or(0),
					};
					program.spec_constants.push(SpecConstantReflection { id: spec_id, default });
				},
				_ => {},
			}
		}

		program.bindings.sort_by_key(|b| (b.set, b.binding));
		program.vertex_inputs.sort_by_key(|v| v.location);
		Ok(program)
	}

	fn reflect_variable(&self, inst: &Instruction, stages: vk::ShaderStageFlags, program: &mut Program) -> Result<()> {
		let Some(Operand::StorageClass(class)) = inst.operands.first() else {
			return Ok(());
		};
		let Some(result) = inst.result_id else { return Ok(()) };
		let Some(pointer_ty) = inst.result_type else { return Ok(()) };
		let Some(pointee) = self.pointee(pointer_ty) else { return Ok(()) };

		match class {
			StorageClass::UniformConstant | StorageClass::Uniform | StorageClass::StorageBuffer => {
				let Some(set) = self.decoration(result, Decoration::DescriptorSet) else {
					return Ok(());
				};
				let binding = self.decoration(result, Decoration::Binding).unwrap_or(0);
				let (ty, count) = self.descriptor_type(pointee, *class)?;
				program.bindings.push(BindingReflection {
					set,
					binding,
					ty,
					count,
					stages,
					// Runtime-sized arrays are partially bound.
					optional: count == 0,
				});
			},
			StorageClass::PushConstant => {
				let size = self.type_size(pointee).unwrap_or(0);
				program.push_constants.push(PushConstantReflection {
					offset: 0,
					size,
					stages,
				});
			},
			StorageClass::Input if stages == vk::ShaderStageFlags::VERTEX => {
				let Some(location) = self.decoration(result, Decoration::Location) else {
					return Ok(());
				};
				if let Some(format) = self.input_format(pointee) {
					program.vertex_inputs.push(VertexInputReflection { location, format });
				}
			},
			_ => {},
		}
		Ok(())
	}

	fn pointee(&self, pointer: Word) -> Option<Word> {
		let inst = self.types.get(&pointer)?;
		if inst.class.opcode != Op::TypePointer {
			return None;
		}
		id(&inst.operands[1])
	}

	fn descriptor_type(&self, ty: Word, class: StorageClass) -> Result<(vk::DescriptorType, u32)> {
		let inst = self
			.types
			.get(&ty)
			.ok_or_else(|| Error::ShaderCompilation("dangling type reference".into()))?;
		match inst.class.opcode {
			Op::TypeArray => {
				let elem = id(&inst.operands[0]).unwrap();
				let count = id(&inst.operands[1])
					.and_then(|c| self.types.get(&c))
					.and_then(|c| c.operands.first())
					.and_then(literal)
					.unwrap_or(1);
				let (ty, _) = self.descriptor_type(elem, class)?;
				Ok((ty, count))
			},
			Op::TypeRuntimeArray => {
				let elem = id(&inst.operands[0]).unwrap();
				let (ty, _) = self.descriptor_type(elem, class)?;
				Ok((ty, 0))
			},
			Op::TypeSampler => Ok((vk::DescriptorType::SAMPLER, 1)),
			Op::TypeSampledImage => Ok((vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1)),
			Op::TypeImage => {
				// operands: sampled type, dim, depth, arrayed, ms, sampled, format, [access]
				let sampled = inst.operands.get(5).and_then(literal).unwrap_or(1);
				let dim = inst.operands.get(1);
				if matches!(dim, Some(Operand::Dim(rspirv::spirv::Dim::DimBuffer))) {
					Ok(if sampled == 2 {
						(vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1)
					} else {
						(vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1)
					})
				} else if sampled == 2 {
					Ok((vk::DescriptorType::STORAGE_IMAGE, 1))
				} else {
					Ok((vk::DescriptorType::SAMPLED_IMAGE, 1))
				}
			},
			Op::TypeAccelerationStructureKHR => Ok((vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1)),
			Op::TypeStruct => {
				let result = inst.result_id.unwrap();
				let buffer_block = self.has_decoration(result, Decoration::BufferBlock);
				if class == StorageClass::StorageBuffer || buffer_block {
					Ok((vk::DescriptorType::STORAGE_BUFFER, 1))
				} else {
					Ok((vk::DescriptorType::UNIFORM_BUFFER, 1))
				}
			},
			other => Err(Error::ShaderCompilation(format!(
				"unsupported descriptor type instruction {:?}",
				other
			))),
		}
	}

	/// Byte size of a type, following explicit offsets and strides.
	fn type_size(&self, ty: Word) -> Option<u32> {
		let inst = self.types.get(&ty)?;
		match inst.class.opcode {
			Op::TypeInt | Op::TypeFloat => Some(inst.operands.first().and_then(literal)? / 8),
			Op::TypeVector | Op::TypeMatrix => {
				let elem = self.type_size(id(&inst.operands[0])?)?;
				let count = inst.operands.get(1).and_then(literal)?;
				Some(elem * count)
			},
			Op::TypeArray => {
				let elem = self.type_size(id(&inst.operands[0])?)?;
				let count = id(&inst.operands[1])
					.and_then(|c| self.types.get(&c))
					.and_then(|c| c.operands.first())
					.and_then(literal)?;
				let stride = self
					.decoration(inst.result_id?, Decoration::ArrayStride)
					.unwrap_or(elem);
				Some(stride * count)
			},
			Op::TypeStruct => {
				let result = inst.result_id?;
				let offsets = self.member_offsets.get(&result)?;
				let last = inst.operands.len().checked_sub(1)?;
				let last_size = self.type_size(id(&inst.operands[last])?)?;
				Some(offsets.get(last).copied().unwrap_or(0) + last_size)
			},
			_ => None,
		}
	}

	fn input_format(&self, ty: Word) -> Option<vk::Format> {
		let inst = self.types.get(&ty)?;
		match inst.class.opcode {
			Op::TypeFloat => Some(vk::Format::R32_SFLOAT),
			Op::TypeInt => {
				let signed = inst.operands.get(1).and_then(literal)? == 1;
				Some(if signed { vk::Format::R32_SINT } else { vk::Format::R32_UINT })
			},
			Op::TypeVector => {
				let elem = self.types.get(&id(&inst.operands[0])?)?;
				let count = inst.operands.get(1).and_then(literal)?;
				match (elem.class.opcode, count) {
					(Op::TypeFloat, 2) => Some(vk::Format::R32G32_SFLOAT),
					(Op::TypeFloat, 3) => Some(vk::Format::R32G32B32_SFLOAT),
					(Op::TypeFloat, 4) => Some(vk::Format::R32G32B32A32_SFLOAT),
					(Op::TypeInt, 2) => Some(vk::Format::R32G32_UINT),
					(Op::TypeInt, 3) => Some(vk::Format::R32G32B32_UINT),
					(Op::TypeInt, 4) => Some(vk::Format::R32G32B32A32_UINT),
					_ => None,
				}
			},
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merge_unions_bindings_and_stages() {
		let vs = Program {
			stages: vk::ShaderStageFlags::VERTEX,
			bindings: vec![BindingReflection {
				set: 0,
				binding: 0,
				ty: vk::DescriptorType::UNIFORM_BUFFER,
				count: 1,
				stages: vk::ShaderStageFlags::VERTEX,
				optional: false,
			}],
			..Program::default()
		};
		let fs = Program {
			stages: vk::ShaderStageFlags::FRAGMENT,
			bindings: vec![
				BindingReflection {
					set: 0,
					binding: 0,
					ty: vk::DescriptorType::UNIFORM_BUFFER,
					count: 1,
					stages: vk::ShaderStageFlags::FRAGMENT,
					optional: false,
				},
				BindingReflection {
					set: 1,
					binding: 2,
					ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
					count: 1,
					stages: vk::ShaderStageFlags::FRAGMENT,
					optional: false,
				},
			],
			..Program::default()
		};

		let merged = Program::merge([&vs, &fs]);
		assert_eq!(merged.bindings.len(), 2);
		assert_eq!(
			merged.bindings[0].stages,
			vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
		);
		assert_eq!(merged.set_count(), 2);
	}
}
