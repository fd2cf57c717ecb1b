// Merging per-stage reflection into one pipeline layout
//
// An entry with the same name at the same (set, binding) is one resource
// seen by another stage, and the two must agree on its type. Differently
// named resources may only share a binding as the two halves of a texture:
// image + sampler merge into a combined image sampler, and a stage
// declaring the combined form also merges with either half.

use std::collections::BTreeMap;

use crate::backend::{
    DescriptorKind, PushConstantRange, SetLayoutBinding, ShaderStages, VertexAttribute, VertexLayout,
};
use crate::error::LayoutError;
use crate::shader::{CompiledShader, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
    /// Block size for buffers, zero otherwise
    pub size: u32,
}

/// The pipeline-wide view of a shader's resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedLayout {
    pub sets: BTreeMap<u32, Vec<MergedBinding>>,
    pub push_constants: Option<PushConstantRange>,
    pub vertex_layout: Option<VertexLayout>,
}

impl MergedLayout {
    pub fn binding(&self, set: u32, binding: u32) -> Option<&MergedBinding> {
        self.sets.get(&set)?.iter().find(|b| b.binding == binding)
    }

    pub fn has_set(&self, set: u32) -> bool {
        self.sets.contains_key(&set)
    }

    /// Number of set layouts the pipeline layout needs (gaps included)
    pub fn set_count(&self) -> u32 {
        self.sets.keys().next_back().map(|&s| s + 1).unwrap_or(0)
    }

    /// Bindings of `set` in the form the device wants; empty for a gap
    pub fn set_layout_bindings(&self, set: u32) -> Vec<SetLayoutBinding> {
        self.sets
            .get(&set)
            .map(|bindings| {
                bindings
                    .iter()
                    .map(|b| SetLayoutBinding {
                        binding: b.binding,
                        kind: b.kind,
                        count: b.count,
                        stages: b.stages,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Descriptor totals of one kind across all sets
    pub fn descriptor_count(&self, kind: DescriptorKind) -> u32 {
        self.sets
            .values()
            .flatten()
            .filter(|b| b.kind == kind)
            .map(|b| b.count)
            .sum()
    }
}

fn merge_kinds(a: DescriptorKind, b: DescriptorKind) -> Option<DescriptorKind> {
    use DescriptorKind::*;
    match (a, b) {
        _ if a == b => Some(a),
        (SampledImage, Sampler) | (Sampler, SampledImage) => Some(CombinedImageSampler),
        (CombinedImageSampler, SampledImage | Sampler) | (SampledImage | Sampler, CombinedImageSampler) => {
            Some(CombinedImageSampler)
        }
        _ => None,
    }
}

fn is_texture_half(kind: DescriptorKind) -> bool {
    matches!(
        kind,
        DescriptorKind::SampledImage | DescriptorKind::Sampler | DescriptorKind::CombinedImageSampler
    )
}

/// Kind of a binding claimed by `existing` and then by `incoming`
fn merge_claims(existing: &MergedBinding, incoming_name: &str, incoming: DescriptorKind) -> Option<DescriptorKind> {
    if existing.name == incoming_name {
        return merge_kinds(existing.kind, incoming);
    }
    if existing.kind != incoming && is_texture_half(existing.kind) && is_texture_half(incoming) {
        return merge_kinds(existing.kind, incoming);
    }
    None
}

pub fn merge_reflection(shader: &CompiledShader) -> Result<MergedLayout, LayoutError> {
    let mut table: BTreeMap<(u32, u32), MergedBinding> = BTreeMap::new();
    let mut push_constants: Option<PushConstantRange> = None;

    for stage in &shader.stages {
        let mask = stage.stage.mask();

        for resource in &stage.reflection.resources {
            let kind = resource.kind.descriptor_kind();
            match table.get_mut(&(resource.set, resource.binding)) {
                Some(existing) => {
                    existing.kind = merge_claims(existing, &resource.name, kind).ok_or_else(|| LayoutError::BindingCollision {
                        set: resource.set,
                        binding: resource.binding,
                        first: existing.name.clone(),
                        second: resource.name.clone(),
                    })?;
                    existing.stages |= mask;
                    existing.count = existing.count.max(resource.count);
                    existing.size = existing.size.max(resource.size);
                }
                None => {
                    table.insert(
                        (resource.set, resource.binding),
                        MergedBinding {
                            name: resource.name.clone(),
                            set: resource.set,
                            binding: resource.binding,
                            kind,
                            count: resource.count.max(1),
                            stages: mask,
                            size: resource.size,
                        },
                    );
                }
            }
        }

        // One range covering every stage's block
        for block in &stage.reflection.push_constants {
            let range = push_constants.get_or_insert(PushConstantRange {
                stages: ShaderStages::empty(),
                offset: block.offset,
                size: 0,
            });
            let end = (range.offset + range.size).max(block.offset + block.size);
            range.offset = range.offset.min(block.offset);
            range.size = end - range.offset;
            range.stages |= mask;
        }
    }

    let mut sets: BTreeMap<u32, Vec<MergedBinding>> = BTreeMap::new();
    for ((set, _), binding) in table {
        sets.entry(set).or_default().push(binding);
    }

    let vertex_layout = shader.stage(Stage::Vertex).and_then(|vertex| {
        let mut inputs = vertex.reflection.inputs.clone();
        if inputs.is_empty() {
            return None;
        }
        inputs.sort_by_key(|i| i.location);
        let mut offset = 0;
        let attributes = inputs
            .iter()
            .map(|input| {
                let attribute = VertexAttribute {
                    location: input.location,
                    format: input.format,
                    offset,
                };
                offset += input.format.size();
                attribute
            })
            .collect();
        Some(VertexLayout {
            stride: offset,
            attributes,
        })
    });

    Ok(MergedLayout {
        sets,
        push_constants,
        vertex_layout,
    })
}
