// Pipeline & descriptor binder
//
// A Pipeline merges its shader's reflection into one layout, builds the
// pipeline object against a render pass contract and owns one descriptor set
// per (presentable image, set index). Bindings are written into the sets of
// every image at once, so whichever image is acquired next already sees them.
//
// Sets are always addressed by presentable image index, never by sync slot.
// The recorded bindings outlive the GPU objects: `invalidate()` rebuilds
// everything behind the same `Arc<Pipeline>` and replays them.

pub mod layout;

use anyhow::{Context, Result};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{
    BlendMode, CullMode, DescriptorKind, DescriptorPoolDesc, DescriptorResource, DescriptorWrite, GraphicsPipelineDesc,
    RawDescriptorPool, RawDescriptorSet, RawPipeline, RawPipelineLayout, RawSetLayout, RawShaderModule,
    ShaderStageModule, VertexLayout,
};
use crate::buffer::{StorageBuffer, UniformBuffer};
use crate::config::PoolConfig;
use crate::context::GpuContext;
use crate::error::{BindingError, LayoutError};
use crate::framebuffer::Framebuffer;
use crate::handle::{ResourceHandle, RetiredObject};
use crate::queue::CommandList;
use crate::render_pass::RenderPass;
use crate::shader::{CompiledShader, Shader};
use crate::texture::Texture;

pub use layout::{merge_reflection, MergedBinding, MergedLayout};

/// (set, binding, array slot)
type SlotKey = (u32, u32, u32);

#[derive(Clone)]
pub struct PipelineDesc {
    pub shader: Option<Arc<Shader>>,
    pub render_pass: Option<ResourceHandle<RenderPass>>,
    /// Overrides the layout derived from the vertex stage's inputs
    pub vertex_layout: Option<VertexLayout>,
    pub cull_mode: CullMode,
    pub wireframe: bool,
    pub blend: BlendMode,
    pub depth_test: bool,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            shader: None,
            render_pass: None,
            vertex_layout: None,
            cull_mode: CullMode::Back,
            wireframe: false,
            blend: BlendMode::None,
            depth_test: true,
        }
    }
}

impl PipelineDesc {
    pub fn new(shader: Arc<Shader>, render_pass: ResourceHandle<RenderPass>) -> Self {
        Self {
            shader: Some(shader),
            render_pass: Some(render_pass),
            ..Default::default()
        }
    }

    /// Renders into `framebuffer` with its blend mode and no depth test
    pub fn for_framebuffer(shader: Arc<Shader>, framebuffer: &Framebuffer) -> Self {
        Self {
            shader: Some(shader),
            render_pass: Some(framebuffer.render_pass().clone()),
            blend: framebuffer.blend(),
            depth_test: false,
            ..Default::default()
        }
    }
}

// =============================================================================
// BOUND RESOURCES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundClass {
    UniformBuffer,
    StorageBuffer,
    Image,
}

impl BoundClass {
    /// Kind reported in a conflict
    fn kind(self) -> DescriptorKind {
        match self {
            BoundClass::UniformBuffer => DescriptorKind::UniformBuffer,
            BoundClass::StorageBuffer => DescriptorKind::StorageBuffer,
            BoundClass::Image => DescriptorKind::CombinedImageSampler,
        }
    }

    fn accepts(self, declared: DescriptorKind) -> bool {
        match self {
            BoundClass::UniformBuffer => declared == DescriptorKind::UniformBuffer,
            BoundClass::StorageBuffer => declared == DescriptorKind::StorageBuffer,
            BoundClass::Image => matches!(
                declared,
                DescriptorKind::SampledImage
                    | DescriptorKind::CombinedImageSampler
                    | DescriptorKind::Sampler
                    | DescriptorKind::StorageImage
            ),
        }
    }
}

#[derive(Clone)]
enum Bound {
    Uniform(UniformBuffer),
    Storage(StorageBuffer),
    Texture(Arc<Texture>),
}

impl Bound {
    fn class(&self) -> BoundClass {
        match self {
            Bound::Uniform(_) => BoundClass::UniformBuffer,
            Bound::Storage(_) => BoundClass::StorageBuffer,
            Bound::Texture(_) => BoundClass::Image,
        }
    }

    fn resource(&self, declared: DescriptorKind) -> DescriptorResource {
        match self {
            Bound::Uniform(buffer) => DescriptorResource::Buffer {
                kind: DescriptorKind::UniformBuffer,
                buffer: buffer.raw(),
                offset: 0,
                range: buffer.size(),
            },
            Bound::Storage(buffer) => DescriptorResource::Buffer {
                kind: DescriptorKind::StorageBuffer,
                buffer: buffer.raw(),
                offset: 0,
                range: buffer.size(),
            },
            Bound::Texture(texture) => texture.descriptor(declared),
        }
    }

    fn texture_version(&self) -> Option<u64> {
        match self {
            Bound::Texture(texture) => Some(texture.version()),
            _ => None,
        }
    }
}

// =============================================================================
// GPU OBJECTS
// =============================================================================

/// Descriptor pool plus `sets[image][set_index]`
struct SetGroup {
    pool: RawDescriptorPool,
    sets: Vec<Vec<RawDescriptorSet>>,
    /// Texture versions last written, per image
    written: Vec<BTreeMap<SlotKey, u64>>,
}

impl SetGroup {
    fn empty() -> Self {
        Self {
            pool: RawDescriptorPool::NULL,
            sets: Vec::new(),
            written: Vec::new(),
        }
    }
}

struct PipelineObjects {
    layout: MergedLayout,
    set_layouts: Vec<RawSetLayout>,
    pipeline_layout: RawPipelineLayout,
    pipeline: RawPipeline,
    modules: Vec<RawShaderModule>,
    group: SetGroup,
}

impl PipelineObjects {
    fn new(layout: MergedLayout) -> Self {
        Self {
            layout,
            set_layouts: Vec::new(),
            pipeline_layout: RawPipelineLayout::NULL,
            pipeline: RawPipeline::NULL,
            modules: Vec::new(),
            group: SetGroup::empty(),
        }
    }

    /// Everything still alive, for the deferred destroyer
    fn retired(&mut self) -> Vec<RetiredObject> {
        let mut objects = Vec::new();
        if !self.group.pool.is_null() {
            objects.push(RetiredObject::DescriptorPool(self.group.pool));
        }
        if !self.pipeline.is_null() {
            objects.push(RetiredObject::Pipeline(self.pipeline));
        }
        if !self.pipeline_layout.is_null() {
            objects.push(RetiredObject::PipelineLayout(self.pipeline_layout));
        }
        objects.extend(self.set_layouts.drain(..).map(RetiredObject::SetLayout));
        objects.extend(self.modules.drain(..).map(RetiredObject::ShaderModule));
        self.group = SetGroup::empty();
        self.pipeline = RawPipeline::NULL;
        self.pipeline_layout = RawPipelineLayout::NULL;
        objects
    }
}

struct PipelineState {
    objects: PipelineObjects,
    image_count: usize,
    bindings: BTreeMap<SlotKey, Bound>,
    /// Shader generation the objects were built from
    shader_generation: u64,
}

// =============================================================================
// PIPELINE
// =============================================================================

pub struct Pipeline {
    gpu: Arc<GpuContext>,
    shader: Arc<Shader>,
    render_pass: ResourceHandle<RenderPass>,
    vertex_layout: Option<VertexLayout>,
    cull_mode: CullMode,
    wireframe: bool,
    blend: BlendMode,
    depth_test: bool,
    pools: PoolConfig,
    /// Written into image bindings nothing was assigned to
    fallback: Arc<Texture>,
    state: Mutex<PipelineState>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pipeline")
            .field("shader", &self.shader.name())
            .field("pipeline", &state.objects.pipeline)
            .field("images", &state.image_count)
            .field("bindings", &state.bindings.len())
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        gpu: &Arc<GpuContext>,
        desc: PipelineDesc,
        image_count: usize,
        pools: &PoolConfig,
        fallback: Arc<Texture>,
    ) -> Result<Arc<Pipeline>> {
        let shader = desc.shader.ok_or(LayoutError::MissingShader)?;
        let render_pass = desc.render_pass.ok_or(LayoutError::MissingRenderPass)?;

        let pipeline = Pipeline {
            gpu: gpu.clone(),
            shader,
            render_pass,
            vertex_layout: desc.vertex_layout,
            cull_mode: desc.cull_mode,
            wireframe: desc.wireframe,
            blend: desc.blend,
            depth_test: desc.depth_test,
            pools: pools.clone(),
            fallback,
            state: Mutex::new(PipelineState {
                objects: PipelineObjects::new(MergedLayout::default()),
                image_count: image_count.max(1),
                bindings: BTreeMap::new(),
                shader_generation: 0,
            }),
        };

        {
            let mut state = pipeline.state.lock();
            let generation = pipeline.shader.generation();
            let compiled = pipeline.shader.compiled();
            let mut objects = pipeline.build_objects(&compiled, state.image_count)?;
            pipeline.fill_sets(&mut objects, &state.bindings, 0..state.image_count)?;
            state.objects = objects;
            state.shader_generation = generation;
            log::info!(
                "Created pipeline for shader '{}' ({} sets, {} images)",
                pipeline.shader.name(),
                state.objects.set_layouts.len(),
                state.image_count
            );
        }

        Ok(Arc::new(pipeline))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }

    pub fn render_pass(&self) -> &ResourceHandle<RenderPass> {
        &self.render_pass
    }

    pub fn raw(&self) -> RawPipeline {
        self.state.lock().objects.pipeline
    }

    pub fn raw_layout(&self) -> RawPipelineLayout {
        self.state.lock().objects.pipeline_layout
    }

    pub fn layout(&self) -> MergedLayout {
        self.state.lock().objects.layout.clone()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().image_count
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    pub fn shader_generation(&self) -> u64 {
        self.state.lock().shader_generation
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    pub fn set_uniform_buffer(&self, buffer: &UniformBuffer, binding: u32) -> Result<()> {
        self.set_uniform_buffer_at(0, buffer, binding)
    }

    pub fn set_uniform_buffer_at(&self, set: u32, buffer: &UniformBuffer, binding: u32) -> Result<()> {
        self.assign(set, binding, 0, Bound::Uniform(buffer.clone()))
    }

    pub fn set_storage_buffer(&self, buffer: &StorageBuffer, binding: u32) -> Result<()> {
        self.set_storage_buffer_at(0, buffer, binding)
    }

    pub fn set_storage_buffer_at(&self, set: u32, buffer: &StorageBuffer, binding: u32) -> Result<()> {
        self.assign(set, binding, 0, Bound::Storage(buffer.clone()))
    }

    pub fn set_texture(&self, texture: &Arc<Texture>, binding: u32, slot: u32) -> Result<()> {
        self.set_texture_at(0, texture, binding, slot)
    }

    pub fn set_texture_at(&self, set: u32, texture: &Arc<Texture>, binding: u32, slot: u32) -> Result<()> {
        self.assign(set, binding, slot, Bound::Texture(texture.clone()))
    }

    fn validate(
        &self,
        state: &PipelineState,
        set: u32,
        binding: u32,
        slot: u32,
        class: BoundClass,
    ) -> Result<DescriptorKind, BindingError> {
        let layout = &state.objects.layout;
        if !layout.has_set(set) {
            return Err(BindingError::SetNotFound {
                shader: self.shader.name().to_string(),
                set,
            });
        }

        if let Some((_, prior)) = state.bindings.range((set, binding, 0)..=(set, binding, u32::MAX)).next() {
            if prior.class() != class {
                return Err(BindingError::KindConflict {
                    set,
                    binding,
                    existing: prior.class().kind(),
                    requested: class.kind(),
                });
            }
        }

        let declared = layout.binding(set, binding).ok_or_else(|| BindingError::NotDeclared {
            shader: self.shader.name().to_string(),
            set,
            binding,
        })?;
        if !class.accepts(declared.kind) {
            return Err(BindingError::KindConflict {
                set,
                binding,
                existing: declared.kind,
                requested: class.kind(),
            });
        }
        if slot >= declared.count {
            return Err(BindingError::SlotOutOfRange {
                binding,
                slot,
                count: declared.count,
            });
        }
        Ok(declared.kind)
    }

    fn assign(&self, set: u32, binding: u32, slot: u32, bound: Bound) -> Result<()> {
        let mut state = self.state.lock();
        let declared = self.validate(&state, set, binding, slot, bound.class())?;

        let key = (set, binding, slot);
        let resource = bound.resource(declared);
        let version = bound.texture_version();
        let group = &mut state.objects.group;

        let writes: Vec<DescriptorWrite> = group
            .sets
            .iter()
            .map(|sets| DescriptorWrite {
                set: sets[set as usize],
                binding,
                slot,
                resource,
            })
            .collect();
        self.gpu
            .device()
            .update_descriptor_sets(&writes)
            .context("Failed to write descriptor sets")?;

        for written in &mut group.written {
            match version {
                Some(version) => written.insert(key, version),
                None => written.remove(&key),
            };
        }
        state.bindings.insert(key, bound);
        Ok(())
    }

    /// Write every declared slot of the given images: the recorded binding
    /// if there is one, the fallback texture for unassigned image slots
    fn fill_sets(
        &self,
        objects: &mut PipelineObjects,
        bindings: &BTreeMap<SlotKey, Bound>,
        images: std::ops::Range<usize>,
    ) -> Result<()> {
        let fallback = Bound::Texture(self.fallback.clone());
        let mut writes = Vec::new();

        for merged in objects.layout.sets.values().flatten() {
            for slot in 0..merged.count {
                let key = (merged.set, merged.binding, slot);
                let bound = match bindings.get(&key) {
                    Some(bound) => bound,
                    None if BoundClass::Image.accepts(merged.kind) && merged.kind != DescriptorKind::StorageImage => {
                        &fallback
                    }
                    None => continue,
                };
                let resource = bound.resource(merged.kind);
                let version = bound.texture_version();

                for image in images.clone() {
                    writes.push(DescriptorWrite {
                        set: objects.group.sets[image][merged.set as usize],
                        binding: merged.binding,
                        slot,
                        resource,
                    });
                    if let Some(version) = version {
                        objects.group.written[image].insert(key, version);
                    }
                }
            }
        }

        if writes.is_empty() {
            return Ok(());
        }
        self.gpu
            .device()
            .update_descriptor_sets(&writes)
            .context("Failed to write descriptor sets")
    }

    /// Descriptor sets for presentable image `image_index`, rewriting any
    /// texture binding whose image changed state since it was written
    pub fn descriptor_sets_for(&self, image_index: usize) -> Result<Vec<RawDescriptorSet>> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if image_index >= state.image_count {
            return Err(BindingError::ImageIndexOutOfRange {
                index: image_index,
                count: state.image_count,
            }
            .into());
        }

        let objects = &mut state.objects;
        let mut writes = Vec::new();
        for (&(set, binding, slot), bound) in &state.bindings {
            let Some(version) = bound.texture_version() else {
                continue;
            };
            let written = &mut objects.group.written[image_index];
            if written.get(&(set, binding, slot)) == Some(&version) {
                continue;
            }
            let Some(merged) = objects.layout.binding(set, binding) else {
                continue;
            };
            writes.push(DescriptorWrite {
                set: objects.group.sets[image_index][set as usize],
                binding,
                slot,
                resource: bound.resource(merged.kind),
            });
            written.insert((set, binding, slot), version);
        }

        if !writes.is_empty() {
            log::debug!("Refreshing {} stale descriptors for image {}", writes.len(), image_index);
            self.gpu
                .device()
                .update_descriptor_sets(&writes)
                .context("Failed to refresh descriptor sets")?;
        }
        Ok(objects.group.sets[image_index].clone())
    }

    /// Bind the pipeline and the sets of `image_index` into `list`
    pub fn bind(&self, list: &mut CommandList, image_index: usize) -> Result<()> {
        let sets = self.descriptor_sets_for(image_index)?;
        let (pipeline, layout) = {
            let state = self.state.lock();
            (state.objects.pipeline, state.objects.pipeline_layout)
        };
        list.record(&crate::backend::Command::BindPipeline(pipeline))?;
        if !sets.is_empty() {
            list.record(&crate::backend::Command::BindDescriptorSets {
                layout,
                first_set: 0,
                sets: &sets,
            })?;
        }
        Ok(())
    }

    /// Push `value` to the stages that declared the push constant block
    pub fn push_constants<T: Pod>(&self, list: &mut CommandList, value: &T) -> Result<()> {
        let (layout, range) = {
            let state = self.state.lock();
            (state.objects.pipeline_layout, state.objects.layout.push_constants)
        };
        let range = range.context("Pipeline shader declares no push constants")?;
        list.push_constants(layout, range.stages, value)
    }

    // -------------------------------------------------------------------------
    // Rebuild
    // -------------------------------------------------------------------------

    /// Rebuild every GPU object from the shader's current contents and replay
    /// the recorded bindings. Old objects go through the deferred destroyer.
    pub fn invalidate(&self) -> Result<()> {
        let mut state = self.state.lock();
        let generation = self.shader.generation();
        let compiled = self.shader.compiled();
        let mut objects = self.build_objects(&compiled, state.image_count)?;

        // Bindings the rebuilt layout no longer accepts are dropped
        let shader = self.shader.name().to_string();
        state.bindings.retain(|&(set, binding, slot), bound| {
            let keep = objects
                .layout
                .binding(set, binding)
                .is_some_and(|b| bound.class().accepts(b.kind) && slot < b.count);
            if !keep {
                log::warn!(
                    "Shader '{}' no longer declares set {} binding {} slot {}, dropping it",
                    shader,
                    set,
                    binding,
                    slot
                );
            }
            keep
        });

        let image_count = state.image_count;
        if let Err(e) = self.fill_sets(&mut objects, &state.bindings, 0..image_count) {
            self.gpu.destroyer().retire(objects.retired());
            return Err(e);
        }

        let mut old = std::mem::replace(&mut state.objects, objects);
        self.gpu.destroyer().retire(old.retired());
        state.shader_generation = generation;

        log::info!(
            "Rebuilt pipeline for shader '{}' (generation {}, {} bindings replayed)",
            self.shader.name(),
            generation,
            state.bindings.len()
        );
        Ok(())
    }

    /// Reallocate per-image sets after the presentable image count changed
    pub fn set_image_count(&self, image_count: usize) -> Result<()> {
        let image_count = image_count.max(1);
        let mut state = self.state.lock();
        if state.image_count == image_count {
            return Ok(());
        }

        let set_layouts = state.objects.set_layouts.clone();
        let group = self.allocate_sets(&state.objects.layout, &set_layouts, image_count)?;
        let old = std::mem::replace(&mut state.objects.group, group);

        let state = &mut *state;
        let filled = self.fill_sets(&mut state.objects, &state.bindings, 0..image_count);
        if !old.pool.is_null() {
            self.gpu.destroyer().retire(vec![RetiredObject::DescriptorPool(old.pool)]);
        }
        filled?;

        log::debug!(
            "Pipeline '{}' now has sets for {} images",
            self.shader.name(),
            image_count
        );
        state.image_count = image_count;
        Ok(())
    }

    fn build_objects(&self, compiled: &CompiledShader, image_count: usize) -> Result<PipelineObjects> {
        let layout = merge_reflection(compiled)
            .with_context(|| format!("Failed to build layout for shader '{}'", self.shader.name()))?;
        let mut objects = PipelineObjects::new(layout);
        match self.create_objects(&mut objects, compiled, image_count) {
            Ok(()) => Ok(objects),
            Err(e) => {
                // Never submitted, but retire anyway to keep one destruction path
                self.gpu.destroyer().retire(objects.retired());
                Err(e)
            }
        }
    }

    fn create_objects(&self, objects: &mut PipelineObjects, compiled: &CompiledShader, image_count: usize) -> Result<()> {
        let device = self.gpu.device();

        for set in 0..objects.layout.set_count() {
            let bindings = objects.layout.set_layout_bindings(set);
            let set_layout = device
                .create_set_layout(&bindings)
                .with_context(|| format!("Failed to create layout for set {}", set))?;
            objects.set_layouts.push(set_layout);
        }

        let push_constants: Vec<_> = objects.layout.push_constants.into_iter().collect();
        objects.pipeline_layout = device
            .create_pipeline_layout(&objects.set_layouts, &push_constants)
            .context("Failed to create pipeline layout")?;

        let mut stages = Vec::with_capacity(compiled.stages.len());
        for stage in &compiled.stages {
            let module = device
                .create_shader_module(&stage.words)
                .with_context(|| format!("Failed to create {:?} shader module", stage.stage))?;
            objects.modules.push(module);
            stages.push(ShaderStageModule {
                stage: stage.stage.mask(),
                module,
                entry_point: stage.entry_point.clone(),
            });
        }

        let vertex_layout = self
            .vertex_layout
            .clone()
            .or_else(|| objects.layout.vertex_layout.clone());
        objects.pipeline = device
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                layout: objects.pipeline_layout,
                render_pass: self.render_pass.raw(),
                stages,
                vertex_layout,
                cull_mode: self.cull_mode,
                wireframe: self.wireframe,
                blend: self.blend,
                depth_test: self.depth_test,
                color_attachments: self.render_pass.color_count() as u32,
            })
            .with_context(|| format!("Failed to create pipeline for shader '{}'", self.shader.name()))?;

        let set_layouts = objects.set_layouts.clone();
        objects.group = self.allocate_sets(&objects.layout, &set_layouts, image_count)?;
        Ok(())
    }

    fn allocate_sets(&self, layout: &MergedLayout, set_layouts: &[RawSetLayout], image_count: usize) -> Result<SetGroup> {
        let mut group = SetGroup {
            pool: RawDescriptorPool::NULL,
            sets: vec![Vec::new(); image_count],
            written: vec![BTreeMap::new(); image_count],
        };
        if set_layouts.is_empty() {
            return Ok(group);
        }

        let device = self.gpu.device();
        let images = image_count as u32;
        let per_image = |configured: u32, kind: DescriptorKind| configured.max(layout.descriptor_count(kind)) * images;
        let pools = &self.pools;
        group.pool = device
            .create_descriptor_pool(&DescriptorPoolDesc {
                max_sets: pools.max_sets_per_image.max(set_layouts.len() as u32) * images,
                uniform_buffers: per_image(pools.uniform_buffers, DescriptorKind::UniformBuffer),
                storage_buffers: per_image(pools.storage_buffers, DescriptorKind::StorageBuffer),
                sampled_images: per_image(pools.sampled_images, DescriptorKind::SampledImage),
                samplers: per_image(pools.samplers, DescriptorKind::Sampler),
                combined_image_samplers: per_image(pools.combined_image_samplers, DescriptorKind::CombinedImageSampler),
                storage_images: per_image(pools.storage_images, DescriptorKind::StorageImage),
            })
            .context("Failed to create descriptor pool")?;

        for sets in group.sets.iter_mut() {
            match device.allocate_descriptor_sets(group.pool, set_layouts) {
                Ok(allocated) => *sets = allocated,
                Err(e) => {
                    device.destroy_descriptor_pool(group.pool);
                    return Err(e.context("Descriptor pool exhausted"));
                }
            }
        }
        Ok(group)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let objects = self.state.get_mut().objects.retired();
        self.gpu.destroyer().retire(objects);
    }
}
