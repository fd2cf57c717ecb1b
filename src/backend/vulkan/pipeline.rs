// Render passes, framebuffers, descriptors and graphics pipelines
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Viewport and scissor are dynamic so a pipeline survives swapchain resize.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;

use super::conv::{self, AsVk};
use super::VulkanDevice;
use crate::backend::types::*;

impl VulkanDevice {
    pub(super) fn build_render_pass(&self, desc: &RenderPassDesc) -> Result<RawRenderPass> {
        if desc.colors.is_empty() {
            anyhow::bail!("Render pass needs at least one color attachment");
        }

        // Color attachments. Presented targets start undefined and end in
        // PRESENT_SRC; offscreen targets return to their resting state.
        let mut attachments: Vec<vk::AttachmentDescription> = desc
            .colors
            .iter()
            .map(|color| {
                let (initial, final_layout) = if desc.present {
                    if color.clear {
                        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR)
                    } else {
                        (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::PRESENT_SRC_KHR)
                    }
                } else {
                    let resting = conv::image_layout(color.state);
                    (if color.clear { vk::ImageLayout::UNDEFINED } else { resting }, resting)
                };
                vk::AttachmentDescription::builder()
                    .format(conv::format(color.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(if color.clear { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial)
                    .final_layout(final_layout)
                    .build()
            })
            .collect();

        // Depth attachment, never stored
        if let Some(depth) = desc.depth {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(conv::format(depth.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(if depth.clear { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD })
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(if depth.clear {
                        vk::ImageLayout::UNDEFINED
                    } else {
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    })
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.colors.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.colors.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { self.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;
        Ok(RawRenderPass::from_vk(render_pass))
    }

    pub(super) fn build_framebuffer(&self, desc: &FramebufferDesc) -> Result<RawFramebuffer> {
        let attachments: Vec<vk::ImageView> = desc.attachments.iter().map(|v| v.vk()).collect();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(desc.render_pass.vk())
            .attachments(&attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);

        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")?;
        Ok(RawFramebuffer::from_vk(framebuffer))
    }

    pub(super) fn build_shader_module(&self, words: &[u32]) -> Result<RawShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;
        Ok(RawShaderModule::from_vk(module))
    }

    pub(super) fn build_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<RawDescriptorPool> {
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = [
            (vk::DescriptorType::UNIFORM_BUFFER, desc.uniform_buffers),
            (vk::DescriptorType::STORAGE_BUFFER, desc.storage_buffers),
            (vk::DescriptorType::SAMPLED_IMAGE, desc.sampled_images),
            (vk::DescriptorType::SAMPLER, desc.samplers),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, desc.combined_image_samplers),
            (vk::DescriptorType::STORAGE_IMAGE, desc.storage_images),
        ]
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect();

        // A pool needs at least one size even when nothing is declared
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            });
        }

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(desc.max_sets.max(1))
            .pool_sizes(&pool_sizes);

        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")?;
        Ok(RawDescriptorPool::from_vk(pool))
    }

    pub(super) fn build_set_layout(&self, bindings: &[SetLayoutBinding]) -> Result<RawSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(conv::descriptor_type(b.kind))
                    .descriptor_count(b.count)
                    .stage_flags(conv::shader_stages(b.stages))
                    .build()
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .context("Failed to create descriptor set layout")?;
        Ok(RawSetLayout::from_vk(layout))
    }

    pub(super) fn allocate_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[RawSetLayout],
    ) -> Result<Vec<RawDescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }

        let layouts: Vec<vk::DescriptorSetLayout> = layouts.iter().map(|l| l.vk()).collect();
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }
            .context("Failed to allocate descriptor sets")?;
        Ok(sets.into_iter().map(RawDescriptorSet::from_vk).collect())
    }

    pub(super) fn write_descriptors(&self, writes: &[DescriptorWrite]) {
        if writes.is_empty() {
            return;
        }

        // Infos first so the writes can point into stable storage
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for write in writes {
            match write.resource {
                DescriptorResource::Buffer {
                    buffer, offset, range, ..
                } => buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: buffer.vk(),
                    offset,
                    range,
                }),
                DescriptorResource::Image {
                    kind,
                    view,
                    sampler,
                    state,
                } => image_infos.push(vk::DescriptorImageInfo {
                    sampler: if kind == DescriptorKind::SampledImage || kind == DescriptorKind::StorageImage {
                        vk::Sampler::null()
                    } else {
                        sampler.vk()
                    },
                    image_view: if kind == DescriptorKind::Sampler {
                        vk::ImageView::null()
                    } else {
                        view.vk()
                    },
                    image_layout: conv::image_layout(state),
                }),
            }
        }

        let mut next_buffer = 0;
        let mut next_image = 0;
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|write| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set.vk())
                    .dst_binding(write.binding)
                    .dst_array_element(write.slot);
                match write.resource {
                    DescriptorResource::Buffer { kind, .. } => {
                        let info = &buffer_infos[next_buffer];
                        next_buffer += 1;
                        builder
                            .descriptor_type(conv::descriptor_type(kind))
                            .buffer_info(std::slice::from_ref(info))
                            .build()
                    }
                    DescriptorResource::Image { kind, .. } => {
                        let info = &image_infos[next_image];
                        next_image += 1;
                        builder
                            .descriptor_type(conv::descriptor_type(kind))
                            .image_info(std::slice::from_ref(info))
                            .build()
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    pub(super) fn build_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout> {
        let set_layouts: Vec<vk::DescriptorSetLayout> = set_layouts.iter().map(|l| l.vk()).collect();
        let push_constant_ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: conv::shader_stages(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;
        Ok(RawPipelineLayout::from_vk(layout))
    }

    pub(super) fn build_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<RawPipeline> {
        // Shader stages
        let entry_points = desc
            .stages
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("Shader entry point contains a NUL byte")?;
        let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(&entry_points)
            .map(|(stage, entry_point)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(conv::shader_stages(stage.stage))
                    .module(stage.module.vk())
                    .name(entry_point)
                    .build()
            })
            .collect();

        // Vertex input: one interleaved binding
        let (bindings, attributes) = match &desc.vertex_layout {
            Some(layout) => (
                vec![vk::VertexInputBindingDescription {
                    binding: 0,
                    stride: layout.stride,
                    input_rate: vk::VertexInputRate::VERTEX,
                }],
                layout
                    .attributes
                    .iter()
                    .map(|a| vk::VertexInputAttributeDescription {
                        location: a.location,
                        binding: 0,
                        format: conv::vertex_format(a.format),
                        offset: a.offset,
                    })
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the values are recorded per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(if desc.wireframe { vk::PolygonMode::LINE } else { vk::PolygonMode::FILL })
            .line_width(1.0)
            .cull_mode(conv::cull_mode(desc.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_test)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments =
            vec![blend_attachment(desc.blend); desc.color_attachments.max(1) as usize];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.vk())
            .render_pass(desc.render_pass.vk())
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

        let pipeline = pipelines.first().context("Driver returned no pipeline")?;
        Ok(RawPipeline::from_vk(*pipeline))
    }
}

fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let builder = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .color_blend_op(vk::BlendOp::ADD)
        .alpha_blend_op(vk::BlendOp::ADD);
    let (src, dst, src_alpha, dst_alpha) = match mode {
        BlendMode::None => return builder.blend_enable(false).build(),
        BlendMode::OneZero => (
            vk::BlendFactor::ONE,
            vk::BlendFactor::ZERO,
            vk::BlendFactor::ONE,
            vk::BlendFactor::ZERO,
        ),
        BlendMode::SrcAlphaOneMinusSrcAlpha => (
            vk::BlendFactor::SRC_ALPHA,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            vk::BlendFactor::ONE,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        ),
        BlendMode::ZeroSrcColor => (
            vk::BlendFactor::ZERO,
            vk::BlendFactor::SRC_COLOR,
            vk::BlendFactor::ZERO,
            vk::BlendFactor::SRC_ALPHA,
        ),
    };
    builder
        .blend_enable(true)
        .src_color_blend_factor(src)
        .dst_color_blend_factor(dst)
        .src_alpha_blend_factor(src_alpha)
        .dst_alpha_blend_factor(dst_alpha)
        .build()
}
