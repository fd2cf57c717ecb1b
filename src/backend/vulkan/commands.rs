// Recording commands into Vulkan command buffers

use ash::vk;

use super::conv::{self, AsVk};
use super::VulkanDevice;
use crate::backend::types::*;

impl VulkanDevice {
    pub(super) fn record_command(&self, cb: vk::CommandBuffer, command: &Command<'_>) {
        let device = &self.device;

        unsafe {
            match *command {
                Command::Barrier(barrier) => {
                    let image_barrier = vk::ImageMemoryBarrier::builder()
                        .old_layout(conv::image_layout(barrier.old_state))
                        .new_layout(conv::image_layout(barrier.new_state))
                        .src_access_mask(conv::access(barrier.src_access))
                        .dst_access_mask(conv::access(barrier.dst_access))
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(barrier.image.vk())
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: conv::aspect(barrier.depth),
                            base_mip_level: 0,
                            level_count: vk::REMAINING_MIP_LEVELS,
                            base_array_layer: 0,
                            layer_count: vk::REMAINING_ARRAY_LAYERS,
                        })
                        .build();

                    // An empty stage mask is invalid; nothing-before / nothing-after
                    let src = if barrier.src_stages.is_empty() {
                        vk::PipelineStageFlags::TOP_OF_PIPE
                    } else {
                        conv::pipeline_stages(barrier.src_stages)
                    };
                    let dst = if barrier.dst_stages.is_empty() {
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE
                    } else {
                        conv::pipeline_stages(barrier.dst_stages)
                    };

                    device.cmd_pipeline_barrier(
                        cb,
                        src,
                        dst,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[image_barrier],
                    );
                }
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_color,
                } => {
                    // One value per color attachment, then depth. The trailing
                    // depth value is ignored when the pass has none.
                    let colors = self
                        .render_pass_colors
                        .lock()
                        .get(&render_pass.vk())
                        .copied()
                        .unwrap_or(1);
                    let mut clear_values = vec![
                        vk::ClearValue {
                            color: vk::ClearColorValue { float32: clear_color },
                        };
                        colors
                    ];
                    clear_values.push(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                    });
                    let begin_info = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass.vk())
                        .framebuffer(framebuffer.vk())
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: conv::extent(extent),
                        })
                        .clear_values(&clear_values);
                    device.cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cb),
                Command::BindPipeline(pipeline) => {
                    device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline.vk())
                }
                Command::BindDescriptorSets { layout, first_set, sets } => {
                    let sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| s.vk()).collect();
                    device.cmd_bind_descriptor_sets(
                        cb,
                        vk::PipelineBindPoint::GRAPHICS,
                        layout.vk(),
                        first_set,
                        &sets,
                        &[],
                    );
                }
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => device.cmd_push_constants(cb, layout.vk(), conv::shader_stages(stages), offset, data),
                Command::SetViewport(viewport) => {
                    let viewport = vk::Viewport {
                        x: viewport.x,
                        y: viewport.y,
                        width: viewport.width,
                        height: viewport.height,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    };
                    device.cmd_set_viewport(cb, 0, &[viewport]);
                }
                Command::SetScissor(extent) => {
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: conv::extent(extent),
                    };
                    device.cmd_set_scissor(cb, 0, &[scissor]);
                }
                Command::BindVertexBuffer { buffer, offset } => {
                    device.cmd_bind_vertex_buffers(cb, 0, &[buffer.vk()], &[offset])
                }
                Command::BindIndexBuffer { buffer, offset } => {
                    device.cmd_bind_index_buffer(cb, buffer.vk(), offset, vk::IndexType::UINT32)
                }
                Command::Draw { vertices, instances } => device.cmd_draw(cb, vertices, instances, 0, 0),
                Command::DrawIndexed { indices, instances } => {
                    device.cmd_draw_indexed(cb, indices, instances, 0, 0, 0)
                }
                Command::CopyBufferToImage { buffer, image, extent } => {
                    let region = vk::BufferImageCopy {
                        buffer_offset: 0,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                        image_extent: vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        },
                    };
                    device.cmd_copy_buffer_to_image(
                        cb,
                        buffer.vk(),
                        image.vk(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                Command::CopyImageToBuffer { image, buffer, extent } => {
                    let region = vk::BufferImageCopy {
                        buffer_offset: 0,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                        image_extent: vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        },
                    };
                    device.cmd_copy_image_to_buffer(
                        cb,
                        image.vk(),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        buffer.vk(),
                        &[region],
                    );
                }
            }
        }
    }
}
