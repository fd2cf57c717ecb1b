//! Offscreen Framebuffer Tests
//!
//! Tests for:
//! - Clear-on-load passes filling every color attachment
//! - Load passes keeping contents and resting states
//! - Blend modes carried into pipelines built for a framebuffer
//! - Sampled attachments handed to textures and reclaimed by the next pass
//! - resize() rebuilding attachments behind the same render pass
//! - Refusal of unusable attachment lists and extents
//! - Deferred destruction on drop

mod common;

use common::harness;
use render_core::backend::headless::{CompletionMode, HeadlessDevice, ObjectKind, RecordedCommand};
use render_core::backend::{BlendMode, Extent2D, ImageFormat, ImageState, SamplerDesc};
use render_core::{
    Framebuffer, FramebufferAttachment, FramebufferError, FramebufferSpec, PipelineDesc, ResourceHandle, Texture,
};

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

fn spec(width: u32, height: u32, attachments: Vec<FramebufferAttachment>) -> FramebufferSpec {
    FramebufferSpec::new(Extent2D::new(width, height), attachments)
}

/// One pass with nothing drawn, submitted and waited on
fn run_pass(h: &common::Harness, framebuffer: &Framebuffer, clear_color: [f32; 4]) {
    let graphics = h.ctx.gpu().graphics();
    let mut list = graphics.get().unwrap();
    list.begin().unwrap();
    framebuffer.begin(&mut list, clear_color).unwrap();
    framebuffer.end(&mut list).unwrap();
    list.end().unwrap();
    graphics.submit(list, true).unwrap();
}

fn framebuffer_error(err: &anyhow::Error) -> Option<&FramebufferError> {
    err.downcast_ref::<FramebufferError>()
}

// ============================================================================
// Passes
// ============================================================================

#[test]
fn clearing_pass_fills_every_attachment() {
    let h = harness(HeadlessDevice::new());
    let fb = h
        .ctx
        .create_framebuffer(spec(
            4,
            2,
            vec![
                FramebufferAttachment::color(ImageFormat::Rgba8Unorm),
                FramebufferAttachment::sampled(ImageFormat::Rgba32Float),
            ],
        ))
        .unwrap();

    run_pass(&h, &fb, [1.0, 0.5, 0.0, 1.0]);

    let color = fb.attachment(0).unwrap().read_back().unwrap();
    assert_eq!(color, common::pixels(4, 2, [255, 128, 0, 255]));

    let float: Vec<u8> = [1.0f32, 0.5, 0.0, 1.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .cycle()
        .take(4 * 2 * 16)
        .collect();
    assert_eq!(fb.attachment(1).unwrap().read_back().unwrap(), float);

    assert_eq!(fb.attachment(0).unwrap().state(), ImageState::ColorAttachment);
    assert_eq!(fb.attachment(1).unwrap().state(), ImageState::General);
    assert_eq!(h.device.stats().layout_mismatches, 0);
}

#[test]
fn bgra_attachments_store_channels_swapped() {
    let h = harness(HeadlessDevice::new());
    let fb = h
        .ctx
        .create_framebuffer(spec(2, 2, vec![FramebufferAttachment::color(ImageFormat::Bgra8Unorm)]))
        .unwrap();

    run_pass(&h, &fb, RED);

    assert_eq!(
        fb.attachment(0).unwrap().read_back().unwrap(),
        common::pixels(2, 2, [0, 0, 255, 255])
    );
}

#[test]
fn loading_pass_keeps_previous_contents() {
    let h = harness(HeadlessDevice::new());
    let mut load = spec(2, 2, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]);
    load.clear_on_load = false;
    let fb = h.ctx.create_framebuffer(load).unwrap();

    run_pass(&h, &fb, RED);

    assert_eq!(fb.attachment(0).unwrap().read_back().unwrap(), vec![0; 16]);
    assert_eq!(h.device.image_state(fb.attachment(0).unwrap().raw()), Some(ImageState::ColorAttachment));
    assert_eq!(h.device.stats().layout_mismatches, 0);
}

#[test]
fn begin_records_pass_with_framebuffer_extent() {
    let h = harness(HeadlessDevice::new());
    let fb = h
        .ctx
        .create_framebuffer(spec(64, 32, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]))
        .unwrap();

    let mut list = h.ctx.gpu().graphics().get().unwrap();
    list.begin().unwrap();
    fb.begin(&mut list, RED).unwrap();
    fb.end(&mut list).unwrap();

    let commands = h.device.commands(list.raw());
    assert!(matches!(
        commands.first(),
        Some(RecordedCommand::BeginRenderPass { framebuffer, extent, clear_color, .. })
            if *framebuffer == fb.raw() && *extent == Extent2D::new(64, 32) && *clear_color == RED
    ));
    assert_eq!(commands.last(), Some(&RecordedCommand::EndRenderPass));
}

// ============================================================================
// Blending
// ============================================================================

#[test]
fn pipelines_take_the_framebuffer_blend_mode() {
    let h = harness(HeadlessDevice::new());
    for blend in [
        BlendMode::None,
        BlendMode::OneZero,
        BlendMode::SrcAlphaOneMinusSrcAlpha,
        BlendMode::ZeroSrcColor,
    ] {
        let mut blended = spec(
            8,
            8,
            vec![
                FramebufferAttachment::color(ImageFormat::Rgba8Unorm),
                FramebufferAttachment::color(ImageFormat::Rgba16Float),
            ],
        );
        blended.blend = blend;
        let fb = h.ctx.create_framebuffer(blended).unwrap();

        let desc = PipelineDesc::for_framebuffer(h.ctx.shader("textured").unwrap(), &fb);
        let pipeline = h.ctx.create_pipeline(desc, 1).unwrap();

        assert_eq!(h.device.pipeline_blend(pipeline.raw()), Some((blend, 2)));
    }
}

// ============================================================================
// Sampling attachments
// ============================================================================

#[test]
fn sampled_attachment_returns_to_its_resting_state_for_the_next_pass() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let fb = h
        .ctx
        .create_framebuffer(spec(2, 2, vec![FramebufferAttachment::sampled(ImageFormat::Rgba8Unorm)]))
        .unwrap();
    run_pass(&h, &fb, RED);

    let texture = Texture::new(gpu, fb.attachment(0).unwrap().clone(), SamplerDesc::default()).unwrap();
    assert_eq!(texture.image().state(), ImageState::ShaderReadOnly);
    let version = texture.version();

    let mut list = gpu.graphics().get().unwrap();
    list.begin().unwrap();
    fb.begin(&mut list, RED).unwrap();
    let commands = h.device.commands(list.raw());
    assert!(matches!(
        commands.first(),
        Some(RecordedCommand::Barrier(b))
            if b.old_state == ImageState::ShaderReadOnly && b.new_state == ImageState::General
    ));
    fb.end(&mut list).unwrap();
    list.end().unwrap();
    gpu.graphics().submit(list, true).unwrap();

    assert_eq!(texture.version(), version + 1);
    assert_eq!(h.device.image_state(texture.image().raw()), Some(ImageState::General));
    assert_eq!(texture.image().read_back().unwrap(), common::pixels(2, 2, [255, 0, 0, 255]));
    assert_eq!(h.device.stats().layout_mismatches, 0);
}

// ============================================================================
// Resize
// ============================================================================

#[test]
fn resize_rebuilds_attachments_behind_the_same_render_pass() {
    let h = harness(HeadlessDevice::new());
    let mut fb = h
        .ctx
        .create_framebuffer(spec(4, 4, vec![FramebufferAttachment::sampled(ImageFormat::Rgba8Unorm)]))
        .unwrap();
    let render_pass = fb.render_pass().clone();
    let old = fb.attachment(0).unwrap().clone();
    let old_raw = fb.raw();
    let images = h.device.live_objects(ObjectKind::Image);

    fb.resize(Extent2D::new(16, 8)).unwrap();

    assert_eq!(fb.extent(), Extent2D::new(16, 8));
    assert_ne!(fb.raw(), old_raw);
    assert!(ResourceHandle::ptr_eq(fb.render_pass(), &render_pass));
    let new = fb.attachment(0).unwrap();
    assert!(!ResourceHandle::ptr_eq(new, &old));
    assert_eq!(new.extent(), Extent2D::new(16, 8));
    assert_eq!(new.state(), ImageState::General);

    // The old image survives while someone still holds it
    h.ctx.gpu().destroyer().collect().unwrap();
    assert_eq!(h.device.live_objects(ObjectKind::Image), images + 1);
    assert_eq!(h.device.live_objects(ObjectKind::Framebuffer), 1);

    drop(old);
    h.ctx.gpu().destroyer().collect().unwrap();
    assert_eq!(h.device.live_objects(ObjectKind::Image), images);

    run_pass(&h, &fb, RED);
    assert_eq!(
        fb.attachment(0).unwrap().read_back().unwrap(),
        common::pixels(16, 8, [255, 0, 0, 255])
    );
}

#[test]
fn resize_to_same_extent_keeps_everything() {
    let h = harness(HeadlessDevice::new());
    let mut fb = h
        .ctx
        .create_framebuffer(spec(4, 4, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]))
        .unwrap();
    let raw = fb.raw();
    let image = fb.attachment(0).unwrap().clone();

    fb.resize(Extent2D::new(4, 4)).unwrap();

    assert_eq!(fb.raw(), raw);
    assert!(ResourceHandle::ptr_eq(fb.attachment(0).unwrap(), &image));
}

#[test]
fn resize_to_zero_is_refused() {
    let h = harness(HeadlessDevice::new());
    let mut fb = h
        .ctx
        .create_framebuffer(spec(4, 4, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]))
        .unwrap();
    let raw = fb.raw();

    let err = fb.resize(Extent2D::new(0, 600)).unwrap_err();
    assert_eq!(
        framebuffer_error(&err),
        Some(&FramebufferError::ZeroExtent { width: 0, height: 600 })
    );
    assert_eq!(fb.extent(), Extent2D::new(4, 4));
    assert_eq!(fb.raw(), raw);
}

// ============================================================================
// Validation and lifetime
// ============================================================================

#[test]
fn invalid_specs_are_refused() {
    let h = harness(HeadlessDevice::new());

    let err = h
        .ctx
        .create_framebuffer(spec(0, 4, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]))
        .unwrap_err();
    assert_eq!(
        framebuffer_error(&err),
        Some(&FramebufferError::ZeroExtent { width: 0, height: 4 })
    );

    let err = h.ctx.create_framebuffer(spec(4, 4, Vec::new())).unwrap_err();
    assert_eq!(framebuffer_error(&err), Some(&FramebufferError::NoAttachments));

    let err = h
        .ctx
        .create_framebuffer(spec(
            4,
            4,
            vec![
                FramebufferAttachment::color(ImageFormat::Rgba8Unorm),
                FramebufferAttachment::color(ImageFormat::Depth32Float),
            ],
        ))
        .unwrap_err();
    assert_eq!(
        framebuffer_error(&err),
        Some(&FramebufferError::DepthAttachment {
            index: 1,
            format: ImageFormat::Depth32Float
        })
    );
    assert_eq!(h.device.live_objects(ObjectKind::RenderPass), 0);
}

#[test]
fn attachment_index_is_checked() {
    let h = harness(HeadlessDevice::new());
    let fb = h
        .ctx
        .create_framebuffer(spec(4, 4, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]))
        .unwrap();

    assert_eq!(fb.attachment_count(), 1);
    let err = fb.attachment(1).unwrap_err();
    assert_eq!(
        framebuffer_error(&err),
        Some(&FramebufferError::AttachmentOutOfRange { index: 1, count: 1 })
    );
}

#[test]
fn dropped_framebuffer_outlives_its_last_pass() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let graphics = h.ctx.gpu().graphics();
    let fb = h
        .ctx
        .create_framebuffer(spec(4, 4, vec![FramebufferAttachment::color(ImageFormat::Rgba8Unorm)]))
        .unwrap();
    let images = h.device.live_objects(ObjectKind::Image);

    let mut list = graphics.get().unwrap();
    list.begin().unwrap();
    fb.begin(&mut list, RED).unwrap();
    fb.end(&mut list).unwrap();
    list.end().unwrap();
    graphics.submit(list, false).unwrap();

    drop(fb);
    h.ctx.gpu().destroyer().collect().unwrap();
    assert_eq!(h.device.live_objects(ObjectKind::Framebuffer), 1);
    assert_eq!(h.device.live_objects(ObjectKind::RenderPass), 1);

    h.device.complete_all();
    h.ctx.gpu().destroyer().collect().unwrap();
    assert_eq!(h.device.live_objects(ObjectKind::Framebuffer), 0);
    assert_eq!(h.device.live_objects(ObjectKind::RenderPass), 0);
    assert_eq!(h.device.live_objects(ObjectKind::Image), images - 1);
    assert_eq!(h.device.stats().hazards, 0);
}
