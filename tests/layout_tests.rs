//! Layout Tracker Tests
//!
//! Tests for:
//! - set_layout with a caller-owned list (barrier only, no submission)
//! - set_layout without a list (transfer submission, waited on)
//! - Image uploads through a staging buffer
//! - Image read back through a staging buffer
//! - Texture observers registered and deregistered with their image

mod common;

use common::harness;
use render_core::backend::headless::{CompletionMode, HeadlessDevice, ObjectKind, RecordedCommand};
use render_core::backend::{AccessFlags, Extent2D, ImageFormat, ImageState, PipelineStages, QueueKind, SamplerDesc};
use render_core::{Image, Texture};

// ============================================================================
// set_layout
// ============================================================================

#[test]
fn transition_into_caller_list_is_not_submitted() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let image = Image::new_2d(gpu, Extent2D::new(4, 4), ImageFormat::Rgba8Unorm).unwrap();

    let submissions = h.device.stats().submissions;
    let mut list = gpu.graphics().get().unwrap();
    list.begin().unwrap();
    image.set_layout(ImageState::TransferDst, Some(&mut list)).unwrap();

    assert_eq!(image.state(), ImageState::TransferDst);
    assert_eq!(h.device.stats().submissions, submissions);
    assert_eq!(h.device.image_state(image.raw()), Some(ImageState::Undefined));

    let commands = h.device.commands(list.raw());
    let barrier = match commands.as_slice() {
        [RecordedCommand::Barrier(barrier)] => *barrier,
        other => panic!("expected one barrier, got {other:?}"),
    };
    assert_eq!(barrier.old_state, ImageState::Undefined);
    assert_eq!(barrier.new_state, ImageState::TransferDst);
    assert_eq!(barrier.src_stages, PipelineStages::TOP_OF_PIPE);
    assert_eq!(barrier.src_access, AccessFlags::empty());
    assert_eq!(barrier.dst_stages, PipelineStages::TRANSFER);
    assert_eq!(barrier.dst_access, AccessFlags::TRANSFER_WRITE);
    assert!(!barrier.depth);

    gpu.graphics().submit(list, true).unwrap();
    assert_eq!(h.device.image_state(image.raw()), Some(ImageState::TransferDst));
}

#[test]
fn transition_without_list_submits_and_waits() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let gpu = h.ctx.gpu();
    let image = Image::new_2d(gpu, Extent2D::new(4, 4), ImageFormat::Rgba8Unorm).unwrap();

    let before = h.device.submitted_value(QueueKind::Transfer);
    image.set_layout(ImageState::ShaderReadOnly, None).unwrap();

    let value = h.device.submitted_value(QueueKind::Transfer);
    assert_eq!(value, before + 1);
    assert!(gpu.transfer().is_complete(value).unwrap());
    assert_eq!(h.device.image_state(image.raw()), Some(ImageState::ShaderReadOnly));
    assert_eq!(h.device.outstanding_submissions(), 0);
}

#[test]
fn chained_transitions_follow_tracked_state() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let image = Image::new_2d(gpu, Extent2D::new(8, 8), ImageFormat::Rgba8Unorm).unwrap();

    let mut list = gpu.graphics().get().unwrap();
    list.begin().unwrap();
    for state in [
        ImageState::TransferDst,
        ImageState::ShaderReadOnly,
        ImageState::General,
        ImageState::TransferSrc,
    ] {
        image.set_layout(state, Some(&mut list)).unwrap();
    }
    gpu.graphics().submit(list, true).unwrap();

    assert_eq!(h.device.image_state(image.raw()), Some(ImageState::TransferSrc));
    assert_eq!(h.device.stats().layout_mismatches, 0);
}

#[test]
fn depth_images_get_depth_barriers() {
    let h = harness(HeadlessDevice::new());
    let image = Image::new(
        h.ctx.gpu(),
        render_core::backend::ImageDesc {
            extent: Extent2D::new(16, 16),
            format: ImageFormat::Depth32Float,
            usage: render_core::backend::ImageUsage::DEPTH_STENCIL_ATTACHMENT,
            mip_levels: 1,
        },
    )
    .unwrap();

    let barrier = image.barrier(ImageState::Undefined, ImageState::DepthStencilAttachment);
    assert!(barrier.depth);
    assert!(barrier.dst_access.contains(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
}

// ============================================================================
// Uploads
// ============================================================================

#[test]
fn upload_leaves_image_shader_readable() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let image = Image::new_2d(gpu, Extent2D::new(2, 2), ImageFormat::Rgba8Unorm).unwrap();
    let buffers = h.device.live_objects(ObjectKind::Buffer);

    image.upload(&common::pixels(2, 2, [9, 9, 9, 255])).unwrap();

    assert_eq!(image.state(), ImageState::ShaderReadOnly);
    assert_eq!(h.device.image_state(image.raw()), Some(ImageState::ShaderReadOnly));
    assert_eq!(h.device.stats().layout_mismatches, 0);
    // The staging buffer is gone once the copy completed
    assert_eq!(h.device.live_objects(ObjectKind::Buffer), buffers);
}

#[test]
fn upload_size_must_match_extent() {
    let h = harness(HeadlessDevice::new());
    let image = Image::new_2d(h.ctx.gpu(), Extent2D::new(2, 2), ImageFormat::Rgba8Unorm).unwrap();
    assert!(image.upload(&[0; 15]).is_err());
    assert_eq!(image.state(), ImageState::Undefined);
}

// ============================================================================
// Read back
// ============================================================================

#[test]
fn read_back_returns_uploaded_pixels() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let image = Image::new_2d(gpu, Extent2D::new(3, 2), ImageFormat::Rgba8Unorm).unwrap();
    let pixels = common::pixels(3, 2, [12, 34, 56, 255]);
    image.upload(&pixels).unwrap();
    let buffers = h.device.live_objects(ObjectKind::Buffer);
    let graphics = h.device.submitted_value(QueueKind::Graphics);

    assert_eq!(image.read_back().unwrap(), pixels);

    // Copied on the graphics queue and returned to where it was
    assert_eq!(h.device.submitted_value(QueueKind::Graphics), graphics + 1);
    assert_eq!(image.state(), ImageState::ShaderReadOnly);
    assert_eq!(h.device.image_state(image.raw()), Some(ImageState::ShaderReadOnly));
    assert_eq!(h.device.stats().layout_mismatches, 0);
    assert_eq!(h.device.live_objects(ObjectKind::Buffer), buffers);
}

#[test]
fn read_back_waits_for_the_copy() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let image = Image::new_2d(h.ctx.gpu(), Extent2D::new(1, 1), ImageFormat::Rgba8Unorm).unwrap();
    image.upload(&[1, 2, 3, 4]).unwrap();

    assert_eq!(image.read_back().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(h.device.outstanding_submissions(), 0);
}

#[test]
fn read_back_of_undefined_image_is_refused() {
    let h = harness(HeadlessDevice::new());
    let image = Image::new_2d(h.ctx.gpu(), Extent2D::new(2, 2), ImageFormat::Rgba8Unorm).unwrap();
    let submissions = h.device.stats().submissions;

    assert!(image.read_back().is_err());
    assert_eq!(h.device.stats().submissions, submissions);
}

#[test]
fn read_back_needs_transfer_source_usage() {
    let h = harness(HeadlessDevice::new());
    let image = Image::new(
        h.ctx.gpu(),
        render_core::backend::ImageDesc {
            extent: Extent2D::new(2, 2),
            format: ImageFormat::Rgba8Unorm,
            usage: render_core::backend::ImageUsage::SAMPLED | render_core::backend::ImageUsage::TRANSFER_DST,
            mip_levels: 1,
        },
    )
    .unwrap();
    image.upload(&common::pixels(2, 2, [1, 1, 1, 1])).unwrap();

    assert!(image.read_back().is_err());
    assert_eq!(image.state(), ImageState::ShaderReadOnly);
}

// ============================================================================
// Texture observers
// ============================================================================

#[test]
fn texture_observes_its_image_until_dropped() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let image = Image::new_2d(gpu, Extent2D::new(2, 2), ImageFormat::Rgba8Unorm).unwrap();

    let texture = Texture::new(gpu, image.clone(), SamplerDesc::default()).unwrap();
    assert_eq!(image.state(), ImageState::ShaderReadOnly);
    assert_eq!(image.dependent_count(), 1);
    assert_eq!(texture.version(), 0);

    image.set_layout(ImageState::TransferDst, None).unwrap();
    image.set_layout(ImageState::ShaderReadOnly, None).unwrap();
    assert_eq!(texture.version(), 2);

    drop(texture);
    assert_eq!(image.dependent_count(), 0);
    // No observer left to notify
    image.set_layout(ImageState::General, None).unwrap();
}

#[test]
fn storage_textures_live_in_general_layout() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();
    let image = Image::new(
        gpu,
        render_core::backend::ImageDesc {
            extent: Extent2D::new(4, 4),
            format: ImageFormat::Rgba8Unorm,
            usage: render_core::backend::ImageUsage::STORAGE | render_core::backend::ImageUsage::SAMPLED,
            mip_levels: 1,
        },
    )
    .unwrap();

    let texture = Texture::new(gpu, image, SamplerDesc::default()).unwrap();
    assert_eq!(texture.image().state(), ImageState::General);
}
