//! Swapchain Tests
//!
//! Tests for:
//! - Sync slot cycling independent of the acquired image index
//! - Frame pacing: never more than M frames outstanding
//! - Image reacquired before its slot was waited on
//! - Rebuild on stale acquire/present, explicit resize, degenerate and zero-area surfaces
//! - Resize idempotence and leak-free teardown

mod common;

use std::collections::VecDeque;

use common::{harness, swapchain, CLEAR};
use render_core::backend::headless::{AcquireOrder, CompletionMode, HeadlessDevice, ObjectKind};
use render_core::backend::{Extent2D, ImageFormat};
use render_core::{Swapchain, SwapchainError};

/// Acquire, draw a triangle and present; returns the image index used
fn frame(swapchain: &mut Swapchain) -> usize {
    assert!(swapchain.new_frame().unwrap(), "surface unexpectedly suspended");
    let index = swapchain.current_image_index();
    swapchain.begin_render_pass(CLEAR).unwrap();
    swapchain.current_command_list().unwrap().draw(3, 1).unwrap();
    swapchain.present().unwrap();
    index
}

const ALL_KINDS: [ObjectKind; 16] = [
    ObjectKind::CommandList,
    ObjectKind::Semaphore,
    ObjectKind::Surface,
    ObjectKind::Swapchain,
    ObjectKind::Image,
    ObjectKind::ImageView,
    ObjectKind::Sampler,
    ObjectKind::Buffer,
    ObjectKind::RenderPass,
    ObjectKind::Framebuffer,
    ObjectKind::ShaderModule,
    ObjectKind::DescriptorPool,
    ObjectKind::SetLayout,
    ObjectKind::DescriptorSet,
    ObjectKind::PipelineLayout,
    ObjectKind::Pipeline,
];

fn live(device: &HeadlessDevice) -> Vec<usize> {
    ALL_KINDS.iter().map(|&kind| device.live_objects(kind)).collect()
}

// ============================================================================
// Frame loop
// ============================================================================

#[test]
fn five_frames_cycle_two_slots_over_three_images() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    assert_eq!(sc.image_count(), 3);
    assert_eq!(sc.frames_in_flight(), 2);

    let mut slots = Vec::new();
    for _ in 0..5 {
        slots.push(sc.frame_index());
        assert!(sc.new_frame().unwrap());

        let index = sc.current_image_index();
        assert!(index < 3, "image index {index} out of range");
        let fence = sc.image_fence(index).unwrap();
        assert!(h.ctx.gpu().graphics().is_complete(fence).unwrap());

        sc.begin_render_pass(CLEAR).unwrap();
        sc.present().unwrap();
    }

    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    assert_eq!(sc.submit_count(), 5);

    let stats = h.device.stats();
    assert_eq!(stats.presents, 5);
    assert_eq!(stats.stalls, 0);
    assert_eq!(stats.fence_violations, 0);
}

#[test]
fn frames_in_flight_is_clamped_to_image_count() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 5);
    assert_eq!(sc.frames_in_flight(), 3);
}

#[test]
fn outstanding_frames_never_exceed_slot_count() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let mut sc = swapchain(&h, 3, 2);

    for n in 0..12 {
        frame(&mut sc);
        assert!(sc.outstanding_frames().unwrap() <= 2);
        assert!(h.device.outstanding_submissions() <= 2);
        // The GPU catches up only every third frame
        if n % 3 == 0 {
            h.device.complete_all();
        }
    }

    let stats = h.device.stats();
    assert_eq!(stats.fence_violations, 0);
    assert_eq!(stats.hazards, 0);
    assert_eq!(stats.layout_mismatches, 0);
}

#[test]
fn reacquired_image_waits_for_its_own_fence() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let mut sc = swapchain(&h, 3, 2);
    h.device.set_acquire_order(AcquireOrder::Scripted(VecDeque::from([0, 0])));

    assert_eq!(frame(&mut sc), 0);
    let first = sc.image_fence(0).unwrap();
    assert!(!h.ctx.gpu().graphics().is_complete(first).unwrap());

    // Slot 1 has never been used, so only the image fence can block
    let stalls = h.device.stats().stalls;
    assert!(sc.new_frame().unwrap());
    assert_eq!(sc.current_image_index(), 0);
    assert!(h.ctx.gpu().graphics().is_complete(first).unwrap());
    assert_eq!(h.device.stats().stalls, stalls + 1);

    sc.present().unwrap();
    assert_eq!(h.device.stats().fence_violations, 0);
}

#[test]
fn present_without_acquire_is_rejected() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    let err = sc.present().unwrap_err();
    assert_eq!(err.downcast_ref::<SwapchainError>(), Some(&SwapchainError::NotAcquired));
    assert!(sc.current_command_list().is_err());
}

// ============================================================================
// Rebuild
// ============================================================================

#[test]
fn stale_acquire_rebuilds_and_retries() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    let render_pass = sc.render_pass().clone();

    h.device.inject_acquire_out_of_date(1);
    frame(&mut sc);

    assert_eq!(sc.generation(), 1);
    assert_eq!(h.device.stats().swapchains_created, 2);
    assert_eq!(h.device.live_objects(ObjectKind::Swapchain), 1);
    assert!(render_core::handle::ResourceHandle::ptr_eq(&render_pass, sc.render_pass()));
}

#[test]
fn stale_present_rebuilds_and_keeps_slot_order() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);

    h.device.inject_present_out_of_date(1);
    frame(&mut sc);
    assert_eq!(sc.generation(), 1);
    assert_eq!(sc.frame_index(), 1);

    frame(&mut sc);
    assert_eq!(sc.frame_index(), 0);
    assert_eq!(sc.generation(), 1);
}

#[test]
fn permanently_stale_surface_gives_up() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    h.device.inject_acquire_out_of_date(1000);
    assert!(sc.new_frame().is_err());
}

#[test]
fn resize_to_degenerate_and_back() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    frame(&mut sc);

    h.device.set_surface_extent(Extent2D::new(1, 1));
    sc.on_resize(1, 1);
    frame(&mut sc);
    assert_eq!(sc.extent(), Extent2D::new(1, 1));

    h.device.set_surface_extent(Extent2D::new(800, 600));
    sc.on_resize(800, 600);
    frame(&mut sc);

    assert_eq!(sc.extent(), Extent2D::new(800, 600));
    assert_eq!(sc.image_count(), 3);
    assert_eq!(sc.generation(), 2);
    assert_eq!(h.device.live_objects(ObjectKind::Framebuffer), 3);
    assert_eq!(h.device.stats().hazards, 0);
}

#[test]
fn zero_area_surface_suspends_rendering() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    frame(&mut sc);

    h.device.set_surface_extent(Extent2D::new(0, 0));
    sc.on_resize(0, 0);
    assert!(!sc.new_frame().unwrap());
    assert!(sc.is_suspended());
    assert!(!sc.new_frame().unwrap());
    assert_eq!(h.device.stats().presents, 1);

    h.device.set_surface_extent(Extent2D::new(640, 480));
    sc.on_resize(640, 480);
    frame(&mut sc);
    assert!(!sc.is_suspended());
    assert_eq!(sc.extent(), Extent2D::new(640, 480));
}

#[test]
fn resize_twice_to_same_extent_is_idempotent() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let mut sc = swapchain(&h, 3, 2);
    frame(&mut sc);
    frame(&mut sc);

    let extent = Extent2D::new(800, 600);
    sc.resize(extent).unwrap();
    h.ctx.gpu().destroyer().collect().unwrap();
    let first = (sc.image_count(), sc.format(), sc.extent(), live(&h.device));

    sc.resize(extent).unwrap();
    h.ctx.gpu().destroyer().collect().unwrap();
    let second = (sc.image_count(), sc.format(), sc.extent(), live(&h.device));

    assert_eq!(first, second);
    assert_eq!(h.device.live_objects(ObjectKind::Swapchain), 1);
    assert_eq!(h.device.stats().hazards, 0);

    frame(&mut sc);
    assert_eq!(h.device.stats().fence_violations, 0);
}

#[test]
fn format_change_across_resize_is_an_error() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    assert_eq!(sc.format(), ImageFormat::Bgra8Unorm);

    h.device.set_surface_format(ImageFormat::Rgba8Unorm);
    let err = sc.resize(Extent2D::new(800, 600)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SwapchainError>(),
        Some(SwapchainError::FormatChanged { .. })
    ));
}

#[test]
fn dropping_everything_leaks_nothing() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let mut sc = swapchain(&h, 3, 2);
    for _ in 0..4 {
        frame(&mut sc);
    }
    sc.on_resize(800, 600);
    frame(&mut sc);

    drop(sc);
    assert_eq!(h.device.live_objects(ObjectKind::Swapchain), 0);
    assert_eq!(h.device.live_objects(ObjectKind::Framebuffer), 0);
    assert_eq!(h.device.live_objects(ObjectKind::Surface), 0);
    assert_eq!(h.device.live_objects(ObjectKind::Semaphore), 0);

    let device = h.device.clone();
    h.ctx.shutdown().unwrap();
    assert!(live(&device).iter().all(|&count| count == 0), "leaked: {:?}", live(&device));
    assert_eq!(device.stats().hazards, 0);
}
