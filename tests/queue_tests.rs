//! Command Queue Tests
//!
//! Tests for:
//! - Fence-checked recycling of pool command lists
//! - Draining a queue with wait()
//! - Command list state machine and queue ownership
//! - Deferred destruction bound to both queue timelines

mod common;

use common::harness;
use render_core::backend::headless::{CompletionMode, HeadlessDevice, ObjectKind};
use render_core::backend::QueueKind;
use render_core::queue::ListState;
use render_core::{QueueError, UniformBuffer};

fn queue_error(err: &anyhow::Error) -> QueueError {
    err.downcast_ref::<QueueError>().cloned().expect("queue error")
}

// ============================================================================
// Recycling
// ============================================================================

#[test]
fn lists_are_recycled_only_after_their_fence() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let graphics = h.ctx.gpu().graphics();

    let mut raws = Vec::new();
    let mut values = Vec::new();
    for _ in 0..3 {
        let mut list = graphics.get().unwrap();
        list.begin().unwrap();
        raws.push(list.raw());
        values.push(graphics.submit(list, false).unwrap());
    }
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(graphics.live_lists(), 3);
    assert_eq!(graphics.pending_lists(), 3);

    // Front still pending: a fresh list is allocated
    let fresh = graphics.get().unwrap();
    assert!(!raws.contains(&fresh.raw()));
    drop(fresh);

    h.device.complete_through(QueueKind::Graphics, values[0]);
    let recycled = graphics.get().unwrap();
    assert_eq!(recycled.raw(), raws[0]);
    assert_eq!(recycled.state(), ListState::Idle);
    assert_eq!(h.device.list_fence(recycled.raw()), Some(values[0]));

    assert_eq!(h.device.stats().fence_violations, 0);
    assert_eq!(h.device.stats().stalls, 1);
}

#[test]
fn wait_drains_all_outstanding_work() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let graphics = h.ctx.gpu().graphics();

    for _ in 0..4 {
        let mut list = graphics.get().unwrap();
        list.begin().unwrap();
        graphics.submit(list, false).unwrap();
    }
    assert_eq!(h.device.outstanding_submissions(), 4);

    graphics.wait().unwrap();
    assert_eq!(h.device.outstanding_submissions(), 0);
    assert!(graphics.is_complete(graphics.last_submitted()).unwrap());
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn out_of_order_use_is_refused() {
    let h = harness(HeadlessDevice::new());
    let graphics = h.ctx.gpu().graphics();

    let mut list = graphics.get().unwrap();
    let err = list.end().unwrap_err();
    assert!(matches!(queue_error(&err), QueueError::InvalidState { .. }));
    assert!(list.draw(3, 1).is_err());

    list.begin().unwrap();
    assert_eq!(list.state(), ListState::Recording);
    let err = list.begin().unwrap_err();
    assert!(matches!(queue_error(&err), QueueError::InvalidState { .. }));
}

#[test]
fn list_submitted_to_foreign_queue_is_refused() {
    let h = harness(HeadlessDevice::new());
    let gpu = h.ctx.gpu();

    let mut list = gpu.transfer().get().unwrap();
    list.begin().unwrap();
    let err = gpu.graphics().submit(list, false).unwrap_err();
    assert_eq!(
        queue_error(&err),
        QueueError::WrongQueue {
            owner: QueueKind::Transfer,
            queue: QueueKind::Graphics,
        }
    );
}

// ============================================================================
// Deferred destruction
// ============================================================================

#[test]
fn dropped_buffer_outlives_pending_work() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let gpu = h.ctx.gpu();
    let buffers = h.device.live_objects(ObjectKind::Buffer);

    let uniform = UniformBuffer::new(gpu, 64).unwrap();
    let mut list = gpu.graphics().get().unwrap();
    list.begin().unwrap();
    let value = gpu.graphics().submit(list, false).unwrap();

    drop(uniform);
    assert_eq!(gpu.destroyer().collect().unwrap(), 0);
    assert_eq!(h.device.live_objects(ObjectKind::Buffer), buffers + 1);

    h.device.complete_through(QueueKind::Graphics, value);
    assert_eq!(gpu.destroyer().collect().unwrap(), 1);
    assert_eq!(h.device.live_objects(ObjectKind::Buffer), buffers);
}
