//! Pipeline & Descriptor Binder Tests
//!
//! Tests for:
//! - Bindings written into the set of every presentable image
//! - Fallback texture in unassigned sampled slots
//! - Kind conflicts and other binding contract violations
//! - invalidate() replaying bindings independent of bind order
//! - Per-image set reallocation after the image count changes
//! - Stale descriptors refreshed after an image transition

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{harness, resource, shader_with, swapchain, Harness, CLEAR};
use render_core::backend::headless::{CompletionMode, HeadlessDevice, ObjectKind, RecordedCommand};
use render_core::backend::{DescriptorKind, DescriptorResource, Extent2D, ImageState, RawDescriptorSet};
use render_core::shader::ResourceKind;
use render_core::{BindingError, LayoutError, Pipeline, PipelineDesc, Swapchain, Texture, UniformBuffer};

fn pipeline(h: &Harness, sc: &Swapchain) -> Arc<Pipeline> {
    let shader = h.ctx.shader("textured").unwrap();
    h.ctx
        .create_pipeline(PipelineDesc::new(shader, sc.render_pass().clone()), sc.image_count())
        .unwrap()
}

fn texture(h: &Harness, rgba: [u8; 4]) -> Arc<Texture> {
    h.ctx.create_texture(2, 2, &common::pixels(2, 2, rgba)).unwrap()
}

fn material(h: &Harness) -> UniformBuffer {
    UniformBuffer::with_value(h.ctx.gpu(), &[1.0f32, 0.5, 0.25, 1.0]).unwrap()
}

fn binding_error(err: &anyhow::Error) -> BindingError {
    err.downcast_ref::<BindingError>().cloned().expect("binding error")
}

/// Contents of set 0 for every image, independent of the raw set handles
fn contents(h: &Harness, pipeline: &Pipeline) -> Vec<BTreeMap<(u32, u32), DescriptorResource>> {
    (0..pipeline.image_count())
        .map(|image| {
            let sets = pipeline.descriptor_sets_for(image).unwrap();
            h.device.descriptor_contents(sets[0])
        })
        .collect()
}

// ============================================================================
// Binding correctness
// ============================================================================

#[test]
fn texture_reaches_every_image_set() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let red = texture(&h, [255, 0, 0, 255]);

    pipeline.set_texture(&red, 1, 2).unwrap();

    let black = h.ctx.black_texture().unwrap().clone();
    for image in 0..3 {
        let sets = pipeline.descriptor_sets_for(image).unwrap();
        match h.device.descriptor(sets[0], 1, 2) {
            Some(DescriptorResource::Image { kind, view, sampler, state }) => {
                assert_eq!(kind, DescriptorKind::CombinedImageSampler);
                assert_eq!(view, red.view());
                assert_eq!(sampler, red.sampler());
                assert_eq!(state, ImageState::ShaderReadOnly);
            }
            other => panic!("image {image}: unexpected descriptor {other:?}"),
        }
        for slot in [0, 1, 3] {
            match h.device.descriptor(sets[0], 1, slot) {
                Some(DescriptorResource::Image { view, .. }) => assert_eq!(view, black.view()),
                other => panic!("slot {slot} should hold the fallback, got {other:?}"),
            }
        }
    }
}

#[test]
fn uniform_buffer_reaches_every_image_set() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let material = material(&h);

    pipeline.set_uniform_buffer(&material, 0).unwrap();

    for image in 0..3 {
        let sets = pipeline.descriptor_sets_for(image).unwrap();
        assert_eq!(
            h.device.descriptor(sets[0], 0, 0),
            Some(DescriptorResource::Buffer {
                kind: DescriptorKind::UniformBuffer,
                buffer: material.raw(),
                offset: 0,
                range: 16,
            })
        );
    }
    assert_eq!(
        h.device.buffer_contents(material.raw()).unwrap(),
        bytemuck::cast_slice::<f32, u8>(&[1.0, 0.5, 0.25, 1.0]).to_vec()
    );
}

#[test]
fn frames_bind_the_set_of_the_acquired_image() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    pipeline.set_uniform_buffer(&material(&h), 0).unwrap();
    pipeline.set_texture(&texture(&h, [0, 255, 0, 255]), 1, 0).unwrap();

    for _ in 0..4 {
        assert!(sc.new_frame().unwrap());
        let index = sc.current_image_index();
        sc.begin_render_pass(CLEAR).unwrap();
        let raw = {
            let list = sc.current_command_list().unwrap();
            pipeline.bind(list, index).unwrap();
            pipeline.push_constants(list, &[0.0f32; 16]).unwrap();
            list.draw(3, 1).unwrap();
            list.raw()
        };
        sc.present().unwrap();

        let expected = pipeline.descriptor_sets_for(index).unwrap();
        let bound: Vec<RawDescriptorSet> = h
            .device
            .commands(raw)
            .into_iter()
            .find_map(|c| match c {
                RecordedCommand::BindDescriptorSets { sets, .. } => Some(sets),
                _ => None,
            })
            .expect("descriptor sets bound");
        assert_eq!(bound, expected);
    }
}

#[test]
fn image_index_out_of_range_is_rejected() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let err = pipeline.descriptor_sets_for(3).unwrap_err();
    assert_eq!(binding_error(&err), BindingError::ImageIndexOutOfRange { index: 3, count: 3 });
}

// ============================================================================
// Contract violations
// ============================================================================

#[test]
fn texture_over_bound_buffer_is_a_kind_conflict() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let material = material(&h);
    let red = texture(&h, [255, 0, 0, 255]);

    pipeline.set_uniform_buffer(&material, 0).unwrap();
    let err = pipeline.set_texture(&red, 0, 0).unwrap_err();
    assert_eq!(
        binding_error(&err),
        BindingError::KindConflict {
            set: 0,
            binding: 0,
            existing: DescriptorKind::UniformBuffer,
            requested: DescriptorKind::CombinedImageSampler,
        }
    );

    // Nothing was overwritten
    assert_eq!(pipeline.binding_count(), 1);
    let sets = pipeline.descriptor_sets_for(0).unwrap();
    assert!(matches!(
        h.device.descriptor(sets[0], 0, 0),
        Some(DescriptorResource::Buffer { buffer, .. }) if buffer == material.raw()
    ));
}

#[test]
fn buffer_into_sampled_binding_is_a_kind_conflict() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);

    let err = pipeline.set_uniform_buffer(&material(&h), 1).unwrap_err();
    assert!(matches!(binding_error(&err), BindingError::KindConflict { binding: 1, .. }));
}

#[test]
fn undeclared_targets_are_rejected() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let red = texture(&h, [255, 0, 0, 255]);

    let err = pipeline.set_texture(&red, 7, 0).unwrap_err();
    assert!(matches!(binding_error(&err), BindingError::NotDeclared { set: 0, binding: 7, .. }));

    let err = pipeline.set_texture(&red, 1, 4).unwrap_err();
    assert_eq!(
        binding_error(&err),
        BindingError::SlotOutOfRange {
            binding: 1,
            slot: 4,
            count: 4
        }
    );

    let err = pipeline.set_texture_at(3, &red, 0, 0).unwrap_err();
    assert!(matches!(binding_error(&err), BindingError::SetNotFound { set: 3, .. }));
    assert_eq!(pipeline.binding_count(), 0);
}

#[test]
fn missing_shader_or_render_pass_is_refused() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);

    let desc = PipelineDesc {
        render_pass: Some(sc.render_pass().clone()),
        ..Default::default()
    };
    assert!(h.ctx.create_pipeline(desc, 3).is_err());

    let desc = PipelineDesc {
        shader: Some(h.ctx.shader("textured").unwrap()),
        ..Default::default()
    };
    assert!(h.ctx.create_pipeline(desc, 3).is_err());
}

#[test]
fn two_resources_claiming_one_binding_refuse_to_build() {
    let h = harness(HeadlessDevice::new());
    h.source.insert(
        "clashing",
        shader_with(1, vec![resource("lights", 0, 0, ResourceKind::UniformBuffer, 1)]),
    );
    let sc = swapchain(&h, 3, 2);
    let shader = h.ctx.shader("clashing").unwrap();

    let err = h
        .ctx
        .create_pipeline(PipelineDesc::new(shader, sc.render_pass().clone()), 3)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<LayoutError>(),
        Some(&LayoutError::BindingCollision {
            set: 0,
            binding: 0,
            first: "material".into(),
            second: "lights".into(),
        })
    );
}

#[test]
fn second_set_is_bound_independently() {
    let h = harness(HeadlessDevice::new());
    h.source.insert(
        "two_sets",
        shader_with(1, vec![resource("lights", 1, 0, ResourceKind::StorageBuffer, 1)]),
    );
    let sc = swapchain(&h, 3, 2);
    let shader = h.ctx.shader("two_sets").unwrap();
    let pipeline = h
        .ctx
        .create_pipeline(PipelineDesc::new(shader, sc.render_pass().clone()), 3)
        .unwrap();

    let lights = render_core::StorageBuffer::new(h.ctx.gpu(), 256).unwrap();
    pipeline.set_storage_buffer_at(1, &lights, 0).unwrap();

    for image in 0..3 {
        let sets = pipeline.descriptor_sets_for(image).unwrap();
        assert_eq!(sets.len(), 2);
        assert!(matches!(
            h.device.descriptor(sets[1], 0, 0),
            Some(DescriptorResource::Buffer { kind: DescriptorKind::StorageBuffer, buffer, .. }) if buffer == lights.raw()
        ));
    }
}

// ============================================================================
// Invalidate and image count changes
// ============================================================================

#[test]
fn invalidate_replays_bindings_in_any_order() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let material = material(&h);
    let red = texture(&h, [255, 0, 0, 255]);
    let blue = texture(&h, [0, 0, 255, 255]);

    let forward = pipeline(&h, &sc);
    forward.set_uniform_buffer(&material, 0).unwrap();
    forward.set_texture(&red, 1, 0).unwrap();
    forward.set_texture(&blue, 1, 3).unwrap();

    let backward = pipeline(&h, &sc);
    backward.set_texture(&blue, 1, 3).unwrap();
    backward.set_texture(&red, 1, 0).unwrap();
    backward.set_uniform_buffer(&material, 0).unwrap();

    let before = contents(&h, &forward);
    assert_eq!(before, contents(&h, &backward));

    let old_raw = forward.raw();
    let old_sets = forward.descriptor_sets_for(0).unwrap();
    forward.invalidate().unwrap();
    assert_ne!(forward.raw(), old_raw);
    assert_ne!(forward.descriptor_sets_for(0).unwrap(), old_sets);
    assert_eq!(forward.binding_count(), 3);
    assert_eq!(contents(&h, &forward), before);

    forward.invalidate().unwrap();
    backward.invalidate().unwrap();
    assert_eq!(contents(&h, &forward), before);
    assert_eq!(contents(&h, &backward), before);
}

#[test]
fn invalidate_retires_old_objects_without_leaking() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);

    let destroyer = h.ctx.gpu().destroyer();
    destroyer.collect().unwrap();
    for _ in 0..3 {
        pipeline.invalidate().unwrap();
    }
    assert_eq!(h.device.live_objects(ObjectKind::Pipeline), 4);

    destroyer.collect().unwrap();
    assert_eq!(destroyer.pending(), 0);
    assert_eq!(h.device.live_objects(ObjectKind::Pipeline), 1);
    assert_eq!(h.device.live_objects(ObjectKind::DescriptorPool), 1);
    assert_eq!(h.device.live_objects(ObjectKind::DescriptorSet), 3);
    assert_eq!(h.device.live_objects(ObjectKind::ShaderModule), 2);
}

#[test]
fn invalidate_mid_frame_keeps_old_objects_until_the_frame_completes() {
    let h = harness(HeadlessDevice::new().with_completion(CompletionMode::Manual));
    let mut sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let destroyer = h.ctx.gpu().destroyer();
    destroyer.collect().unwrap();
    let pipelines = h.device.live_objects(ObjectKind::Pipeline);

    assert!(sc.new_frame().unwrap());
    sc.begin_render_pass(CLEAR).unwrap();
    let index = sc.current_image_index();
    let list = sc.current_command_list().unwrap();
    pipeline.bind(list, index).unwrap();
    list.draw(3, 1).unwrap();

    // The open recording still binds the old pipeline
    pipeline.invalidate().unwrap();
    assert_eq!(destroyer.collect().unwrap(), 0);

    sc.present().unwrap();
    assert!(sc.new_frame().unwrap());
    assert_eq!(h.device.outstanding_submissions(), 1);
    assert_eq!(h.device.live_objects(ObjectKind::Pipeline), pipelines + 1);

    h.device.complete_all();
    assert!(destroyer.collect().unwrap() > 0);
    assert_eq!(h.device.live_objects(ObjectKind::Pipeline), pipelines);
    assert_eq!(h.device.stats().fence_violations, 0);
}

#[test]
fn image_count_change_reallocates_and_replays() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let material = material(&h);
    pipeline.set_uniform_buffer(&material, 0).unwrap();

    h.ctx.on_swapchain_recreated(5).unwrap();
    assert_eq!(pipeline.image_count(), 5);

    let all = contents(&h, &pipeline);
    assert_eq!(all.len(), 5);
    for image in &all {
        assert_eq!(image, &all[0]);
        assert!(matches!(
            image.get(&(0, 0)),
            Some(DescriptorResource::Buffer { buffer, .. }) if *buffer == material.raw()
        ));
    }
}

#[test]
fn context_follows_image_count_across_rebuilds() {
    let h = harness(HeadlessDevice::new());
    let mut sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let red = texture(&h, [255, 0, 0, 255]);
    pipeline.set_texture(&red, 1, 2).unwrap();
    h.ctx.sync_swapchain(&sc).unwrap();
    assert!(!h.ctx.sync_swapchain(&sc).unwrap());

    h.device.set_image_limits(5, 8);
    sc.resize(Extent2D::new(800, 600)).unwrap();
    assert_eq!(sc.image_count(), 5);
    assert!(matches!(
        pipeline.descriptor_sets_for(4).map_err(|e| binding_error(&e)),
        Err(BindingError::ImageIndexOutOfRange { index: 4, count: 3 })
    ));

    assert!(h.ctx.sync_swapchain(&sc).unwrap());
    assert_eq!(pipeline.image_count(), 5);
    let sets = pipeline.descriptor_sets_for(4).unwrap();
    assert!(matches!(
        h.device.descriptor(sets[0], 1, 2),
        Some(DescriptorResource::Image { view, .. }) if view == red.view()
    ));
    assert!(!h.ctx.sync_swapchain(&sc).unwrap());
}

#[test]
fn stale_texture_descriptor_is_refreshed_on_fetch() {
    let h = harness(HeadlessDevice::new());
    let sc = swapchain(&h, 3, 2);
    let pipeline = pipeline(&h, &sc);
    let red = texture(&h, [255, 0, 0, 255]);
    pipeline.set_texture(&red, 1, 0).unwrap();

    let version = red.version();
    red.image().set_layout(ImageState::General, None).unwrap();
    assert_eq!(red.version(), version + 1);

    for image in 0..3 {
        let sets = pipeline.descriptor_sets_for(image).unwrap();
        assert!(matches!(
            h.device.descriptor(sets[0], 1, 0),
            Some(DescriptorResource::Image { state: ImageState::General, .. })
        ));
    }
}
