//! Shared setup for the integration tests: a renderer context on the
//! headless device with shaders registered in memory.

#![allow(dead_code)]

use std::sync::Arc;

use render_core::backend::headless::HeadlessDevice;
use render_core::backend::{Extent2D, PresentMode, VertexFormat};
use render_core::shader::{
    CompiledShader, CompiledStage, InMemoryShaderSource, ReflectedInput, ReflectedPushConstant, ReflectedResource,
    ResourceKind, Stage, StageReflection,
};
use render_core::{HeadlessWindow, RendererConfig, RendererContext, Swapchain, SwapchainOptions};

pub const CLEAR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Harness {
    pub device: Arc<HeadlessDevice>,
    pub source: Arc<InMemoryShaderSource>,
    pub ctx: RendererContext,
}

pub fn harness(device: HeadlessDevice) -> Harness {
    init_logging();
    let device = Arc::new(device);
    let source = Arc::new(InMemoryShaderSource::new());
    source.insert("textured", textured_shader(4));
    let ctx = RendererContext::with_device(RendererConfig::headless(), device.clone(), Box::new(source.clone()))
        .expect("headless context");
    Harness { device, source, ctx }
}

pub fn window(width: u32, height: u32) -> HeadlessWindow {
    HeadlessWindow {
        extent: Extent2D::new(width, height),
    }
}

/// N presentable images, M sync slots
pub fn swapchain(harness: &Harness, images: u32, frames_in_flight: usize) -> Swapchain {
    let options = SwapchainOptions {
        image_count: images,
        max_frames_in_flight: frames_in_flight,
        present_mode: PresentMode::Fifo,
        clear_color: CLEAR,
        depth: true,
    };
    Swapchain::new(harness.ctx.gpu(), &window(800, 600), options).expect("headless swapchain")
}

pub fn resource(name: &str, set: u32, binding: u32, kind: ResourceKind, count: u32) -> ReflectedResource {
    ReflectedResource {
        name: name.to_string(),
        set,
        binding,
        kind,
        count,
        size: if matches!(kind, ResourceKind::UniformBuffer) { 16 } else { 0 },
    }
}

fn module(stage: Stage, reflection: StageReflection) -> CompiledStage {
    CompiledStage {
        stage,
        words: vec![0x0723_0203, 0, 0],
        entry_point: "main".to_string(),
        reflection,
    }
}

/// Vertex stage with a 64 byte push constant; fragment stage with a
/// material block at binding 0 and an array of `textures` samplers at
/// binding 1, plus whatever `extra` adds to the fragment stage
pub fn shader_with(textures: u32, extra: Vec<ReflectedResource>) -> CompiledShader {
    let vertex = module(
        Stage::Vertex,
        StageReflection {
            push_constants: vec![ReflectedPushConstant { offset: 0, size: 64 }],
            inputs: vec![
                ReflectedInput {
                    name: "position".into(),
                    location: 0,
                    format: VertexFormat::Float2,
                },
                ReflectedInput {
                    name: "uv".into(),
                    location: 1,
                    format: VertexFormat::Float2,
                },
            ],
            ..Default::default()
        },
    );

    let mut resources = vec![
        resource("material", 0, 0, ResourceKind::UniformBuffer, 1),
        resource("albedo", 0, 1, ResourceKind::SampledImage, textures),
    ];
    resources.extend(extra);
    let fragment = module(
        Stage::Fragment,
        StageReflection {
            resources,
            ..Default::default()
        },
    );

    CompiledShader {
        stages: vec![vertex, fragment],
    }
}

pub fn textured_shader(textures: u32) -> CompiledShader {
    shader_with(textures, Vec::new())
}

/// Solid RGBA8 pixels for a `width` x `height` texture
pub fn pixels(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    rgba.iter()
        .copied()
        .cycle()
        .take((width * height * 4) as usize)
        .collect()
}
