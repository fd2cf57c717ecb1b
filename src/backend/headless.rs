// Headless device - deterministic simulated GPU
//
// Implements GpuDevice without any graphics API. Submissions advance a
// per-queue timeline which completes either immediately or when the caller
// says so, which lets tests pin down exactly which frames are in flight.
//
// The device also polices the rules a real driver would only catch with
// validation layers: command lists reused before their fence completes,
// binary semaphores waited on without a signal, barriers whose old state
// does not match the image, swapchain objects destroyed under live work.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::types::*;
use super::GpuDevice;

/// When submitted work is considered finished by the simulated GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Every submission is complete as soon as it is submitted
    Immediate,
    /// Submissions stay pending until `complete_through`/`complete_all`
    /// or until the CPU blocks on them (which counts as a stall)
    Manual,
}

/// Which image index `acquire_next_image` hands out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOrder {
    RoundRobin,
    /// Indices are consumed front to back, then round robin resumes
    Scripted(VecDeque<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    CommandList,
    Semaphore,
    Surface,
    Swapchain,
    Image,
    ImageView,
    Sampler,
    Buffer,
    RenderPass,
    Framebuffer,
    ShaderModule,
    DescriptorPool,
    SetLayout,
    DescriptorSet,
    PipelineLayout,
    Pipeline,
}

/// Counters accumulated since the device was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub acquires: u64,
    pub presents: u64,
    /// CPU waits that found the GPU still busy
    pub stalls: u64,
    /// Command lists reset, begun, resubmitted or freed while pending
    pub fence_violations: u64,
    /// Barriers whose old state disagreed with the tracked image state
    pub layout_mismatches: u64,
    /// Swapchain-owned objects destroyed while work was outstanding
    pub hazards: u64,
    pub swapchains_created: u64,
}

/// Owned copy of a recorded command, for inspection
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Barrier(ImageBarrier),
    BeginRenderPass {
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        extent: Extent2D,
        clear_color: [f32; 4],
    },
    EndRenderPass,
    BindPipeline(RawPipeline),
    BindDescriptorSets {
        layout: RawPipelineLayout,
        first_set: u32,
        sets: Vec<RawDescriptorSet>,
    },
    PushConstants {
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport(Viewport),
    SetScissor(Extent2D),
    BindVertexBuffer(RawBuffer),
    BindIndexBuffer(RawBuffer),
    Draw { vertices: u32, instances: u32 },
    DrawIndexed { indices: u32, instances: u32 },
    CopyBufferToImage { buffer: RawBuffer, image: RawImage },
    CopyImageToBuffer { image: RawImage, buffer: RawBuffer },
}

impl From<&Command<'_>> for RecordedCommand {
    fn from(command: &Command<'_>) -> Self {
        match *command {
            Command::Barrier(barrier) => RecordedCommand::Barrier(barrier),
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_color,
            } => RecordedCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_color,
            },
            Command::EndRenderPass => RecordedCommand::EndRenderPass,
            Command::BindPipeline(pipeline) => RecordedCommand::BindPipeline(pipeline),
            Command::BindDescriptorSets { layout, first_set, sets } => RecordedCommand::BindDescriptorSets {
                layout,
                first_set,
                sets: sets.to_vec(),
            },
            Command::PushConstants { stages, offset, data, .. } => RecordedCommand::PushConstants {
                stages,
                offset,
                data: data.to_vec(),
            },
            Command::SetViewport(viewport) => RecordedCommand::SetViewport(viewport),
            Command::SetScissor(extent) => RecordedCommand::SetScissor(extent),
            Command::BindVertexBuffer { buffer, .. } => RecordedCommand::BindVertexBuffer(buffer),
            Command::BindIndexBuffer { buffer, .. } => RecordedCommand::BindIndexBuffer(buffer),
            Command::Draw { vertices, instances } => RecordedCommand::Draw { vertices, instances },
            Command::DrawIndexed { indices, instances } => RecordedCommand::DrawIndexed { indices, instances },
            Command::CopyBufferToImage { buffer, image, .. } => RecordedCommand::CopyBufferToImage { buffer, image },
            Command::CopyImageToBuffer { image, buffer, .. } => RecordedCommand::CopyImageToBuffer { image, buffer },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListPhase {
    Initial,
    Recording,
    Executable,
}

struct ListState {
    queue: QueueKind,
    phase: ListPhase,
    last_fence: FenceValue,
    commands: Vec<RecordedCommand>,
}

#[derive(Default, Clone, Copy)]
struct TimelineState {
    submitted: FenceValue,
    completed: FenceValue,
}

struct SwapchainState {
    images: Vec<RawImage>,
    extent: Extent2D,
    next: u32,
    acquired: HashSet<u32>,
    retired: bool,
}

struct PoolState {
    max_sets: u32,
    remaining: HashMap<DescriptorKind, u32>,
    sets: HashSet<RawDescriptorSet>,
}

struct SetState {
    pool: RawDescriptorPool,
    layout: RawSetLayout,
    writes: BTreeMap<(u32, u32), DescriptorResource>,
}

/// Level-zero contents of an image, tightly packed
struct Texels {
    format: ImageFormat,
    bytes: Vec<u8>,
}

struct State {
    next_id: u64,
    completion: CompletionMode,
    acquire_order: AcquireOrder,
    surface_extent: Extent2D,
    surface_format: ImageFormat,
    min_images: u32,
    max_images: u32,
    acquire_out_of_date: u32,
    present_out_of_date: u32,
    timelines: [TimelineState; 2],
    lists: HashMap<RawCommandList, ListState>,
    semaphores: HashMap<RawSemaphore, bool>,
    swapchains: HashMap<RawSwapchain, SwapchainState>,
    image_states: HashMap<RawImage, ImageState>,
    texels: HashMap<RawImage, Texels>,
    views: HashMap<RawImageView, RawImage>,
    render_passes: HashMap<RawRenderPass, RenderPassDesc>,
    framebuffers: HashMap<RawFramebuffer, Vec<RawImageView>>,
    pipelines: HashMap<RawPipeline, (BlendMode, u32)>,
    buffers: HashMap<RawBuffer, Vec<u8>>,
    set_layouts: HashMap<RawSetLayout, Vec<SetLayoutBinding>>,
    pools: HashMap<RawDescriptorPool, PoolState>,
    sets: HashMap<RawDescriptorSet, SetState>,
    live: BTreeMap<ObjectKind, usize>,
    stats: HeadlessStats,
}

impl State {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        *self.live.entry(kind).or_insert(0) += 1;
        id
    }

    fn destroy(&mut self, kind: ObjectKind) {
        match self.live.get_mut(&kind) {
            Some(count) if *count > 0 => *count -= 1,
            _ => log::error!("[Headless] {:?} destroyed more often than created", kind),
        }
    }

    fn timeline(&mut self, queue: QueueKind) -> &mut TimelineState {
        &mut self.timelines[queue.index()]
    }

    fn outstanding(&self) -> u64 {
        self.timelines.iter().map(|t| t.submitted - t.completed).sum()
    }

    fn list_pending(&self, list: &ListState) -> bool {
        list.last_fence > self.timelines[list.queue.index()].completed
    }

    /// Execute `list` against the tracked image states and contents.
    /// Only transfers and render pass clears touch memory; draws do not.
    fn replay(&mut self, list: RawCommandList) {
        let commands = match self.lists.get(&list) {
            Some(state) => state.commands.clone(),
            None => return,
        };

        for command in commands {
            match command {
                RecordedCommand::Barrier(barrier) => self.apply_barrier(&barrier),
                RecordedCommand::CopyBufferToImage { buffer, image } => {
                    self.expect_state(image, ImageState::TransferDst, "copied into");
                    if let (Some(src), Some(dst)) = (self.buffers.get(&buffer), self.texels.get_mut(&image)) {
                        let len = src.len().min(dst.bytes.len());
                        dst.bytes[..len].copy_from_slice(&src[..len]);
                    }
                }
                RecordedCommand::CopyImageToBuffer { image, buffer } => {
                    self.expect_state(image, ImageState::TransferSrc, "copied from");
                    if let (Some(src), Some(dst)) = (self.texels.get(&image), self.buffers.get_mut(&buffer)) {
                        let len = src.bytes.len().min(dst.len());
                        dst[..len].copy_from_slice(&src.bytes[..len]);
                    }
                }
                RecordedCommand::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    clear_color,
                    ..
                } => self.run_render_pass(render_pass, framebuffer, clear_color),
                _ => {}
            }
        }
    }

    fn apply_barrier(&mut self, barrier: &ImageBarrier) {
        let Some(current) = self.image_states.get(&barrier.image).copied() else {
            return;
        };
        if barrier.old_state != ImageState::Undefined && barrier.old_state != current {
            log::error!(
                "[Headless] Barrier on {:?} expects {:?} but image is {:?}",
                barrier.image,
                barrier.old_state,
                current
            );
            self.stats.layout_mismatches += 1;
        }
        self.image_states.insert(barrier.image, barrier.new_state);
    }

    fn expect_state(&mut self, image: RawImage, expected: ImageState, action: &str) {
        let Some(current) = self.image_states.get(&image).copied() else {
            return;
        };
        if current != expected {
            log::error!("[Headless] {:?} {} while {:?}, not {:?}", image, action, current, expected);
            self.stats.layout_mismatches += 1;
        }
    }

    /// Offscreen color attachments are checked against their resting state,
    /// cleared if the pass clears, and left in that state afterwards
    fn run_render_pass(&mut self, render_pass: RawRenderPass, framebuffer: RawFramebuffer, clear_color: [f32; 4]) {
        let Some(desc) = self.render_passes.get(&render_pass).cloned() else {
            return;
        };
        if desc.present {
            return;
        }
        let views = self.framebuffers.get(&framebuffer).cloned().unwrap_or_default();
        for (attachment, view) in desc.colors.iter().zip(views) {
            let Some(image) = self.views.get(&view).copied() else {
                continue;
            };
            if !attachment.clear {
                self.expect_state(image, attachment.state, "loaded by a render pass");
            }
            if attachment.clear {
                if let Some(texels) = self.texels.get_mut(&image) {
                    let pixel = encode_color(texels.format, clear_color);
                    if !pixel.is_empty() {
                        for chunk in texels.bytes.chunks_exact_mut(pixel.len()) {
                            chunk.copy_from_slice(&pixel);
                        }
                    }
                }
            }
            self.image_states.insert(image, attachment.state);
        }
    }
}

/// One texel of `format` holding `color`
fn encode_color(format: ImageFormat, color: [f32; 4]) -> Vec<u8> {
    let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let srgb = |v: f32| {
        let v = v.clamp(0.0, 1.0);
        let encoded = if v <= 0.003_130_8 {
            v * 12.92
        } else {
            1.055 * v.powf(1.0 / 2.4) - 0.055
        };
        unorm(encoded)
    };
    let [r, g, b, a] = color;
    match format {
        ImageFormat::Undefined | ImageFormat::Depth32Float => Vec::new(),
        ImageFormat::R8Unorm => vec![unorm(r)],
        ImageFormat::Rgb8Unorm => vec![unorm(r), unorm(g), unorm(b)],
        ImageFormat::Bgr8Unorm => vec![unorm(b), unorm(g), unorm(r)],
        ImageFormat::Rgba8Unorm => vec![unorm(r), unorm(g), unorm(b), unorm(a)],
        ImageFormat::Bgra8Unorm => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
        ImageFormat::Rgba8Srgb => vec![srgb(r), srgb(g), srgb(b), unorm(a)],
        ImageFormat::Bgra8Srgb => vec![srgb(b), srgb(g), srgb(r), unorm(a)],
        ImageFormat::Rgba16Float => color.iter().flat_map(|&v| half_bits(v).to_le_bytes()).collect(),
        ImageFormat::Rgba32Float => bytemuck::cast_slice::<f32, u8>(&color[..]).to_vec(),
    }
}

/// IEEE half precision bits, flushing values too small for a normal half to zero
fn half_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let exponent = exponent - 127 + 15;
    if exponent >= 0x1f {
        sign | 0x7c00
    } else if exponent <= 0 {
        sign
    } else {
        sign | ((exponent as u16) << 10) | (mantissa >> 13) as u16
    }
}

/// Simulated GPU for tests and windowless tools
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        log::info!("Creating headless device");
        Self {
            state: Mutex::new(State {
                next_id: 1,
                completion: CompletionMode::Immediate,
                acquire_order: AcquireOrder::RoundRobin,
                surface_extent: Extent2D::new(800, 600),
                surface_format: ImageFormat::Bgra8Unorm,
                min_images: 2,
                max_images: 8,
                acquire_out_of_date: 0,
                present_out_of_date: 0,
                timelines: [TimelineState::default(); 2],
                lists: HashMap::new(),
                semaphores: HashMap::new(),
                swapchains: HashMap::new(),
                image_states: HashMap::new(),
                texels: HashMap::new(),
                views: HashMap::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                pipelines: HashMap::new(),
                buffers: HashMap::new(),
                set_layouts: HashMap::new(),
                pools: HashMap::new(),
                sets: HashMap::new(),
                live: BTreeMap::new(),
                stats: HeadlessStats::default(),
            }),
        }
    }

    pub fn with_completion(self, mode: CompletionMode) -> Self {
        self.state.lock().completion = mode;
        self
    }

    pub fn with_surface_extent(self, extent: Extent2D) -> Self {
        self.state.lock().surface_extent = extent;
        self
    }

    pub fn with_image_limits(self, min_images: u32, max_images: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.min_images = min_images;
            state.max_images = max_images;
        }
        self
    }

    // -- controls -----------------------------------------------------------

    /// Image count bounds the next swapchain build clamps to
    pub fn set_image_limits(&self, min_images: u32, max_images: u32) {
        let mut state = self.state.lock();
        state.min_images = min_images;
        state.max_images = max_images;
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state.lock().completion = mode;
    }

    pub fn set_acquire_order(&self, order: AcquireOrder) {
        self.state.lock().acquire_order = order;
    }

    /// Change what the window reports; live swapchains become out of date
    pub fn set_surface_extent(&self, extent: Extent2D) {
        self.state.lock().surface_extent = extent;
    }

    pub fn set_surface_format(&self, format: ImageFormat) {
        self.state.lock().surface_format = format;
    }

    /// The next `count` acquires report the swapchain as out of date
    pub fn inject_acquire_out_of_date(&self, count: u32) {
        self.state.lock().acquire_out_of_date += count;
    }

    /// The next `count` presents report the swapchain as out of date
    pub fn inject_present_out_of_date(&self, count: u32) {
        self.state.lock().present_out_of_date += count;
    }

    /// Finish every submission on `queue` up to and including `value`
    pub fn complete_through(&self, queue: QueueKind, value: FenceValue) {
        let mut state = self.state.lock();
        let timeline = state.timeline(queue);
        timeline.completed = timeline.completed.max(value.min(timeline.submitted));
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        for timeline in state.timelines.iter_mut() {
            timeline.completed = timeline.submitted;
        }
    }

    // -- inspection ---------------------------------------------------------

    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats.clone()
    }

    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.get(&kind).copied().unwrap_or(0)
    }

    /// Submissions on all queues that have not completed yet
    pub fn outstanding_submissions(&self) -> u64 {
        self.state.lock().outstanding()
    }

    pub fn submitted_value(&self, queue: QueueKind) -> FenceValue {
        self.state.lock().timelines[queue.index()].submitted
    }

    pub fn commands(&self, list: RawCommandList) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .lists
            .get(&list)
            .map(|l| l.commands.clone())
            .unwrap_or_default()
    }

    /// Fence value of the last submission of `list` (zero if never submitted)
    pub fn list_fence(&self, list: RawCommandList) -> Option<FenceValue> {
        self.state.lock().lists.get(&list).map(|l| l.last_fence)
    }

    pub fn descriptor(&self, set: RawDescriptorSet, binding: u32, slot: u32) -> Option<DescriptorResource> {
        self.state
            .lock()
            .sets
            .get(&set)
            .and_then(|s| s.writes.get(&(binding, slot)).copied())
    }

    /// Every write currently held by `set`, keyed by (binding, slot)
    pub fn descriptor_contents(&self, set: RawDescriptorSet) -> BTreeMap<(u32, u32), DescriptorResource> {
        self.state
            .lock()
            .sets
            .get(&set)
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    pub fn image_state(&self, image: RawImage) -> Option<ImageState> {
        self.state.lock().image_states.get(&image).copied()
    }

    pub fn buffer_contents(&self, buffer: RawBuffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    /// Level-zero texels of `image` as the simulated GPU last left them
    pub fn image_contents(&self, image: RawImage) -> Option<Vec<u8>> {
        self.state.lock().texels.get(&image).map(|t| t.bytes.clone())
    }

    /// Blend mode and color attachment count `pipeline` was built with
    pub fn pipeline_blend(&self, pipeline: RawPipeline) -> Option<(BlendMode, u32)> {
        self.state.lock().pipelines.get(&pipeline).copied()
    }
}

fn check_list_can_restart(state: &mut State, list: RawCommandList, action: &str) -> Result<()> {
    let pending = match state.lists.get(&list) {
        Some(l) => state.list_pending(l),
        None => bail!("Unknown command list {:?}", list),
    };
    if pending {
        state.stats.fence_violations += 1;
        bail!("Command list {:?} {} while its fence is still pending", list, action);
    }
    Ok(())
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<FenceValue> {
        let mut state = self.state.lock();

        check_list_can_restart(&mut state, submission.list, "resubmitted")?;
        match state.lists.get(&submission.list) {
            Some(l) if l.phase != ListPhase::Executable => {
                bail!("Command list {:?} submitted without being ended", submission.list)
            }
            Some(l) if l.queue != queue => {
                bail!("Command list {:?} belongs to {:?}, not {:?}", submission.list, l.queue, queue)
            }
            _ => {}
        }

        if let Some((semaphore, _)) = submission.wait {
            match state.semaphores.get_mut(&semaphore) {
                Some(signaled) if *signaled => *signaled = false,
                Some(_) => bail!("Submission waits on unsignaled semaphore {:?}", semaphore),
                None => bail!("Unknown semaphore {:?}", semaphore),
            }
        }
        if let Some(semaphore) = submission.signal {
            match state.semaphores.get_mut(&semaphore) {
                Some(signaled) if !*signaled => *signaled = true,
                Some(_) => bail!("Submission signals already signaled semaphore {:?}", semaphore),
                None => bail!("Unknown semaphore {:?}", semaphore),
            }
        }

        state.replay(submission.list);

        let completion = state.completion;
        let timeline = state.timeline(queue);
        timeline.submitted += 1;
        let value = timeline.submitted;
        if completion == CompletionMode::Immediate {
            timeline.completed = value;
        }

        if let Some(list) = state.lists.get_mut(&submission.list) {
            list.last_fence = value;
        }
        state.stats.submissions += 1;
        Ok(value)
    }

    fn completed_value(&self, queue: QueueKind) -> Result<FenceValue> {
        Ok(self.state.lock().timelines[queue.index()].completed)
    }

    fn wait_for_value(&self, queue: QueueKind, value: FenceValue) -> Result<()> {
        let mut state = self.state.lock();
        let timeline = state.timeline(queue);
        if value > timeline.submitted {
            bail!("Wait for fence value {} on {:?} which was never submitted", value, queue);
        }
        if timeline.completed < value {
            timeline.completed = value;
            state.stats.stalls += 1;
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.outstanding() > 0 {
            state.stats.stalls += 1;
        }
        for timeline in state.timelines.iter_mut() {
            timeline.completed = timeline.submitted;
        }
        Ok(())
    }

    fn allocate_command_list(&self, queue: QueueKind) -> Result<RawCommandList> {
        let mut state = self.state.lock();
        let list = RawCommandList(state.create(ObjectKind::CommandList));
        state.lists.insert(
            list,
            ListState {
                queue,
                phase: ListPhase::Initial,
                last_fence: 0,
                commands: Vec::new(),
            },
        );
        Ok(list)
    }

    fn free_command_list(&self, _queue: QueueKind, list: RawCommandList) {
        let mut state = self.state.lock();
        let pending = state.lists.get(&list).map(|l| state.list_pending(l));
        match pending {
            Some(true) => {
                log::error!("[Headless] Command list {:?} freed while pending", list);
                state.stats.fence_violations += 1;
            }
            Some(false) => {}
            None => return,
        }
        state.lists.remove(&list);
        state.destroy(ObjectKind::CommandList);
    }

    fn reset_command_list(&self, list: RawCommandList) -> Result<()> {
        let mut state = self.state.lock();
        check_list_can_restart(&mut state, list, "reset")?;
        if let Some(l) = state.lists.get_mut(&list) {
            l.phase = ListPhase::Initial;
            l.commands.clear();
        }
        Ok(())
    }

    fn begin_command_list(&self, list: RawCommandList) -> Result<()> {
        let mut state = self.state.lock();
        check_list_can_restart(&mut state, list, "begun")?;
        let l = state.lists.get_mut(&list).context("Unknown command list")?;
        if l.phase == ListPhase::Recording {
            bail!("Command list {:?} begun twice", list);
        }
        l.phase = ListPhase::Recording;
        l.commands.clear();
        Ok(())
    }

    fn end_command_list(&self, list: RawCommandList) -> Result<()> {
        let mut state = self.state.lock();
        let l = state.lists.get_mut(&list).context("Unknown command list")?;
        if l.phase != ListPhase::Recording {
            bail!("Command list {:?} ended while not recording", list);
        }
        l.phase = ListPhase::Executable;
        Ok(())
    }

    fn record(&self, list: RawCommandList, command: &Command<'_>) -> Result<()> {
        let mut state = self.state.lock();
        let l = state.lists.get_mut(&list).context("Unknown command list")?;
        if l.phase != ListPhase::Recording {
            bail!("Command recorded into {:?} while not recording", list);
        }
        l.commands.push(RecordedCommand::from(command));
        Ok(())
    }

    fn create_semaphore(&self) -> Result<RawSemaphore> {
        let mut state = self.state.lock();
        let semaphore = RawSemaphore(state.create(ObjectKind::Semaphore));
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: RawSemaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore).is_some() {
            state.destroy(ObjectKind::Semaphore);
        }
    }

    fn create_surface(&self, target: SurfaceTarget) -> Result<RawSurface> {
        if let SurfaceTarget::Native { .. } = target {
            bail!("Headless device cannot present to a native window");
        }
        let mut state = self.state.lock();
        Ok(RawSurface(state.create(ObjectKind::Surface)))
    }

    fn destroy_surface(&self, surface: RawSurface) {
        if !surface.is_null() {
            self.state.lock().destroy(ObjectKind::Surface);
        }
    }

    fn surface_extent(&self, _surface: RawSurface) -> Result<Option<Extent2D>> {
        Ok(Some(self.state.lock().surface_extent))
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, old: RawSwapchain) -> Result<SwapchainImages> {
        let mut state = self.state.lock();
        if desc.extent.is_zero_area() {
            bail!("Cannot create a swapchain with zero-area extent {:?}", desc.extent);
        }
        if !old.is_null() {
            let old_state = state.swapchains.get_mut(&old).context("Unknown old swapchain")?;
            old_state.retired = true;
        }

        let count = desc.image_count.clamp(state.min_images, state.max_images);
        let swapchain = RawSwapchain(state.create(ObjectKind::Swapchain));
        // Presentable images belong to the swapchain and are not counted as live images
        let images: Vec<RawImage> = (0..count)
            .map(|_| {
                let id = state.next_id;
                state.next_id += 1;
                RawImage(id)
            })
            .collect();

        let format = state.surface_format;
        state.swapchains.insert(
            swapchain,
            SwapchainState {
                images: images.clone(),
                extent: desc.extent,
                next: 0,
                acquired: HashSet::new(),
                retired: false,
            },
        );
        state.stats.swapchains_created += 1;

        Ok(SwapchainImages {
            swapchain,
            images,
            format,
            extent: desc.extent,
            present_mode: desc.present_mode,
        })
    }

    fn destroy_swapchain(&self, swapchain: RawSwapchain) {
        let mut state = self.state.lock();
        if state.swapchains.remove(&swapchain).is_some() {
            if state.timelines[QueueKind::Graphics.index()].submitted
                > state.timelines[QueueKind::Graphics.index()].completed
            {
                log::error!("[Headless] Swapchain {:?} destroyed with work in flight", swapchain);
                state.stats.hazards += 1;
            }
            state.destroy(ObjectKind::Swapchain);
        }
    }

    fn acquire_next_image(&self, swapchain: RawSwapchain, signal: RawSemaphore) -> Result<AcquireResult> {
        let mut state = self.state.lock();
        state.stats.acquires += 1;

        let surface_extent = state.surface_extent;
        let forced = state.acquire_out_of_date > 0;
        if forced {
            state.acquire_out_of_date -= 1;
        }
        let sc = state.swapchains.get(&swapchain).context("Unknown swapchain")?;
        if forced || sc.retired || sc.extent != surface_extent {
            return Ok(AcquireResult::OutOfDate);
        }

        match state.semaphores.get(&signal) {
            Some(false) => {}
            Some(true) => bail!("Acquire signals already signaled semaphore {:?}", signal),
            None => bail!("Unknown semaphore {:?}", signal),
        }

        let scripted = match &mut state.acquire_order {
            AcquireOrder::Scripted(order) => order.pop_front(),
            AcquireOrder::RoundRobin => None,
        };
        let sc = state.swapchains.get_mut(&swapchain).context("Unknown swapchain")?;
        let count = sc.images.len() as u32;
        let index = match scripted {
            Some(index) if index < count => index,
            Some(index) => bail!("Scripted acquire index {} out of range ({} images)", index, count),
            None => {
                let index = sc.next % count;
                sc.next = (index + 1) % count;
                index
            }
        };
        sc.acquired.insert(index);
        state.semaphores.insert(signal, true);

        Ok(AcquireResult::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        _queue: QueueKind,
        swapchain: RawSwapchain,
        image_index: u32,
        wait: RawSemaphore,
    ) -> Result<PresentResult> {
        let mut state = self.state.lock();
        state.stats.presents += 1;

        match state.semaphores.get_mut(&wait) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => bail!("Present waits on unsignaled semaphore {:?}", wait),
            None => bail!("Unknown semaphore {:?}", wait),
        }

        let surface_extent = state.surface_extent;
        let forced = state.present_out_of_date > 0;
        if forced {
            state.present_out_of_date -= 1;
        }
        let sc = state.swapchains.get_mut(&swapchain).context("Unknown swapchain")?;
        if !sc.acquired.remove(&image_index) {
            bail!("Presented image {} was never acquired", image_index);
        }
        if forced || sc.extent != surface_extent {
            return Ok(PresentResult::OutOfDate);
        }
        Ok(PresentResult::Presented)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<RawImage> {
        if desc.extent.is_zero_area() {
            bail!("Cannot create a zero-area image");
        }
        let mut state = self.state.lock();
        let image = RawImage(state.create(ObjectKind::Image));
        state.image_states.insert(image, ImageState::Undefined);
        let len = desc.extent.width as usize * desc.extent.height as usize * desc.format.bytes_per_pixel() as usize;
        state.texels.insert(
            image,
            Texels {
                format: desc.format,
                bytes: vec![0; len],
            },
        );
        Ok(image)
    }

    fn destroy_image(&self, image: RawImage) {
        let mut state = self.state.lock();
        if state.image_states.remove(&image).is_some() {
            state.texels.remove(&image);
            state.destroy(ObjectKind::Image);
        }
    }

    fn create_image_view(&self, image: RawImage, _format: ImageFormat) -> Result<RawImageView> {
        let mut state = self.state.lock();
        let view = RawImageView(state.create(ObjectKind::ImageView));
        state.views.insert(view, image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: RawImageView) {
        if !view.is_null() {
            let mut state = self.state.lock();
            state.views.remove(&view);
            state.destroy(ObjectKind::ImageView);
        }
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<RawSampler> {
        let mut state = self.state.lock();
        Ok(RawSampler(state.create(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: RawSampler) {
        if !sampler.is_null() {
            self.state.lock().destroy(ObjectKind::Sampler);
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer> {
        if desc.size == 0 {
            bail!("Cannot create a zero-sized buffer");
        }
        let mut state = self.state.lock();
        let buffer = RawBuffer(state.create(ObjectKind::Buffer));
        state.buffers.insert(buffer, vec![0; desc.size as usize]);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: RawBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let contents = state.buffers.get_mut(&buffer).context("Unknown buffer")?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            bail!("Write of {} bytes at {} overflows buffer of {} bytes", data.len(), offset, contents.len());
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: RawBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let contents = state.buffers.get(&buffer).context("Unknown buffer")?;
        let start = offset as usize;
        let end = start + out.len();
        if end > contents.len() {
            bail!("Read of {} bytes at {} overflows buffer of {} bytes", out.len(), offset, contents.len());
        }
        out.copy_from_slice(&contents[start..end]);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.destroy(ObjectKind::Buffer);
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RawRenderPass> {
        if desc.colors.is_empty() {
            bail!("Render pass needs at least one color attachment");
        }
        let mut state = self.state.lock();
        let render_pass = RawRenderPass(state.create(ObjectKind::RenderPass));
        state.render_passes.insert(render_pass, desc.clone());
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: RawRenderPass) {
        if !render_pass.is_null() {
            let mut state = self.state.lock();
            state.render_passes.remove(&render_pass);
            state.destroy(ObjectKind::RenderPass);
        }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<RawFramebuffer> {
        if desc.extent.is_zero_area() {
            bail!("Cannot create a zero-area framebuffer");
        }
        let mut state = self.state.lock();
        if let Some(pass) = state.render_passes.get(&desc.render_pass) {
            let expected = pass.colors.len() + usize::from(pass.depth.is_some());
            if desc.attachments.len() != expected {
                bail!(
                    "Framebuffer has {} attachments but its render pass expects {}",
                    desc.attachments.len(),
                    expected
                );
            }
        }
        let framebuffer = RawFramebuffer(state.create(ObjectKind::Framebuffer));
        state.framebuffers.insert(framebuffer, desc.attachments.clone());
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: RawFramebuffer) {
        if framebuffer.is_null() {
            return;
        }
        let mut state = self.state.lock();
        if state.timelines[QueueKind::Graphics.index()].submitted
            > state.timelines[QueueKind::Graphics.index()].completed
        {
            log::error!("[Headless] Framebuffer {:?} destroyed with work in flight", framebuffer);
            state.stats.hazards += 1;
        }
        state.framebuffers.remove(&framebuffer);
        state.destroy(ObjectKind::Framebuffer);
    }

    fn create_shader_module(&self, words: &[u32]) -> Result<RawShaderModule> {
        if words.is_empty() {
            bail!("Empty shader module");
        }
        let mut state = self.state.lock();
        Ok(RawShaderModule(state.create(ObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: RawShaderModule) {
        if !module.is_null() {
            self.state.lock().destroy(ObjectKind::ShaderModule);
        }
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<RawDescriptorPool> {
        let mut state = self.state.lock();
        let pool = RawDescriptorPool(state.create(ObjectKind::DescriptorPool));
        let remaining = HashMap::from([
            (DescriptorKind::UniformBuffer, desc.uniform_buffers),
            (DescriptorKind::StorageBuffer, desc.storage_buffers),
            (DescriptorKind::SampledImage, desc.sampled_images),
            (DescriptorKind::Sampler, desc.samplers),
            (DescriptorKind::CombinedImageSampler, desc.combined_image_samplers),
            (DescriptorKind::StorageImage, desc.storage_images),
        ]);
        state.pools.insert(
            pool,
            PoolState {
                max_sets: desc.max_sets,
                remaining,
                sets: HashSet::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        let mut state = self.state.lock();
        let Some(pool_state) = state.pools.remove(&pool) else {
            return;
        };
        for set in pool_state.sets {
            state.sets.remove(&set);
            state.destroy(ObjectKind::DescriptorSet);
        }
        state.destroy(ObjectKind::DescriptorPool);
    }

    fn create_set_layout(&self, bindings: &[SetLayoutBinding]) -> Result<RawSetLayout> {
        let mut state = self.state.lock();
        let mut seen = HashSet::new();
        for binding in bindings {
            if !seen.insert(binding.binding) {
                bail!("Set layout declares binding {} twice", binding.binding);
            }
        }
        let layout = RawSetLayout(state.create(ObjectKind::SetLayout));
        state.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_set_layout(&self, layout: RawSetLayout) {
        let mut state = self.state.lock();
        if state.set_layouts.remove(&layout).is_some() {
            state.destroy(ObjectKind::SetLayout);
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: RawDescriptorPool,
        layouts: &[RawSetLayout],
    ) -> Result<Vec<RawDescriptorSet>> {
        let mut state = self.state.lock();

        // Validate the whole request before touching the pool
        let mut needed: HashMap<DescriptorKind, u32> = HashMap::new();
        for layout in layouts {
            let bindings = state.set_layouts.get(layout).context("Unknown set layout")?;
            for binding in bindings {
                *needed.entry(binding.kind).or_insert(0) += binding.count;
            }
        }
        let pool_state = state.pools.get(&pool).context("Unknown descriptor pool")?;
        if pool_state.sets.len() + layouts.len() > pool_state.max_sets as usize {
            bail!(
                "Descriptor pool exhausted: {} sets live, {} requested, max {}",
                pool_state.sets.len(),
                layouts.len(),
                pool_state.max_sets
            );
        }
        for (kind, count) in &needed {
            let remaining = pool_state.remaining.get(kind).copied().unwrap_or(0);
            if *count > remaining {
                bail!("Descriptor pool exhausted: {} {:?} requested, {} remaining", count, kind, remaining);
            }
        }

        let mut sets = Vec::with_capacity(layouts.len());
        for layout in layouts {
            let set = RawDescriptorSet(state.create(ObjectKind::DescriptorSet));
            state.sets.insert(
                set,
                SetState {
                    pool,
                    layout: *layout,
                    writes: BTreeMap::new(),
                },
            );
            sets.push(set);
        }
        if let Some(pool_state) = state.pools.get_mut(&pool) {
            for (kind, count) in needed {
                if let Some(remaining) = pool_state.remaining.get_mut(&kind) {
                    *remaining -= count;
                }
            }
            pool_state.sets.extend(sets.iter().copied());
        }
        Ok(sets)
    }

    fn free_descriptor_sets(&self, pool: RawDescriptorPool, sets: &[RawDescriptorSet]) -> Result<()> {
        let mut state = self.state.lock();
        for set in sets {
            let set_state = state.sets.remove(set).context("Freeing unknown descriptor set")?;
            if set_state.pool != pool {
                bail!("Descriptor set {:?} freed through the wrong pool", set);
            }
            let bindings = state.set_layouts.get(&set_state.layout).cloned().unwrap_or_default();
            if let Some(pool_state) = state.pools.get_mut(&pool) {
                pool_state.sets.remove(set);
                for binding in bindings {
                    *pool_state.remaining.entry(binding.kind).or_insert(0) += binding.count;
                }
            }
            state.destroy(ObjectKind::DescriptorSet);
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> Result<()> {
        let mut state = self.state.lock();
        for write in writes {
            let set = state.sets.get(&write.set).context("Write to unknown descriptor set")?;
            let bindings = state.set_layouts.get(&set.layout).context("Descriptor set has no layout")?;
            let declared = bindings
                .iter()
                .find(|b| b.binding == write.binding)
                .with_context(|| format!("Binding {} is not in the set layout", write.binding))?;
            if write.slot >= declared.count {
                bail!("Slot {} out of range for binding {} (count {})", write.slot, write.binding, declared.count);
            }
            let kind = match write.resource {
                DescriptorResource::Buffer { kind, .. } | DescriptorResource::Image { kind, .. } => kind,
            };
            if kind != declared.kind {
                bail!("Binding {} is {:?} but was written as {:?}", write.binding, declared.kind, kind);
            }
            if let Some(set) = state.sets.get_mut(&write.set) {
                set.writes.insert((write.binding, write.slot), write.resource);
            }
        }
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        _push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout> {
        let mut state = self.state.lock();
        for layout in set_layouts {
            if !state.set_layouts.contains_key(layout) {
                bail!("Pipeline layout references unknown set layout {:?}", layout);
            }
        }
        Ok(RawPipelineLayout(state.create(ObjectKind::PipelineLayout)))
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        if !layout.is_null() {
            self.state.lock().destroy(ObjectKind::PipelineLayout);
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<RawPipeline> {
        if desc.stages.is_empty() {
            bail!("Graphics pipeline needs at least one shader stage");
        }
        if desc.render_pass.is_null() {
            bail!("Graphics pipeline needs a render pass");
        }
        let mut state = self.state.lock();
        if let Some(pass) = state.render_passes.get(&desc.render_pass) {
            if pass.colors.len() != desc.color_attachments as usize {
                bail!(
                    "Pipeline blends {} color attachments but its render pass has {}",
                    desc.color_attachments,
                    pass.colors.len()
                );
            }
        }
        let pipeline = RawPipeline(state.create(ObjectKind::Pipeline));
        state.pipelines.insert(pipeline, (desc.blend, desc.color_attachments));
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: RawPipeline) {
        if !pipeline.is_null() {
            let mut state = self.state.lock();
            state.pipelines.remove(&pipeline);
            state.destroy(ObjectKind::Pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ended_list(device: &HeadlessDevice) -> RawCommandList {
        let list = device.allocate_command_list(QueueKind::Graphics).unwrap();
        device.begin_command_list(list).unwrap();
        device.end_command_list(list).unwrap();
        list
    }

    #[test]
    fn immediate_mode_completes_on_submit() {
        let device = HeadlessDevice::new();
        let list = ended_list(&device);
        let value = device
            .submit(QueueKind::Graphics, &Submission { list, wait: None, signal: None })
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(device.completed_value(QueueKind::Graphics).unwrap(), 1);
        assert_eq!(device.outstanding_submissions(), 0);
    }

    #[test]
    fn reset_while_pending_is_a_violation() {
        let device = HeadlessDevice::new().with_completion(CompletionMode::Manual);
        let list = ended_list(&device);
        device
            .submit(QueueKind::Graphics, &Submission { list, wait: None, signal: None })
            .unwrap();

        assert!(device.reset_command_list(list).is_err());
        assert_eq!(device.stats().fence_violations, 1);

        device.complete_all();
        assert!(device.reset_command_list(list).is_ok());
    }

    #[test]
    fn cpu_wait_counts_a_stall_only_when_busy() {
        let device = HeadlessDevice::new().with_completion(CompletionMode::Manual);
        let list = ended_list(&device);
        let value = device
            .submit(QueueKind::Graphics, &Submission { list, wait: None, signal: None })
            .unwrap();

        device.wait_for_value(QueueKind::Graphics, value).unwrap();
        device.wait_for_value(QueueKind::Graphics, value).unwrap();
        assert_eq!(device.stats().stalls, 1);
        assert!(device.wait_for_value(QueueKind::Graphics, value + 1).is_err());
    }

    #[test]
    fn waiting_on_unsignaled_semaphore_fails() {
        let device = HeadlessDevice::new();
        let list = ended_list(&device);
        let semaphore = device.create_semaphore().unwrap();
        let result = device.submit(
            QueueKind::Graphics,
            &Submission {
                list,
                wait: Some((semaphore, PipelineStages::COLOR_ATTACHMENT_OUTPUT)),
                signal: None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn descriptor_pool_enforces_max_sets() {
        let device = HeadlessDevice::new();
        let layout = device
            .create_set_layout(&[SetLayoutBinding {
                binding: 0,
                kind: DescriptorKind::UniformBuffer,
                count: 1,
                stages: ShaderStages::VERTEX,
            }])
            .unwrap();
        let pool = device
            .create_descriptor_pool(&DescriptorPoolDesc {
                max_sets: 2,
                uniform_buffers: 10,
                storage_buffers: 0,
                sampled_images: 0,
                samplers: 0,
                combined_image_samplers: 0,
                storage_images: 0,
            })
            .unwrap();

        let sets = device.allocate_descriptor_sets(pool, &[layout, layout]).unwrap();
        assert!(device.allocate_descriptor_sets(pool, &[layout]).is_err());

        device.free_descriptor_sets(pool, &sets[..1]).unwrap();
        assert!(device.allocate_descriptor_sets(pool, &[layout]).is_ok());
    }

    #[test]
    fn swapchain_goes_out_of_date_when_surface_changes() {
        let device = HeadlessDevice::new();
        let surface = device.create_surface(SurfaceTarget::Headless).unwrap();
        let images = device
            .create_swapchain(
                &SwapchainDesc {
                    surface,
                    extent: Extent2D::new(800, 600),
                    image_count: 3,
                    present_mode: PresentMode::Fifo,
                    format: None,
                },
                RawSwapchain::NULL,
            )
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.set_surface_extent(Extent2D::new(1024, 768));
        assert_eq!(
            device.acquire_next_image(images.swapchain, semaphore).unwrap(),
            AcquireResult::OutOfDate
        );
    }

    #[test]
    fn clear_colors_follow_the_attachment_format() {
        let red = [1.0, 0.0, 0.0, 1.0];
        assert_eq!(encode_color(ImageFormat::Rgba8Unorm, red), vec![255, 0, 0, 255]);
        assert_eq!(encode_color(ImageFormat::Bgra8Unorm, red), vec![0, 0, 255, 255]);
        assert_eq!(encode_color(ImageFormat::R8Unorm, [0.2, 1.0, 1.0, 1.0]), vec![51]);
        assert_eq!(encode_color(ImageFormat::Rgba8Srgb, [0.5, 0.0, 1.0, 0.5]), vec![188, 0, 255, 128]);
        assert!(encode_color(ImageFormat::Depth32Float, red).is_empty());

        assert_eq!(half_bits(1.0), 0x3c00);
        assert_eq!(half_bits(-2.0), 0xc000);
        assert_eq!(half_bits(0.0), 0);
        assert_eq!(half_bits(f32::INFINITY), 0x7c00);
    }
}
