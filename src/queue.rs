// Command Queue - command list pool stamped with timeline fence values
//
// Lists handed out by `get()` come back through `submit()` and wait in a
// FIFO ring ordered by fence value. A list is only reused after its fence
// value is observed complete on the queue's timeline.
//
// The timeline also tracks recordings that have begun but not been
// submitted yet, so retired objects they may reference outlive them.

use anyhow::{Context, Result};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{
    Command, Extent2D, FenceValue, GpuDevice, ImageBarrier, PipelineStages, QueueKind, RawBuffer,
    RawCommandList, RawFramebuffer, RawImage, RawRenderPass, RawSemaphore, ShaderStages, Submission,
    Viewport,
};
use crate::error::QueueError;

// =============================================================================
// TIMELINE
// =============================================================================

/// CPU view of one queue's completion counter
pub struct Timeline {
    kind: QueueKind,
    device: Arc<dyn GpuDevice>,
    submitted: AtomicU64,
    /// Last value seen complete; only ever grows
    completed: AtomicU64,
    /// Ids of recordings begun and not yet submitted
    open: Mutex<BTreeSet<u64>>,
    next_recording: AtomicU64,
}

impl Timeline {
    pub fn new(device: Arc<dyn GpuDevice>, kind: QueueKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            device,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            open: Mutex::new(BTreeSet::new()),
            next_recording: AtomicU64::new(0),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn last_submitted(&self) -> FenceValue {
        self.submitted.load(Ordering::Acquire)
    }

    fn record_submitted(&self, value: FenceValue) {
        self.submitted.fetch_max(value, Ordering::AcqRel);
    }

    fn open_recording(&self) -> u64 {
        let id = self.next_recording.fetch_add(1, Ordering::AcqRel) + 1;
        self.open.lock().insert(id);
        id
    }

    fn close_recording(&self, id: u64) {
        self.open.lock().remove(&id);
    }

    /// Newest recording not yet submitted
    pub fn newest_open_recording(&self) -> Option<u64> {
        self.open.lock().iter().next_back().copied()
    }

    /// Whether a recording begun at or before `id` is still unsubmitted
    pub fn has_open_through(&self, id: u64) -> bool {
        self.open.lock().iter().next().is_some_and(|&oldest| oldest <= id)
    }

    /// Fence value zero is never submitted and is always complete
    pub fn is_complete(&self, value: FenceValue) -> Result<bool> {
        if value <= self.completed.load(Ordering::Acquire) {
            return Ok(true);
        }
        let completed = self
            .device
            .completed_value(self.kind)
            .with_context(|| format!("Failed to query {:?} timeline", self.kind))?;
        self.completed.fetch_max(completed, Ordering::AcqRel);
        Ok(value <= completed)
    }

    pub fn wait_for(&self, value: FenceValue) -> Result<()> {
        if self.is_complete(value)? {
            return Ok(());
        }
        log::debug!("Waiting for {:?} fence value {}", self.kind, value);
        self.device
            .wait_for_value(self.kind, value)
            .with_context(|| format!("Failed to wait for {:?} fence value {}", self.kind, value))?;
        self.completed.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }
}

// =============================================================================
// COMMAND LIST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Idle,
    Recording,
    Executable,
    Submitted,
}

impl ListState {
    fn name(self) -> &'static str {
        match self {
            ListState::Idle => "idle",
            ListState::Recording => "recording",
            ListState::Executable => "executable",
            ListState::Submitted => "submitted",
        }
    }
}

/// A recording target owned by the queue that allocated it
pub struct CommandList {
    raw: RawCommandList,
    timeline: Arc<Timeline>,
    live: Arc<AtomicUsize>,
    state: ListState,
    /// Value of the last submission; zero if never submitted
    fence: FenceValue,
    /// Open recording id between begin() and submission
    recording: Option<u64>,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("raw", &self.raw)
            .field("queue", &self.timeline.kind())
            .field("state", &self.state)
            .field("fence", &self.fence)
            .finish()
    }
}

impl CommandList {
    pub fn raw(&self) -> RawCommandList {
        self.raw
    }

    pub fn queue(&self) -> QueueKind {
        self.timeline.kind()
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn fence(&self) -> FenceValue {
        self.fence
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.timeline.is_complete(self.fence)
    }

    fn device(&self) -> &dyn GpuDevice {
        self.timeline.device().as_ref()
    }

    fn close_recording(&mut self) {
        if let Some(id) = self.recording.take() {
            self.timeline.close_recording(id);
        }
    }

    fn expect_state(&self, expected: ListState) -> Result<()> {
        if self.state != expected {
            return Err(QueueError::InvalidState {
                state: self.state.name(),
                expected: expected.name(),
            }
            .into());
        }
        Ok(())
    }

    /// Return a submitted list to idle; refuses while its fence is pending
    pub fn reset(&mut self) -> Result<()> {
        if self.state == ListState::Idle {
            return Ok(());
        }
        if !self.is_complete()? {
            return Err(QueueError::Pending { fence: self.fence }.into());
        }
        self.device()
            .reset_command_list(self.raw)
            .context("Failed to reset command list")?;
        self.close_recording();
        self.state = ListState::Idle;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.state == ListState::Submitted {
            self.reset()?;
        }
        self.expect_state(ListState::Idle)?;
        self.device()
            .begin_command_list(self.raw)
            .context("Failed to begin command list")?;
        self.recording = Some(self.timeline.open_recording());
        self.state = ListState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.expect_state(ListState::Recording)?;
        self.device()
            .end_command_list(self.raw)
            .context("Failed to end command list")?;
        self.state = ListState::Executable;
        Ok(())
    }

    pub fn record(&mut self, command: &Command<'_>) -> Result<()> {
        self.expect_state(ListState::Recording)?;
        self.device()
            .record(self.raw, command)
            .context("Failed to record command")
    }

    // -- typed recording helpers -------------------------------------------

    pub fn barrier(&mut self, barrier: ImageBarrier) -> Result<()> {
        self.record(&Command::Barrier(barrier))
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        extent: Extent2D,
        clear_color: [f32; 4],
    ) -> Result<()> {
        self.record(&Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_color,
        })
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        self.record(&Command::EndRenderPass)
    }

    /// Full-target viewport and scissor (pipelines use dynamic state)
    pub fn set_viewport_and_scissor(&mut self, extent: Extent2D) -> Result<()> {
        self.record(&Command::SetViewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
        }))?;
        self.record(&Command::SetScissor(extent))
    }

    pub fn push_constants<T: Pod>(
        &mut self,
        layout: crate::backend::RawPipelineLayout,
        stages: ShaderStages,
        value: &T,
    ) -> Result<()> {
        self.record(&Command::PushConstants {
            layout,
            stages,
            offset: 0,
            data: bytemuck::bytes_of(value),
        })
    }

    pub fn bind_vertex_buffer(&mut self, buffer: RawBuffer) -> Result<()> {
        self.record(&Command::BindVertexBuffer { buffer, offset: 0 })
    }

    pub fn bind_index_buffer(&mut self, buffer: RawBuffer) -> Result<()> {
        self.record(&Command::BindIndexBuffer { buffer, offset: 0 })
    }

    pub fn draw(&mut self, vertices: u32, instances: u32) -> Result<()> {
        self.record(&Command::Draw { vertices, instances })
    }

    pub fn draw_indexed(&mut self, indices: u32, instances: u32) -> Result<()> {
        self.record(&Command::DrawIndexed { indices, instances })
    }

    pub fn copy_buffer_to_image(&mut self, buffer: RawBuffer, image: RawImage, extent: Extent2D) -> Result<()> {
        self.record(&Command::CopyBufferToImage { buffer, image, extent })
    }

    pub fn copy_image_to_buffer(&mut self, image: RawImage, buffer: RawBuffer, extent: Extent2D) -> Result<()> {
        self.record(&Command::CopyImageToBuffer { image, buffer, extent })
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.close_recording();
        // Freeing a list the GPU may still execute is undefined; block instead
        match self.timeline.is_complete(self.fence) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Command list {:?} dropped while in flight, waiting", self.raw);
                if let Err(e) = self.timeline.wait_for(self.fence) {
                    log::error!("Failed to wait before freeing command list: {:#}", e);
                    return;
                }
            }
            Err(e) => {
                log::error!("Leaking command list {:?}: {:#}", self.raw, e);
                return;
            }
        }
        self.timeline.device().free_command_list(self.timeline.kind(), self.raw);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// QUEUE
// =============================================================================

pub struct Queue {
    timeline: Arc<Timeline>,
    limit: usize,
    live: Arc<AtomicUsize>,
    /// Submitted pool lists in fence order
    in_flight: Mutex<VecDeque<CommandList>>,
}

impl Queue {
    pub fn new(timeline: Arc<Timeline>, limit: usize) -> Self {
        log::debug!("Creating {:?} queue (max {} command lists)", timeline.kind(), limit);
        Self {
            timeline,
            limit,
            live: Arc::new(AtomicUsize::new(0)),
            in_flight: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.timeline.kind()
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Command lists currently allocated from this queue
    pub fn live_lists(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Pool lists submitted and not yet handed out again
    pub fn pending_lists(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_complete(&self, value: FenceValue) -> Result<bool> {
        self.timeline.is_complete(value)
    }

    pub fn wait_for(&self, value: FenceValue) -> Result<()> {
        self.timeline.wait_for(value)
    }

    pub fn last_submitted(&self) -> FenceValue {
        self.timeline.last_submitted()
    }

    /// Allocate a list outside the pool (the caller keeps it across frames)
    pub fn create_command_list(&self) -> Result<CommandList> {
        if self.live.load(Ordering::Acquire) >= self.limit {
            return Err(QueueError::Exhausted {
                queue: self.kind(),
                limit: self.limit,
            }
            .into());
        }
        let raw = self
            .timeline
            .device()
            .allocate_command_list(self.kind())
            .context("Failed to allocate command list")?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(CommandList {
            raw,
            timeline: self.timeline.clone(),
            live: self.live.clone(),
            state: ListState::Idle,
            fence: 0,
            recording: None,
        })
    }

    /// A list ready to record: the oldest submitted one if its fence is
    /// complete, otherwise a fresh allocation
    pub fn get(&self) -> Result<CommandList> {
        let recycled = {
            let mut in_flight = self.in_flight.lock();
            let front_done = match in_flight.front() {
                Some(front) => self.timeline.is_complete(front.fence())?,
                None => false,
            };
            if front_done {
                in_flight.pop_front()
            } else {
                None
            }
        };

        match recycled {
            Some(mut list) => {
                list.reset()?;
                Ok(list)
            }
            None => self.create_command_list(),
        }
    }

    fn submit_raw(
        &self,
        list: &mut CommandList,
        wait: Option<(RawSemaphore, PipelineStages)>,
        signal: Option<RawSemaphore>,
    ) -> Result<FenceValue> {
        if list.queue() != self.kind() {
            return Err(QueueError::WrongQueue {
                owner: list.queue(),
                queue: self.kind(),
            }
            .into());
        }
        if list.state == ListState::Recording {
            list.end()?;
        }
        list.expect_state(ListState::Executable)?;

        let value = self
            .timeline
            .device()
            .submit(
                self.kind(),
                &Submission {
                    list: list.raw,
                    wait,
                    signal,
                },
            )
            .with_context(|| format!("Failed to submit to {:?} queue", self.kind()))?;
        self.timeline.record_submitted(value);
        list.close_recording();

        list.state = ListState::Submitted;
        list.fence = value;
        Ok(value)
    }

    /// Submit a pool list; it returns to the pool once its fence completes
    pub fn submit(&self, mut list: CommandList, wait: bool) -> Result<FenceValue> {
        let value = self.submit_raw(&mut list, None, None)?;
        self.in_flight.lock().push_back(list);
        if wait {
            self.timeline.wait_for(value)?;
        }
        Ok(value)
    }

    /// Submit a caller-owned list gated on `wait` and signaling `signal`
    pub fn submit_frame(
        &self,
        list: &mut CommandList,
        wait: Option<(RawSemaphore, PipelineStages)>,
        signal: Option<RawSemaphore>,
    ) -> Result<FenceValue> {
        self.submit_raw(list, wait, signal)
    }

    /// Block until every submission made so far has completed
    pub fn wait(&self) -> Result<()> {
        self.timeline.wait_for(self.timeline.last_submitted())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            log::error!("Failed to drain {:?} queue: {:#}", self.kind(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{CompletionMode, HeadlessDevice};

    fn queue(mode: CompletionMode, limit: usize) -> (Arc<HeadlessDevice>, Queue) {
        let device = Arc::new(HeadlessDevice::new().with_completion(mode));
        let timeline = Timeline::new(device.clone(), QueueKind::Graphics);
        (device, Queue::new(timeline, limit))
    }

    #[test]
    fn get_recycles_completed_front() {
        let (_device, queue) = queue(CompletionMode::Immediate, 4);
        let mut list = queue.get().unwrap();
        list.begin().unwrap();
        let raw = list.raw();
        queue.submit(list, false).unwrap();

        let again = queue.get().unwrap();
        assert_eq!(again.raw(), raw);
        assert_eq!(again.state(), ListState::Idle);
        assert_eq!(queue.live_lists(), 1);
    }

    #[test]
    fn get_allocates_while_front_is_pending() {
        let (device, queue) = queue(CompletionMode::Manual, 4);
        let mut list = queue.get().unwrap();
        list.begin().unwrap();
        let raw = list.raw();
        queue.submit(list, false).unwrap();

        let fresh = queue.get().unwrap();
        assert_ne!(fresh.raw(), raw);
        assert_eq!(device.stats().fence_violations, 0);
    }

    #[test]
    fn reset_refuses_pending_list() {
        let (device, queue) = queue(CompletionMode::Manual, 4);
        let mut list = queue.create_command_list().unwrap();
        list.begin().unwrap();
        queue.submit_frame(&mut list, None, None).unwrap();

        let err = list.reset().unwrap_err();
        assert!(matches!(err.downcast_ref::<QueueError>(), Some(QueueError::Pending { .. })));
        // The guard fires before the device sees the reset
        assert_eq!(device.stats().fence_violations, 0);

        device.complete_all();
        list.reset().unwrap();
    }

    #[test]
    fn exhaustion_is_reported() {
        let (_device, queue) = queue(CompletionMode::Manual, 2);
        let _a = queue.create_command_list().unwrap();
        let _b = queue.create_command_list().unwrap();
        let err = queue.get().unwrap_err();
        assert!(matches!(err.downcast_ref::<QueueError>(), Some(QueueError::Exhausted { limit: 2, .. })));
    }

    #[test]
    fn recordings_stay_open_until_submitted() {
        let (_device, queue) = queue(CompletionMode::Manual, 4);
        let timeline = queue.timeline().clone();
        let mut first = queue.get().unwrap();
        first.begin().unwrap();
        let mut second = queue.get().unwrap();
        second.begin().unwrap();

        let newest = timeline.newest_open_recording().unwrap();
        assert!(timeline.has_open_through(newest));

        queue.submit(first, false).unwrap();
        assert!(timeline.has_open_through(newest));
        drop(second);
        assert!(!timeline.has_open_through(newest));
        assert_eq!(timeline.newest_open_recording(), None);
    }

    #[test]
    fn submit_with_wait_blocks_until_complete() {
        let (device, queue) = queue(CompletionMode::Manual, 4);
        let mut list = queue.get().unwrap();
        list.begin().unwrap();
        let value = queue.submit(list, true).unwrap();
        assert!(queue.is_complete(value).unwrap());
        assert_eq!(device.stats().stalls, 1);
    }
}
