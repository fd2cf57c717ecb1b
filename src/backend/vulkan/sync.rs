// Timeline semaphores and queue submission
//
// Every submission signals the queue's timeline with the next value. Binary
// semaphores (acquire -> render -> present) ride along in the same submit.

use anyhow::{Context, Result};
use ash::vk;

use super::conv::{self, AsVk};
use super::VulkanDevice;
use crate::backend::types::*;

/// How long a CPU wait may block before it is reported as a lost device
const WAIT_TIMEOUT_NS: u64 = 10_000_000_000;

pub(super) fn create_timeline(device: &ash::Device) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
    let semaphore = unsafe { device.create_semaphore(&info, None) }.context("Failed to create timeline semaphore")?;
    Ok(semaphore)
}

impl VulkanDevice {
    pub(super) fn submit_list(&self, queue: QueueKind, submission: &Submission) -> Result<FenceValue> {
        let slot = self.slot(queue);
        let _submit = slot.submit_lock.lock();
        let mut signaled = slot.signaled.lock();
        let value = *signaled + 1;

        let command_buffers = [submission.list.vk()];

        let mut wait_semaphores = Vec::with_capacity(1);
        let mut wait_stages = Vec::with_capacity(1);
        let mut wait_values = Vec::with_capacity(1);
        if let Some((semaphore, stages)) = submission.wait {
            wait_semaphores.push(semaphore.vk());
            wait_stages.push(conv::pipeline_stages(stages));
            // Ignored for binary semaphores
            wait_values.push(0);
        }

        let mut signal_semaphores = vec![slot.timeline];
        let mut signal_values = vec![value];
        if let Some(semaphore) = submission.signal {
            signal_semaphores.push(semaphore.vk());
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe {
            self.device
                .queue_submit(slot.queue, std::slice::from_ref(&submit_info), vk::Fence::null())
        }
        .with_context(|| format!("Failed to submit to {:?} queue", queue))?;

        *signaled = value;
        Ok(value)
    }

    pub(super) fn wait_timeline(&self, queue: QueueKind, value: FenceValue) -> Result<()> {
        let slot = self.slot(queue);
        let signaled = *slot.signaled.lock();
        if value > signaled {
            anyhow::bail!(
                "Wait for fence value {} on {:?} which was never submitted (last {})",
                value,
                queue,
                signaled
            );
        }

        let semaphores = [slot.timeline];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);

        match unsafe { self.device.wait_semaphores(&info, WAIT_TIMEOUT_NS) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                anyhow::bail!("GPU did not reach fence value {} on {:?} in time", value, queue)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to wait on {:?} timeline", queue)),
        }
    }
}
