// Typed errors for contract violations and exhausted pools
//
// Device failures travel as plain anyhow errors with context. The enums
// below mark the conditions callers may want to tell apart; they are carried
// inside anyhow::Error and recovered with `downcast_ref`.

use thiserror::Error;

use crate::backend::{DescriptorKind, QueueKind};

/// Misuse of a pipeline's binding table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("binding {binding} in set {set} holds {existing:?}, cannot bind {requested:?}")]
    KindConflict {
        set: u32,
        binding: u32,
        existing: DescriptorKind,
        requested: DescriptorKind,
    },
    #[error("binding {binding} is not declared in set {set} of shader '{shader}'")]
    NotDeclared { shader: String, set: u32, binding: u32 },
    #[error("slot {slot} out of range for binding {binding} (array length {count})")]
    SlotOutOfRange { binding: u32, slot: u32, count: u32 },
    #[error("descriptor set {set} is not declared by shader '{shader}'")]
    SetNotFound { shader: String, set: u32 },
    #[error("image index {index} out of range ({count} presentable images)")]
    ImageIndexOutOfRange { index: usize, count: usize },
}

/// Reflection tables that cannot be merged into one pipeline layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("incompatible resource types at set {set} binding {binding}: '{first}' and '{second}'")]
    BindingCollision {
        set: u32,
        binding: u32,
        first: String,
        second: String,
    },
    #[error("pipeline needs a shader")]
    MissingShader,
    #[error("pipeline needs a render pass contract")]
    MissingRenderPass,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{queue:?} queue exhausted: all {limit} command lists are in flight")]
    Exhausted { queue: QueueKind, limit: usize },
    #[error("command list is {state}, expected {expected}")]
    InvalidState { state: &'static str, expected: &'static str },
    #[error("command list belongs to the {owner:?} queue, not {queue:?}")]
    WrongQueue { owner: QueueKind, queue: QueueKind },
    #[error("command list is still pending on fence value {fence}")]
    Pending { fence: crate::backend::FenceValue },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwapchainError {
    #[error("no image has been acquired for this frame")]
    NotAcquired,
    #[error("surface format changed from {old:?} to {new:?} across resize")]
    FormatChanged {
        old: crate::backend::ImageFormat,
        new: crate::backend::ImageFormat,
    },
    #[error("command list index {index} out of range ({count} presentable images)")]
    ImageIndexOutOfRange { index: usize, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramebufferError {
    #[error("framebuffer extent {width}x{height} has zero area")]
    ZeroExtent { width: u32, height: u32 },
    #[error("framebuffer needs at least one color attachment")]
    NoAttachments,
    #[error("attachment {index} uses depth format {format:?}, only color attachments are supported")]
    DepthAttachment {
        index: usize,
        format: crate::backend::ImageFormat,
    },
    #[error("attachment {index} out of range ({count} attachments)")]
    AttachmentOutOfRange { index: usize, count: usize },
}
