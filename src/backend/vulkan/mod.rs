// Vulkan device - GpuDevice over ash + gpu-allocator
//
// Responsibilities:
// - Instance creation with validation layers and every surface extension
//   the platform offers
// - Physical device selection (prefer discrete GPU, require Vulkan 1.2
//   timeline semaphores)
// - Logical device with a graphics queue and, when the family has room,
//   a second queue used for transfers
// - One timeline semaphore per queue kind: the fence value `submit` returns
//   is the value that submission signals on it
// - Memory allocator setup and the allocations backing images and buffers
//
// Object creation lives in the submodules; this file wires the trait.

mod commands;
mod conv;
mod pipeline;
mod presentation;
mod resources;
mod sync;

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::types::*;
use super::GpuDevice;
use conv::AsVk;

/// Required Vulkan device features
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    // Wireframe pipelines
    fill_mode_non_solid: vk::TRUE,
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Surface extensions enabled when the loader reports them
const SURFACE_EXTENSIONS: [&CStr; 4] = [
    khr::XlibSurface::name(),
    khr::XcbSurface::name(),
    khr::WaylandSurface::name(),
    khr::Win32Surface::name(),
];

/// One queue kind: where it submits and the timeline it signals
struct QueueSlot {
    queue: vk::Queue,
    /// Shared by both kinds when they map onto the same vk::Queue
    submit_lock: Arc<Mutex<()>>,
    timeline: vk::Semaphore,
    /// Last value handed out by `submit`
    signaled: Mutex<FenceValue>,
    /// Lists of one queue are recorded from one thread at a time
    command_pool: Mutex<vk::CommandPool>,
}

/// Host-visible memory behind a buffer; `size` is what the caller asked for
struct BufferMemory {
    allocation: Allocation,
    size: u64,
}

/// Memory behind the objects the device created
#[derive(Default)]
struct Allocations {
    buffers: HashMap<vk::Buffer, BufferMemory>,
    images: HashMap<vk::Image, Allocation>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    name: String,
    // `None` only while dropping: it must go before the device does
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<Allocations>,
    queues: [QueueSlot; 2],
    queue_family: u32,
    // Color attachment count per render pass, to lay out clear values
    render_pass_colors: Mutex<HashMap<vk::RenderPass, usize>>,

    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,

    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    instance: ash::Instance,
    entry: Entry,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;
        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, queue_family, queue_count) = Self::pick_physical_device(&instance)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Selected GPU: {}", name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Transfers get their own queue when the family has a second one
        let queue_count = queue_count.min(2);
        let device = Self::create_logical_device(&instance, physical_device, queue_family, queue_count)?;

        let graphics_queue = unsafe { device.get_device_queue(queue_family, 0) };
        let transfer_queue = unsafe { device.get_device_queue(queue_family, queue_count - 1) };
        let graphics_lock = Arc::new(Mutex::new(()));
        let transfer_lock = if queue_count > 1 {
            Arc::new(Mutex::new(()))
        } else {
            graphics_lock.clone()
        };
        log::info!(
            "Queue family {}: {}",
            queue_family,
            if queue_count > 1 { "separate transfer queue" } else { "transfers share the graphics queue" }
        );

        let queues = [
            Self::create_queue_slot(&device, queue_family, graphics_queue, graphics_lock)?,
            Self::create_queue_slot(&device, queue_family, transfer_queue, transfer_lock)?,
        ];

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            name,
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(Allocations::default()),
            queues,
            queue_family,
            render_pass_colors: Mutex::new(HashMap::new()),
            surface_loader: khr::Surface::new(&entry, &instance),
            swapchain_loader: khr::Swapchain::new(&instance, &device),
            device,
            physical_device,
            instance,
            entry,
            debug_utils,
            properties,
        }))
    }

    fn create_instance(entry: &Entry, app_name: &str, enable_validation: bool) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("render-core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let available: Vec<CString> = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?
            .iter()
            .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
            .collect();

        let mut extensions = vec![khr::Surface::name().as_ptr()];
        for name in SURFACE_EXTENSIONS {
            if available.iter().any(|a| a.as_c_str() == name) {
                extensions.push(name.as_ptr());
            }
        }
        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Best scoring device with a graphics family and timeline semaphores.
    /// Returns the device, the family and how many queues it offers.
    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.api_version < vk::API_VERSION_1_2 {
                continue;
            }

            let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut vulkan12);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
            let features = features2.features;
            if !Self::check_device_features(&features) || vulkan12.timeline_semaphore != vk::TRUE {
                continue;
            }

            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, props)| (i as u32, props.queue_count));

            if let Some((family, queue_count)) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, family, queue_count.max(1)));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found (Vulkan 1.2 with timeline semaphores)"))
    }

    fn check_device_features(features: &vk::PhysicalDeviceFeatures) -> bool {
        features.fill_mode_non_solid == vk::TRUE && features.sampler_anisotropy == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        queue_count: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = vec![1.0; queue_count as usize];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES)
            .push_next(&mut vulkan12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_queue_slot(
        device: &ash::Device,
        queue_family: u32,
        queue: vk::Queue,
        submit_lock: Arc<Mutex<()>>,
    ) -> Result<QueueSlot> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.context("Failed to create command pool")?;

        Ok(QueueSlot {
            queue,
            submit_lock,
            timeline: sync::create_timeline(device)?,
            signaled: Mutex::new(0),
            command_pool: Mutex::new(command_pool),
        })
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    fn slot(&self, queue: QueueKind) -> &QueueSlot {
        &self.queues[queue.index()]
    }

    pub fn raw_device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<FenceValue> {
        self.submit_list(queue, submission)
    }

    fn completed_value(&self, queue: QueueKind) -> Result<FenceValue> {
        let value = unsafe { self.device.get_semaphore_counter_value(self.slot(queue).timeline) }
            .with_context(|| format!("Failed to read {:?} timeline", queue))?;
        Ok(value)
    }

    fn wait_for_value(&self, queue: QueueKind, value: FenceValue) -> Result<()> {
        self.wait_timeline(queue, value)
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }

    fn allocate_command_list(&self, queue: QueueKind) -> Result<RawCommandList> {
        let pool = self.slot(queue).command_pool.lock();
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers =
            unsafe { self.device.allocate_command_buffers(&info) }.context("Failed to allocate command buffer")?;
        let buffer = buffers.first().context("Driver returned no command buffer")?;
        Ok(RawCommandList::from_vk(*buffer))
    }

    fn free_command_list(&self, queue: QueueKind, list: RawCommandList) {
        let pool = self.slot(queue).command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[list.vk()]) };
    }

    fn reset_command_list(&self, list: RawCommandList) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(list.vk(), vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")?;
        Ok(())
    }

    fn begin_command_list(&self, list: RawCommandList) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(list.vk(), &info) }.context("Failed to begin command buffer")?;
        Ok(())
    }

    fn end_command_list(&self, list: RawCommandList) -> Result<()> {
        unsafe { self.device.end_command_buffer(list.vk()) }.context("Failed to end command buffer")?;
        Ok(())
    }

    fn record(&self, list: RawCommandList, command: &Command<'_>) -> Result<()> {
        self.record_command(list.vk(), command);
        Ok(())
    }

    fn create_semaphore(&self) -> Result<RawSemaphore> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .context("Failed to create semaphore")?;
        Ok(RawSemaphore::from_vk(semaphore))
    }

    fn destroy_semaphore(&self, semaphore: RawSemaphore) {
        unsafe { self.device.destroy_semaphore(semaphore.vk(), None) };
    }

    fn create_surface(&self, target: SurfaceTarget) -> Result<RawSurface> {
        self.create_window_surface(target)
    }

    fn destroy_surface(&self, surface: RawSurface) {
        unsafe { self.surface_loader.destroy_surface(surface.vk(), None) };
    }

    fn surface_extent(&self, surface: RawSurface) -> Result<Option<Extent2D>> {
        self.current_surface_extent(surface.vk())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, old: RawSwapchain) -> Result<SwapchainImages> {
        self.build_swapchain(desc, old.vk())
    }

    fn destroy_swapchain(&self, swapchain: RawSwapchain) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain.vk(), None) };
    }

    fn acquire_next_image(&self, swapchain: RawSwapchain, signal: RawSemaphore) -> Result<AcquireResult> {
        self.acquire(swapchain.vk(), signal.vk())
    }

    fn present(
        &self,
        queue: QueueKind,
        swapchain: RawSwapchain,
        image_index: u32,
        wait: RawSemaphore,
    ) -> Result<PresentResult> {
        self.queue_present(queue, swapchain.vk(), image_index, wait.vk())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<RawImage> {
        self.allocate_image(desc)
    }

    fn destroy_image(&self, image: RawImage) {
        self.free_image(image.vk())
    }

    fn create_image_view(&self, image: RawImage, format: ImageFormat) -> Result<RawImageView> {
        self.build_image_view(image.vk(), format)
    }

    fn destroy_image_view(&self, view: RawImageView) {
        unsafe { self.device.destroy_image_view(view.vk(), None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<RawSampler> {
        self.build_sampler(desc)
    }

    fn destroy_sampler(&self, sampler: RawSampler) {
        unsafe { self.device.destroy_sampler(sampler.vk(), None) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer> {
        self.allocate_buffer(desc)
    }

    fn write_buffer(&self, buffer: RawBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.write_mapped(buffer.vk(), offset, data)
    }

    fn read_buffer(&self, buffer: RawBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        self.read_mapped(buffer.vk(), offset, out)
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.free_buffer(buffer.vk())
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RawRenderPass> {
        let render_pass = self.build_render_pass(desc)?;
        self.render_pass_colors
            .lock()
            .insert(render_pass.vk(), desc.colors.len());
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: RawRenderPass) {
        self.render_pass_colors.lock().remove(&render_pass.vk());
        unsafe { self.device.destroy_render_pass(render_pass.vk(), None) };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<RawFramebuffer> {
        self.build_framebuffer(desc)
    }

    fn destroy_framebuffer(&self, framebuffer: RawFramebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer.vk(), None) };
    }

    fn create_shader_module(&self, words: &[u32]) -> Result<RawShaderModule> {
        self.build_shader_module(words)
    }

    fn destroy_shader_module(&self, module: RawShaderModule) {
        unsafe { self.device.destroy_shader_module(module.vk(), None) };
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<RawDescriptorPool> {
        self.build_descriptor_pool(desc)
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool.vk(), None) };
    }

    fn create_set_layout(&self, bindings: &[SetLayoutBinding]) -> Result<RawSetLayout> {
        self.build_set_layout(bindings)
    }

    fn destroy_set_layout(&self, layout: RawSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout.vk(), None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: RawDescriptorPool,
        layouts: &[RawSetLayout],
    ) -> Result<Vec<RawDescriptorSet>> {
        self.allocate_sets(pool.vk(), layouts)
    }

    fn free_descriptor_sets(&self, pool: RawDescriptorPool, sets: &[RawDescriptorSet]) -> Result<()> {
        let sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| s.vk()).collect();
        unsafe { self.device.free_descriptor_sets(pool.vk(), &sets) }.context("Failed to free descriptor sets")?;
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> Result<()> {
        self.write_descriptors(writes);
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout> {
        self.build_pipeline_layout(set_layouts, push_constants)
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout.vk(), None) };
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<RawPipeline> {
        self.build_graphics_pipeline(desc)
    }

    fn destroy_pipeline(&self, pipeline: RawPipeline) {
        unsafe { self.device.destroy_pipeline(pipeline.vk(), None) };
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = GpuDevice::wait_idle(self) {
            log::error!("{:#}", e);
        }

        // Anything still allocated here leaked past its owner
        let mut allocations = std::mem::take(&mut *self.allocations.lock());
        if !allocations.buffers.is_empty() || !allocations.images.is_empty() {
            log::warn!(
                "{} buffers and {} images still alive at device destruction",
                allocations.buffers.len(),
                allocations.images.len()
            );
        }

        unsafe {
            for (buffer, _) in &allocations.buffers {
                self.device.destroy_buffer(*buffer, None);
            }
            for (image, _) in &allocations.images {
                self.device.destroy_image(*image, None);
            }
            if let Some(mut allocator) = self.allocator.lock().take() {
                let buffers = allocations.buffers.drain().map(|(_, memory)| memory.allocation);
                for allocation in buffers.chain(allocations.images.drain().map(|(_, allocation)| allocation)) {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free allocation: {}", e);
                    }
                }
                drop(allocator);
            }

            for slot in &self.queues {
                self.device.destroy_command_pool(*slot.command_pool.lock(), None);
                self.device.destroy_semaphore(slot.timeline, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
