// Surfaces and swapchains
//
// Surface creation dispatches on the raw window handle. Swapchain creation
// picks format, present mode, extent and image count from what the surface
// supports; the core only sees the result.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::conv::{self, AsVk};
use super::VulkanDevice;
use crate::backend::types::*;

/// Formats tried in order when the caller has no preference
const PREFERRED_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8_UNORM,
    vk::Format::R8G8B8_UNORM,
];

/// Fallbacks after the requested mode, FIFO is always supported
const PRESENT_MODE_FALLBACKS: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::IMMEDIATE,
    vk::PresentModeKHR::FIFO,
];

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    keep: Option<ImageFormat>,
) -> Result<(vk::SurfaceFormatKHR, ImageFormat)> {
    let srgb_nonlinear = |format: vk::Format| {
        formats
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
    };

    let kept = keep.and_then(|f| srgb_nonlinear(conv::format(f)));
    let chosen = kept
        .or_else(|| PREFERRED_FORMATS.iter().find_map(|&f| srgb_nonlinear(f)))
        .or_else(|| formats.iter().find(|f| conv::image_format(f.format).is_some()))
        .context("No suitable surface format")?;

    let format = conv::image_format(chosen.format).context("Surface format has no ImageFormat")?;
    Ok((*chosen, format))
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], requested: PresentMode) -> vk::PresentModeKHR {
    std::iter::once(conv::present_mode(requested))
        .chain(PRESENT_MODE_FALLBACKS)
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

impl VulkanDevice {
    pub(super) fn create_window_surface(&self, target: SurfaceTarget) -> Result<RawSurface> {
        let (display, window) = match target {
            SurfaceTarget::Native { display, window } => (display, window),
            SurfaceTarget::Headless => anyhow::bail!("Vulkan device needs a native window to present to"),
        };

        let surface = unsafe {
            match (display, window) {
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                    let dpy = display
                        .display
                        .context("Xlib display handle is missing its connection")?;
                    let info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy.as_ptr() as *mut vk::Display)
                        .window(window.window);
                    khr::XlibSurface::new(&self.entry, &self.instance).create_xlib_surface(&info, None)
                }
                (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
                    let connection = display
                        .connection
                        .context("XCB display handle is missing its connection")?;
                    let info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection.as_ptr())
                        .window(window.window.get());
                    khr::XcbSurface::new(&self.entry, &self.instance).create_xcb_surface(&info, None)
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                    let info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr())
                        .surface(window.surface.as_ptr());
                    khr::WaylandSurface::new(&self.entry, &self.instance).create_wayland_surface(&info, None)
                }
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
                    let hinstance = window.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                    let hwnd = window.hwnd.get() as *const std::ffi::c_void;
                    let info = vk::Win32SurfaceCreateInfoKHR::builder().hinstance(hinstance).hwnd(hwnd);
                    khr::Win32Surface::new(&self.entry, &self.instance).create_win32_surface(&info, None)
                }
                (display, window) => anyhow::bail!("Unsupported window system: {:?} / {:?}", display, window),
            }
        }
        .context("Failed to create window surface")?;

        // Verify the GPU supports presenting to this surface
        let supported = unsafe {
            self.surface_loader
                .get_physical_device_surface_support(self.physical_device, self.queue_family, surface)
        }?;
        if !supported {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        Ok(RawSurface::from_vk(surface))
    }

    pub(super) fn current_surface_extent(&self, surface: vk::SurfaceKHR) -> Result<Option<Extent2D>> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
        .context("Failed to query surface capabilities")?;

        // u32::MAX means the swapchain decides
        if caps.current_extent.width == u32::MAX {
            Ok(None)
        } else {
            Ok(Some(Extent2D::new(caps.current_extent.width, caps.current_extent.height)))
        }
    }

    pub(super) fn build_swapchain(&self, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> Result<SwapchainImages> {
        let surface = desc.surface.vk();
        let (caps, formats, present_modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, surface)?,
                self.surface_loader
                    .get_physical_device_surface_formats(self.physical_device, surface)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, surface)?,
            )
        };

        let (surface_format, format) = choose_surface_format(&formats, desc.format)?;
        let present_mode = choose_present_mode(&present_modes, desc.present_mode);
        let extent = choose_extent(&caps, desc.extent);
        let image_count = choose_image_count(&caps, desc.image_count);

        if extent.width == 0 || extent.height == 0 {
            anyhow::bail!("Cannot create a swapchain with zero-area extent {:?}", extent);
        }

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        Ok(SwapchainImages {
            swapchain: RawSwapchain::from_vk(swapchain),
            images: images.into_iter().map(RawImage::from_vk).collect(),
            format,
            extent: Extent2D::new(extent.width, extent.height),
            present_mode: conv::from_present_mode(present_mode),
        })
    }

    pub(super) fn acquire(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> Result<AcquireResult> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireResult::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    pub(super) fn queue_present(
        &self,
        queue: QueueKind,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentResult> {
        let slot = self.slot(queue);
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _submit = slot.submit_lock.lock();
        let result = unsafe { self.swapchain_loader.queue_present(slot.queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentResult::Presented),
            Ok(true) => Ok(PresentResult::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}
