//! Presentation surface and swapchain: build, acquire, present, and
//! rebuild on resize or loss.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::context::{Context, QueueKind};
use crate::memory::GpuAllocation;
use crate::resource::Texture;
use crate::FRAME_COUNT;

/// Acquire timeout; a frame blocked longer than this is discarded.
const ACQUIRE_TIMEOUT_NS: u64 = 100_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceStatus {
    Ok,
    /// The swapchain no longer matches the surface; skip the frame and
    /// call [`Context::rebuild_surface`].
    ShouldRebuild,
    Error,
}

#[derive(Clone, Copy, Debug)]
pub struct SurfaceDesc {
    pub use_vsync: bool,
    pub srgb: bool,
}

impl Default for SurfaceDesc {
    fn default() -> Self {
        Self {
            use_vsync: true,
            srgb: true,
        }
    }
}

pub struct Surface {
    raw: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    acquire_semaphores: [vk::Semaphore; FRAME_COUNT],
    textures: Vec<Texture>,
}

impl Surface {
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// One texture per swapchain image.
    pub fn texture(&self, image_index: usize) -> &Texture {
        &self.textures[image_index]
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub(crate) fn acquire_semaphore(&self, frame_index: usize) -> vk::Semaphore {
        self.acquire_semaphores[frame_index]
    }

    pub(crate) fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl Context {
    pub fn create_surface(
        &self,
        window: &(impl HasDisplayHandle + HasWindowHandle),
        desc: SurfaceDesc,
    ) -> Surface {
        let display = window
            .display_handle()
            .expect("window has no display handle")
            .as_raw();
        let win = window
            .window_handle()
            .expect("window has no window handle")
            .as_raw();
        let raw = unsafe {
            ash_window::create_surface(self.entry(), self.instance(), display, win, None)
        }
        .expect("failed to create a surface");

        let capabilities = unsafe {
            self.surface_fn()
                .get_physical_device_surface_capabilities(self.physical_device(), raw)
        }
        .expect("failed to query surface capabilities");
        assert!(
            capabilities.current_extent.width != u32::MAX,
            "surface has no fixed extent"
        );
        let extent = capabilities.current_extent;

        // FIFO is always available; without vsync prefer mailbox when the
        // driver offers it.
        let mut present_mode = vk::PresentModeKHR::FIFO;
        if !desc.use_vsync {
            let modes = unsafe {
                self.surface_fn()
                    .get_physical_device_surface_present_modes(self.physical_device(), raw)
            }
            .expect("failed to query present modes");
            if modes.contains(&vk::PresentModeKHR::MAILBOX) {
                present_mode = vk::PresentModeKHR::MAILBOX;
            }
        }

        let formats = unsafe {
            self.surface_fn()
                .get_physical_device_surface_formats(self.physical_device(), raw)
        }
        .expect("failed to query surface formats");
        assert!(!formats.is_empty());
        let target_format = if desc.srgb {
            vk::Format::R8G8B8A8_SRGB
        } else {
            vk::Format::R8G8B8A8_UNORM
        };
        let format = if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
            // The surface does not care; ask for what we want.
            vk::SurfaceFormatKHR {
                format: target_format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }
        } else {
            formats
                .iter()
                .copied()
                .find(|candidate| {
                    candidate.format == target_format
                        && candidate.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(formats[0])
        };

        let mut surface = Surface {
            raw,
            swapchain: vk::SwapchainKHR::null(),
            format,
            present_mode,
            extent,
            acquire_semaphores: [vk::Semaphore::null(); FRAME_COUNT],
            textures: Vec::new(),
        };
        self.build_swapchain(&mut surface);

        for semaphore in &mut surface.acquire_semaphores {
            *semaphore = unsafe {
                self.device()
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            }
            .expect("failed to create an acquire semaphore");
        }

        surface
    }

    pub fn destroy_surface(&self, mut surface: Surface) {
        unsafe {
            for semaphore in surface.acquire_semaphores {
                self.device().destroy_semaphore(semaphore, None);
            }
            for texture in surface.textures.drain(..) {
                self.device().destroy_image_view(texture.view, None);
            }
            self.swapchain_fn().destroy_swapchain(surface.swapchain, None);
            self.surface_fn().destroy_surface(surface.raw, None);
        }
    }

    /// Recreates the swapchain against the surface's current extent,
    /// handing the previous swapchain to the driver for recycling.
    fn build_swapchain(&self, surface: &mut Surface) {
        let old_swapchain = surface.swapchain;
        for texture in surface.textures.drain(..) {
            unsafe { self.device().destroy_image_view(texture.view, None) };
        }

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        // sRGB images cannot be storage images.
        if surface.format.format != vk::Format::R8G8B8A8_SRGB
            && surface.format.format != vk::Format::B8G8R8A8_SRGB
        {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw)
            .min_image_count(FRAME_COUNT as u32)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(surface.extent)
            .image_array_layers(1)
            .image_usage(usage)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let share_families = [
            self.queue_family(QueueKind::Graphics),
            self.queue_family(QueueKind::Present),
        ];
        if share_families[0] != share_families[1] {
            info = info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&share_families);
        } else {
            info = info.image_sharing_mode(vk::SharingMode::EXCLUSIVE);
        }

        surface.swapchain = unsafe { self.swapchain_fn().create_swapchain(&info, None) }
            .expect("failed to create the swapchain");
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_fn().destroy_swapchain(old_swapchain, None) };
        }

        let images = unsafe { self.swapchain_fn().get_swapchain_images(surface.swapchain) }
            .expect("failed to query swapchain images");
        assert!(images.len() >= FRAME_COUNT, "too few swapchain images");

        for image in images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface.format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe { self.device().create_image_view(&view_info, None) }
                .expect("vkCreateImageView failed");

            surface.textures.push(Texture {
                image,
                view,
                aspect: vk::ImageAspectFlags::COLOR,
                extent: vk::Extent3D {
                    width: surface.extent.width,
                    height: surface.extent.height,
                    depth: 1,
                },
                format: surface.format.format,
                mip_count: 1,
                layer_count: 1,
                allocation: GpuAllocation::null(),
            });
        }
    }

    /// Acquires the next swapchain image against the frame slot's
    /// acquire semaphore.
    pub(crate) fn acquire_swapchain_texture(
        &self,
        surface: &Surface,
        frame_index: usize,
    ) -> (u32, SurfaceStatus) {
        let semaphore = surface.acquire_semaphore(frame_index);
        match unsafe {
            self.swapchain_fn().acquire_next_image(
                surface.swapchain(),
                ACQUIRE_TIMEOUT_NS,
                semaphore,
                vk::Fence::null(),
            )
        } {
            // A suboptimal acquire still renders; present reports it.
            Ok((image_index, _suboptimal)) => (image_index, SurfaceStatus::Ok),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => (0, SurfaceStatus::ShouldRebuild),
            Err(err) => {
                log::warn!("vkAcquireNextImageKHR failed: {err}");
                (0, SurfaceStatus::Error)
            }
        }
    }

    pub(crate) fn present_surface(
        &self,
        surface: &Surface,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> SurfaceStatus {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [surface.swapchain()];
        let image_indices = [image_index];
        let mut info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        if wait_semaphore != vk::Semaphore::null() {
            info = info.wait_semaphores(&wait_semaphores);
        }

        match unsafe {
            self.swapchain_fn()
                .queue_present(self.queue(QueueKind::Present), &info)
        } {
            Ok(false) => SurfaceStatus::Ok,
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => SurfaceStatus::ShouldRebuild,
            Err(err) => {
                log::warn!("vkQueuePresentKHR failed: {err}");
                SurfaceStatus::Error
            }
        }
    }

    /// Drains the device, re-reads the surface capabilities and rebuilds
    /// the swapchain. A zero-sized surface (minimised window) leaves the
    /// old swapchain in place.
    pub fn rebuild_surface(&self, surface: &mut Surface) {
        unsafe { self.device().device_wait_idle() }.expect("vkDeviceWaitIdle failed");

        let capabilities = unsafe {
            self.surface_fn()
                .get_physical_device_surface_capabilities(self.physical_device(), surface.raw)
        }
        .expect("failed to query surface capabilities");
        assert!(
            capabilities.current_extent.width != u32::MAX,
            "surface has no fixed extent"
        );

        if capabilities.current_extent.width > 0 && capabilities.current_extent.height > 0 {
            surface.extent = capabilities.current_extent;
            log::debug!(
                "rebuilding swapchain at {}x{}",
                surface.extent.width,
                surface.extent.height
            );
            self.build_swapchain(surface);
        }
    }
}
