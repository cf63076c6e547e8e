//! Device-scoped state every other component consumes: instance, physical
//! device, logical device, the queue table, the general GPU allocator and
//! the staging engine.
//!
//! Extension entry points live on the context rather than in process
//! globals; validation output is forwarded to the `log` facade.

use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::sync::Mutex;

use ash::{ext, khr, vk};
use raw_window_handle::{
    HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
};

use crate::memory::GpuAllocator;
use crate::staging::Staging;
use crate::ROOT_ALLOCATION_SIZE;

/// Queues the core distinguishes; several may share a family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Present = 0,
    Graphics,
    Compute,
    Transfer,
}

pub const QUEUE_COUNT: usize = 4;

impl QueueKind {
    pub(crate) const ALL: [QueueKind; QUEUE_COUNT] = [
        QueueKind::Present,
        QueueKind::Graphics,
        QueueKind::Compute,
        QueueKind::Transfer,
    ];
}

#[derive(Debug)]
pub enum InitError {
    Loading(ash::LoadingError),
    Vulkan(vk::Result),
    Window(raw_window_handle::HandleError),
    NoCompatibleDevice,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Loading(err) => write!(f, "failed to load the Vulkan library: {err}"),
            Self::Vulkan(err) => write!(f, "Vulkan call failed: {err}"),
            Self::Window(err) => write!(f, "window handle unavailable: {err}"),
            Self::NoCompatibleDevice => write!(f, "no compatible physical device"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<vk::Result> for InitError {
    fn from(err: vk::Result) -> Self {
        Self::Vulkan(err)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ContextDesc {
    /// Enable the Khronos validation layer and route its messages to `log`.
    pub validation: bool,
}

/// A timeline semaphore paired with the last value known to be signalled
/// on it.
pub struct TimelineSemaphore {
    pub raw: vk::Semaphore,
    pub last_signal: u64,
}

pub(crate) struct QueueInfo {
    pub family: u32,
    pub raw: vk::Queue,
    pub command_pool: vk::CommandPool,
}

pub struct Context {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queues: [QueueInfo; QUEUE_COUNT],
    timestamp_period: f32,
    surface_fn: Option<khr::surface::Instance>,
    swapchain_fn: Option<khr::swapchain::Device>,
    debug_utils: Option<ext::debug_utils::Device>,
    debug_messenger: Option<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub(crate) memory: Mutex<GpuAllocator>,
    pub(crate) staging: Mutex<Staging>,
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn debug_utils_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    let data = &*callback_data;
    let message = if data.p_message.is_null() {
        Default::default()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("vulkan: {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("vulkan: {message}");
    } else {
        log::debug!("vulkan: {message}");
    }
    vk::FALSE
}

/// The last family carrying each capability wins: dedicated compute and
/// transfer families enumerate after the general graphics family on every
/// driver that has them. Present is the first family the surface accepts.
fn select_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: Option<&khr::surface::Instance>,
    surface: vk::SurfaceKHR,
) -> Option<[u32; QUEUE_COUNT]> {
    let props =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics = None;
    let mut compute = None;
    let mut transfer = None;
    for (index, family) in props.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index as u32);
        }
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            compute = Some(index as u32);
        }
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER) {
            transfer = Some(index as u32);
        }
    }

    let present = match surface_fn {
        Some(surface_fn) if surface != vk::SurfaceKHR::null() => {
            props.iter().enumerate().find_map(|(index, family)| {
                if family.queue_count == 0 {
                    return None;
                }
                let supported = unsafe {
                    surface_fn.get_physical_device_surface_support(
                        physical_device,
                        index as u32,
                        surface,
                    )
                }
                .unwrap_or(false);
                supported.then_some(index as u32)
            })
        }
        _ => graphics,
    };

    Some([present?, graphics?, compute?, transfer?])
}

impl Context {
    /// Creates a headless context; surfaces and swapchains are
    /// unavailable and the present queue aliases the graphics queue.
    pub fn new(desc: ContextDesc) -> Result<Self, InitError> {
        Self::init(desc, None)
    }

    /// Creates a context able to present to `window`'s display. The
    /// window is only used to probe surface support; surfaces themselves
    /// are created separately.
    pub fn new_windowed(
        desc: ContextDesc,
        window: &(impl HasDisplayHandle + HasWindowHandle),
    ) -> Result<Self, InitError> {
        let display = window.display_handle().map_err(InitError::Window)?.as_raw();
        let win = window.window_handle().map_err(InitError::Window)?.as_raw();
        Self::init(desc, Some((display, win)))
    }

    fn init(
        desc: ContextDesc,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<Self, InitError> {
        let entry = unsafe { ash::Entry::load() }.map_err(InitError::Loading)?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"keel")
            .application_version(1)
            .engine_name(c"keel")
            .engine_version(1)
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some((display, _)) = window {
            extensions.extend_from_slice(ash_window::enumerate_required_extensions(display)?);
        }
        if desc.validation {
            extensions.push(ext::debug_utils::NAME.as_ptr());
        }
        let layers: Vec<*const c_char> = if desc.validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&instance_info, None) }?;

        let debug_messenger = if desc.validation {
            let debug_instance = ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_utils_callback));
            let messenger = unsafe {
                debug_instance.create_debug_utils_messenger(&messenger_info, None)
            }?;
            Some((debug_instance, messenger))
        } else {
            None
        };

        // A throwaway surface on the main window picks the present queue.
        let surface_fn = window
            .is_some()
            .then(|| khr::surface::Instance::new(&entry, &instance));
        let temp_surface = match window {
            Some((display, win)) => unsafe {
                ash_window::create_surface(&entry, &instance, display, win, None)
            }?,
            None => vk::SurfaceKHR::null(),
        };

        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;
        let mut selected = None;
        for physical_device in physical_devices {
            if let Some(families) = select_queue_families(
                &instance,
                physical_device,
                surface_fn.as_ref(),
                temp_surface,
            ) {
                selected = Some((physical_device, families));
                break;
            }
        }

        if temp_surface != vk::SurfaceKHR::null() {
            if let Some(surface_fn) = &surface_fn {
                unsafe { surface_fn.destroy_surface(temp_surface, None) };
            }
        }

        let (physical_device, families) = selected.ok_or(InitError::NoCompatibleDevice)?;

        let device_props = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(device_props.device_name.as_ptr()) };
        log::info!("using {device_name:?}");
        let timestamp_period = device_props.limits.timestamp_period;

        let mut unique_families: Vec<u32> = families.to_vec();
        unique_families.sort_unstable();
        unique_families.dedup();
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let device_extensions: Vec<*const c_char> = if window.is_some() {
            vec![khr::swapchain::NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .host_query_reset(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);
        let device =
            unsafe { instance.create_device(physical_device, &device_info, None) }?;

        let queues = std::array::from_fn(|index| {
            let family = families[index];
            let raw = unsafe { device.get_device_queue(family, 0) };
            let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(family);
            let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
                .expect("failed to create a queue command pool");
            QueueInfo {
                family,
                raw,
                command_pool,
            }
        });

        let swapchain_fn = window
            .is_some()
            .then(|| khr::swapchain::Device::new(&instance, &device));
        let debug_utils = desc
            .validation
            .then(|| ext::debug_utils::Device::new(&instance, &device));

        let memory = Mutex::new(GpuAllocator::new(
            &instance,
            physical_device,
            device.clone(),
            ROOT_ALLOCATION_SIZE,
        ));
        let staging = Mutex::new(Staging::new(
            &instance,
            physical_device,
            device.clone(),
            families[QueueKind::Transfer as usize],
        ));

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queues,
            timestamp_period,
            surface_fn,
            swapchain_fn,
            debug_utils,
            debug_messenger,
            memory,
            staging,
        })
    }

    /// Tears the context down in dependency order. All surfaces, graph
    /// pools and resources created from it must already be destroyed.
    pub fn destroy(self) {
        let Self {
            entry: _entry,
            instance,
            physical_device: _,
            device,
            queues,
            timestamp_period: _,
            surface_fn: _,
            swapchain_fn: _,
            debug_utils: _,
            debug_messenger,
            memory,
            staging,
        } = self;
        unsafe {
            let _ = device.device_wait_idle();
            drop(staging);
            drop(memory);
            for queue in queues {
                device.destroy_command_pool(queue.command_pool, None);
            }
            device.destroy_device(None);
            if let Some((debug_instance, messenger)) = debug_messenger {
                debug_instance.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        self.queues[kind as usize].raw
    }

    pub fn queue_family(&self, kind: QueueKind) -> u32 {
        self.queues[kind as usize].family
    }

    pub fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    pub(crate) fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub(crate) fn surface_fn(&self) -> &khr::surface::Instance {
        self.surface_fn
            .as_ref()
            .expect("context was created without window support")
    }

    pub(crate) fn swapchain_fn(&self) -> &khr::swapchain::Device {
        self.swapchain_fn
            .as_ref()
            .expect("context was created without window support")
    }

    // Debug-utils helpers; all no-ops when validation is off.

    pub(crate) fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        if let Some(debug_utils) = &self.debug_utils {
            let name = CString::new(name).unwrap_or_default();
            let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
            unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
        }
    }

    pub(crate) fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
        }
    }

    pub(crate) fn set_object_name<T: vk::Handle>(&self, handle: T, name: &str) {
        if name.is_empty() {
            return;
        }
        if let Some(debug_utils) = &self.debug_utils {
            let name = CString::new(name).unwrap_or_default();
            let info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(&name);
            let _ = unsafe { debug_utils.set_debug_utils_object_name(&info) };
        }
    }

    // Timeline semaphores.

    pub fn create_timeline_semaphore(&self, initial_value: u64) -> TimelineSemaphore {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let raw = unsafe { self.device.create_semaphore(&info, None) }
            .expect("failed to create a timeline semaphore");
        TimelineSemaphore {
            raw,
            last_signal: initial_value,
        }
    }

    /// Blocks until the semaphore reaches its recorded `last_signal`.
    pub fn wait_timeline_semaphore(&self, semaphore: &TimelineSemaphore) {
        let semaphores = [semaphore.raw];
        let values = [semaphore.last_signal];
        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait, u64::MAX) }
            .expect("vkWaitSemaphores failed");
    }

    pub fn destroy_timeline_semaphore(&self, semaphore: TimelineSemaphore) {
        unsafe { self.device.destroy_semaphore(semaphore.raw, None) };
    }

    // One-shot command buffer helpers on the per-queue default pools.

    pub(crate) fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Vec<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }
            .expect("failed to allocate command buffers")
    }

    pub fn alloc_command_buffer(&self, queue: QueueKind) -> vk::CommandBuffer {
        self.allocate_command_buffers(self.queues[queue as usize].command_pool, 1)[0]
    }

    pub fn begin_command_buffer(&self, cmd: vk::CommandBuffer) {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
            .expect("vkBeginCommandBuffer failed");
    }

    pub fn end_command_buffer(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.end_command_buffer(cmd) }.expect("vkEndCommandBuffer failed");
    }

    pub fn alloc_and_begin_command_buffer(&self, queue: QueueKind) -> vk::CommandBuffer {
        let cmd = self.alloc_command_buffer(queue);
        self.begin_command_buffer(cmd);
        cmd
    }

    pub fn end_and_submit_command_buffer(&self, cmd: vk::CommandBuffer, queue: QueueKind) {
        unsafe { self.device.end_command_buffer(cmd) }.expect("vkEndCommandBuffer failed");
        let commands = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&commands);
        unsafe {
            self.device
                .queue_submit2(self.queue(queue), &[submit], vk::Fence::null())
        }
        .expect("vkQueueSubmit2 failed");
    }

    pub fn free_command_buffer(&self, queue: QueueKind, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .free_command_buffers(self.queues[queue as usize].command_pool, &[cmd])
        };
    }

    // Staging.

    /// Waits for every outstanding transfer, then recycles the staging
    /// ring and its command buffers. Idempotent when no request
    /// intervened.
    pub fn flush_staging(&self) {
        self.staging.lock().unwrap().flush();
    }

    /// Transfer command buffers recorded since the last flush.
    pub fn active_staging_command_buffers(&self) -> usize {
        self.staging.lock().unwrap().active_command_buffers()
    }

    /// Reserves staging scratch for a caller-recorded copy. The caller
    /// must signal `signal_value` on [`Self::staging_timeline`] from the
    /// submission that reads the slice.
    pub fn request_staging(&self, size: u32, align: u32) -> crate::StagingSlice {
        self.staging.lock().unwrap().request(size, align)
    }

    pub fn staging_timeline(&self) -> vk::Semaphore {
        self.staging.lock().unwrap().timeline()
    }
}
