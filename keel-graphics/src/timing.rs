//! GPU timestamp pool: timers are pairs of timestamps written at the top
//! and bottom of the pipe, queried after the owning frame's fence has
//! signalled.

use ash::vk;

/// A timer's slot in the query pool; queries `first_query` and
/// `first_query + 1`.
#[derive(Clone, Copy, Debug)]
pub struct Timer {
    first_query: u32,
}

/// A resolved scope timing from the previous use of a frame slot.
#[derive(Clone, Debug)]
pub struct ScopeTiming {
    pub name: String,
    pub milliseconds: f64,
}

pub struct TimerManager {
    pool: vk::QueryPool,
    max_timestamps: u32,
    next_timestamp: u32,
    timestamp_period: f32,
}

impl TimerManager {
    pub fn new(device: &ash::Device, max_timers: u32, timestamp_period: f32) -> Self {
        let max_timestamps = max_timers * 2;
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(max_timestamps);
        let pool = unsafe { device.create_query_pool(&info, None) }
            .expect("failed to create the timestamp query pool");
        Self {
            pool,
            max_timestamps,
            next_timestamp: 0,
            timestamp_period,
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe { device.destroy_query_pool(self.pool, None) };
        self.pool = vk::QueryPool::null();
    }

    /// Host-side reset of every timestamp and the write cursor.
    pub fn reset(&mut self, device: &ash::Device) {
        unsafe { device.reset_query_pool(self.pool, 0, self.max_timestamps) };
        self.next_timestamp = 0;
    }

    pub fn begin(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) -> Timer {
        assert!(
            self.next_timestamp < self.max_timestamps,
            "out of GPU timers"
        );
        let timer = Timer {
            first_query: self.next_timestamp,
        };
        self.next_timestamp += 2;
        unsafe {
            device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.pool,
                timer.first_query,
            )
        };
        timer
    }

    pub fn end(&self, device: &ash::Device, cmd: vk::CommandBuffer, timer: Timer) {
        unsafe {
            device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.pool,
                timer.first_query + 1,
            )
        };
    }

    /// Elapsed milliseconds between a timer's begin and end timestamps,
    /// or `None` when the results are not yet available and `blocking`
    /// was not requested.
    pub fn query(&self, device: &ash::Device, timer: Timer, blocking: bool) -> Option<f64> {
        let mut flags = vk::QueryResultFlags::TYPE_64;
        if blocking {
            flags |= vk::QueryResultFlags::WAIT;
        }
        let mut timestamps = [0u64; 2];
        let result = unsafe {
            device.get_query_pool_results(self.pool, timer.first_query, &mut timestamps[..], flags)
        };
        match result {
            Ok(()) => {
                let ticks = timestamps[1].saturating_sub(timestamps[0]);
                Some(ticks as f64 * f64::from(self.timestamp_period) / 1_000_000.0)
            }
            Err(vk::Result::NOT_READY) => None,
            Err(err) => panic!("vkGetQueryPoolResults failed: {err}"),
        }
    }
}
