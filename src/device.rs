//! `Device`: the facade SPEC_FULL.md's Device module describes — the
//! non-realtime-critical surface a caller actually programs against.
//! Delegates everything to the wrapped `DeviceCore`, adding only the
//! bookkeeping (open/close state, the ≥512 default buffer size rule, the
//! empirical `+2×bufferSize` latency correction) that doesn't belong on the
//! realtime path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::callback::IOCallback;
use crate::device_core::DeviceCore;
use crate::error::{DeviceError, DeviceResult};
use crate::state::{ChannelMask, DeviceId, MIN_DEFAULT_BUFFER_SIZE};

pub struct Device {
    core: DeviceCore,
    open: AtomicBool,
}

impl Device {
    pub(crate) fn new(core: DeviceCore) -> Self {
        Device {
            core,
            open: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.core.device_id()
    }

    /// Pulls the device's current configuration from the OS, then — if the
    /// caller asked for a specific active-channel mask, sample rate, or
    /// buffer size — negotiates it via `DeviceCore::reopen`. A `buffer_size`
    /// of `None` or `Some(0)` is replaced with `default_buffer_size()`, per
    /// spec.md §4.3. Must be called before `start`; safe to call again
    /// later as an explicit resync.
    pub fn open(
        &self,
        input_mask: Option<ChannelMask>,
        output_mask: Option<ChannelMask>,
        sample_rate: Option<f64>,
        buffer_size: Option<u32>,
    ) -> DeviceResult<()> {
        self.core.refresh_from_os()?;

        let wants_buffer_size = buffer_size.filter(|&b| b > 0).or(Some(self.default_buffer_size()));
        let needs_reopen = input_mask.is_some()
            || output_mask.is_some()
            || sample_rate.is_some()
            || wants_buffer_size != Some(self.core.buffer_size());
        if needs_reopen {
            self.core
                .reopen(input_mask, output_mask, sample_rate, wants_buffer_size)?;
        }

        self.open.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) -> DeviceResult<()> {
        self.core.stop()?;
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    pub fn start(&self, client: Arc<dyn IOCallback>) -> DeviceResult<()> {
        if !self.is_open() {
            return Err(DeviceError::OpenFailure(
                "device must be opened before start".into(),
            ));
        }
        self.core.start(Some(client))
    }

    pub fn stop(&self) -> DeviceResult<()> {
        self.core.stop()
    }

    /// Changes active channel masks and/or sample rate/buffer size, reusing
    /// `DeviceCore::reopen` to suspend/resume the realtime callback around
    /// the OS negotiation.
    pub fn reconfigure(
        &self,
        input_mask: Option<ChannelMask>,
        output_mask: Option<ChannelMask>,
        sample_rate: Option<f64>,
        buffer_size: Option<u32>,
    ) -> DeviceResult<()> {
        self.core.reopen(input_mask, output_mask, sample_rate, buffer_size)
    }

    /// Union of master's and slave's active-input masks (spec.md §4.3).
    pub fn active_input_channels(&self) -> ChannelMask {
        self.core.active_input_channels()
    }

    pub fn num_input_channels(&self) -> usize {
        self.core.num_input_channels()
    }

    pub fn num_output_channels(&self) -> usize {
        self.core.num_output_channels()
    }

    pub fn input_channel_names(&self) -> Vec<String> {
        self.core.input_channel_names()
    }

    pub fn output_channel_names(&self) -> Vec<String> {
        self.core.output_channel_names()
    }

    pub fn current_sample_rate(&self) -> f64 {
        self.core.sample_rate()
    }

    pub fn available_sample_rates(&self) -> Vec<f64> {
        self.core.available_sample_rates()
    }

    pub fn current_buffer_size(&self) -> u32 {
        self.core.buffer_size()
    }

    pub fn available_buffer_sizes(&self) -> Vec<u32> {
        self.core.available_buffer_sizes()
    }

    /// The buffer size this device would use absent any caller preference:
    /// the smallest *available* size ≥ `MIN_DEFAULT_BUFFER_SIZE`, or
    /// `MIN_DEFAULT_BUFFER_SIZE` itself if nothing available qualifies
    /// (spec.md §4.3's `getDefaultBufferSize`).
    pub fn default_buffer_size(&self) -> u32 {
        self.core
            .available_buffer_sizes()
            .into_iter()
            .filter(|&size| size >= MIN_DEFAULT_BUFFER_SIZE)
            .min()
            .unwrap_or(MIN_DEFAULT_BUFFER_SIZE)
    }

    /// Always 32 — the adapter only ever deals in float32 samples (spec.md
    /// §4.3's `getCurrentBitDepth`).
    pub fn current_bit_depth(&self) -> u32 {
        32
    }

    /// Reported input latency plus two buffers' worth of frames, matching
    /// the empirical correction spec.md calls for (the OS-reported figure
    /// alone consistently undercounts the actual round-trip latency).
    pub fn input_latency_in_samples(&self) -> u32 {
        self.core.input_latency_frames() + 2 * self.core.buffer_size()
    }

    pub fn output_latency_in_samples(&self) -> u32 {
        self.core.output_latency_frames() + 2 * self.core.buffer_size()
    }

    pub fn input_data_source_names(&self) -> Vec<String> {
        self.core.input_data_source_names()
    }

    pub fn output_data_source_names(&self) -> Vec<String> {
        self.core.output_data_source_names()
    }

    pub fn current_input_data_source_index(&self) -> Option<usize> {
        self.core.current_input_data_source()
    }

    pub fn current_output_data_source_index(&self) -> Option<usize> {
        self.core.current_output_data_source()
    }

    pub fn set_input_data_source_index(&self, index: usize) -> DeviceResult<()> {
        self.core.set_input_data_source(index)
    }

    pub fn set_output_data_source_index(&self, index: usize) -> DeviceResult<()> {
        self.core.set_output_data_source(index)
    }

    pub fn related_devices(&self) -> Vec<DeviceId> {
        self.core.related_devices()
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    /// The last error raised by `open`/`reconfigure`/`start`/`stop` or a
    /// data-source change, cleared on the next such call's success
    /// (spec.md §3's `DeviceState.lastError`).
    pub fn last_error(&self) -> Option<String> {
        self.core.last_error()
    }
}
