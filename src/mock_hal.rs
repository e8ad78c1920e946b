//! In-memory stand-in for `Hal`, used by `tests/scenarios.rs` to drive
//! spec.md §8's S1–S6 scenarios without real hardware. Plain hand-written
//! struct behind the trait, matching the teacher's preference for the
//! simplest thing that works over an extra dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DeviceError, DeviceResult};
use crate::hal::{
    AudioCallbackSink, Hal, IoProcToken, IoProcTokenInner, ListenerToken, ListenerTokenInner,
    PropertyChangeSink, ValueRange, WatchedProperty,
};
use crate::state::DeviceId;

pub struct MockDevice {
    pub name: String,
    pub uid: String,
    pub is_aggregate: bool,
    pub related: Vec<DeviceId>,
    pub input_stream_channels: Vec<u32>,
    pub output_stream_channels: Vec<u32>,
    pub sample_rate: f64,
    pub available_sample_rates: Vec<ValueRange<f64>>,
    pub buffer_size: u32,
    pub buffer_size_range: ValueRange<u32>,
    pub input_latency: u32,
    pub output_latency: u32,
    pub running: bool,
    pub alive: bool,
    pub input_data_sources: Vec<String>,
    pub output_data_sources: Vec<String>,
    pub current_input_source: Option<usize>,
    pub current_output_source: Option<usize>,
    /// Number of `nominal_sample_rate`/`buffer_frame_size` reads to keep
    /// reporting the pre-change value after a `set_*` call succeeds, before
    /// reporting the newly requested one — simulates an OS that delays
    /// convergence (spec.md §8 S4).
    pub convergence_delay_polls: u32,
    pending_sample_rate: Option<(f64, u32)>,
    pending_buffer_size: Option<(u32, u32)>,
    io_sink: Option<Arc<dyn AudioCallbackSink>>,
    listener_sinks: Vec<Arc<dyn PropertyChangeSink>>,
}

impl MockDevice {
    pub fn new(name: &str, num_inputs: u32, num_outputs: u32) -> Self {
        MockDevice {
            name: name.to_string(),
            uid: format!("mock-uid-{}", name),
            is_aggregate: false,
            related: Vec::new(),
            input_stream_channels: if num_inputs > 0 { vec![num_inputs] } else { Vec::new() },
            output_stream_channels: if num_outputs > 0 { vec![num_outputs] } else { Vec::new() },
            sample_rate: 48_000.0,
            available_sample_rates: vec![ValueRange {
                min: 44_100.0,
                max: 192_000.0,
            }],
            buffer_size: 512,
            buffer_size_range: ValueRange { min: 32, max: 4096 },
            input_latency: 0,
            output_latency: 0,
            running: false,
            alive: true,
            input_data_sources: Vec::new(),
            output_data_sources: Vec::new(),
            current_input_source: None,
            current_output_source: None,
            convergence_delay_polls: 0,
            pending_sample_rate: None,
            pending_buffer_size: None,
            io_sink: None,
            listener_sinks: Vec::new(),
        }
    }
}

#[derive(Default)]
struct MockState {
    devices: HashMap<DeviceId, MockDevice>,
    default_input: Option<DeviceId>,
    default_output: Option<DeviceId>,
}

pub struct MockHal {
    state: Mutex<MockState>,
    next_token: AtomicU64,
}

impl Default for MockHal {
    fn default() -> Self {
        MockHal {
            state: Mutex::new(MockState::default()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, id: DeviceId, device: MockDevice) {
        let mut state = self.state.lock();
        state.devices.insert(id, device);
    }

    pub fn set_default_input(&self, id: DeviceId) {
        self.state.lock().default_input = Some(id);
    }

    pub fn set_default_output(&self, id: DeviceId) {
        self.state.lock().default_output = Some(id);
    }

    /// Marks a device dead and fires its `DeviceIsAlive` listener, as a
    /// real unplug does (scenario S6).
    pub fn simulate_unplug(&self, id: DeviceId) {
        let sinks = {
            let mut state = self.state.lock();
            let Some(device) = state.devices.get_mut(&id) else {
                return;
            };
            device.alive = false;
            device.running = false;
            device.listener_sinks.clone()
        };
        for sink in sinks {
            sink.device_details_changed();
        }
    }

    /// Fires every registered listener for `id`, as a coalesced burst of OS
    /// notifications would (scenario S4's reconfigure-detection path).
    pub fn simulate_property_change(&self, id: DeviceId) {
        let sinks = {
            let state = self.state.lock();
            state
                .devices
                .get(&id)
                .map(|d| d.listener_sinks.clone())
                .unwrap_or_default()
        };
        for sink in sinks {
            sink.device_details_changed();
        }
    }

    /// Drives one realtime cycle through the installed I/O proc, the way
    /// the OS would call it. `inputs`/`outputs` are per-stream interleaved
    /// buffers sized `num_channels * num_frames`.
    pub fn run_io_cycle(
        &self,
        id: DeviceId,
        inputs: &[Vec<f32>],
        input_channels: &[usize],
        outputs: &mut [Vec<f32>],
        output_channels: &[usize],
        num_frames: usize,
    ) {
        let sink = {
            let state = self.state.lock();
            state.devices.get(&id).and_then(|d| d.io_sink.clone())
        };
        let Some(sink) = sink else { return };

        use crate::callback::{RawStream, RawStreamMut};
        let raw_inputs: Vec<RawStream> = inputs
            .iter()
            .zip(input_channels.iter())
            .map(|(buf, &chans)| RawStream {
                samples: buf,
                num_channels: chans,
            })
            .collect();
        let mut raw_outputs: Vec<RawStreamMut> = outputs
            .iter_mut()
            .zip(output_channels.iter())
            .map(|(buf, &chans)| RawStreamMut {
                samples: buf,
                num_channels: chans,
            })
            .collect();
        sink.render(&raw_inputs, &mut raw_outputs, num_frames);
    }

    fn next_id(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn with_device<T>(&self, id: DeviceId, f: impl FnOnce(&MockDevice) -> T) -> Option<T> {
        self.state.lock().devices.get(&id).map(f)
    }
}

impl Hal for MockHal {
    fn all_device_ids(&self) -> DeviceResult<Vec<DeviceId>> {
        Ok(self.state.lock().devices.keys().copied().collect())
    }

    fn default_device(&self, input: bool) -> Option<DeviceId> {
        let state = self.state.lock();
        if input {
            state.default_input
        } else {
            state.default_output
        }
    }

    fn device_name(&self, id: DeviceId) -> DeviceResult<String> {
        self.with_device(id, |d| d.name.clone())
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))
    }

    fn device_uid(&self, id: DeviceId) -> DeviceResult<String> {
        self.with_device(id, |d| d.uid.clone())
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))
    }

    fn is_aggregate(&self, id: DeviceId) -> bool {
        self.with_device(id, |d| d.is_aggregate).unwrap_or(false)
    }

    fn related_devices(&self, id: DeviceId) -> Vec<DeviceId> {
        self.with_device(id, |d| d.related.clone()).unwrap_or_default()
    }

    fn stream_channel_counts(&self, id: DeviceId, input: bool) -> Vec<u32> {
        self.with_device(id, |d| {
            if input {
                d.input_stream_channels.clone()
            } else {
                d.output_stream_channels.clone()
            }
        })
        .unwrap_or_default()
    }

    fn nominal_sample_rate(&self, id: DeviceId) -> Option<f64> {
        let mut state = self.state.lock();
        let device = state.devices.get_mut(&id)?;
        if let Some((target, remaining)) = device.pending_sample_rate {
            if remaining == 0 {
                device.sample_rate = target;
                device.pending_sample_rate = None;
            } else {
                device.pending_sample_rate = Some((target, remaining - 1));
            }
        }
        Some(device.sample_rate)
    }

    fn set_nominal_sample_rate(&self, id: DeviceId, rate: f64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))?;
        let supported = device
            .available_sample_rates
            .iter()
            .any(|r| rate >= r.min && rate <= r.max);
        if !supported {
            return Err(DeviceError::ReconfigureFailure);
        }
        if device.convergence_delay_polls == 0 {
            device.sample_rate = rate;
            device.pending_sample_rate = None;
        } else {
            device.pending_sample_rate = Some((rate, device.convergence_delay_polls));
        }
        Ok(())
    }

    fn available_sample_rates(&self, id: DeviceId) -> Vec<ValueRange<f64>> {
        self.with_device(id, |d| d.available_sample_rates.clone())
            .unwrap_or_default()
    }

    fn buffer_frame_size(&self, id: DeviceId) -> Option<u32> {
        let mut state = self.state.lock();
        let device = state.devices.get_mut(&id)?;
        if let Some((target, remaining)) = device.pending_buffer_size {
            if remaining == 0 {
                device.buffer_size = target;
                device.pending_buffer_size = None;
            } else {
                device.pending_buffer_size = Some((target, remaining - 1));
            }
        }
        Some(device.buffer_size)
    }

    fn set_buffer_frame_size(&self, id: DeviceId, frames: u32) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))?;
        if frames < device.buffer_size_range.min || frames > device.buffer_size_range.max {
            return Err(DeviceError::ReconfigureFailure);
        }
        if device.convergence_delay_polls == 0 {
            device.buffer_size = frames;
            device.pending_buffer_size = None;
        } else {
            device.pending_buffer_size = Some((frames, device.convergence_delay_polls));
        }
        Ok(())
    }

    fn buffer_frame_size_range(&self, id: DeviceId) -> Option<ValueRange<u32>> {
        self.with_device(id, |d| d.buffer_size_range)
    }

    fn latency_frames(&self, id: DeviceId, input: bool) -> u32 {
        self.with_device(id, |d| if input { d.input_latency } else { d.output_latency })
            .unwrap_or(0)
    }

    fn is_running(&self, id: DeviceId) -> bool {
        self.with_device(id, |d| d.running).unwrap_or(false)
    }

    fn is_alive(&self, id: DeviceId) -> bool {
        self.with_device(id, |d| d.alive).unwrap_or(false)
    }

    fn data_source_names(&self, id: DeviceId, input: bool) -> Vec<String> {
        self.with_device(id, |d| {
            if input {
                d.input_data_sources.clone()
            } else {
                d.output_data_sources.clone()
            }
        })
        .unwrap_or_default()
    }

    fn current_data_source_index(&self, id: DeviceId, input: bool) -> Option<usize> {
        self.with_device(id, |d| {
            if input {
                d.current_input_source
            } else {
                d.current_output_source
            }
        })
        .flatten()
    }

    fn set_current_data_source_index(
        &self,
        id: DeviceId,
        input: bool,
        index: usize,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))?;
        let count = if input {
            device.input_data_sources.len()
        } else {
            device.output_data_sources.len()
        };
        if index >= count {
            return Err(DeviceError::OpenFailure("data source index out of range".into()));
        }
        if input {
            device.current_input_source = Some(index);
        } else {
            device.current_output_source = Some(index);
        }
        Ok(())
    }

    fn add_io_proc(
        &self,
        id: DeviceId,
        sink: Arc<dyn AudioCallbackSink>,
    ) -> DeviceResult<IoProcToken> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))?;
        device.io_sink = Some(sink);
        Ok(IoProcToken(IoProcTokenInner::Mock(self.next_id())))
    }

    fn remove_io_proc(&self, id: DeviceId, _token: IoProcToken) {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.io_sink = None;
        }
    }

    fn start_device(&self, id: DeviceId, _token: &IoProcToken) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))?;
        if !device.alive {
            return Err(DeviceError::StartFailure("device is not alive".into()));
        }
        device.running = true;
        Ok(())
    }

    fn stop_device(&self, id: DeviceId, _token: &IoProcToken) -> DeviceResult<()> {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.running = false;
        }
        Ok(())
    }

    fn add_property_listener(
        &self,
        id: DeviceId,
        _selectors: &[WatchedProperty],
        sink: Arc<dyn PropertyChangeSink>,
    ) -> DeviceResult<ListenerToken> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::OpenFailure(format!("unknown device {}", id)))?;
        device.listener_sinks.push(sink);
        Ok(ListenerToken(ListenerTokenInner::Mock(self.next_id())))
    }

    fn remove_property_listener(&self, id: DeviceId, _token: ListenerToken) {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.listener_sinks.clear();
        }
    }
}
