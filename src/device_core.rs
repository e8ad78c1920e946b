//! `DeviceCore`: the realtime-facing heart of the adapter (SPEC_FULL.md's
//! DeviceCore module). Owns the OS device, the temp buffers, channel
//! routing, and — when aggregating a slave device — the slave's own
//! `DeviceCore`. `Device` (device.rs) is a thin, non-realtime-critical
//! facade over this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::callback::{AudioBufferView, AudioBufferViewMut, IOCallback, RawStream, RawStreamMut};
use crate::debounce::Debouncer;
use crate::error::{DeviceError, DeviceResult};
use crate::hal::{AudioCallbackSink, Hal, IoProcToken, ListenerToken, PropertyChangeSink, WatchedProperty};
use crate::state::{
    buffer_size_grid, ChannelMask, ChannelRouting, DeviceId, CANDIDATE_SAMPLE_RATES, DEBOUNCE_MS,
    MAX_CHANS, REOPEN_POLL_INTERVAL_MS, REOPEN_POLL_MAX_ATTEMPTS, STOP_POLL_INTERVAL_MS,
    STOP_POLL_MAX_ATTEMPTS,
};

const TEMP_BUFFER_HEAD_PAD: usize = 32;

/// Tolerance spec.md §4.2 allows when matching a candidate sample rate
/// against an OS-reported range (`"±2 Hz"`).
const SAMPLE_RATE_TOLERANCE_HZ: f64 = 2.0;

/// Tolerance for comparing the rate `reopen` observes via `refreshFromOS`
/// against the one it actually requested — guards against float noise, not
/// a negotiation window.
const OBSERVED_RATE_EPSILON_HZ: f64 = 0.01;

/// Single contiguous allocation backing `tempInputBuffers`/
/// `tempOutputBuffers`. Reallocated only from `refresh_from_os`, under the
/// realtime lock — never from inside `render`.
pub(crate) struct TempAudioBuffer {
    data: Box<[f32]>,
    num_in: usize,
    num_out: usize,
    buffer_size: usize,
}

impl TempAudioBuffer {
    fn empty() -> Self {
        TempAudioBuffer {
            data: Box::new([]),
            num_in: 0,
            num_out: 0,
            buffer_size: 0,
        }
    }

    fn resize(&mut self, num_in: usize, num_out: usize, buffer_size: usize) {
        let total = TEMP_BUFFER_HEAD_PAD + (num_in + num_out) * buffer_size;
        self.data = vec![0.0f32; total].into_boxed_slice();
        self.num_in = num_in;
        self.num_out = num_out;
        self.buffer_size = buffer_size;
    }

    fn input_start(&self) -> usize {
        TEMP_BUFFER_HEAD_PAD
    }

    fn output_start(&self) -> usize {
        TEMP_BUFFER_HEAD_PAD + self.num_in * self.buffer_size
    }

    fn input_channel_mut(&mut self, logical: usize, frames: usize) -> &mut [f32] {
        let base = self.input_start() + logical * self.buffer_size;
        &mut self.data[base..base + frames]
    }

    fn output_channel(&self, logical: usize, frames: usize) -> &[f32] {
        let base = self.output_start() + logical * self.buffer_size;
        &self.data[base..base + frames]
    }

    /// View over the full captured input region, for a master reading a
    /// slave's buffer (`slave_state.temp.input_view(..)`).
    pub(crate) fn input_view(&self, frames: usize) -> AudioBufferView<'_> {
        AudioBufferView::new(&self.data[self.input_start()..self.output_start()], self.num_in, frames)
    }

    fn output_view_mut(&mut self, frames: usize) -> AudioBufferViewMut<'_> {
        let start = self.output_start();
        AudioBufferViewMut::new(&mut self.data[start..], self.num_out, frames)
    }

    /// Disjoint input/output views over this same buffer, for the
    /// no-slave case where a client reads and writes the one device's own
    /// temp buffer in a single cycle.
    fn split_views(&mut self, frames: usize) -> (AudioBufferView<'_>, AudioBufferViewMut<'_>) {
        let out_start = self.output_start();
        let num_in = self.num_in;
        let num_out = self.num_out;
        let (input_part, output_part) = self.data.split_at_mut(out_start);
        let input_view = AudioBufferView::new(&input_part[TEMP_BUFFER_HEAD_PAD..], num_in, frames);
        let output_view = AudioBufferViewMut::new(output_part, num_out, frames);
        (input_view, output_view)
    }
}

/// Everything the realtime lock guards: routing, temp buffers, and the
/// control-thread-visible fields `refresh_from_os` recomputes together with
/// them (spec.md's resource-model text has `refreshFromOS` update all of
/// this under one lock, so one `Mutex` covers it all here too).
pub(crate) struct CoreState {
    pub sample_rate: f64,
    pub buffer_size: u32,
    pub total_input_channels: usize,
    pub total_output_channels: usize,
    pub active_input_mask: ChannelMask,
    pub active_output_mask: ChannelMask,
    pub num_input_chans: usize,
    pub num_output_chans: usize,
    pub input_routing: [ChannelRouting; MAX_CHANS],
    pub output_routing: [ChannelRouting; MAX_CHANS],
    pub input_chan_names: Vec<String>,
    pub output_chan_names: Vec<String>,
    pub input_latency: u32,
    pub output_latency: u32,
    /// The candidate rates `{44100, 48000, 88200, 96000, 176400, 192000}`
    /// that fall within an OS-reported range, per spec.md §4.2 — not the raw
    /// OS ranges themselves. Never empty while the device is open.
    pub available_sample_rates: Vec<f64>,
    /// The `buffer_size_grid()` entries (plus the OS range's own `min` and
    /// the current `buffer_size`) that fall within the OS-reported range.
    /// Never empty while the device is open.
    pub available_buffer_sizes: Vec<u32>,
    pub client: Option<Arc<dyn IOCallback>>,
    pub callbacks_allowed: bool,
    /// The last error produced by `refreshFromOS`/`reopen`/`start`/`stop` or
    /// a data-source change, cleared on the next success — spec.md §3's
    /// `DeviceState.lastError`.
    pub last_error: Option<String>,
    pub(crate) temp: TempAudioBuffer,
}

impl CoreState {
    fn new() -> Self {
        CoreState {
            sample_rate: 0.0,
            buffer_size: 0,
            total_input_channels: 0,
            total_output_channels: 0,
            active_input_mask: ChannelMask::ALL,
            active_output_mask: ChannelMask::ALL,
            num_input_chans: 0,
            num_output_chans: 0,
            input_routing: [ChannelRouting::default(); MAX_CHANS],
            output_routing: [ChannelRouting::default(); MAX_CHANS],
            input_chan_names: Vec::new(),
            output_chan_names: Vec::new(),
            input_latency: 0,
            output_latency: 0,
            available_sample_rates: Vec::new(),
            available_buffer_sizes: Vec::new(),
            client: None,
            callbacks_allowed: true,
            last_error: None,
            temp: TempAudioBuffer::empty(),
        }
    }
}

/// The piece of a `DeviceCore` the OS actually calls back into. Split out
/// from `DeviceCore` so the realtime lock is independent of the
/// control-thread-only fields (I/O proc/listener tokens, the debouncer).
pub(crate) struct DeviceShared {
    pub device_id: DeviceId,
    pub is_slave: bool,
    pub state: Mutex<CoreState>,
    slave_shared: Mutex<Option<Arc<DeviceShared>>>,
}

fn build_routing(
    stream_channels: &[u32],
    mask: ChannelMask,
) -> ([ChannelRouting; MAX_CHANS], usize) {
    let mut routing = [ChannelRouting::default(); MAX_CHANS];
    let mut logical = 0usize;
    let mut physical = 0usize;
    'streams: for (stream_num, &count) in stream_channels.iter().enumerate() {
        for offset in 0..count as usize {
            if mask.is_active(physical) {
                if logical >= MAX_CHANS {
                    break 'streams;
                }
                routing[logical] = ChannelRouting {
                    source_channel_num: physical as u32,
                    stream_num: stream_num as u32,
                    data_offset_samples: offset as u32,
                    data_stride_samples: count,
                };
                logical += 1;
            }
            physical += 1;
        }
    }
    (routing, logical)
}

/// Builds spec.md §4.2's `availableSampleRates`: the fixed candidate set
/// filtered down to whichever candidates fall within any OS-reported range,
/// tolerating the range boundary by `SAMPLE_RATE_TOLERANCE_HZ`. Falls back
/// to `[current]` when the OS reports no ranges at all, so the
/// non-empty-while-open invariant holds.
fn compute_available_sample_rates(ranges: &[crate::hal::ValueRange<f64>], current: f64) -> Vec<f64> {
    if ranges.is_empty() {
        return vec![current];
    }
    CANDIDATE_SAMPLE_RATES
        .iter()
        .copied()
        .filter(|&rate| {
            ranges
                .iter()
                .any(|r| rate >= r.min - SAMPLE_RATE_TOLERANCE_HZ && rate <= r.max + SAMPLE_RATE_TOLERANCE_HZ)
        })
        .collect()
}

/// Builds spec.md §4.2's `availableBufferSizes`: the coarse `{min, 32, 64,
/// 96, ..., 8192}` grid intersected with the OS-reported range, with the
/// current `bufferSize` added if the intersection didn't already include it.
/// Falls back to `[current]` when the OS reports no range.
fn compute_available_buffer_sizes(range: Option<crate::hal::ValueRange<u32>>, current: u32) -> Vec<u32> {
    let Some(range) = range else {
        return vec![current];
    };
    let mut sizes: Vec<u32> = std::iter::once(range.min)
        .chain(buffer_size_grid())
        .filter(|&size| size >= range.min && size <= range.max)
        .collect();
    sizes.sort_unstable();
    sizes.dedup();
    if !sizes.contains(&current) {
        sizes.push(current);
        sizes.sort_unstable();
    }
    sizes
}

fn deinterleave_inputs(
    routing: &[ChannelRouting],
    streams: &[RawStream],
    temp: &mut TempAudioBuffer,
    frames: usize,
) {
    for (logical, r) in routing.iter().enumerate() {
        if !r.is_valid() {
            continue;
        }
        let dst = temp.input_channel_mut(logical, frames);
        let Some(stream) = streams.get(r.stream_num as usize) else {
            dst.fill(0.0);
            continue;
        };
        let stride = r.data_stride_samples as usize;
        let offset = r.data_offset_samples as usize;
        for (k, slot) in dst.iter_mut().enumerate() {
            *slot = stream.samples.get(offset + k * stride).copied().unwrap_or(0.0);
        }
    }
}

fn interleave_outputs(
    routing: &[ChannelRouting],
    temp: &TempAudioBuffer,
    streams: &mut [RawStreamMut],
    frames: usize,
) {
    for (logical, r) in routing.iter().enumerate() {
        if !r.is_valid() {
            continue;
        }
        let src = temp.output_channel(logical, frames);
        let Some(stream) = streams.get_mut(r.stream_num as usize) else {
            continue;
        };
        let stride = r.data_stride_samples as usize;
        let offset = r.data_offset_samples as usize;
        for (k, sample) in src.iter().enumerate() {
            if let Some(slot) = stream.samples.get_mut(offset + k * stride) {
                *slot = *sample;
            }
        }
    }
}

fn zero_fill_outputs(routing: &[ChannelRouting], streams: &mut [RawStreamMut], frames: usize) {
    for r in routing.iter() {
        if !r.is_valid() {
            continue;
        }
        let Some(stream) = streams.get_mut(r.stream_num as usize) else {
            continue;
        };
        let stride = r.data_stride_samples as usize;
        let offset = r.data_offset_samples as usize;
        for k in 0..frames {
            if let Some(slot) = stream.samples.get_mut(offset + k * stride) {
                *slot = 0.0;
            }
        }
    }
}

impl AudioCallbackSink for DeviceShared {
    fn render(&self, inputs: &[RawStream], outputs: &mut [RawStreamMut], num_frames: usize) {
        let mut state = self.state.lock();

        // Suspended across a reopen's negotiation window: routing and temp
        // buffers may be mid-resize, so touch nothing and hand back silence.
        if !state.callbacks_allowed {
            let num_out = state.num_output_chans;
            zero_fill_outputs(&state.output_routing[..num_out], outputs, num_frames);
            return;
        }

        let num_in = state.num_input_chans;

        // Input capture happens unconditionally, for both the master-alone
        // and slave roles, before any client-bound check — see
        // SPEC_FULL.md's DeviceCore section on why this can't be gated on
        // `client.is_some()`.
        deinterleave_inputs(&state.input_routing[..num_in], inputs, &mut state.temp, num_frames);

        if self.is_slave {
            return;
        }

        let num_out = state.num_output_chans;
        if state.client.is_none() {
            zero_fill_outputs(&state.output_routing[..num_out], outputs, num_frames);
            return;
        }
        let client = state.client.clone().unwrap();

        let slave = self.slave_shared.lock().clone();
        if let Some(slave_shared) = slave {
            let slave_state = slave_shared.state.lock();
            let input_view = slave_state.temp.input_view(num_frames);
            let mut output_view = state.temp.output_view_mut(num_frames);
            client.audio_device_io_callback(&input_view, &mut output_view, num_frames);
        } else {
            let (input_view, mut output_view) = state.temp.split_views(num_frames);
            client.audio_device_io_callback(&input_view, &mut output_view, num_frames);
        }

        interleave_outputs(&state.output_routing[..num_out], &state.temp, outputs, num_frames);
    }
}

/// Bridges OS property-change notifications into the debounced refresh.
struct PropertyListenerSink {
    core: std::sync::Weak<DeviceCoreInner>,
}

impl PropertyChangeSink for PropertyListenerSink {
    fn device_details_changed(&self) {
        if let Some(core) = self.core.upgrade() {
            core.arm_debounce();
        }
    }
}

const WATCHED_PROPERTIES: &[WatchedProperty] = &[
    WatchedProperty::DeviceIsAlive,
    WatchedProperty::NominalSampleRate,
    WatchedProperty::BufferFrameSize,
    WatchedProperty::StreamConfiguration,
    WatchedProperty::DataSource,
];

struct ControlState {
    io_token: Option<IoProcToken>,
    listener_token: Option<ListenerToken>,
    debouncer: Option<Debouncer>,
    slave: Option<Box<DeviceCore>>,
}

/// Inner, `Arc`-shared pieces of `DeviceCore` so the debounce worker thread
/// (which only holds a `Weak` back-reference, per spec.md's non-owning
/// back-reference guidance) can trigger a refresh without owning the core.
struct DeviceCoreInner {
    hal: Arc<dyn Hal>,
    device_id: DeviceId,
    shared: Arc<DeviceShared>,
    control: Mutex<ControlState>,
    started: AtomicBool,
}

impl DeviceCoreInner {
    /// Spec.md §4.2's `deviceDetailsChanged`: "if callbacks are allowed,
    /// (re)arm a one-shot 100 ms refresh timer" — a notification that lands
    /// while `reopen`/`on_debounced_refresh` has callbacks suspended must not
    /// queue a refresh against state mid-negotiation.
    fn arm_debounce(self: &Arc<Self>) {
        if !self.shared.state.lock().callbacks_allowed {
            return;
        }
        let control = self.control.lock();
        if let Some(debouncer) = &control.debouncer {
            debouncer.arm();
        }
    }
}

/// Public handle to one device's realtime core. Cheap to clone (wraps an
/// `Arc`); `Device` (device.rs) holds one of these per open device.
pub struct DeviceCore {
    inner: Arc<DeviceCoreInner>,
}

impl DeviceCore {
    pub(crate) fn new(hal: Arc<dyn Hal>, device_id: DeviceId, is_slave: bool) -> Self {
        let shared = Arc::new(DeviceShared {
            device_id,
            is_slave,
            state: Mutex::new(CoreState::new()),
            slave_shared: Mutex::new(None),
        });
        let inner = Arc::new(DeviceCoreInner {
            hal,
            device_id,
            shared,
            control: Mutex::new(ControlState {
                io_token: None,
                listener_token: None,
                debouncer: None,
                slave: None,
            }),
            started: AtomicBool::new(false),
        });
        DeviceCore { inner }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// The last error raised by `refresh_from_os`/`reopen`/`start`/`stop` or
    /// a data-source change; `None` once the next such call succeeds.
    /// spec.md §3's `DeviceState.lastError`.
    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.state.lock().last_error.clone()
    }

    /// Stores `result`'s error (via `Display`) into `last_error`, clearing it
    /// on success, then hands `result` back unchanged.
    fn record_outcome<T>(&self, result: DeviceResult<T>) -> DeviceResult<T> {
        let mut state = self.inner.shared.state.lock();
        state.last_error = match &result {
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        drop(state);
        result
    }

    /// Re-reads the device's current configuration from the OS and rebuilds
    /// channel names and routings under the realtime lock. Preserves the
    /// previously active channel mask when the channel count hasn't
    /// changed; otherwise defaults back to "all channels active".
    pub fn refresh_from_os(&self) -> DeviceResult<()> {
        let result = self.refresh_from_os_with_masks(None);
        self.record_outcome(result)
    }

    /// The debounce worker's on-fire body (spec.md §4.2's
    /// `deviceDetailsChanged`): snapshot the old rate/size, refresh, and —
    /// only if either actually changed — suspend callbacks, stop the I/O
    /// proc, refresh again, then resume. A no-op change (e.g. S6's
    /// hot-unplug, where rate/size are untouched) never stops anything.
    fn on_debounced_refresh(&self) {
        let (old_rate, old_size) = {
            let state = self.inner.shared.state.lock();
            (state.sample_rate, state.buffer_size)
        };

        if self.refresh_from_os().is_err() {
            return;
        }

        let (new_rate, new_size) = {
            let state = self.inner.shared.state.lock();
            (state.sample_rate, state.buffer_size)
        };
        if new_rate == old_rate && new_size == old_size {
            return;
        }

        let was_running = self.inner.started.load(Ordering::Acquire);
        {
            let mut state = self.inner.shared.state.lock();
            state.callbacks_allowed = false;
        }
        if was_running {
            if let Some(token) = &self.inner.control.lock().io_token {
                let _ = self.inner.hal.stop_device(self.inner.device_id, token);
            }
            self.wait_for_quiescence();
        }

        let _ = self.refresh_from_os();

        {
            let mut state = self.inner.shared.state.lock();
            state.callbacks_allowed = true;
        }
        if was_running {
            if let Some(token) = &self.inner.control.lock().io_token {
                let _ = self.inner.hal.start_device(self.inner.device_id, token);
            }
        }
    }

    /// As `refresh_from_os`, but when `masks` is `Some`, the given input and
    /// output masks replace whatever was previously active rather than
    /// being preserved/reset by channel count — the mechanism `open`/`reopen`
    /// use to apply a caller-requested active-channel mask (spec.md §4.2
    /// step 2).
    fn refresh_from_os_with_masks(&self, masks: Option<(ChannelMask, ChannelMask)>) -> DeviceResult<()> {
        let hal = &self.inner.hal;
        let id = self.inner.device_id;

        let sample_rate = hal.nominal_sample_rate(id).unwrap_or(0.0);
        let buffer_size = hal.buffer_frame_size(id).unwrap_or(0);
        let in_streams = hal.stream_channel_counts(id, true);
        let out_streams = hal.stream_channel_counts(id, false);
        let total_in: usize = in_streams.iter().map(|&c| c as usize).sum();
        let total_out: usize = out_streams.iter().map(|&c| c as usize).sum();
        if total_in > MAX_CHANS || total_out > MAX_CHANS {
            return Err(DeviceError::OpenFailure(format!(
                "device {} exceeds the {}-channel cap ({} in / {} out)",
                id, MAX_CHANS, total_in, total_out
            )));
        }

        let available_sample_rates =
            compute_available_sample_rates(&hal.available_sample_rates(id), sample_rate);
        let available_buffer_sizes =
            compute_available_buffer_sizes(hal.buffer_frame_size_range(id), buffer_size);
        let input_latency = hal.latency_frames(id, true);
        let output_latency = hal.latency_frames(id, false);

        let mut state = self.inner.shared.state.lock();

        let (input_mask, output_mask) = if let Some((im, om)) = masks {
            (im, om)
        } else {
            let im = if state.total_input_channels == total_in {
                state.active_input_mask
            } else {
                ChannelMask::ALL
            };
            let om = if state.total_output_channels == total_out {
                state.active_output_mask
            } else {
                ChannelMask::ALL
            };
            (im, om)
        };

        let (input_routing, num_in) = build_routing(&in_streams, input_mask);
        let (output_routing, num_out) = build_routing(&out_streams, output_mask);

        state.input_chan_names = (0..num_in).map(|i| format!("Input {}", i + 1)).collect();
        state.output_chan_names = (0..num_out).map(|i| format!("Output {}", i + 1)).collect();

        state.total_input_channels = total_in;
        state.total_output_channels = total_out;
        state.active_input_mask = input_mask;
        state.active_output_mask = output_mask;
        state.input_routing = input_routing;
        state.output_routing = output_routing;
        state.num_input_chans = num_in;
        state.num_output_chans = num_out;
        state.sample_rate = sample_rate;
        state.buffer_size = buffer_size;
        state.input_latency = input_latency;
        state.output_latency = output_latency;
        state.available_sample_rates = available_sample_rates;
        state.available_buffer_sizes = available_buffer_sizes;
        state.temp.resize(num_in, num_out, buffer_size as usize);
        drop(state);

        if let Some(slave_core) = &self.inner.control.lock().slave {
            slave_core.refresh_from_os()?;
        }

        Ok(())
    }

    /// Requests `desired`, falling back across `CANDIDATE_SAMPLE_RATES`.
    /// Returns the rate actually requested, for `wait_for_convergence` to
    /// poll for.
    fn negotiate_sample_rate(&self, desired: f64) -> DeviceResult<f64> {
        let available = self.inner.hal.available_sample_rates(self.inner.device_id);
        if available.is_empty() {
            return Err(DeviceError::NoRatesAvailable);
        }
        if self
            .inner
            .hal
            .set_nominal_sample_rate(self.inner.device_id, desired)
            .is_ok()
        {
            return Ok(desired);
        }
        for &candidate in CANDIDATE_SAMPLE_RATES {
            let in_range = available.iter().any(|r| candidate >= r.min && candidate <= r.max);
            if in_range
                && self
                    .inner
                    .hal
                    .set_nominal_sample_rate(self.inner.device_id, candidate)
                    .is_ok()
            {
                return Ok(candidate);
            }
        }
        Err(DeviceError::ReconfigureFailure)
    }

    /// Requests `desired`, falling back across `buffer_size_grid()`. Returns
    /// the size actually requested, for `wait_for_convergence` to poll for.
    fn negotiate_buffer_size(&self, desired: u32) -> DeviceResult<u32> {
        let range = self
            .inner
            .hal
            .buffer_frame_size_range(self.inner.device_id)
            .ok_or(DeviceError::NoBufferSizesAvailable)?;
        if self
            .inner
            .hal
            .set_buffer_frame_size(self.inner.device_id, desired)
            .is_ok()
        {
            return Ok(desired);
        }
        for candidate in buffer_size_grid() {
            if candidate >= range.min
                && candidate <= range.max
                && self
                    .inner
                    .hal
                    .set_buffer_frame_size(self.inner.device_id, candidate)
                    .is_ok()
            {
                return Ok(candidate);
            }
        }
        Err(DeviceError::ReconfigureFailure)
    }

    fn wait_for_quiescence(&self) {
        for _ in 0..STOP_POLL_MAX_ATTEMPTS {
            if !self.inner.hal.is_running(self.inner.device_id) {
                return;
            }
            std::thread::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS));
        }
    }

    /// Spec.md §4.2 step 5: poll `refreshFromOS` up to 30×/100 ms until the
    /// observed rate and size (whichever of the two was actually requested)
    /// match what was negotiated. `target_rate`/`target_size` being `None`
    /// means that dimension wasn't part of this `reopen` and needs no
    /// convergence check.
    fn wait_for_convergence(
        &self,
        target_rate: Option<f64>,
        target_size: Option<u32>,
    ) -> DeviceResult<()> {
        if target_rate.is_none() && target_size.is_none() {
            return Ok(());
        }
        for _ in 0..REOPEN_POLL_MAX_ATTEMPTS {
            let _ = self.refresh_from_os_with_masks(None);
            let state = self.inner.shared.state.lock();
            let rate_converged = target_rate
                .map(|r| (state.sample_rate - r).abs() <= OBSERVED_RATE_EPSILON_HZ)
                .unwrap_or(true);
            let size_converged = target_size.map(|s| state.buffer_size == s).unwrap_or(true);
            drop(state);
            if rate_converged && size_converged {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(REOPEN_POLL_INTERVAL_MS));
        }
        Err(DeviceError::ReconfigureFailure)
    }

    /// Suspends callbacks, stops the I/O proc if running, assigns the
    /// requested active-channel masks, negotiates the requested sample
    /// rate/buffer size (falling back across `CANDIDATE_SAMPLE_RATES`/
    /// `buffer_size_grid()`), waits for the OS to converge on the
    /// negotiated values, refreshes from the OS, propagates to the slave if
    /// any (same arguments, per spec.md §4.2 step 7), and restarts if it was
    /// running.
    pub fn reopen(
        &self,
        input_mask: Option<ChannelMask>,
        output_mask: Option<ChannelMask>,
        sample_rate: Option<f64>,
        buffer_size: Option<u32>,
    ) -> DeviceResult<()> {
        let was_running = self.inner.started.load(Ordering::Acquire);

        {
            let mut state = self.inner.shared.state.lock();
            state.callbacks_allowed = false;
        }

        if was_running {
            if let Some(token) = &self.inner.control.lock().io_token {
                let _ = self.inner.hal.stop_device(self.inner.device_id, token);
            }
            self.wait_for_quiescence();
        }

        // Negotiation can fail (no candidate converges); callbacks must be
        // re-armed and a running device restarted either way, so the facade
        // stays usable after a failed reconfigure (spec.md §8 S5).
        let result = self.reopen_locked(input_mask, output_mask, sample_rate, buffer_size);

        {
            let mut state = self.inner.shared.state.lock();
            state.callbacks_allowed = true;
        }

        if was_running {
            if let Some(token) = &self.inner.control.lock().io_token {
                if let Err(e) = self.inner.hal.start_device(self.inner.device_id, token) {
                    return self.record_outcome(result.and(Err(DeviceError::StartFailure(e.to_string()))));
                }
            }
        }

        self.record_outcome(result)
    }

    fn reopen_locked(
        &self,
        input_mask: Option<ChannelMask>,
        output_mask: Option<ChannelMask>,
        sample_rate: Option<f64>,
        buffer_size: Option<u32>,
    ) -> DeviceResult<()> {
        let target_rate = sample_rate.map(|rate| self.negotiate_sample_rate(rate)).transpose()?;
        let target_size = buffer_size.map(|size| self.negotiate_buffer_size(size)).transpose()?;
        self.wait_for_convergence(target_rate, target_size)?;

        let masks = match (input_mask, output_mask) {
            (None, None) => None,
            (im, om) => {
                let current = self.inner.shared.state.lock();
                Some((
                    im.unwrap_or(current.active_input_mask),
                    om.unwrap_or(current.active_output_mask),
                ))
            }
        };
        self.refresh_from_os_with_masks(masks)?;

        if let Some(slave_core) = &self.inner.control.lock().slave {
            slave_core
                .reopen(input_mask, output_mask, sample_rate, buffer_size)
                .map_err(|e| DeviceError::SlaveFailure(e.to_string()))?;
        }

        Ok(())
    }

    /// Installs the I/O proc and property listener (first call only),
    /// binds `client`, starts the slave (informational-only, no client of
    /// its own) if one was set by `DeviceType::createDevice`, and starts
    /// this device's own I/O proc.
    pub fn start(&self, client: Option<Arc<dyn IOCallback>>) -> DeviceResult<()> {
        let result = self.start_inner(client);
        self.record_outcome(result)
    }

    fn start_inner(&self, client: Option<Arc<dyn IOCallback>>) -> DeviceResult<()> {
        {
            let mut state = self.inner.shared.state.lock();
            if let Some(c) = &client {
                c.audio_device_about_to_start(state.sample_rate, state.buffer_size);
            }
            state.client = client;
        }

        let mut control = self.inner.control.lock();
        if control.io_token.is_none() {
            let token = self
                .inner
                .hal
                .add_io_proc(self.inner.device_id, self.inner.shared.clone())?;
            control.io_token = Some(token);
        }
        if control.listener_token.is_none() {
            let sink: Arc<dyn PropertyChangeSink> = Arc::new(PropertyListenerSink {
                core: Arc::downgrade(&self.inner),
            });
            let token = self.inner.hal.add_property_listener(
                self.inner.device_id,
                WATCHED_PROPERTIES,
                sink,
            )?;
            control.listener_token = Some(token);
        }
        if control.debouncer.is_none() {
            let weak = Arc::downgrade(&self.inner);
            control.debouncer = Some(Debouncer::new(Duration::from_millis(DEBOUNCE_MS), move || {
                if let Some(inner) = weak.upgrade() {
                    DeviceCore { inner }.on_debounced_refresh();
                }
            }));
        }

        if let Some(slave_core) = &control.slave {
            slave_core.start(None)?;
            *self.inner.shared.slave_shared.lock() = Some(slave_core.inner.shared.clone());
        }

        let token = control.io_token.as_ref().unwrap();
        self.inner
            .hal
            .start_device(self.inner.device_id, token)
            .map_err(|e| DeviceError::StartFailure(e.to_string()))?;
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops the I/O proc, waits for it to go quiescent, unbinds the
    /// client, and stops the slave if any. The listener and debouncer stay
    /// installed so a later `start` can reuse them.
    pub fn stop(&self) -> DeviceResult<()> {
        let result = self.stop_inner();
        self.record_outcome(result)
    }

    fn stop_inner(&self) -> DeviceResult<()> {
        let control = self.inner.control.lock();
        if let Some(token) = &control.io_token {
            self.inner.hal.stop_device(self.inner.device_id, token)?;
        }
        drop(control);
        self.wait_for_quiescence();
        self.inner.started.store(false, Ordering::Release);

        let client = {
            let mut state = self.inner.shared.state.lock();
            let client = state.client.take();
            client
        };
        if let Some(client) = client {
            client.audio_device_stopped();
        }

        let control = self.inner.control.lock();
        if let Some(slave_core) = &control.slave {
            slave_core.stop()?;
        }
        *self.inner.shared.slave_shared.lock() = None;
        Ok(())
    }

    pub fn set_slave(&self, slave: Option<DeviceCore>) {
        self.inner.control.lock().slave = slave.map(Box::new);
    }

    pub fn has_slave(&self) -> bool {
        self.inner.control.lock().slave.is_some()
    }

    /// When a slave is set, the slave device (not this master) is the one
    /// actually capturing input — `getInputChannelNames`/`numInputChans` and
    /// the other input-facing queries below report the slave's state, per
    /// S3 in spec.md §8.
    pub fn num_input_channels(&self) -> usize {
        if let Some(slave_core) = &self.inner.control.lock().slave {
            return slave_core.num_input_channels();
        }
        self.inner.shared.state.lock().num_input_chans
    }

    pub fn num_output_channels(&self) -> usize {
        self.inner.shared.state.lock().num_output_chans
    }

    /// This core's own active-input mask, ignoring any slave — used to
    /// build `Device::active_input_channels`'s master-union-slave result.
    pub fn own_active_input_mask(&self) -> ChannelMask {
        self.inner.shared.state.lock().active_input_mask
    }

    pub fn active_output_mask(&self) -> ChannelMask {
        self.inner.shared.state.lock().active_output_mask
    }

    /// Union of this core's own mask and its slave's, per spec.md §4.3's
    /// `getActiveInputChannels`.
    pub fn active_input_channels(&self) -> ChannelMask {
        let own = self.own_active_input_mask();
        if let Some(slave_core) = &self.inner.control.lock().slave {
            ChannelMask(own.0 | slave_core.own_active_input_mask().0)
        } else {
            own
        }
    }

    pub fn input_channel_names(&self) -> Vec<String> {
        if let Some(slave_core) = &self.inner.control.lock().slave {
            return slave_core.input_channel_names();
        }
        self.inner.shared.state.lock().input_chan_names.clone()
    }

    pub fn output_channel_names(&self) -> Vec<String> {
        self.inner.shared.state.lock().output_chan_names.clone()
    }

    pub fn sample_rate(&self) -> f64 {
        self.inner.shared.state.lock().sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.inner.shared.state.lock().buffer_size
    }

    pub fn available_sample_rates(&self) -> Vec<f64> {
        self.inner.shared.state.lock().available_sample_rates.clone()
    }

    pub fn available_buffer_sizes(&self) -> Vec<u32> {
        self.inner.shared.state.lock().available_buffer_sizes.clone()
    }

    pub fn input_latency_frames(&self) -> u32 {
        if let Some(slave_core) = &self.inner.control.lock().slave {
            return slave_core.input_latency_frames();
        }
        self.inner.shared.state.lock().input_latency
    }

    pub fn output_latency_frames(&self) -> u32 {
        self.inner.shared.state.lock().output_latency
    }

    pub fn input_data_source_names(&self) -> Vec<String> {
        if let Some(slave_core) = &self.inner.control.lock().slave {
            return slave_core.input_data_source_names();
        }
        self.inner.hal.data_source_names(self.inner.device_id, true)
    }

    pub fn output_data_source_names(&self) -> Vec<String> {
        self.inner.hal.data_source_names(self.inner.device_id, false)
    }

    pub fn current_input_data_source(&self) -> Option<usize> {
        if let Some(slave_core) = &self.inner.control.lock().slave {
            return slave_core.current_input_data_source();
        }
        self.inner
            .hal
            .current_data_source_index(self.inner.device_id, true)
    }

    pub fn current_output_data_source(&self) -> Option<usize> {
        self.inner
            .hal
            .current_data_source_index(self.inner.device_id, false)
    }

    pub fn set_input_data_source(&self, index: usize) -> DeviceResult<()> {
        let result = if let Some(slave_core) = &self.inner.control.lock().slave {
            slave_core.set_input_data_source(index)
        } else {
            self.inner
                .hal
                .set_current_data_source_index(self.inner.device_id, true, index)
        };
        self.record_outcome(result)
    }

    pub fn set_output_data_source(&self, index: usize) -> DeviceResult<()> {
        let result = self
            .inner
            .hal
            .set_current_data_source_index(self.inner.device_id, false, index);
        self.record_outcome(result)
    }

    pub fn related_devices(&self) -> Vec<DeviceId> {
        self.inner.hal.related_devices(self.inner.device_id)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.hal.is_alive(self.inner.device_id)
    }
}

impl Drop for DeviceCoreInner {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        if let Some(token) = control.listener_token.take() {
            self.hal.remove_property_listener(self.device_id, token);
        }
        if let Some(token) = control.io_token.take() {
            self.hal.remove_io_proc(self.device_id, token);
        }
        control.debouncer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChannelMask;

    #[test]
    fn routing_is_indexed_by_logical_position_not_physical_channel() {
        // Two physical input channels, only channel 1 (bit index 1) active:
        // logical channel 0 must report sourceChannelNum == 1, matching
        // scenario S2 in spec.md §8.
        let (routing, count) = build_routing(&[2], ChannelMask(0b10));
        assert_eq!(count, 1);
        assert_eq!(routing[0].source_channel_num, 1);
        assert_eq!(routing[0].data_stride_samples, 2);
    }

    #[test]
    fn deinterleave_respects_stride_and_offset() {
        let mut temp = TempAudioBuffer::empty();
        temp.resize(1, 0, 4);
        let routing = [ChannelRouting {
            source_channel_num: 1,
            stream_num: 0,
            data_offset_samples: 1,
            data_stride_samples: 2,
        }];
        // interleaved stereo stream: L0 R0 L1 R1 L2 R2 L3 R3
        let samples = [0.0, 10.0, 0.0, 20.0, 0.0, 30.0, 0.0, 40.0];
        let streams = [RawStream {
            samples: &samples,
            num_channels: 2,
        }];
        deinterleave_inputs(&routing, &streams, &mut temp, 4);
        assert_eq!(temp.input_channel_mut(0, 4), &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn zero_fill_writes_silence_into_routed_slots() {
        let routing = [ChannelRouting {
            source_channel_num: 0,
            stream_num: 0,
            data_offset_samples: 0,
            data_stride_samples: 1,
        }];
        let mut samples = [1.0, 1.0, 1.0];
        let mut streams = [RawStreamMut {
            samples: &mut samples,
            num_channels: 1,
        }];
        zero_fill_outputs(&routing, &mut streams, 3);
        assert_eq!(samples, [0.0, 0.0, 0.0]);
    }

    struct Loud;
    impl IOCallback for Loud {
        fn audio_device_io_callback(
            &self,
            _inputs: &AudioBufferView,
            outputs: &mut AudioBufferViewMut,
            _num_frames: usize,
        ) {
            outputs.channel_mut(0).iter_mut().for_each(|s| *s = 7.0);
        }
    }

    #[test]
    fn reopen_failure_reenables_callbacks_instead_of_leaving_them_suspended() {
        let hal = Arc::new(crate::mock_hal::MockHal::new());
        let mut device = crate::mock_hal::MockDevice::new("Test", 1, 1);
        device.available_sample_rates = vec![crate::hal::ValueRange {
            min: 1_000.0,
            max: 2_000.0,
        }];
        hal.add_device(DeviceId(1), device);

        let core = DeviceCore::new(hal, DeviceId(1), false);
        core.refresh_from_os().unwrap();
        let err = core.reopen(None, None, Some(48_000.0), None).unwrap_err();
        assert_eq!(err, DeviceError::ReconfigureFailure);
        assert!(core.inner.shared.state.lock().callbacks_allowed);

        core.start(Some(Arc::new(Loud))).unwrap();
        let mut out = [0.0f32];
        let mut streams = [RawStreamMut {
            samples: &mut out,
            num_channels: 1,
        }];
        core.inner.shared.render(&[], &mut streams, 1);
        assert_eq!(out, [7.0]);
    }

    #[test]
    fn last_error_reflects_the_most_recent_outcome() {
        let hal = Arc::new(crate::mock_hal::MockHal::new());
        let mut device = crate::mock_hal::MockDevice::new("Test", 1, 1);
        device.available_sample_rates = vec![crate::hal::ValueRange {
            min: 1_000.0,
            max: 2_000.0,
        }];
        hal.add_device(DeviceId(1), device);

        let core = DeviceCore::new(hal, DeviceId(1), false);
        assert_eq!(core.last_error(), None);

        let err = core.reopen(None, None, Some(48_000.0), None).unwrap_err();
        assert_eq!(core.last_error(), Some(err.to_string()));

        core.refresh_from_os().unwrap();
        assert_eq!(core.last_error(), None);
    }
}
