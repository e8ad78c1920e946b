//! The "Downward (to the OS HAL)" interface from SPEC_FULL.md. `DeviceType`
//! and `DeviceCore` talk to the operating system exclusively through this
//! trait, which is what lets `tests/scenarios.rs` drive spec.md §8's S1–S6
//! scenarios against `MockHal` instead of real hardware.

use std::sync::Arc;

use crate::callback::{RawStream, RawStreamMut};
use crate::error::DeviceResult;
use crate::state::DeviceId;

/// Receives realtime callbacks from an installed I/O proc. `DeviceCore`'s
/// shared state implements this; `Hal::add_io_proc` is handed an `Arc` to it.
pub trait AudioCallbackSink: Send + Sync {
    /// Called on the device's realtime thread. `inputs`/`outputs` are raw,
    /// still-interleaved OS streams — no routing has been applied yet.
    fn render(&self, inputs: &[RawStream], outputs: &mut [RawStreamMut], num_frames: usize);
}

/// Receives OS property-change notifications for a device.
pub trait PropertyChangeSink: Send + Sync {
    /// Called on whatever thread CoreAudio delivers property notifications
    /// on (never the realtime audio thread). Implementations debounce.
    fn device_details_changed(&self);
}

/// The subset of `AudioObjectPropertySelector`s `Hal::add_property_listener`
/// can be asked to watch. Named, not raw `u32`s, so callers read intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedProperty {
    DeviceIsAlive,
    NominalSampleRate,
    BufferFrameSize,
    StreamConfiguration,
    DataSource,
    DeviceList,
    DefaultInputDevice,
    DefaultOutputDevice,
}

/// Opaque handle returned by `add_io_proc`; must be passed back to
/// `remove_io_proc`/`start_device`/`stop_device` for the same device.
pub struct IoProcToken(pub(crate) IoProcTokenInner);

pub(crate) enum IoProcTokenInner {
    Mock(u64),
    #[cfg(target_os = "macos")]
    CoreAudio {
        proc_id: coreaudio::sys::AudioDeviceIOProcID,
        client_data: *mut std::ffi::c_void,
    },
}

/// Opaque handle returned by `add_property_listener`.
pub struct ListenerToken(pub(crate) ListenerTokenInner);

pub(crate) enum ListenerTokenInner {
    Mock(u64),
    #[cfg(target_os = "macos")]
    CoreAudio {
        selectors: Vec<u32>,
        client_data: *mut std::ffi::c_void,
    },
}

/// A half-open range, as CoreAudio reports continuous ranges of supported
/// sample rates or buffer sizes (`AudioValueRange`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
}

/// Everything `DeviceType`/`DeviceCore` need from the OS HAL. Implemented by
/// `CoreAudioHal` (real hardware, `#[cfg(target_os = "macos")]`) and
/// `MockHal` (tests, any platform).
pub trait Hal: Send + Sync {
    fn all_device_ids(&self) -> DeviceResult<Vec<DeviceId>>;
    fn default_device(&self, input: bool) -> Option<DeviceId>;

    fn device_name(&self, id: DeviceId) -> DeviceResult<String>;
    fn device_uid(&self, id: DeviceId) -> DeviceResult<String>;
    fn is_aggregate(&self, id: DeviceId) -> bool;
    /// Sub-devices of an aggregate, or devices otherwise related (shared
    /// clock domain) to `id`. Empty for a plain physical device.
    fn related_devices(&self, id: DeviceId) -> Vec<DeviceId>;

    /// Channel count per OS stream, in stream order, for the given direction.
    fn stream_channel_counts(&self, id: DeviceId, input: bool) -> Vec<u32>;

    fn nominal_sample_rate(&self, id: DeviceId) -> Option<f64>;
    fn set_nominal_sample_rate(&self, id: DeviceId, rate: f64) -> DeviceResult<()>;
    fn available_sample_rates(&self, id: DeviceId) -> Vec<ValueRange<f64>>;

    fn buffer_frame_size(&self, id: DeviceId) -> Option<u32>;
    fn set_buffer_frame_size(&self, id: DeviceId, frames: u32) -> DeviceResult<()>;
    fn buffer_frame_size_range(&self, id: DeviceId) -> Option<ValueRange<u32>>;

    fn latency_frames(&self, id: DeviceId, input: bool) -> u32;
    fn is_running(&self, id: DeviceId) -> bool;
    fn is_alive(&self, id: DeviceId) -> bool;

    fn data_source_names(&self, id: DeviceId, input: bool) -> Vec<String>;
    fn current_data_source_index(&self, id: DeviceId, input: bool) -> Option<usize>;
    fn set_current_data_source_index(
        &self,
        id: DeviceId,
        input: bool,
        index: usize,
    ) -> DeviceResult<()>;

    fn add_io_proc(&self, id: DeviceId, sink: Arc<dyn AudioCallbackSink>) -> DeviceResult<IoProcToken>;
    fn remove_io_proc(&self, id: DeviceId, token: IoProcToken);
    fn start_device(&self, id: DeviceId, token: &IoProcToken) -> DeviceResult<()>;
    fn stop_device(&self, id: DeviceId, token: &IoProcToken) -> DeviceResult<()>;

    fn add_property_listener(
        &self,
        id: DeviceId,
        selectors: &[WatchedProperty],
        sink: Arc<dyn PropertyChangeSink>,
    ) -> DeviceResult<ListenerToken>;
    fn remove_property_listener(&self, id: DeviceId, token: ListenerToken);
}
