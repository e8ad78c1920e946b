//! A full-duplex, deinterleaved-float32 CoreAudio device adapter.
//!
//! [`DeviceType`] enumerates the devices the OS reports and resolves a pair
//! of input/output names into a [`Device`]; [`Device`] is the facade callers
//! program against (open/start/stop/reconfigure, channel and latency
//! queries); [`DeviceCore`] carries the realtime-safe state underneath it,
//! including master/slave aggregation for devices that need independent
//! input and output hardware. Everything OS-specific sits behind the
//! [`Hal`] trait, so the crate builds and tests on any platform even though
//! only `CoreAudioHal` talks to real hardware.

mod callback;
mod debounce;
mod device;
mod device_core;
mod device_type;
mod error;
mod hal;
#[cfg(target_os = "macos")]
mod hal_coreaudio;
mod mock_hal;
mod state;

pub use callback::{AudioBufferView, AudioBufferViewMut, IOCallback, RawStream, RawStreamMut};
pub use device::Device;
pub use device_core::DeviceCore;
pub use device_type::DeviceType;
pub use error::{DeviceError, DeviceResult};
pub use hal::{AudioCallbackSink, Hal, IoProcToken, ListenerToken, PropertyChangeSink, ValueRange, WatchedProperty};
pub use mock_hal::{MockDevice, MockHal};
pub use state::{
    buffer_size_grid, ChannelMask, ChannelRouting, DeviceDescriptor, DeviceId, CANDIDATE_SAMPLE_RATES,
    MAX_CHANS, MIN_DEFAULT_BUFFER_SIZE,
};

#[cfg(target_os = "macos")]
pub use hal_coreaudio::CoreAudioHal;
