//! The "Upward" interface from SPEC_FULL.md §External interfaces: what a
//! client bound to a `Device` receives on every audio cycle, and the raw
//! per-stream views the HAL hands `DeviceCore::audio_callback` before any
//! routing has been applied.

/// One OS-side interleaved audio stream, as delivered in an
/// `AudioBufferList`'s `AudioBuffer` entries (or a mock equivalent in
/// tests). Never allocates; borrows directly into the OS (or mock) buffer.
pub struct RawStream<'a> {
    pub samples: &'a [f32],
    pub num_channels: usize,
}

impl<'a> RawStream<'a> {
    pub fn frames(&self) -> usize {
        if self.num_channels == 0 {
            0
        } else {
            self.samples.len() / self.num_channels
        }
    }
}

pub struct RawStreamMut<'a> {
    pub samples: &'a mut [f32],
    pub num_channels: usize,
}

impl<'a> RawStreamMut<'a> {
    pub fn frames(&self) -> usize {
        if self.num_channels == 0 {
            0
        } else {
            self.samples.len() / self.num_channels
        }
    }
}

/// Deinterleaved, per-logical-channel view of `tempInputBuffers`/
/// `tempOutputBuffers` handed to `IOCallback::audio_device_io_callback`.
/// Channel `i` is always the logical position assigned during
/// `refreshFromOS`, never the raw OS channel number.
pub struct AudioBufferView<'a> {
    data: &'a [f32],
    num_channels: usize,
    frames: usize,
}

impl<'a> AudioBufferView<'a> {
    pub fn new(data: &'a [f32], num_channels: usize, frames: usize) -> Self {
        debug_assert!(data.len() >= num_channels * frames);
        AudioBufferView {
            data,
            num_channels,
            frames,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        let start = index * self.frames;
        &self.data[start..start + self.frames]
    }
}

pub struct AudioBufferViewMut<'a> {
    data: &'a mut [f32],
    num_channels: usize,
    frames: usize,
}

impl<'a> AudioBufferViewMut<'a> {
    pub fn new(data: &'a mut [f32], num_channels: usize, frames: usize) -> Self {
        debug_assert!(data.len() >= num_channels * frames);
        AudioBufferViewMut {
            data,
            num_channels,
            frames,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.frames;
        &mut self.data[start..start + self.frames]
    }
}

/// A client bound to a `Device` via `Device::start`. All three methods run
/// on the realtime audio thread under the device's callback lock except
/// `audio_device_about_to_start`/`audio_device_stopped`, which run on the
/// control thread immediately before/after the realtime callback is
/// installed or removed.
pub trait IOCallback: Send + Sync {
    /// Called once, on the control thread, right before the I/O proc is
    /// started, with the sample rate and buffer size that will be in effect.
    fn audio_device_about_to_start(&self, sample_rate: f64, buffer_size: u32) {
        let _ = (sample_rate, buffer_size);
    }

    /// Called on the realtime thread for every audio cycle. Must not
    /// allocate, lock anything outside what the device already holds, or
    /// block.
    fn audio_device_io_callback(
        &self,
        inputs: &AudioBufferView,
        outputs: &mut AudioBufferViewMut,
        num_frames: usize,
    );

    /// Called once, on the control thread, right after the I/O proc has
    /// been stopped and will receive no further callbacks.
    fn audio_device_stopped(&self) {}
}
