//! Black-box end-to-end tests against `MockHal`, one per testable scenario
//! in spec.md §8 (S1-S6). Each drives the public `DeviceType`/`Device`
//! facade exactly as a real caller would; `MockHal::run_io_cycle` stands in
//! for the OS calling the installed I/O proc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use coreaudio_duplex_device::{
    AudioBufferView, AudioBufferViewMut, ChannelMask, DeviceId, DeviceType, IOCallback, MockDevice,
    MockHal, ValueRange,
};

/// Copies input channel `i` to output channel `i`, for as many channels as
/// both sides have.
struct PassThrough;

impl IOCallback for PassThrough {
    fn audio_device_io_callback(
        &self,
        inputs: &AudioBufferView,
        outputs: &mut AudioBufferViewMut,
        _num_frames: usize,
    ) {
        let n = inputs.num_channels().min(outputs.num_channels());
        for ch in 0..n {
            outputs.channel_mut(ch).copy_from_slice(inputs.channel(ch));
        }
    }
}

/// Records every input buffer it's handed, for tests that need to inspect
/// what the routing layer actually delivered.
struct Capture {
    frames: Mutex<Vec<Vec<f32>>>,
}

impl Capture {
    fn new() -> Self {
        Capture {
            frames: Mutex::new(Vec::new()),
        }
    }
}

impl IOCallback for Capture {
    fn audio_device_io_callback(
        &self,
        inputs: &AudioBufferView,
        outputs: &mut AudioBufferViewMut,
        num_frames: usize,
    ) {
        for ch in 0..outputs.num_channels() {
            outputs.channel_mut(ch).iter_mut().for_each(|s| *s = 0.0);
        }
        let mut frames = self.frames.lock().unwrap();
        for ch in 0..inputs.num_channels() {
            frames.push(inputs.channel(ch).to_vec());
        }
        let _ = num_frames;
    }
}

struct CountingCallback {
    count: AtomicUsize,
}

impl IOCallback for CountingCallback {
    fn audio_device_io_callback(
        &self,
        _inputs: &AudioBufferView,
        outputs: &mut AudioBufferViewMut,
        _num_frames: usize,
    ) {
        self.count.fetch_add(1, Ordering::SeqCst);
        for ch in 0..outputs.num_channels() {
            outputs.channel_mut(ch).iter_mut().for_each(|s| *s = 0.0);
        }
    }
}

/// S1: 2 in / 2 out, interleaved, `bufferSize=64`. A pass-through client
/// copies inputs straight to outputs; verify the expected de/re-interleave.
#[test]
fn s1_single_duplex_device_passes_audio_through() {
    let hal = Arc::new(MockHal::new());
    let mut device = MockDevice::new("Duplex", 2, 2);
    device.buffer_size = 64;
    device.buffer_size_range = ValueRange { min: 32, max: 4096 };
    hal.add_device(DeviceId(1), device);

    let registry = DeviceType::new(hal.clone());
    let duplex = registry
        .create_device(Some("Duplex"), Some("Duplex"))
        .expect("single device resolves for both names");
    duplex.open(None, None, None, Some(64)).unwrap();
    assert_eq!(duplex.num_input_channels(), 2);
    assert_eq!(duplex.num_output_channels(), 2);

    duplex.start(Arc::new(PassThrough)).unwrap();

    let frames = 64usize;
    let mut interleaved_in = vec![0.0f32; 2 * frames];
    for k in 0..frames {
        interleaved_in[2 * k] = k as f32;
        interleaved_in[2 * k + 1] = 1000.0 + k as f32;
    }
    let mut outputs = vec![vec![0.0f32; 2 * frames]];
    hal.run_io_cycle(DeviceId(1), &[interleaved_in], &[2], &mut outputs, &[2], frames);

    for k in 0..frames {
        assert_eq!(outputs[0][2 * k], k as f32);
        assert_eq!(outputs[0][2 * k + 1], 1000.0 + k as f32);
    }
}

/// S2: active input mask selects only physical channel 1. Logical channel 0
/// must read from physical channel 1, not 0 — demonstrated here by feeding
/// distinguishable data on each physical channel and checking which one the
/// client actually receives. `device_core`'s unit tests cover the routing
/// table itself (`sourceChannelNum == 1`) directly.
#[test]
fn s2_active_channel_mask_selects_physical_channel_one() {
    let hal = Arc::new(MockHal::new());
    hal.add_device(DeviceId(1), MockDevice::new("Input Only", 2, 0));

    let registry = DeviceType::new(hal.clone());
    let device = registry
        .create_device(Some("Input Only"), None)
        .expect("input-only device resolves");
    device.open(Some(ChannelMask(0b10)), None, None, Some(32)).unwrap();
    assert_eq!(device.num_input_channels(), 1);

    let capture = Arc::new(Capture::new());
    device.start(capture.clone()).unwrap();

    let frames = 32usize;
    let mut interleaved_in = vec![0.0f32; 2 * frames];
    for k in 0..frames {
        interleaved_in[2 * k] = -1.0; // physical channel 0, must be ignored
        interleaved_in[2 * k + 1] = k as f32; // physical channel 1, must be seen
    }
    hal.run_io_cycle(DeviceId(1), &[interleaved_in], &[2], &mut [], &[], frames);

    let captured = capture.frames.lock().unwrap();
    assert_eq!(captured.len(), 1);
    let expected: Vec<f32> = (0..frames).map(|k| k as f32).collect();
    assert_eq!(captured[0], expected);
}

/// S3: input device A, output device B. `createDevice` builds a facade whose
/// channel names come from A (input) and B (output); a callback driven by
/// B's I/O proc reads A's last-captured input.
#[test]
fn s3_aggregated_master_slave_reads_slave_input_through_master_callback() {
    let hal = Arc::new(MockHal::new());
    hal.add_device(DeviceId(1), MockDevice::new("Mic A", 2, 0));
    hal.add_device(DeviceId(2), MockDevice::new("Speaker B", 0, 2));

    let registry = DeviceType::new(hal.clone());
    let facade = registry
        .create_device(Some("Mic A"), Some("Speaker B"))
        .expect("different devices aggregate into a master/slave facade");
    facade.open(None, None, None, Some(32)).unwrap();

    assert_eq!(facade.input_channel_names(), vec!["Input 1", "Input 2"]);
    assert_eq!(facade.output_channel_names(), vec!["Output 1", "Output 2"]);
    assert_eq!(facade.num_input_channels(), 2);
    assert_eq!(facade.num_output_channels(), 2);

    facade.start(Arc::new(PassThrough)).unwrap();

    let frames = 32usize;
    let mut mic_in = vec![0.0f32; 2 * frames];
    for k in 0..frames {
        mic_in[2 * k] = k as f32;
        mic_in[2 * k + 1] = 100.0 + k as f32;
    }
    // The slave (A) is driven by its own I/O proc first, as the OS would.
    hal.run_io_cycle(DeviceId(1), &[mic_in], &[2], &mut [], &[], frames);

    // The master (B) is driven next; its buffer sizes must agree with A's.
    let mut speaker_out = vec![vec![0.0f32; 2 * frames]];
    hal.run_io_cycle(DeviceId(2), &[], &[], &mut speaker_out, &[2], frames);

    for k in 0..frames {
        assert_eq!(speaker_out[0][2 * k], k as f32);
        assert_eq!(speaker_out[0][2 * k + 1], 100.0 + k as f32);
    }
}

/// S4: reconfigure to a supported rate/buffer size succeeds, even when the
/// OS doesn't report the new values back immediately — the mock delays
/// convergence by a few polls, exercising the same `refreshFromOS` retry
/// loop a real device's settling time would.
#[test]
fn s4_reconfigure_to_a_supported_rate_and_size_succeeds() {
    let hal = Arc::new(MockHal::new());
    let mut mock = MockDevice::new("Interface", 2, 2);
    mock.sample_rate = 44_100.0;
    mock.buffer_size = 512;
    mock.convergence_delay_polls = 3;
    hal.add_device(DeviceId(1), mock);

    let registry = DeviceType::new(hal);
    let device = registry
        .create_device(Some("Interface"), Some("Interface"))
        .unwrap();
    device.open(None, None, Some(44_100.0), Some(512)).unwrap();
    assert_eq!(device.current_sample_rate(), 44_100.0);
    assert_eq!(device.current_buffer_size(), 512);

    device.reconfigure(None, None, Some(48_000.0), Some(256)).unwrap();
    assert_eq!(device.current_sample_rate(), 48_000.0);
    assert_eq!(device.current_buffer_size(), 256);
}

/// S5: reconfigure to a rate the device can never converge on fails with the
/// exact error message callers match against, and the facade stays usable
/// afterwards (still queryable, still reports its last-good configuration).
#[test]
fn s5_reconfigure_failure_leaves_the_facade_usable() {
    let hal = Arc::new(MockHal::new());
    let mut mock = MockDevice::new("Interface", 2, 2);
    mock.sample_rate = 1_500.0;
    mock.available_sample_rates = vec![ValueRange {
        min: 1_000.0,
        max: 2_000.0,
    }];
    hal.add_device(DeviceId(1), mock);

    let registry = DeviceType::new(hal);
    let device = registry
        .create_device(Some("Interface"), Some("Interface"))
        .unwrap();
    device.open(None, None, None, None).unwrap();
    assert_eq!(device.current_sample_rate(), 1_500.0);

    let err = device
        .reconfigure(None, None, Some(48_000.0), None)
        .unwrap_err();
    assert_eq!(err.to_string(), "Couldn't change sample rate/buffer size");

    // The facade must still be fully usable: queries work, and a later
    // start/stop cycle against the untouched configuration still runs.
    assert_eq!(device.current_sample_rate(), 1_500.0);
    let counting = Arc::new(CountingCallback {
        count: AtomicUsize::new(0),
    });
    device.start(counting.clone()).unwrap();
    device.stop().unwrap();
}

/// S6: a hot-unplug fires one debounced refresh; since the last-known
/// configuration is still valid, the facade keeps reporting it rather than
/// tearing anything down, and the active-input mask survives.
#[test]
fn s6_hot_unplug_is_debounced_and_preserves_the_active_mask() {
    let hal = Arc::new(MockHal::new());
    hal.add_device(DeviceId(1), MockDevice::new("USB Interface", 2, 2));

    let registry = DeviceType::new(hal.clone());
    let device = registry
        .create_device(Some("USB Interface"), Some("USB Interface"))
        .unwrap();
    device.open(Some(ChannelMask(0b01)), None, None, None).unwrap();
    assert_eq!(device.active_input_channels().0, 0b01);

    device.start(Arc::new(PassThrough)).unwrap();
    assert!(device.is_alive());

    hal.simulate_unplug(DeviceId(1));
    // The debounce worker fires asynchronously; give it a moment to run the
    // single refresh it arms.
    std::thread::sleep(std::time::Duration::from_millis(250));

    assert!(!device.is_alive());
    assert_eq!(device.active_input_channels().0, 0b01);
    assert_eq!(device.num_input_channels(), 1);

    device.stop().unwrap();
}
