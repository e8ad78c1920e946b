//! Real CoreAudio implementation of `Hal`, built directly on
//! `coreaudio::sys` the way `device/enumerate.rs` and `audio.rs` read
//! device properties in the teacher app. The I/O proc and property listener
//! registration/trampolines follow the leak-an-Arc-as-client-data pattern
//! used by `maolan-maolan`'s `hw/coreaudio/ioproc.rs` for the same
//! `AudioDeviceCreateIOProcID`/`AudioObjectAddPropertyListener` APIs.

#![cfg(target_os = "macos")]

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::Arc;

use coreaudio::sys::*;
use core_foundation::base::TCFType;
use core_foundation::string::CFString;

use crate::callback::{RawStream, RawStreamMut};
use crate::error::{DeviceError, DeviceResult};
use crate::hal::{
    AudioCallbackSink, Hal, IoProcToken, IoProcTokenInner, ListenerToken, ListenerTokenInner,
    PropertyChangeSink, ValueRange, WatchedProperty,
};
use crate::state::DeviceId;

pub struct CoreAudioHal;

impl CoreAudioHal {
    pub fn new() -> Self {
        CoreAudioHal
    }
}

impl Default for CoreAudioHal {
    fn default() -> Self {
        Self::new()
    }
}

fn scope_for(input: bool) -> u32 {
    if input {
        kAudioObjectPropertyScopeInput
    } else {
        kAudioObjectPropertyScopeOutput
    }
}

fn address(selector: u32, scope: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: scope,
        mElement: kAudioObjectPropertyElementMain,
    }
}

fn ca_error(context: &str, status: OSStatus) -> DeviceError {
    DeviceError::OpenFailure(format!("{} failed with status {}", context, status))
}

/// Reads a variable-length property into a freshly sized buffer, following
/// the get-size-then-get-data two-step every CoreAudio property read needs.
unsafe fn read_property_raw(
    object_id: AudioObjectID,
    addr: &AudioObjectPropertyAddress,
) -> Result<Vec<u8>, OSStatus> {
    let mut size: u32 = 0;
    let status = AudioObjectGetPropertyDataSize(object_id, addr, 0, ptr::null(), &mut size);
    if status != 0 {
        return Err(status);
    }
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; size as usize];
    let status = AudioObjectGetPropertyData(
        object_id,
        addr,
        0,
        ptr::null(),
        &mut size,
        buf.as_mut_ptr() as *mut c_void,
    );
    if status != 0 {
        return Err(status);
    }
    buf.truncate(size as usize);
    Ok(buf)
}

unsafe fn read_property<T: Copy>(
    object_id: AudioObjectID,
    addr: &AudioObjectPropertyAddress,
) -> Option<T> {
    let bytes = read_property_raw(object_id, addr).ok()?;
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    Some(ptr::read_unaligned(bytes.as_ptr() as *const T))
}

unsafe fn read_property_array<T: Copy>(
    object_id: AudioObjectID,
    addr: &AudioObjectPropertyAddress,
) -> Vec<T> {
    let bytes = match read_property_raw(object_id, addr) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };
    let count = bytes.len() / mem::size_of::<T>();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(ptr::read_unaligned(
            (bytes.as_ptr() as *const T).add(i),
        ));
    }
    out
}

fn device_name(id: DeviceId) -> DeviceResult<String> {
    let addr = address(kAudioObjectPropertyName, kAudioObjectPropertyScopeGlobal);
    unsafe {
        let cf: Option<CFStringRef> = read_property(id.0, &addr);
        match cf {
            Some(r) if !r.is_null() => {
                let s = CFString::wrap_under_create_rule(r);
                Ok(s.to_string())
            }
            _ => Err(DeviceError::OpenFailure(format!(
                "no name for device {}",
                id
            ))),
        }
    }
}

fn device_uid(id: DeviceId) -> DeviceResult<String> {
    let addr = address(kAudioDevicePropertyDeviceUID, kAudioObjectPropertyScopeGlobal);
    unsafe {
        let cf: Option<CFStringRef> = read_property(id.0, &addr);
        match cf {
            Some(r) if !r.is_null() => {
                let s = CFString::wrap_under_create_rule(r);
                Ok(s.to_string())
            }
            _ => Err(DeviceError::OpenFailure(format!(
                "no UID for device {}",
                id
            ))),
        }
    }
}

impl Hal for CoreAudioHal {
    fn all_device_ids(&self) -> DeviceResult<Vec<DeviceId>> {
        let addr = address(
            kAudioHardwarePropertyDevices,
            kAudioObjectPropertyScopeGlobal,
        );
        let ids: Vec<AudioObjectID> =
            unsafe { read_property_array(kAudioObjectSystemObject, &addr) };
        Ok(ids.into_iter().map(DeviceId).collect())
    }

    fn default_device(&self, input: bool) -> Option<DeviceId> {
        let selector = if input {
            kAudioHardwarePropertyDefaultInputDevice
        } else {
            kAudioHardwarePropertyDefaultOutputDevice
        };
        let addr = address(selector, kAudioObjectPropertyScopeGlobal);
        let id: Option<AudioObjectID> =
            unsafe { read_property(kAudioObjectSystemObject, &addr) };
        id.filter(|&i| i != kAudioObjectUnknown).map(DeviceId)
    }

    fn device_name(&self, id: DeviceId) -> DeviceResult<String> {
        device_name(id)
    }

    fn device_uid(&self, id: DeviceId) -> DeviceResult<String> {
        device_uid(id)
    }

    fn is_aggregate(&self, id: DeviceId) -> bool {
        let addr = address(kAudioObjectPropertyClass, kAudioObjectPropertyScopeGlobal);
        let class: Option<u32> = unsafe { read_property(id.0, &addr) };
        class == Some(kAudioAggregateDeviceClassID)
    }

    fn related_devices(&self, id: DeviceId) -> Vec<DeviceId> {
        let addr = address(
            kAudioAggregateDevicePropertyFullSubDeviceList,
            kAudioObjectPropertyScopeGlobal,
        );
        let cf_array: Option<core_foundation::array::CFArrayRef> =
            unsafe { read_property(id.0, &addr) };
        let Some(array_ref) = cf_array.filter(|r| !r.is_null()) else {
            return Vec::new();
        };
        let array: core_foundation::array::CFArray<core_foundation::string::CFString> =
            unsafe { core_foundation::array::CFArray::wrap_under_create_rule(array_ref) };
        array
            .iter()
            .filter_map(|uid| {
                let uid_string = uid.to_string();
                self.all_device_ids()
                    .ok()
                    .into_iter()
                    .flatten()
                    .find(|candidate| device_uid(*candidate).ok().as_deref() == Some(uid_string.as_str()))
            })
            .collect()
    }

    fn stream_channel_counts(&self, id: DeviceId, input: bool) -> Vec<u32> {
        let addr = address(
            kAudioDevicePropertyStreamConfiguration,
            scope_for(input),
        );
        let bytes = match unsafe { read_property_raw(id.0, &addr) } {
            Ok(b) => b,
            Err(_) => return Vec::new(),
        };
        if bytes.is_empty() {
            return Vec::new();
        }
        unsafe {
            let abl = bytes.as_ptr() as *const AudioBufferList;
            let num_buffers = (*abl).mNumberBuffers as usize;
            let first = (*abl).mBuffers.as_ptr();
            (0..num_buffers)
                .map(|i| (*first.add(i)).mNumberChannels)
                .collect()
        }
    }

    fn nominal_sample_rate(&self, id: DeviceId) -> Option<f64> {
        let addr = address(
            kAudioDevicePropertyNominalSampleRate,
            kAudioObjectPropertyScopeGlobal,
        );
        unsafe { read_property(id.0, &addr) }
    }

    fn set_nominal_sample_rate(&self, id: DeviceId, rate: f64) -> DeviceResult<()> {
        let addr = address(
            kAudioDevicePropertyNominalSampleRate,
            kAudioObjectPropertyScopeGlobal,
        );
        let status = unsafe {
            AudioObjectSetPropertyData(
                id.0,
                &addr,
                0,
                ptr::null(),
                mem::size_of::<f64>() as u32,
                &rate as *const f64 as *const c_void,
            )
        };
        if status != 0 {
            return Err(ca_error("AudioObjectSetPropertyData(sample rate)", status));
        }
        match self.nominal_sample_rate(id) {
            Some(actual) if (actual - rate).abs() < 0.5 => Ok(()),
            _ => Err(DeviceError::ReconfigureFailure),
        }
    }

    fn available_sample_rates(&self, id: DeviceId) -> Vec<ValueRange<f64>> {
        let addr = address(
            kAudioDevicePropertyAvailableNominalSampleRates,
            kAudioObjectPropertyScopeGlobal,
        );
        unsafe { read_property_array::<AudioValueRange>(id.0, &addr) }
            .into_iter()
            .map(|r| ValueRange {
                min: r.mMinimum,
                max: r.mMaximum,
            })
            .collect()
    }

    fn buffer_frame_size(&self, id: DeviceId) -> Option<u32> {
        let addr = address(
            kAudioDevicePropertyBufferFrameSize,
            kAudioObjectPropertyScopeGlobal,
        );
        unsafe { read_property(id.0, &addr) }
    }

    fn set_buffer_frame_size(&self, id: DeviceId, frames: u32) -> DeviceResult<()> {
        let addr = address(
            kAudioDevicePropertyBufferFrameSize,
            kAudioObjectPropertyScopeGlobal,
        );
        let status = unsafe {
            AudioObjectSetPropertyData(
                id.0,
                &addr,
                0,
                ptr::null(),
                mem::size_of::<u32>() as u32,
                &frames as *const u32 as *const c_void,
            )
        };
        if status != 0 {
            return Err(ca_error("AudioObjectSetPropertyData(buffer size)", status));
        }
        match self.buffer_frame_size(id) {
            Some(actual) if actual == frames => Ok(()),
            _ => Err(DeviceError::ReconfigureFailure),
        }
    }

    fn buffer_frame_size_range(&self, id: DeviceId) -> Option<ValueRange<u32>> {
        let addr = address(
            kAudioDevicePropertyBufferFrameSizeRange,
            kAudioObjectPropertyScopeGlobal,
        );
        let range: Option<AudioValueRange> = unsafe { read_property(id.0, &addr) };
        range.map(|r| ValueRange {
            min: r.mMinimum as u32,
            max: r.mMaximum as u32,
        })
    }

    fn latency_frames(&self, id: DeviceId, input: bool) -> u32 {
        let addr = address(kAudioDevicePropertyLatency, scope_for(input));
        unsafe { read_property(id.0, &addr) }.unwrap_or(0)
    }

    fn is_running(&self, id: DeviceId) -> bool {
        let addr = address(
            kAudioDevicePropertyDeviceIsRunning,
            kAudioObjectPropertyScopeGlobal,
        );
        unsafe { read_property::<u32>(id.0, &addr) }.unwrap_or(0) != 0
    }

    fn is_alive(&self, id: DeviceId) -> bool {
        let addr = address(
            kAudioDevicePropertyDeviceIsAlive,
            kAudioObjectPropertyScopeGlobal,
        );
        unsafe { read_property::<u32>(id.0, &addr) }.unwrap_or(0) != 0
    }

    fn data_source_names(&self, id: DeviceId, input: bool) -> Vec<String> {
        let list_addr = address(kAudioDevicePropertyDataSources, scope_for(input));
        let ids: Vec<u32> = unsafe { read_property_array(id.0, &list_addr) };
        ids.into_iter()
            .filter_map(|source_id| {
                let mut translation = AudioValueTranslation {
                    mInputData: &source_id as *const u32 as *mut c_void,
                    mInputDataSize: mem::size_of::<u32>() as u32,
                    mOutputData: ptr::null_mut(),
                    mOutputDataSize: mem::size_of::<CFStringRef>() as u32,
                };
                let mut cf_name: CFStringRef = ptr::null_mut();
                translation.mOutputData = &mut cf_name as *mut CFStringRef as *mut c_void;
                let addr = address(
                    kAudioDevicePropertyDataSourceNameForIDCFString,
                    scope_for(input),
                );
                let mut size = mem::size_of::<AudioValueTranslation>() as u32;
                let status = unsafe {
                    AudioObjectGetPropertyData(
                        id.0,
                        &addr,
                        0,
                        ptr::null(),
                        &mut size,
                        &mut translation as *mut AudioValueTranslation as *mut c_void,
                    )
                };
                if status == 0 && !cf_name.is_null() {
                    Some(unsafe { CFString::wrap_under_create_rule(cf_name) }.to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    fn current_data_source_index(&self, id: DeviceId, input: bool) -> Option<usize> {
        let current_addr = address(kAudioDevicePropertyDataSource, scope_for(input));
        let current: u32 = unsafe { read_property(id.0, &current_addr) }?;
        let list_addr = address(kAudioDevicePropertyDataSources, scope_for(input));
        let ids: Vec<u32> = unsafe { read_property_array(id.0, &list_addr) };
        ids.iter().position(|&id| id == current)
    }

    fn set_current_data_source_index(
        &self,
        id: DeviceId,
        input: bool,
        index: usize,
    ) -> DeviceResult<()> {
        let list_addr = address(kAudioDevicePropertyDataSources, scope_for(input));
        let ids: Vec<u32> = unsafe { read_property_array(id.0, &list_addr) };
        let source_id = *ids
            .get(index)
            .ok_or_else(|| DeviceError::OpenFailure("data source index out of range".into()))?;
        let addr = address(kAudioDevicePropertyDataSource, scope_for(input));
        let status = unsafe {
            AudioObjectSetPropertyData(
                id.0,
                &addr,
                0,
                ptr::null(),
                mem::size_of::<u32>() as u32,
                &source_id as *const u32 as *const c_void,
            )
        };
        if status == 0 {
            Ok(())
        } else {
            Err(ca_error("AudioObjectSetPropertyData(data source)", status))
        }
    }

    fn add_io_proc(
        &self,
        id: DeviceId,
        sink: Arc<dyn AudioCallbackSink>,
    ) -> DeviceResult<IoProcToken> {
        let boxed: Box<Arc<dyn AudioCallbackSink>> = Box::new(sink);
        let client_data = Box::into_raw(boxed) as *mut c_void;
        let mut proc_id: AudioDeviceIOProcID = None;
        let status = unsafe {
            AudioDeviceCreateIOProcID(id.0, Some(io_proc_trampoline), client_data, &mut proc_id)
        };
        if status != 0 || proc_id.is_none() {
            unsafe {
                drop(Box::from_raw(client_data as *mut Arc<dyn AudioCallbackSink>));
            }
            return Err(ca_error("AudioDeviceCreateIOProcID", status));
        }
        Ok(IoProcToken(IoProcTokenInner::CoreAudio {
            proc_id,
            client_data,
        }))
    }

    fn remove_io_proc(&self, id: DeviceId, token: IoProcToken) {
        if let IoProcTokenInner::CoreAudio {
            proc_id,
            client_data,
        } = token.0
        {
            unsafe {
                AudioDeviceStop(id.0, proc_id);
                AudioDeviceDestroyIOProcID(id.0, proc_id);
                drop(Box::from_raw(client_data as *mut Arc<dyn AudioCallbackSink>));
            }
        }
    }

    fn start_device(&self, id: DeviceId, token: &IoProcToken) -> DeviceResult<()> {
        if let IoProcTokenInner::CoreAudio { proc_id, .. } = token.0 {
            let status = unsafe { AudioDeviceStart(id.0, proc_id) };
            if status == 0 {
                Ok(())
            } else {
                Err(DeviceError::StartFailure(format!(
                    "AudioDeviceStart failed with status {}",
                    status
                )))
            }
        } else {
            Ok(())
        }
    }

    fn stop_device(&self, id: DeviceId, token: &IoProcToken) -> DeviceResult<()> {
        if let IoProcTokenInner::CoreAudio { proc_id, .. } = token.0 {
            let status = unsafe { AudioDeviceStop(id.0, proc_id) };
            if status == 0 {
                Ok(())
            } else {
                Err(ca_error("AudioDeviceStop", status))
            }
        } else {
            Ok(())
        }
    }

    fn add_property_listener(
        &self,
        id: DeviceId,
        selectors: &[WatchedProperty],
        sink: Arc<dyn PropertyChangeSink>,
    ) -> DeviceResult<ListenerToken> {
        let raw_selectors: Vec<u32> = selectors.iter().map(|s| selector_for(*s)).collect();
        let boxed: Box<Arc<dyn PropertyChangeSink>> = Box::new(sink);
        let client_data = Box::into_raw(boxed) as *mut c_void;
        for selector in &raw_selectors {
            let addr = address(*selector, kAudioObjectPropertyScopeGlobal);
            let status = unsafe {
                AudioObjectAddPropertyListener(
                    id.0,
                    &addr,
                    Some(property_listener_trampoline),
                    client_data,
                )
            };
            if status != 0 {
                for done in raw_selectors.iter().take_while(|&&s| s != *selector) {
                    let addr = address(*done, kAudioObjectPropertyScopeGlobal);
                    unsafe {
                        AudioObjectRemovePropertyListener(
                            id.0,
                            &addr,
                            Some(property_listener_trampoline),
                            client_data,
                        );
                    }
                }
                unsafe {
                    drop(Box::from_raw(
                        client_data as *mut Arc<dyn PropertyChangeSink>,
                    ));
                }
                return Err(ca_error("AudioObjectAddPropertyListener", status));
            }
        }
        Ok(ListenerToken(ListenerTokenInner::CoreAudio {
            selectors: raw_selectors,
            client_data,
        }))
    }

    fn remove_property_listener(&self, id: DeviceId, token: ListenerToken) {
        if let ListenerTokenInner::CoreAudio {
            selectors,
            client_data,
        } = token.0
        {
            for selector in &selectors {
                let addr = address(*selector, kAudioObjectPropertyScopeGlobal);
                unsafe {
                    AudioObjectRemovePropertyListener(
                        id.0,
                        &addr,
                        Some(property_listener_trampoline),
                        client_data,
                    );
                }
            }
            unsafe {
                drop(Box::from_raw(
                    client_data as *mut Arc<dyn PropertyChangeSink>,
                ));
            }
        }
    }
}

fn selector_for(property: WatchedProperty) -> u32 {
    match property {
        WatchedProperty::DeviceIsAlive => kAudioDevicePropertyDeviceIsAlive,
        WatchedProperty::NominalSampleRate => kAudioDevicePropertyNominalSampleRate,
        WatchedProperty::BufferFrameSize => kAudioDevicePropertyBufferFrameSize,
        WatchedProperty::StreamConfiguration => kAudioDevicePropertyStreamConfiguration,
        WatchedProperty::DataSource => kAudioDevicePropertyDataSource,
        WatchedProperty::DeviceList => kAudioHardwarePropertyDevices,
        WatchedProperty::DefaultInputDevice => kAudioHardwarePropertyDefaultInputDevice,
        WatchedProperty::DefaultOutputDevice => kAudioHardwarePropertyDefaultOutputDevice,
    }
}

/// Builds `RawStream` views over an `AudioBufferList`'s buffers without
/// copying, then hands them to the sink. No allocation on this path.
unsafe fn with_raw_streams<R>(
    abl: *const AudioBufferList,
    f: impl FnOnce(&[RawStream]) -> R,
) -> R {
    let num_buffers = (*abl).mNumberBuffers as usize;
    let mut streams: Vec<RawStream> = Vec::with_capacity(num_buffers);
    let first = (*abl).mBuffers.as_ptr();
    for i in 0..num_buffers {
        let buf = &*first.add(i);
        let num_channels = buf.mNumberChannels as usize;
        let num_samples = (buf.mDataByteSize as usize) / mem::size_of::<f32>();
        let samples = std::slice::from_raw_parts(buf.mData as *const f32, num_samples);
        streams.push(RawStream {
            samples,
            num_channels,
        });
    }
    f(&streams)
}

unsafe fn with_raw_streams_mut<R>(
    abl: *mut AudioBufferList,
    f: impl FnOnce(&mut [RawStreamMut]) -> R,
) -> R {
    let num_buffers = (*abl).mNumberBuffers as usize;
    let mut streams: Vec<RawStreamMut> = Vec::with_capacity(num_buffers);
    let first = (*abl).mBuffers.as_mut_ptr();
    for i in 0..num_buffers {
        let buf = &mut *first.add(i);
        let num_channels = buf.mNumberChannels as usize;
        let num_samples = (buf.mDataByteSize as usize) / mem::size_of::<f32>();
        let samples = std::slice::from_raw_parts_mut(buf.mData as *mut f32, num_samples);
        streams.push(RawStreamMut {
            samples,
            num_channels,
        });
    }
    f(&mut streams)
}

unsafe extern "C" fn io_proc_trampoline(
    _device_id: AudioObjectID,
    _now: *const AudioTimeStamp,
    in_data: *const AudioBufferList,
    _in_time: *const AudioTimeStamp,
    out_data: *mut AudioBufferList,
    _out_time: *const AudioTimeStamp,
    client_data: *mut c_void,
) -> OSStatus {
    let sink = &*(client_data as *const Arc<dyn AudioCallbackSink>);
    let num_frames = if !out_data.is_null() && (*out_data).mNumberBuffers > 0 {
        let buf = &(*out_data).mBuffers[0];
        let channels = buf.mNumberChannels.max(1) as usize;
        (buf.mDataByteSize as usize) / mem::size_of::<f32>() / channels
    } else {
        0
    };
    with_raw_streams(in_data, |inputs| {
        with_raw_streams_mut(out_data, |outputs| {
            sink.render(inputs, outputs, num_frames);
        })
    });
    0
}

unsafe extern "C" fn property_listener_trampoline(
    _object_id: AudioObjectID,
    _num_addresses: u32,
    _addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus {
    let sink = &*(client_data as *const Arc<dyn PropertyChangeSink>);
    sink.device_details_changed();
    0
}

#[allow(non_upper_case_globals)]
const kAudioObjectUnknown: AudioObjectID = 0;

type CFStringRef = core_foundation::string::CFStringRef;
