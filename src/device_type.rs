//! `DeviceType`: the small top-level registry (SPEC_FULL.md's DeviceType
//! module) that enumerates devices and resolves a pair of device names into
//! a `Device`. Everything realtime-critical lives in `DeviceCore`; this is
//! pure control-thread bookkeeping over the `Hal`.

use std::sync::Arc;

use crate::device::Device;
use crate::device_core::DeviceCore;
use crate::error::DeviceResult;
use crate::hal::Hal;
use crate::state::{DeviceDescriptor, DeviceId};

/// Suffixes every name after the first occurrence with `" (n)"`, ascending
/// from 2, so two devices sharing an OS-reported name (e.g. two identical
/// USB interfaces) resolve to distinct names (spec.md §4.1).
fn disambiguate_names(descriptors: &mut [DeviceDescriptor]) {
    let mut seen: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for d in descriptors.iter_mut() {
        let count = seen.entry(d.name.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            d.name = format!("{} ({})", d.name, count);
        }
    }
}

pub struct DeviceType {
    hal: Arc<dyn Hal>,
}

impl DeviceType {
    pub fn new(hal: Arc<dyn Hal>) -> Self {
        DeviceType { hal }
    }

    /// Enumerates every device the OS currently reports, classifying each
    /// as aggregate or plain and recording its channel counts.
    pub fn scan_for_devices(&self) -> DeviceResult<Vec<DeviceDescriptor>> {
        let ids = self.hal.all_device_ids()?;
        let mut descriptors = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(name) = self.hal.device_name(id) else {
                continue;
            };
            let num_input_channels: u32 = self
                .hal
                .stream_channel_counts(id, true)
                .iter()
                .sum();
            let num_output_channels: u32 = self
                .hal
                .stream_channel_counts(id, false)
                .iter()
                .sum();
            if num_input_channels == 0 && num_output_channels == 0 {
                continue;
            }
            descriptors.push(DeviceDescriptor {
                id,
                name,
                num_input_channels,
                num_output_channels,
                is_aggregate: self.hal.is_aggregate(id),
            });
        }
        disambiguate_names(&mut descriptors);
        println!(
            "[DeviceType] scanned {} input / {} output devices",
            descriptors.iter().filter(|d| d.num_input_channels > 0).count(),
            descriptors.iter().filter(|d| d.num_output_channels > 0).count(),
        );
        Ok(descriptors)
    }

    /// Names of devices offering at least one channel in the given
    /// direction, in `scanForDevices` order.
    pub fn get_device_names(&self, input: bool) -> Vec<String> {
        self.scan_for_devices()
            .unwrap_or_default()
            .into_iter()
            .filter(|d| {
                if input {
                    d.num_input_channels > 0
                } else {
                    d.num_output_channels > 0
                }
            })
            .map(|d| d.name)
            .collect()
    }

    /// Index into `get_device_names(input)` of the OS-reported default
    /// device, if any.
    pub fn get_default_device_index(&self, input: bool) -> Option<usize> {
        let default_id = self.hal.default_device(input)?;
        let names = self.get_device_names(input);
        let descriptors = self.scan_for_devices().ok()?;
        let default_name = descriptors.iter().find(|d| d.id == default_id)?.name.clone();
        names.iter().position(|n| *n == default_name)
    }

    /// Resolves `input_name`/`output_name` against the current device list
    /// and builds a `Device`. Each name is resolved independently — if
    /// neither resolves, `None` is returned rather than falling back to a
    /// leftover index from an earlier lookup.
    pub fn create_device(&self, input_name: Option<&str>, output_name: Option<&str>) -> Option<Device> {
        let descriptors = self.scan_for_devices().ok()?;
        let input_id = input_name.and_then(|name| {
            descriptors
                .iter()
                .find(|d| d.name == name && d.num_input_channels > 0)
                .map(|d| d.id)
        });
        let output_id = output_name.and_then(|name| {
            descriptors
                .iter()
                .find(|d| d.name == name && d.num_output_channels > 0)
                .map(|d| d.id)
        });

        match (input_id, output_id) {
            (None, None) => None,
            (Some(id), None) => Some(self.build_single(id)),
            (None, Some(id)) => Some(self.build_single(id)),
            (Some(in_id), Some(out_id)) if in_id == out_id => Some(self.build_single(in_id)),
            (Some(in_id), Some(out_id)) => Some(self.build_master_slave(out_id, in_id)),
        }
    }

    fn build_single(&self, id: DeviceId) -> Device {
        let core = DeviceCore::new(self.hal.clone(), id, false);
        Device::new(core)
    }

    /// The output device drives the shared audio clock: its `DeviceCore` is
    /// the master (owns the client callback); the input device's own I/O
    /// proc keeps its `tempInputBuffers` current for the master to read,
    /// per SPEC_FULL.md's resolved slave-input-capture ordering.
    fn build_master_slave(&self, master_id: DeviceId, slave_id: DeviceId) -> Device {
        let master = DeviceCore::new(self.hal.clone(), master_id, false);
        let slave = DeviceCore::new(self.hal.clone(), slave_id, true);
        master.set_slave(Some(slave));
        Device::new(master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_hal::{MockDevice, MockHal};
    use crate::state::DeviceId;

    fn hal_with_two_devices() -> Arc<MockHal> {
        let hal = Arc::new(MockHal::new());
        hal.add_device(DeviceId(1), MockDevice::new("Built-in Microphone", 2, 0));
        hal.add_device(DeviceId(2), MockDevice::new("Built-in Output", 0, 2));
        hal
    }

    #[test]
    fn create_device_returns_none_when_neither_name_resolves() {
        let hal = hal_with_two_devices();
        let registry = DeviceType::new(hal);
        assert!(registry.create_device(Some("nonexistent in"), Some("nonexistent out")).is_none());
    }

    #[test]
    fn create_device_builds_a_master_slave_pair_for_different_devices() {
        let hal = hal_with_two_devices();
        let registry = DeviceType::new(hal);
        let device = registry
            .create_device(Some("Built-in Microphone"), Some("Built-in Output"))
            .expect("both names resolve");
        device.open(None, None, None, None).unwrap();
        assert_eq!(device.num_output_channels(), 2);
    }

    #[test]
    fn scan_lists_both_devices() {
        let hal = hal_with_two_devices();
        let registry = DeviceType::new(hal);
        let descriptors = registry.scan_for_devices().unwrap();
        assert_eq!(descriptors.len(), 2);
    }

    #[test]
    fn scan_disambiguates_duplicate_names() {
        let hal = Arc::new(MockHal::new());
        hal.add_device(DeviceId(1), MockDevice::new("USB Audio", 2, 2));
        hal.add_device(DeviceId(2), MockDevice::new("USB Audio", 2, 2));
        hal.add_device(DeviceId(3), MockDevice::new("USB Audio", 2, 2));
        let registry = DeviceType::new(hal);
        let mut names: Vec<String> = registry
            .scan_for_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["USB Audio", "USB Audio (2)", "USB Audio (3)"]);
    }
}
