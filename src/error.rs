//! Error kinds surfaced to control-thread callers as plain strings.
//!
//! The audio callback itself never produces one of these: OS status failures
//! encountered inside `audioCallback` are logged and the callback proceeds
//! (see `hal::CoreAudioHal`), matching the "never exceptions, never abort the
//! stream" rule.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// `open`/`reopen` could not bring the device into a running state.
    OpenFailure(String),
    /// A sample-rate or buffer-size change was requested but rejected or not
    /// reflected back by the OS after the set call.
    ReconfigureFailure,
    /// `AudioObjectGetPropertyData` for available sample rates returned an
    /// empty list.
    NoRatesAvailable,
    /// `AudioObjectGetPropertyData` for the buffer frame size range returned
    /// an empty list.
    NoBufferSizesAvailable,
    /// A master device's slave failed to open or reconfigure alongside it.
    SlaveFailure(String),
    /// `AudioDeviceStart` failed after the I/O proc was registered.
    StartFailure(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OpenFailure(detail) => write!(f, "Couldn't open device: {}", detail),
            DeviceError::ReconfigureFailure => {
                write!(f, "Couldn't change sample rate/buffer size")
            }
            DeviceError::NoRatesAvailable => write!(f, "Device has no available sample-rates"),
            DeviceError::NoBufferSizesAvailable => {
                write!(f, "Device has no available buffer-sizes")
            }
            DeviceError::SlaveFailure(detail) => write!(f, "Slave device failure: {}", detail),
            DeviceError::StartFailure(detail) => write!(f, "Couldn't start device: {}", detail),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<DeviceError> for String {
    fn from(err: DeviceError) -> String {
        err.to_string()
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_exact_wording_callers_rely_on() {
        assert_eq!(
            DeviceError::ReconfigureFailure.to_string(),
            "Couldn't change sample rate/buffer size"
        );
        assert_eq!(
            DeviceError::NoRatesAvailable.to_string(),
            "Device has no available sample-rates"
        );
        assert_eq!(
            DeviceError::NoBufferSizesAvailable.to_string(),
            "Device has no available buffer-sizes"
        );
    }
}
