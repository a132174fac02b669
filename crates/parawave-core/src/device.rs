use std::fmt;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// A typed compute-device descriptor.
///
/// Parsed once from the command line and opened once at startup; nothing
/// downstream dispatches on raw integer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl DeviceSpec {
    /// Convert a list of raw device ids into descriptors.
    ///
    /// A single negative id (the default `-1`) or an empty list selects the
    /// CPU. Negative ids mixed with GPU ids, and duplicate ids, are rejected.
    pub fn parse_ids(ids: &[i64]) -> CoreResult<Vec<DeviceSpec>> {
        match ids {
            [] => return Ok(vec![DeviceSpec::Cpu]),
            [id] if *id < 0 => return Ok(vec![DeviceSpec::Cpu]),
            _ => {}
        }

        let mut specs = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < 0 {
                return Err(CoreError::config(
                    "gpus",
                    "a negative id (CPU) cannot be combined with GPU ids",
                ));
            }
            let spec = DeviceSpec::Cuda(id as usize);
            if specs.contains(&spec) {
                return Err(CoreError::config("gpus", format!("device {id} listed twice")));
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Acquire the device. Failure is fatal: there is no silent CPU fallback
    /// once a GPU was explicitly requested.
    pub fn open(&self) -> CoreResult<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal)
                .map_err(|e| CoreError::DeviceUnavailable(format!("{self}: {e}"))),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Open every requested device, in order. The first entry is the main device
/// that owns the optimizer.
pub fn select_devices(specs: &[DeviceSpec]) -> CoreResult<Vec<Device>> {
    if specs.is_empty() {
        return Err(CoreError::config("gpus", "at least one device is required"));
    }
    let mut devices = Vec::with_capacity(specs.len());
    for spec in specs {
        let device = spec.open()?;
        info!(device = %spec, kind = device_name(&device), "Device ready");
        devices.push(device);
    }
    Ok(devices)
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}
