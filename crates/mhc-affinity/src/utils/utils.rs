use anyhow::{anyhow, Result};
use candle_core::Device;

/// Converts a device string to a Candle Device.
///
/// # Supported Device Strings
///
/// - `"cpu"`: the CPU device
/// - `"cuda"`: the default CUDA device (index 0)
/// - `"cuda:N"`: the CUDA device with index N
///
/// # Errors
///
/// Returns an error if CUDA is requested but unavailable, or the device type
/// is unknown.
pub fn get_device(device_str: &str) -> Result<Device> {
    if device_str.starts_with("cuda") {
        let cuda_index = if device_str == "cuda" {
            0
        } else {
            device_str
                .split(':')
                .nth(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow!("Malformed CUDA device string: {}", device_str))?
        };

        let device = Device::cuda_if_available(cuda_index)?;
        if !device.is_cuda() {
            return Err(anyhow!("CUDA device {} is not available", cuda_index));
        }
        Ok(device)
    } else {
        match device_str {
            "cpu" => Ok(Device::Cpu),
            _ => Err(anyhow!("Unsupported device type: {}", device_str)),
        }
    }
}
