//! Backend glue shared across the crate

use candle_core::Device as CandleDevice;
use facenet_types::{Device, FacenetError, Result};
use tracing::debug;

/// Wrap a candle error into a model error with some context.
pub(crate) fn candle_err(context: &'static str) -> impl Fn(candle_core::Error) -> FacenetError {
    move |e| FacenetError::model(format!("{}: {}", context, e))
}

/// Resolve a configured device into a candle device.
pub fn to_candle_device(device: Device) -> Result<CandleDevice> {
    let resolved = match device {
        Device::Cpu => CandleDevice::Cpu,
        Device::Cuda(idx) => CandleDevice::new_cuda(idx)
            .map_err(|e| FacenetError::device(format!("CUDA device {} unavailable: {}", idx, e)))?,
        Device::Metal(idx) => CandleDevice::new_metal(idx)
            .map_err(|e| FacenetError::device(format!("Metal device {} unavailable: {}", idx, e)))?,
    };
    debug!("Using device {}", device);
    Ok(resolved)
}
