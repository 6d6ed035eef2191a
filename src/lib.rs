pub mod decay;
pub mod model;
pub mod retention;
pub mod rope;
pub mod tokenizer;
pub mod training;

pub use decay::{decay_rates, DecayMask};
pub use model::{RetNet, RetNetConfig, Sampling};
pub use retention::{
    chunkwise_retention, parallel_retention, recurrent_retention, RecurrentState, Retention,
    RetentionMode,
};

use anyhow::Result;
use candle_core::Device;

/// Pick a compute device: `CANDLE_FORCE_CPU` overrides everything, otherwise
/// CUDA when available, CPU as the fallback.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}
