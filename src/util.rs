use candle_core::Device;
use rand::{rngs::StdRng, SeedableRng};

/// Seed for every dataset permutation. Fixed so that all client processes
/// agree on the partition map without talking to each other.
pub const PARTITION_SEED: u64 = 2023;

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn best_device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}
