//! Seeded randomness. Every draw is a pure function of `(seed, stream, counter)`
//! so nothing depends on how many draws happened before it.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    TrainNoise = 1,
    EvalNoise = 2,
    Shuffle = 3,
    Crop = 4,
    EvalCrop = 5,
}

/// splitmix64 finaliser.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub fn derive_seed(seed: u64, stream: Stream, a: u64, b: u64) -> u64 {
    mix(mix(mix(seed ^ (stream as u64).rotate_left(56)) ^ a) ^ b)
}

pub fn rng(seed: u64, stream: Stream, a: u64, b: u64) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, stream, a, b))
}

/// Standard-normal noise `[batch, len]`, drawn on the host.
pub fn gaussian(seed: u64, stream: Stream, counter: u64, batch: usize, len: usize) -> Result<Tensor> {
    let mut r = rng(seed, stream, counter, 0);
    let values: Vec<f32> = (0..batch * len).map(|_| StandardNormal.sample(&mut r)).collect();
    Ok(Tensor::from_vec(values, (batch, len), &Device::Cpu)?)
}
