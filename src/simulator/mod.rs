mod rng;

pub use rng::DeterministicRng;
