//! I/O abstractions shared by production code and the simulation harnesses.
//!
//! Randomness is injected through [`Rng`] so fault injection and workload
//! generation replay exactly from a seed.

pub mod simulation;

pub use simulation::SimulatedRng;

/// Deterministic random source
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    /// Returns true with the given probability (clamped to `0.0..=1.0`)
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `min..max`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn shuffle<T>(&mut self, slice: &mut [T]);
}
