// rust/cir-core/src/kernel.rs

//! Numeric kernels applied once per iteration.

/// One deterministic update of a rank's vector.
///
/// The result must depend only on the previous vector contents, so that
/// replaying iterations from a checkpoint reproduces an uninterrupted run.
pub trait Kernel: Send + Sync {
    /// Applies the update for `iteration` and returns the vector sum.
    fn step(&self, iteration: u32, vector: &mut [f64]) -> f64;
}

/// Adds a fixed increment to every element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IncrementKernel {
    increment: f64,
}

impl IncrementKernel {
    pub fn new(increment: f64) -> Self {
        Self { increment }
    }

    pub fn increment(&self) -> f64 {
        self.increment
    }
}

impl Default for IncrementKernel {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl Kernel for IncrementKernel {
    fn step(&self, _iteration: u32, vector: &mut [f64]) -> f64 {
        let mut sum = 0.0;
        for value in vector.iter_mut() {
            *value += self.increment;
            sum += *value;
        }
        sum
    }
}
