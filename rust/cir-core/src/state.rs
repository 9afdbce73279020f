// rust/cir-core/src/state.rs

//! Per-process working state, which is also the unit of persistence.

/// The state owned by one group member.
///
/// Exactly one `ProcessState` is live per process. It is created fresh or
/// recovered from the member's own checkpoint, mutated in place each
/// iteration, and written out at checkpoint boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessState {
    /// Next iteration to execute.
    pub iteration: u32,
    /// Working vector, identical length on every rank.
    pub vector: Vec<f64>,
    /// Rank this state belongs to. Never changes after construction.
    pub owner_rank: u32,
}

impl ProcessState {
    /// Creates the initial state for `rank`: iteration 0 and
    /// `vector[i] = rank * len + i`.
    pub fn fresh(rank: u32, len: usize) -> Self {
        let base = rank as f64 * len as f64;
        let vector = (0..len).map(|i| base + i as f64).collect();

        Self {
            iteration: 0,
            vector,
            owner_rank: rank,
        }
    }

    /// Sum of all vector elements.
    pub fn sum(&self) -> f64 {
        self.vector.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }
}
