// rust/cir-core/src/fault.rs

//! Deterministic fault injection.
//!
//! A [`FaultInjector`] is consulted once per iteration, after the compute step
//! and before the checkpoint gate. When it fires, the worker loop stops with
//! [`RuntimeError::InjectedFault`](crate::RuntimeError::InjectedFault) without
//! touching its state, the barrier or the group again. The launcher turns that
//! error into an abrupt non-zero process exit, which is what peers observe.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::FaultConfig;
use crate::error::{Result, RuntimeError};

/// Decides whether a rank crashes at a given iteration.
///
/// Implementations must be pure: the same `(iteration, rank)` always gives
/// the same answer.
pub trait FaultInjector: Send + Sync {
    fn should_fail(&self, iteration: u32, rank: u32) -> bool;
}

/// A single `(iteration, rank)` crash point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultTrigger {
    pub iteration: u32,
    pub rank: u32,
}

impl FaultTrigger {
    pub fn new(iteration: u32, rank: u32) -> Self {
        Self { iteration, rank }
    }

    /// Parses a comma separated list such as `"15:0,40:2"`.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for FaultTrigger {
    type Err = RuntimeError;

    /// Parses `ITERATION:RANK`.
    fn from_str(s: &str) -> Result<Self> {
        let (iteration, rank) = s.split_once(':').ok_or_else(|| {
            RuntimeError::config(format!("fault trigger '{s}' must be ITERATION:RANK"))
        })?;

        let iteration = iteration.trim().parse().map_err(|e| {
            RuntimeError::config_with_source(format!("invalid fault iteration in '{s}'"), e)
        })?;
        let rank = rank.trim().parse().map_err(|e| {
            RuntimeError::config_with_source(format!("invalid fault rank in '{s}'"), e)
        })?;

        Ok(Self { iteration, rank })
    }
}

impl fmt::Display for FaultTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.iteration, self.rank)
    }
}

/// Fault injector backed by a fixed list of triggers.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    triggers: Vec<FaultTrigger>,
}

impl FaultPlan {
    pub fn new(triggers: Vec<FaultTrigger>) -> Self {
        Self { triggers }
    }

    /// A plan that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// Crash `rank` at `iteration` and nowhere else.
    pub fn single(iteration: u32, rank: u32) -> Self {
        Self::new(vec![FaultTrigger::new(iteration, rank)])
    }

    pub fn from_config(config: &FaultConfig) -> Self {
        Self::new(config.triggers.clone())
    }

    pub fn triggers(&self) -> &[FaultTrigger] {
        &self.triggers
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

impl FaultInjector for FaultPlan {
    fn should_fail(&self, iteration: u32, rank: u32) -> bool {
        self.triggers
            .iter()
            .any(|t| t.iteration == iteration && t.rank == rank)
    }
}
