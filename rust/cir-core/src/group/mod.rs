// rust/cir-core/src/group/mod.rs

//! Process group membership and collective barriers.
//!
//! A [`ProcessGroup`] is the worker's view of the group runtime: it joins the
//! group to learn an authoritative rank, blocks in [`ProcessGroup::barrier`]
//! until every member has arrived, and leaves with
//! [`ProcessGroup::finalize`].
//!
//! Two implementations are provided:
//!
//! - [`LocalGroup`]: members are threads of one process
//! - [`TcpGroup`]: members are processes connected to a [`GroupServer`]

mod client;
mod local;
pub mod protocol;
mod server;

use std::time::Duration;

use crate::error::Result;

pub use client::TcpGroup;
pub use local::LocalGroup;
pub use protocol::GroupMessage;
pub use server::GroupServer;

/// Identity assigned to a member when it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Membership {
    pub rank: u32,
    pub size: u32,
}

/// How long a member waits at a barrier for its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarrierWait {
    /// Wait until every member arrives, however long that takes.
    #[default]
    Unbounded,
    /// Give up with [`RuntimeError::BarrierTimeout`](crate::RuntimeError::BarrierTimeout)
    /// after the given duration.
    Bounded(Duration),
}

impl BarrierWait {
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            BarrierWait::Unbounded => None,
            BarrierWait::Bounded(duration) => Some(*duration),
        }
    }
}

/// A worker's handle on the group runtime.
pub trait ProcessGroup: Send {
    /// Joins the group and returns the authoritative membership.
    fn initialize(&mut self) -> Result<Membership>;

    /// Membership assigned by [`initialize`](Self::initialize), if joined.
    fn membership(&self) -> Option<Membership>;

    /// Blocks until every member of the group has called `barrier` the same
    /// number of times.
    fn barrier(&mut self) -> Result<()>;

    /// Leaves the group. No further calls are valid afterwards.
    fn finalize(&mut self) -> Result<()>;
}

impl<G: ProcessGroup + ?Sized> ProcessGroup for Box<G> {
    fn initialize(&mut self) -> Result<Membership> {
        (**self).initialize()
    }

    fn membership(&self) -> Option<Membership> {
        (**self).membership()
    }

    fn barrier(&mut self) -> Result<()> {
        (**self).barrier()
    }

    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }
}
