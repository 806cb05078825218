#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Collective operations between evaluation workers.
//!
//! Workers never talk to each other through ambient globals; every stage that
//! needs a barrier or an all-gather receives a [`Collective`] handle. Gathered
//! values are always returned in rank order.

pub mod local;
pub mod tcp;
pub mod thread;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use local::LocalCollective;
pub use tcp::TcpCollective;
pub use thread::{thread_group, ThreadCollective};

#[derive(Debug, Error)]
pub enum CommError {
    #[error("world_size must be > 0")]
    EmptyWorld,
    #[error("rank {rank} out of range for world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
    #[error("collective state lock poisoned")]
    Poisoned,
    #[error("rank {rank} contributed a value of a different type to all_gather")]
    TypeMismatch { rank: usize },
    #[error("frame of {0} bytes exceeds the wire limit")]
    FrameTooLarge(usize),
    #[error("could not reach {addr} within {waited:?}")]
    ConnectTimeout { addr: String, waited: Duration },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Anything that can travel through an all-gather.
pub trait Gatherable: Serialize + DeserializeOwned + Clone + Send + 'static {}

impl<T> Gatherable for T where T: Serialize + DeserializeOwned + Clone + Send + 'static {}

/// Barrier and all-gather across a fixed group of workers.
///
/// Every rank must call the same sequence of operations; a rank that stops
/// calling leaves its peers blocked (there is no timeout).
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    fn barrier(&self) -> Result<(), CommError>;

    /// Returns the value contributed by every rank, indexed by rank.
    fn all_gather<T: Gatherable>(&self, value: T) -> Result<Vec<T>, CommError>;
}

pub(crate) fn check_rank(rank: usize, world_size: usize) -> Result<(), CommError> {
    if world_size == 0 {
        return Err(CommError::EmptyWorld);
    }
    if rank >= world_size {
        return Err(CommError::InvalidRank { rank, world_size });
    }
    Ok(())
}
