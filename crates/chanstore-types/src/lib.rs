//! Foundation types for chanstore.
//!
//! This crate provides the identifiers and timing primitives shared by every
//! other chanstore crate. It has no knowledge of files, tasks or threads.
//!
//! # Key Types
//!
//! - [`ChannelIndex`] / [`ChannelCount`] — identity of one of the fixed worker shards
//! - [`FileNumber`] — per-channel data file sequence number
//! - [`EntityId`] — persisted object identifier
//! - [`UserId`] — identity of a logical consumer of an open file
//! - [`TaskTimestamp`] / [`TaskClock`] — strictly increasing task stamps
//! - [`Deadline`] — time budget bound for incremental work

pub mod clock;
pub mod error;
pub mod ids;

pub use clock::{Deadline, TaskClock, TaskTimestamp};
pub use error::TypeError;
pub use ids::{ChannelCount, ChannelIndex, EntityId, FileNumber, UserId};
