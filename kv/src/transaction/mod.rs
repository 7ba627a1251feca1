//! Group-commit sequencing: the part of the system that decides *when* a
//! transaction's commit becomes durable and visible, built on top of
//! [`crate::replication`]'s stream and stream-entry plumbing.
//!
//! The shared state machine (group ids, state bits, the "wait for
//! watermark" condvar pattern) lives in [`group_complete`]; [`master`] and
//! [`slave`] are the two policies that drive it.

pub mod group_complete;
pub mod master;
pub mod slave;

pub use group_complete::{GroupCompletePolicy, GroupId, TxGroup, TxRecord};
