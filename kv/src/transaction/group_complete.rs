//! Group-complete manager, common base (C6/C7): the state machine shared by
//! master and slave, parameterized by a policy trait rather than modeled as
//! a base class with virtual hooks (see `DESIGN.md`, "inheritance to
//! variants + hooks").

use std::sync::{Condvar, Mutex};

use crate::error::{CResult, Error};
use crate::replication::collaborators::MvccId;
use crate::replication::entry::TranState;

pub type GroupId = u64;

/// Group-state bits. Progression is monotone: bits are set, never cleared,
/// within a single group's lifetime.
pub mod group_state {
    pub const CLOSED: u32 = 1 << 0;
    pub const MVCC_COMPLETED: u32 = 1 << 1;
    pub const LOGGED: u32 = 1 << 2;
    pub const PREPARED_FOR_COMPLETE: u32 = 1 << 3;
    pub const COMPLETE_STARTED: u32 = 1 << 4;
    pub const COMPLETED: u32 = 1 << 5;
}

/// One transaction's membership record within a group.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TxRecord {
    pub tran_index: i32,
    pub mvccid: MvccId,
    pub tran_state: TranState,
}

pub type TxGroup = Vec<TxRecord>;

/// The policy a concrete group-complete manager (master or slave) supplies
/// to the shared state machine: when a transaction registers, and when the
/// current group is allowed to close.
pub trait GroupCompletePolicy: Send + Sync {
    fn on_register_transaction(&self, group_id: GroupId, record: &TxRecord);

    /// Master: previous group fully completed AND current group non-empty.
    /// Slave: driven by dispatcher-supplied close info rather than this
    /// hook directly, but the hook still gates `close_current_group` for
    /// symmetry with the base state machine.
    fn can_close_current_group(&self, current_group: &TxGroup) -> bool;
}

struct State {
    current_group_id: GroupId,
    current_group: TxGroup,
    latest_closed_group_id: GroupId,
    latest_closed_group: TxGroup,
    latest_closed_state: u32,
}

/// The shared group-complete state machine. Holds the current (still open)
/// group and the latest closed group, plus the bits tracking the latter's
/// progress toward `COMPLETED`.
pub struct GroupCompleteCore<P: GroupCompletePolicy> {
    state: Mutex<State>,
    cond: Condvar,
    policy: P,
}

impl<P: GroupCompletePolicy> GroupCompleteCore<P> {
    pub fn new(policy: P) -> Self {
        GroupCompleteCore {
            state: Mutex::new(State {
                current_group_id: 1,
                current_group: Vec::new(),
                latest_closed_group_id: 0,
                latest_closed_group: Vec::new(),
                latest_closed_state: 0,
            }),
            cond: Condvar::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Appends `record` to the current group, notifies the policy, and
    /// returns the group id the transaction now belongs to.
    pub fn register_transaction(&self, record: TxRecord) -> GroupId {
        let mut state = self.state.lock().unwrap();
        state.current_group.push(record);
        let group_id = state.current_group_id;
        drop(state);
        self.policy.on_register_transaction(group_id, &record);
        group_id
    }

    pub fn current_group_id(&self) -> GroupId {
        self.state.lock().unwrap().current_group_id
    }

    pub fn current_group_len(&self) -> usize {
        self.state.lock().unwrap().current_group.len()
    }

    pub fn latest_closed_group_id(&self) -> GroupId {
        self.state.lock().unwrap().latest_closed_group_id
    }

    /// Closes the current group if the policy allows it: publishes it as
    /// the new latest-closed group, resets the current group container,
    /// bumps `current_group_id`, and sets the `CLOSED` bit. Returns the
    /// closed group's id and its member list on success.
    pub fn close_current_group(&self) -> Option<(GroupId, TxGroup)> {
        let mut state = self.state.lock().unwrap();
        if !self.policy.can_close_current_group(&state.current_group) {
            return None;
        }
        let closed_id = state.current_group_id;
        let closed_group = std::mem::take(&mut state.current_group);
        state.latest_closed_group_id = closed_id;
        state.latest_closed_group = closed_group.clone();
        state.latest_closed_state = group_state::CLOSED;
        state.current_group_id += 1;
        drop(state);
        self.cond.notify_all();
        Some((closed_id, closed_group))
    }

    /// Closes the current group unconditionally (provided it is
    /// non-empty), bypassing the policy's `can_close_current_group` check.
    /// Used by the slave's forced-progress rule: a transaction registered
    /// "past" the dispatcher's expected count, so waiting for an exact
    /// match would stall forever.
    pub fn force_close_current_group(&self) -> Option<(GroupId, TxGroup)> {
        let mut state = self.state.lock().unwrap();
        if state.current_group.is_empty() {
            return None;
        }
        let closed_id = state.current_group_id;
        let closed_group = std::mem::take(&mut state.current_group);
        state.latest_closed_group_id = closed_id;
        state.latest_closed_group = closed_group.clone();
        state.latest_closed_state = group_state::CLOSED;
        state.current_group_id += 1;
        drop(state);
        self.cond.notify_all();
        Some((closed_id, closed_group))
    }

    pub fn latest_closed_group(&self, group_id: GroupId) -> Option<TxGroup> {
        let state = self.state.lock().unwrap();
        if state.latest_closed_group_id == group_id {
            Some(state.latest_closed_group.clone())
        } else {
            None
        }
    }

    fn set_bit_if_current(&self, group_id: GroupId, bit: u32) {
        let mut state = self.state.lock().unwrap();
        if state.latest_closed_group_id == group_id {
            state.latest_closed_state |= bit;
        }
        drop(state);
        self.cond.notify_all();
    }

    pub fn notify_group_mvcc_complete(&self, group_id: GroupId) {
        self.set_bit_if_current(group_id, group_state::MVCC_COMPLETED);
    }

    pub fn notify_group_logged(&self, group_id: GroupId) {
        self.set_bit_if_current(group_id, group_state::LOGGED);
    }

    pub fn notify_group_complete(&self, group_id: GroupId) {
        self.set_bit_if_current(group_id, group_state::COMPLETE_STARTED | group_state::COMPLETED);
    }

    pub fn mark_latest_closed_group_prepared_for_complete(&self, group_id: GroupId) {
        self.set_bit_if_current(group_id, group_state::PREPARED_FOR_COMPLETE);
    }

    /// CAS-like: returns `true` to exactly one caller per group id -- the
    /// elected completer. Safe because the check-and-set happens under the
    /// state mutex.
    pub fn starts_latest_closed_group_complete(&self, group_id: GroupId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.latest_closed_group_id != group_id {
            return false;
        }
        if state.latest_closed_state & group_state::COMPLETE_STARTED != 0 {
            return false;
        }
        state.latest_closed_state |= group_state::COMPLETE_STARTED;
        true
    }

    /// The "wait for watermark" primitive: blocks until `latest_closed_group_id
    /// >= group_id` and the target bit is set on that group (or a later
    /// group has superseded it, in which case the condition is vacuously
    /// true -- there is nothing left to wait for).
    fn wait_for_watermark(&self, group_id: GroupId, bit: u32) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.latest_closed_group_id > group_id {
                return;
            }
            if state.latest_closed_group_id == group_id && state.latest_closed_state & bit != 0 {
                return;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn complete_mvcc(&self, group_id: GroupId) {
        self.wait_for_watermark(group_id, group_state::MVCC_COMPLETED);
    }

    pub fn complete_logging(&self, group_id: GroupId) {
        self.wait_for_watermark(group_id, group_state::LOGGED);
    }

    pub fn complete(&self, group_id: GroupId) {
        self.wait_for_watermark(group_id, group_state::COMPLETED);
    }

    /// Translates a stream position to the group it closed, assuming group
    /// ids close in strictly increasing order and `group_id` is already
    /// known to the caller (the dispatcher tracks this mapping itself).
    /// Exposed for symmetry with the slave's `complete_upto_stream_position`.
    pub fn complete_group_id(&self, group_id: GroupId) -> CResult<()> {
        if group_id == 0 {
            // Group 0 never existed (ids start at 1): nothing to wait for.
            return Ok(());
        }
        self.complete(group_id);
        Ok(())
    }

    pub fn state_bits(&self, group_id: GroupId) -> u32 {
        let state = self.state.lock().unwrap();
        if state.latest_closed_group_id == group_id {
            state.latest_closed_state
        } else if state.latest_closed_group_id > group_id {
            group_state::COMPLETED
        } else {
            0
        }
    }
}

/// Convenience error for callers that need a `CResult`-shaped failure when
/// a group-complete operation is asked to act out of order (e.g. a stale
/// group id).
pub fn protocol_error(msg: impl Into<String>) -> Error {
    Error::GroupCompleteProtocol(msg.into())
}
