//! Master group-complete manager (C6): closes batches, drives MVCC
//! completion, logs the group-commit record, and releases committing
//! transactions once the slave's ack catches up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use std::collections::HashMap;

use log::info;

use crate::error::CResult;
use crate::replication::ack_policy::{AckPolicy, FirstAckPolicy};
use crate::replication::collaborators::{LogManager, MvccId, MvccTable};
use crate::replication::entry::TranState;
use crate::replication::stream::Stream;
use crate::replication::entry::StreamEntry;
use crate::replication::transfer::StreamAckSink;
use crate::transaction::group_complete::{group_state, protocol_error, GroupCompleteCore, GroupCompletePolicy, GroupId, TxGroup, TxRecord};

/// The generic, non-empty-current-group close rule shared by master and
/// slave. The "previous group must be fully completed" half of
/// `can_close_current_group` is enforced by the manager itself before it
/// calls `close_current_group`, since it depends on state the base core
/// already owns and a single-threaded daemon context makes a pre-check
/// race-free.
struct NonEmptyPolicy;

impl GroupCompletePolicy for NonEmptyPolicy {
    fn on_register_transaction(&self, _group_id: GroupId, _record: &TxRecord) {}

    fn can_close_current_group(&self, current_group: &TxGroup) -> bool {
        !current_group.is_empty()
    }
}

/// Wakes transfer senders so they attempt to drain up to a position without
/// waiting for their next idle poll.
pub trait SenderWaker: Send + Sync {
    fn wake_senders_up_to(&self, position: u64);
}

/// A no-op waker for standalone tests of the group-complete manager that
/// don't exercise C4.
pub struct NullSenderWaker;
impl SenderWaker for NullSenderWaker {
    fn wake_senders_up_to(&self, _position: u64) {}
}

struct Positions {
    start: u64,
    end: u64,
}

/// Master-side group-complete manager. Implements `StreamAckSink`: the
/// control channel's ack reader calls `notify_stream_ack` directly.
pub struct MasterGroupCompleteManager {
    core: GroupCompleteCore<NonEmptyPolicy>,
    stream: Stream,
    mvcc_table: Arc<dyn MvccTable>,
    log_manager: Arc<dyn LogManager>,
    sender_waker: Arc<dyn SenderWaker>,
    ack_policy: Arc<dyn AckPolicy>,
    positions: Mutex<HashMap<GroupId, Positions>>,
    prev_record_position: AtomicU64,
}

impl MasterGroupCompleteManager {
    pub fn new(
        stream: Stream,
        mvcc_table: Arc<dyn MvccTable>,
        log_manager: Arc<dyn LogManager>,
        sender_waker: Arc<dyn SenderWaker>,
    ) -> Self {
        Self::with_ack_policy(stream, mvcc_table, log_manager, sender_waker, Arc::new(FirstAckPolicy))
    }

    /// As `new`, but with an explicit ack-release policy instead of the
    /// default `FirstAckPolicy`. A multi-replica quorum policy would plug
    /// in here.
    pub fn with_ack_policy(
        stream: Stream,
        mvcc_table: Arc<dyn MvccTable>,
        log_manager: Arc<dyn LogManager>,
        sender_waker: Arc<dyn SenderWaker>,
        ack_policy: Arc<dyn AckPolicy>,
    ) -> Self {
        MasterGroupCompleteManager {
            core: GroupCompleteCore::new(NonEmptyPolicy),
            stream,
            mvcc_table,
            log_manager,
            sender_waker,
            ack_policy,
            positions: Mutex::new(HashMap::new()),
            prev_record_position: AtomicU64::new(0),
        }
    }

    pub fn register_transaction(&self, tran_index: i32, mvccid: MvccId, tran_state: TranState) -> GroupId {
        self.core.register_transaction(TxRecord { tran_index, mvccid, tran_state })
    }

    pub fn complete(&self, group_id: GroupId) {
        self.core.complete(group_id)
    }

    pub fn current_group_id(&self) -> GroupId {
        self.core.current_group_id()
    }

    pub fn latest_closed_group_id(&self) -> GroupId {
        self.core.latest_closed_group_id()
    }

    fn previous_group_is_fully_completed(&self) -> bool {
        let prev_id = self.core.latest_closed_group_id();
        prev_id == 0 || self.core.state_bits(prev_id) & group_state::COMPLETED != 0
    }

    fn pack_group_commit_entry(&self, group_id: GroupId) -> CResult<(u64, u64)> {
        let prev = self.prev_record_position.load(Ordering::SeqCst);
        // The header's mvccid field carries the group id for a marker
        // entry -- it has no objects, so there is no per-transaction
        // mvccid to report.
        let (start, end) = StreamEntry::pack_group_commit(group_id, prev, &self.stream)?;
        self.prev_record_position.store(end, Ordering::SeqCst);
        Ok((start, end))
    }

    /// Run by the 10ms master-GCM daemon. Closes the current group if the
    /// close rule allows it, drives it through MVCC completion and
    /// group-commit entry packing, and wakes senders to drain up to the
    /// entry's end position. Returns the closed group's id, if any.
    pub fn do_prepare_complete(&self) -> CResult<Option<GroupId>> {
        if !self.previous_group_is_fully_completed() {
            return Ok(None);
        }
        let Some((group_id, group)) = self.core.close_current_group() else {
            return Ok(None);
        };

        let mvccids: Vec<MvccId> = group.iter().map(|r| r.mvccid).collect();
        self.mvcc_table.complete_group_mvcc(&mvccids)?;
        self.core.notify_group_mvcc_complete(group_id);

        let (_start, end) = self.pack_group_commit_entry(group_id)?;
        self.positions.lock().unwrap().insert(group_id, Positions { start: _start, end });

        self.core.mark_latest_closed_group_prepared_for_complete(group_id);
        self.sender_waker.wake_senders_up_to(end);

        Ok(Some(group_id))
    }

    /// The release trigger: once an acked position passes the latest
    /// closed group's end stream position, drives the group to completion.
    fn notify_stream_ack_inner(&self, position: u64) -> CResult<()> {
        let group_id = self.core.latest_closed_group_id();
        if group_id == 0 {
            return Ok(());
        }
        let end = self.positions.lock().unwrap().get(&group_id).map(|p| p.end);
        let Some(end) = end else {
            return Ok(());
        };
        if !self.ack_policy.is_satisfied(position, end) {
            return Ok(());
        }
        self.do_complete(group_id)
    }

    /// Runs once, for the single elected completer of `group_id`: waits for
    /// `PREPARED_FOR_COMPLETE` (a rare race with `do_prepare_complete`),
    /// appends the group-complete WAL record, and releases every
    /// transaction waiting in `complete(group_id)`.
    pub fn do_complete(&self, group_id: GroupId) -> CResult<()> {
        if !self.core.starts_latest_closed_group_complete(group_id) {
            return Ok(());
        }
        while self.core.state_bits(group_id) & group_state::PREPARED_FOR_COMPLETE == 0 {
            std::thread::yield_now();
        }

        let start = self
            .positions
            .lock()
            .unwrap()
            .get(&group_id)
            .map(|p| p.start)
            .ok_or_else(|| protocol_error(format!("no recorded positions for group {}", group_id)))?;

        self.log_manager.append_group_complete_record(group_id, start)?;
        self.core.notify_group_logged(group_id);
        self.log_manager.wakeup_log_flush();
        self.core.notify_group_complete(group_id);
        info!("master GCM: group {} completed", group_id);
        Ok(())
    }

    /// Starts the master group-complete daemon: ticks `do_prepare_complete`
    /// on `interval`, logging (not propagating) failures the way a looper
    /// task has no caller to report back to.
    pub fn start_daemon(self: &Arc<Self>, interval: std::time::Duration) -> crate::replication::daemon::Daemon {
        let mgr = self.clone();
        crate::replication::daemon::Daemon::spawn("master-gcm", interval, move || {
            if let Err(e) = mgr.do_prepare_complete() {
                log::error!("master GCM: do_prepare_complete failed: {}", e);
            }
        })
    }
}

impl StreamAckSink for MasterGroupCompleteManager {
    fn notify_stream_ack(&self, position: u64) {
        if let Err(e) = self.notify_stream_ack_inner(position) {
            log::error!("master GCM: notify_stream_ack failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::collaborators::{RecordingMvccTable, EngineLogManager};
    use crate::storage::log_cask::LogCask;
    use std::sync::atomic::AtomicU64 as AU64;
    use std::thread;
    use std::time::Duration;

    fn new_manager() -> (Arc<MasterGroupCompleteManager>, Arc<RecordingMvccTable>) {
        let stream = Stream::new();
        let mvcc = Arc::new(RecordingMvccTable::new());
        let path = tempdir::TempDir::new("master_gcm").unwrap().into_path().join("db");
        let engine = Arc::new(Mutex::new(LogCask::new(path).unwrap()));
        let log_manager = Arc::new(EngineLogManager::new(engine));
        let mgr = Arc::new(MasterGroupCompleteManager::new(stream, mvcc.clone(), log_manager, Arc::new(NullSenderWaker)));
        (mgr, mvcc)
    }

    #[test]
    fn ack_driven_completion_releases_waiters_only_past_end_position() {
        let (mgr, mvcc) = new_manager();
        mgr.register_transaction(1, 100, TranState::Committed);
        let group_id = mgr.do_prepare_complete().unwrap().unwrap();
        assert_eq!(mvcc.completed(), vec![100]);

        let end = mgr.positions.lock().unwrap().get(&group_id).unwrap().end;

        let released = Arc::new(AU64::new(0));
        let released_w = released.clone();
        let waiter_mgr = mgr.clone();
        let handle = thread::spawn(move || {
            waiter_mgr.complete(group_id);
            released_w.store(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        mgr.notify_stream_ack(end - 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        mgr.notify_stream_ack(end);
        handle.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cannot_close_next_group_before_previous_completes() {
        let (mgr, _mvcc) = new_manager();
        mgr.register_transaction(1, 100, TranState::Committed);
        let g1 = mgr.do_prepare_complete().unwrap().unwrap();

        mgr.register_transaction(2, 200, TranState::Committed);
        // Previous group (g1) hasn't been acked/completed yet.
        assert_eq!(mgr.do_prepare_complete().unwrap(), None);
        assert_eq!(mgr.current_group_id(), g1 + 1);

        let end = mgr.positions.lock().unwrap().get(&g1).unwrap().end;
        mgr.notify_stream_ack(end);

        let g2 = mgr.do_prepare_complete().unwrap().unwrap();
        assert_eq!(g2, g1 + 1);
    }

    #[test]
    fn empty_current_group_never_closes() {
        let (mgr, _mvcc) = new_manager();
        assert_eq!(mgr.do_prepare_complete().unwrap(), None);
    }

    #[test]
    fn daemon_closes_group_without_a_manual_tick() {
        let (mgr, mvcc) = new_manager();
        mgr.register_transaction(1, 100, TranState::Committed);

        let daemon = mgr.start_daemon(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(40));
        daemon.stop();

        assert_eq!(mvcc.completed(), vec![100]);
        assert_ne!(mgr.latest_closed_group_id(), 0);
    }
}
