//! Slave group-complete manager (C7): closes batches from dispatcher-
//! provided close info and waits for the expected number of transactions
//! to register before completing. No stream-ack dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::CResult;
use crate::replication::collaborators::{LogManager, MvccId, MvccTable};
use crate::replication::entry::TranState;
use crate::transaction::group_complete::{group_state, GroupCompleteCore, GroupCompletePolicy, GroupId, TxGroup, TxRecord};

/// The dispatcher-facing interface a slave group-complete manager
/// implements: how the dispatcher tells it where a group closes and how
/// many transactions to expect in it.
pub trait DispatchConsumer: Send + Sync {
    fn wait_for_complete_stream_position(&self, position: u64);
    fn set_close_info_for_current_group(&self, position: u64, expected_count: usize);
}

/// The slave's close condition is driven entirely by `close_info` and the
/// forced-progress counter, evaluated by the manager itself; the policy
/// hook only enforces non-emptiness (same contract every
/// `GroupCompleteCore` close relies on).
struct AlwaysClosePolicy;
impl GroupCompletePolicy for AlwaysClosePolicy {
    fn on_register_transaction(&self, _group_id: GroupId, _record: &TxRecord) {}
    fn can_close_current_group(&self, current_group: &TxGroup) -> bool {
        !current_group.is_empty()
    }
}

#[derive(Clone, Copy)]
struct CloseInfo {
    position: u64,
    expected_count: usize,
}

/// Slave-side group-complete manager.
pub struct SlaveGroupCompleteManager {
    core: GroupCompleteCore<AlwaysClosePolicy>,
    mvcc_table: Arc<dyn MvccTable>,
    log_manager: Arc<dyn LogManager>,
    close_info: Mutex<Option<CloseInfo>>,
    position_to_group: Mutex<HashMap<u64, GroupId>>,
    /// Count of transactions the dispatcher has reported as having
    /// registered "past" this group's expected count (see the
    /// forced-progress rule below). Subtracted from `expected_count` so
    /// the group can still close instead of stalling forever waiting for
    /// arrivals that will never come.
    overflow: AtomicUsize,
}

impl SlaveGroupCompleteManager {
    pub fn new(mvcc_table: Arc<dyn MvccTable>, log_manager: Arc<dyn LogManager>) -> Self {
        SlaveGroupCompleteManager {
            core: GroupCompleteCore::new(AlwaysClosePolicy),
            mvcc_table,
            log_manager,
            close_info: Mutex::new(None),
            position_to_group: Mutex::new(HashMap::new()),
            overflow: AtomicUsize::new(0),
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

    /// Records that a transaction registered after this group's expected
    /// count was already fixed by the dispatcher -- it will land in the
    /// *next* group's map instead (the nonexecutable-task carry-over case).
    /// Waiting for the original count would stall forever, so the next
    /// `do_prepare_complete` closes early.
    pub fn note_transaction_registered_past_expected(&self) {
        self.overflow.fetch_add(1, Ordering::SeqCst);
        warn!("slave GCM: transaction registered past the expected count; will force early close");
    }

    /// Run by the slave GCM daemon. Closes the current group once its size
    /// reaches the (possibly overflow-adjusted) expected count, then runs
    /// prepare -> MVCC complete -> log-append -> complete in one step,
    /// since there is no ack to wait for.
    pub fn do_prepare_complete(&self) -> CResult<Option<GroupId>> {
        let info = { *self.close_info.lock().unwrap() };
        let Some(info) = info else {
            return Ok(None);
        };

        let current_len = self.core.current_group_len();
        let overflow = self.overflow.load(Ordering::SeqCst);
        let effective_expected = info.expected_count.saturating_sub(overflow);
        if current_len < effective_expected {
            return Ok(None);
        }

        // The close gate itself was already evaluated above (against the
        // overflow-adjusted expected count); `force_close_current_group`
        // skips the redundant non-empty re-check `close_current_group`
        // would otherwise perform through `AlwaysClosePolicy`.
        let Some((group_id, group)) = self.core.force_close_current_group() else {
            return Ok(None);
        };
        *self.close_info.lock().unwrap() = None;
        self.overflow.store(0, Ordering::SeqCst);
        self.position_to_group.lock().unwrap().insert(info.position, group_id);

        let mvccids: Vec<MvccId> = group.iter().map(|r| r.mvccid).collect();
        self.mvcc_table.complete_group_mvcc(&mvccids)?;
        self.core.notify_group_mvcc_complete(group_id);

        self.log_manager.append_group_complete_record(group_id, info.position)?;
        self.core.notify_group_logged(group_id);
        self.log_manager.wakeup_log_flush();

        self.core.mark_latest_closed_group_prepared_for_complete(group_id);
        // No sender-ack dependency on the slave: the elected completer
        // runs immediately.
        if self.core.starts_latest_closed_group_complete(group_id) {
            self.core.notify_group_complete(group_id);
        }

        Ok(Some(group_id))
    }

    pub fn state_bits(&self, group_id: GroupId) -> u32 {
        self.core.state_bits(group_id)
    }

    /// Starts the slave group-complete daemon: ticks `do_prepare_complete`
    /// (which, unlike the master's, runs prepare and complete in one step
    /// -- there is no ack to wait on) on `interval`.
    pub fn start_daemon(self: &Arc<Self>, interval: std::time::Duration) -> crate::replication::daemon::Daemon {
        let mgr = self.clone();
        crate::replication::daemon::Daemon::spawn("slave-gcm", interval, move || {
            if let Err(e) = mgr.do_prepare_complete() {
                log::error!("slave GCM: do_prepare_complete failed: {}", e);
            }
        })
    }
}

impl DispatchConsumer for SlaveGroupCompleteManager {
    /// Blocks until the group that closed at `position` is fully complete.
    /// `position == 0` means "no previous group" and returns immediately.
    fn wait_for_complete_stream_position(&self, position: u64) {
        if position == 0 {
            return;
        }
        let group_id = { self.position_to_group.lock().unwrap().get(&position).copied() };
        if let Some(group_id) = group_id {
            self.core.complete(group_id);
        }
    }

    fn set_close_info_for_current_group(&self, position: u64, expected_count: usize) {
        *self.close_info.lock().unwrap() = Some(CloseInfo { position, expected_count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::collaborators::{EngineLogManager, RecordingMvccTable};
    use crate::storage::log_cask::LogCask;
    use std::sync::Mutex as StdMutex;

    fn new_manager() -> (SlaveGroupCompleteManager, Arc<RecordingMvccTable>) {
        let mvcc = Arc::new(RecordingMvccTable::new());
        let path = tempdir::TempDir::new("slave_gcm").unwrap().into_path().join("db");
        let engine = Arc::new(StdMutex::new(LogCask::new(path).unwrap()));
        let log_manager = Arc::new(EngineLogManager::new(engine));
        let mgr = SlaveGroupCompleteManager::new(mvcc.clone(), log_manager);
        (mgr, mvcc)
    }

    #[test]
    fn closes_only_once_expected_count_is_reached() {
        let (mgr, mvcc) = new_manager();
        mgr.set_close_info_for_current_group(100, 2);
        mgr.register_transaction(1, 10, TranState::Committed);
        assert_eq!(mgr.do_prepare_complete().unwrap(), None);

        mgr.register_transaction(2, 20, TranState::Aborted);
        let group_id = mgr.do_prepare_complete().unwrap().unwrap();
        assert_eq!(mvcc.completed(), vec![10, 20]);
        assert_eq!(mgr.state_bits(group_id) & group_state::COMPLETED, group_state::COMPLETED);
    }

    #[test]
    fn forced_progress_closes_early_on_overflow() {
        let (mgr, mvcc) = new_manager();
        mgr.set_close_info_for_current_group(100, 2);
        mgr.register_transaction(1, 10, TranState::Committed);
        mgr.note_transaction_registered_past_expected();

        let group_id = mgr.do_prepare_complete().unwrap().unwrap();
        assert_eq!(mvcc.completed(), vec![10]);
        assert_eq!(mgr.state_bits(group_id) & group_state::COMPLETED, group_state::COMPLETED);
    }

    #[test]
    fn wait_for_complete_stream_position_zero_is_a_no_op() {
        let (mgr, _mvcc) = new_manager();
        mgr.wait_for_complete_stream_position(0);
    }

    #[test]
    fn wait_for_complete_stream_position_unblocks_after_close() {
        let (mgr, _mvcc) = new_manager();
        let mgr = Arc::new(mgr);
        mgr.set_close_info_for_current_group(100, 1);
        mgr.register_transaction(1, 10, TranState::Committed);
        mgr.do_prepare_complete().unwrap().unwrap();

        // Synchronous in this implementation, but exercises the same path
        // the dispatcher relies on before processing the next group.
        mgr.wait_for_complete_stream_position(100);
    }

    #[test]
    fn daemon_closes_group_without_a_manual_tick() {
        let (mgr, mvcc) = new_manager();
        let mgr = Arc::new(mgr);
        mgr.set_close_info_for_current_group(100, 1);
        mgr.register_transaction(1, 10, TranState::Committed);

        let daemon = mgr.start_daemon(std::time::Duration::from_millis(5));
        std::thread::sleep(std::time::Duration::from_millis(40));
        daemon.stop();

        assert_eq!(mvcc.completed(), vec![10]);
    }
}
