//! Slave dispatcher + applier worker pool (C5, second half): groups popped
//! entries by MVCCID, and on each `GROUP_COMMIT` boundary submits finished
//! transactions to the applier pool while carrying still-live ones forward.
//!
//! MVCCIDs are assumed unique across groups -- a transaction that starts in
//! one group and finishes in a later one keeps the same id, so carrying its
//! task forward in `repl_tasks` never collides with a same-numbered task
//! from a different transaction (the nonexecutable-task carry-over case).

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, trace, warn};

use crate::error::{CResult, Error};
use crate::replication::collaborators::{ClassCatalog, MvccId};
use crate::replication::consumer::EntryQueue;
use crate::replication::entry::{StreamEntry, TranState};
use crate::replication::stream::Stream;
use crate::transaction::slave::DispatchConsumer;

/// One in-flight transaction's accumulated entries, collected in producer
/// order until its `COMMITTED`/`ABORTED` entry arrives.
struct ApplierWorkerTask {
    entries: Vec<StreamEntry>,
    last_tran_state: TranState,
}

impl ApplierWorkerTask {
    fn seed(entry: StreamEntry) -> Self {
        let last_tran_state = entry.header.tran_state;
        ApplierWorkerTask { entries: vec![entry], last_tran_state }
    }

    fn append(&mut self, entry: StreamEntry) {
        self.last_tran_state = entry.header.tran_state;
        self.entries.push(entry);
    }
}

/// Runs one task to completion on a worker thread: unpacks each collected
/// entry in order and applies its objects, clearing any prior error before
/// each call. A bad object is logged and skipped, never aborts the task --
/// the master has already committed, so the slave's only recourse is to
/// record and continue.
fn run_applier_task(task: ApplierWorkerTask, stream: &Stream, catalog: &dyn ClassCatalog, debug_replication_data: bool) {
    for mut entry in task.entries {
        if let Err(e) = entry.unpack(stream) {
            warn!("applier: failed to unpack entry for mvccid {}: {}", entry.header.mvccid, e);
            continue;
        }
        for obj in entry.objects() {
            if debug_replication_data {
                trace!("applier: applying {}", obj.stringify());
            }
            if let Err(e) = obj.apply(catalog) {
                warn!("applier: apply() failed for {}: {}", obj.stringify(), e);
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of applier worker threads, fed through an `mpsc`
/// channel. Dropping the pool closes the channel and joins every worker.
pub struct ApplierPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ApplierPool {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let receiver = receiver.clone();
            workers.push(thread::spawn(move || loop {
                let job = { receiver.lock().unwrap().recv() };
                match job {
                    Ok(job) => job(),
                    Err(_) => return,
                }
            }));
        }
        ApplierPool { sender: Some(sender), workers }
    }

    pub fn submit(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }
}

impl Drop for ApplierPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// The dispatcher daemon. Pops entries from the consumer's queue, groups
/// them by MVCCID, and on `GROUP_COMMIT` boundaries submits runnable tasks
/// to the applier pool and reports close info to the slave group-complete
/// manager.
pub struct Dispatcher {
    queue: Arc<EntryQueue>,
    stream: Stream,
    catalog: Arc<dyn ClassCatalog>,
    pool: ApplierPool,
    dispatch_consumer: Arc<dyn DispatchConsumer>,
    repl_tasks: Mutex<HashMap<MvccId, ApplierWorkerTask>>,
    prev_group_position: Mutex<u64>,
    debug_replication_data: bool,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<EntryQueue>,
        stream: Stream,
        catalog: Arc<dyn ClassCatalog>,
        dispatch_consumer: Arc<dyn DispatchConsumer>,
        worker_count: usize,
    ) -> Self {
        Dispatcher {
            queue,
            stream,
            catalog,
            pool: ApplierPool::new(worker_count),
            dispatch_consumer,
            repl_tasks: Mutex::new(HashMap::new()),
            prev_group_position: Mutex::new(0),
            debug_replication_data: false,
        }
    }

    /// As `new`, sized and configured from a [`crate::replication::config::ReplicationConfig`]
    /// instead of individually-threaded parameters.
    pub fn with_config(
        queue: Arc<EntryQueue>,
        stream: Stream,
        catalog: Arc<dyn ClassCatalog>,
        dispatch_consumer: Arc<dyn DispatchConsumer>,
        config: &crate::replication::config::ReplicationConfig,
    ) -> Self {
        let mut dispatcher = Self::new(queue, stream, catalog, dispatch_consumer, config.applier_worker_threads_count);
        dispatcher.debug_replication_data = config.debug_replication_data;
        dispatcher
    }

    /// Runs until the queue is stopped (the consumer has seen the stream
    /// stop and drained). Intended to be spawned on its own thread.
    pub fn run(&self) {
        loop {
            let Some(entry) = self.queue.pop_entry() else {
                debug!("dispatcher: queue stopped, exiting");
                return;
            };
            if let Err(e) = self.process_entry(entry) {
                warn!("dispatcher: failed to process entry: {}", e);
            }
        }
    }

    fn process_entry(&self, entry: StreamEntry) -> CResult<()> {
        if entry.header.tran_state == TranState::GroupCommit {
            self.process_group_commit(entry)
        } else {
            self.process_transaction_entry(entry);
            Ok(())
        }
    }

    fn process_transaction_entry(&self, entry: StreamEntry) {
        let mvccid = entry.header.mvccid;
        let mut tasks = self.repl_tasks.lock().unwrap();
        match tasks.get_mut(&mvccid) {
            Some(task) => task.append(entry),
            None => {
                tasks.insert(mvccid, ApplierWorkerTask::seed(entry));
            }
        }
    }

    fn process_group_commit(&self, mut entry: StreamEntry) -> CResult<()> {
        entry.unpack(&self.stream)?;
        if !entry.objects().is_empty() {
            return Err(Error::Parse("GROUP_COMMIT entry carried objects".into()));
        }
        let current_group_position = entry
            .start_position()
            .ok_or_else(|| Error::Internal("GROUP_COMMIT entry missing start position".into()))?;

        let prev_group_position = {
            let mut prev = self.prev_group_position.lock().unwrap();
            let old = *prev;
            *prev = current_group_position;
            old
        };
        self.dispatch_consumer.wait_for_complete_stream_position(prev_group_position);

        let drained = {
            let mut tasks = self.repl_tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };

        let mut expected_count = 0usize;
        let mut carried = HashMap::new();
        for (mvccid, task) in drained {
            match task.last_tran_state {
                TranState::Committed => {
                    expected_count += 1;
                    let catalog = self.catalog.clone();
                    let stream = self.stream.clone();
                    let debug_replication_data = self.debug_replication_data;
                    self.pool.submit(Box::new(move || {
                        run_applier_task(task, &stream, catalog.as_ref(), debug_replication_data)
                    }));
                }
                TranState::Aborted => {
                    expected_count += 1;
                }
                _ => {
                    debug!("dispatcher: carrying mvccid {} into the next group", mvccid);
                    carried.insert(mvccid, task);
                }
            }
        }
        *self.repl_tasks.lock().unwrap() = carried;

        self.dispatch_consumer
            .set_close_info_for_current_group(current_group_position, expected_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::collaborators::NullClassCatalog;
    use crate::replication::object::{Lsa, ReplicationObject};
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingConsumer {
        waited: StdMutex<Vec<u64>>,
        close_info: StdMutex<Vec<(u64, usize)>>,
    }

    impl DispatchConsumer for RecordingConsumer {
        fn wait_for_complete_stream_position(&self, position: u64) {
            self.waited.lock().unwrap().push(position);
        }

        fn set_close_info_for_current_group(&self, position: u64, expected_count: usize) {
            self.close_info.lock().unwrap().push((position, expected_count));
        }
    }

    fn insert_obj(key: u8) -> ReplicationObject {
        ReplicationObject::SingleRowInsert {
            lsa: Lsa::new(1, 0),
            class_name: "t".to_string(),
            key: vec![key],
            record: vec![9],
        }
    }

    #[test]
    fn single_transaction_commits_and_applies_at_group_boundary() {
        let stream = Stream::new();
        let queue = Arc::new(EntryQueue::new(8));
        let catalog = Arc::new(NullClassCatalog::new());
        let consumer = Arc::new(RecordingConsumer::default());
        let dispatcher = Dispatcher::new(queue.clone(), stream.clone(), catalog.clone(), consumer.clone(), 2);

        let mut active = StreamEntry::new_active(100, 0);
        active.add_object(insert_obj(42));
        let start = active.pack(TranState::Active, &stream).unwrap();
        let (mut prepared, _) = StreamEntry::prepare(&stream, start).unwrap();
        prepared.unpack(&stream).unwrap();

        let commit_start = StreamEntry::new_active(100, start).pack(TranState::Committed, &stream).unwrap();
        let (mut committed_entry, _) = StreamEntry::prepare(&stream, commit_start).unwrap();
        committed_entry.unpack(&stream).unwrap();

        let (gc_start, _) = StreamEntry::pack_group_commit(0, commit_start, &stream).unwrap();
        let (gc_entry, _) = StreamEntry::prepare(&stream, gc_start).unwrap();

        dispatcher.process_entry(prepared).unwrap();
        dispatcher.process_entry(committed_entry).unwrap();
        dispatcher.process_entry(gc_entry).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(catalog.calls(), vec!["insert_row(t)".to_string()]);
        assert_eq!(*consumer.close_info.lock().unwrap(), vec![(gc_start, 1)]);
        assert_eq!(*consumer.waited.lock().unwrap(), vec![0]);
    }

    #[test]
    fn live_transaction_is_carried_into_the_next_group() {
        let stream = Stream::new();
        let queue = Arc::new(EntryQueue::new(8));
        let catalog = Arc::new(NullClassCatalog::new());
        let consumer = Arc::new(RecordingConsumer::default());
        let dispatcher = Dispatcher::new(queue, stream.clone(), catalog.clone(), consumer.clone(), 1);

        let mut active = StreamEntry::new_active(200, 0);
        active.add_object(insert_obj(7));
        let start = active.pack(TranState::Active, &stream).unwrap();
        let (mut prepared, _) = StreamEntry::prepare(&stream, start).unwrap();
        prepared.unpack(&stream).unwrap();
        dispatcher.process_entry(prepared).unwrap();

        let (gc_start, _) = StreamEntry::pack_group_commit(0, start, &stream).unwrap();
        let (gc_entry, _) = StreamEntry::prepare(&stream, gc_start).unwrap();
        dispatcher.process_entry(gc_entry).unwrap();

        assert_eq!(*consumer.close_info.lock().unwrap(), vec![(gc_start, 0)]);
        assert_eq!(dispatcher.repl_tasks.lock().unwrap().len(), 1);
        assert!(catalog.calls().is_empty());
    }

    #[test]
    fn aborted_transaction_counts_as_expected_but_is_not_applied() {
        let stream = Stream::new();
        let queue = Arc::new(EntryQueue::new(8));
        let catalog = Arc::new(NullClassCatalog::new());
        let consumer = Arc::new(RecordingConsumer::default());
        let dispatcher = Dispatcher::new(queue, stream.clone(), catalog.clone(), consumer.clone(), 1);

        let mut active = StreamEntry::new_active(300, 0);
        active.add_object(insert_obj(9));
        let start = active.pack(TranState::Active, &stream).unwrap();
        let (mut prepared, _) = StreamEntry::prepare(&stream, start).unwrap();
        prepared.unpack(&stream).unwrap();
        dispatcher.process_entry(prepared).unwrap();

        let abort_start = StreamEntry::new_active(300, start).pack(TranState::Aborted, &stream).unwrap();
        let (mut abort_entry, _) = StreamEntry::prepare(&stream, abort_start).unwrap();
        abort_entry.unpack(&stream).unwrap();
        dispatcher.process_entry(abort_entry).unwrap();

        let (gc_start, _) = StreamEntry::pack_group_commit(0, abort_start, &stream).unwrap();
        let (gc_entry, _) = StreamEntry::prepare(&stream, gc_start).unwrap();
        dispatcher.process_entry(gc_entry).unwrap();

        assert_eq!(*consumer.close_info.lock().unwrap(), vec![(gc_start, 1)]);
        assert!(catalog.calls().is_empty());
    }
}
