//! Historian worker: serialises all access to one time-series database.
//!
//! Each worker owns a dedicated OS thread and a work queue. Submissions are
//! non-blocking; every typed submission returns a oneshot promise for its
//! result. On each wake the thread drains the inbound queue into a local
//! queue and applies the prioritise-and-compress policy before executing
//! the head item.

use super::sqlite::SqliteStore;
use super::{BoundingMethod, ModifyMode, QualityFilter};
use crate::error::{MediatorError, Result};
use crate::values::{Timestamp, VariableRef, VariableValue, VTQ, VTTQ};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// One unit of work for the historian thread.
pub enum WorkItem {
    Append {
        values: Vec<VariableValue>,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    ReadRaw {
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
        max_values: usize,
        bounding: BoundingMethod,
        filter: QualityFilter,
        reply: oneshot::Sender<Result<Vec<VTTQ>>>,
    },
    Count {
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
        filter: QualityFilter,
        reply: oneshot::Sender<Result<i64>>,
    },
    DeleteInterval {
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
        reply: oneshot::Sender<Result<i64>>,
    },
    LatestTimestampDb {
        variable: VariableRef,
        reply: oneshot::Sender<Result<Option<Timestamp>>>,
    },
    Modify {
        variable: VariableRef,
        mode: ModifyMode,
        data: Vec<VTQ>,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteVariables {
        variables: Vec<VariableRef>,
        reply: oneshot::Sender<Result<()>>,
    },
    Terminate {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl WorkItem {
    fn is_read(&self) -> bool {
        matches!(
            self,
            WorkItem::ReadRaw { .. } | WorkItem::Count { .. } | WorkItem::LatestTimestampDb { .. }
        )
    }

    /// Resolves the item's promise with `Terminated`.
    fn fail_terminated(self) {
        match self {
            WorkItem::Append { reply, .. } => drop(reply.send(Err(MediatorError::Terminated))),
            WorkItem::ReadRaw { reply, .. } => drop(reply.send(Err(MediatorError::Terminated))),
            WorkItem::Count { reply, .. } => drop(reply.send(Err(MediatorError::Terminated))),
            WorkItem::DeleteInterval { reply, .. } => {
                drop(reply.send(Err(MediatorError::Terminated)))
            }
            WorkItem::LatestTimestampDb { reply, .. } => {
                drop(reply.send(Err(MediatorError::Terminated)))
            }
            WorkItem::Modify { reply, .. } => drop(reply.send(Err(MediatorError::Terminated))),
            WorkItem::DeleteVariables { reply, .. } => {
                drop(reply.send(Err(MediatorError::Terminated)))
            }
            WorkItem::Terminate { reply } => drop(reply.send(Ok(()))),
        }
    }
}

/// Cloneable handle for submitting work to one historian worker.
#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    tx: mpsc::Sender<WorkItem>,
    terminated: Arc<AtomicBool>,
    append_commits: Arc<AtomicU64>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of append transactions committed so far. Batch coalescing
    /// makes this smaller than the number of append submissions.
    pub fn append_commits(&self) -> u64 {
        self.append_commits.load(Ordering::Relaxed)
    }

    /// Non-blocking submission. The item's promise resolves when the
    /// worker executed it; after termination submissions fail immediately.
    pub fn post(&self, item: WorkItem) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            item.fail_terminated();
            return Err(MediatorError::Terminated);
        }
        self.tx.send(item).map_err(|e| {
            e.0.fail_terminated();
            MediatorError::Terminated
        })
    }

    pub async fn append(&self, values: Vec<VariableValue>) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::Append { values, reply: tx })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    pub async fn read_raw(
        &self,
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
        max_values: usize,
        bounding: BoundingMethod,
        filter: QualityFilter,
    ) -> Result<Vec<VTTQ>> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::ReadRaw {
            variable,
            start,
            end,
            max_values,
            bounding,
            filter,
            reply: tx,
        })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    pub async fn count(
        &self,
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
        filter: QualityFilter,
    ) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::Count {
            variable,
            start,
            end,
            filter,
            reply: tx,
        })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    pub async fn delete_interval(
        &self,
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::DeleteInterval {
            variable,
            start,
            end,
            reply: tx,
        })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    pub async fn latest_timestamp_db(&self, variable: VariableRef) -> Result<Option<Timestamp>> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::LatestTimestampDb { variable, reply: tx })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    pub async fn modify(
        &self,
        variable: VariableRef,
        mode: ModifyMode,
        data: Vec<VTQ>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::Modify {
            variable,
            mode,
            data,
            reply: tx,
        })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    pub async fn delete_variables(&self, variables: Vec<VariableRef>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::DeleteVariables {
            variables,
            reply: tx,
        })?;
        rx.await.map_err(|_| MediatorError::Terminated)?
    }

    /// Closes the database and ends the worker thread. Items still queued
    /// behind the terminate marker fail with `Terminated`.
    pub async fn terminate(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(WorkItem::Terminate { reply: tx })?;
        let result = rx.await.map_err(|_| MediatorError::Terminated)?;
        self.terminated.store(true, Ordering::Release);
        result
    }
}

/// Spawns the worker thread for one database.
pub fn spawn(name: &str, file: &str, prioritize_reads: bool) -> WorkerHandle {
    let (tx, rx) = mpsc::channel();
    let terminated = Arc::new(AtomicBool::new(false));
    let append_commits = Arc::new(AtomicU64::new(0));

    let thread_name = format!("historian-{name}");
    let file = file.to_string();
    let flag = terminated.clone();
    let commits = append_commits.clone();
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker_loop(&file, prioritize_reads, rx, flag, commits))
        .expect("failed to spawn historian worker thread");

    WorkerHandle {
        name: name.to_string(),
        tx,
        terminated,
        append_commits,
    }
}

fn worker_loop(
    file: &str,
    prioritize_reads: bool,
    rx: mpsc::Receiver<WorkItem>,
    terminated: Arc<AtomicBool>,
    append_commits: Arc<AtomicU64>,
) {
    let mut store = match SqliteStore::open(file) {
        Ok(store) => store,
        Err(e) => {
            error!(file, error = %e, "historian database failed to open");
            terminated.store(true, Ordering::Release);
            for item in rx.iter() {
                item.fail_terminated();
            }
            return;
        }
    };

    let mut local: VecDeque<WorkItem> = VecDeque::new();
    loop {
        if local.is_empty() {
            match rx.recv() {
                Ok(item) => local.push_back(item),
                Err(_) => break, // all handles dropped
            }
        }
        while let Ok(item) = rx.try_recv() {
            local.push_back(item);
        }

        prioritize(&mut local, prioritize_reads);

        if matches!(local.front(), Some(WorkItem::Append { .. })) {
            let batch = take_append_prefix(&mut local);
            execute_appends(&mut store, &append_commits, batch);
            continue;
        }

        let Some(item) = local.pop_front() else { continue };
        if let WorkItem::Terminate { reply } = item {
            info!(file, "historian worker terminating");
            let _ = reply.send(Ok(()));
            break;
        }
        execute(&mut store, item);
    }

    terminated.store(true, Ordering::Release);
    for item in local.drain(..).chain(rx.try_iter()) {
        item.fail_terminated();
    }
}

/// Queue policy, deliberately coarse: move the first read to the head when
/// read prioritisation is on (never reordering two reads or two writes),
/// leaving append folding to the execution step.
fn prioritize(queue: &mut VecDeque<WorkItem>, reads_first: bool) {
    if !reads_first {
        return;
    }
    if queue.front().map(|i| i.is_read()).unwrap_or(true) {
        return;
    }
    if let Some(pos) = queue.iter().position(WorkItem::is_read) {
        if let Some(read) = queue.remove(pos) {
            queue.push_front(read);
        }
    }
}

/// Pops the longest prefix of consecutive appends.
fn take_append_prefix(
    queue: &mut VecDeque<WorkItem>,
) -> Vec<(Vec<VariableValue>, oneshot::Sender<Result<Vec<String>>>)> {
    let mut batch = Vec::new();
    while matches!(queue.front(), Some(WorkItem::Append { .. })) {
        if let Some(WorkItem::Append { values, reply }) = queue.pop_front() {
            batch.push((values, reply));
        }
    }
    batch
}

/// Executes a folded group of appends in a single transaction. Each merged
/// item's promise resolves with the error strings of its own values.
fn execute_appends(
    store: &mut SqliteStore,
    append_commits: &AtomicU64,
    batch: Vec<(Vec<VariableValue>, oneshot::Sender<Result<Vec<String>>>)>,
) {
    let merged: Vec<VariableValue> = batch
        .iter()
        .flat_map(|(values, _)| values.iter().cloned())
        .collect();

    match store.append_batch(&merged) {
        Ok(errors) => {
            append_commits.fetch_add(1, Ordering::Relaxed);
            let mut offset = 0;
            for (values, reply) in batch {
                let slice = errors[offset..offset + values.len()].to_vec();
                offset += values.len();
                let _ = reply.send(Ok(slice));
            }
        }
        Err(e) => {
            warn!(error = %e, "append batch failed");
            let msg = e.to_string();
            for (_, reply) in batch {
                let _ = reply.send(Err(MediatorError::internal(msg.clone())));
            }
        }
    }
}

fn execute(store: &mut SqliteStore, item: WorkItem) {
    match item {
        WorkItem::Append { .. } | WorkItem::Terminate { .. } => unreachable!("handled by caller"),
        WorkItem::ReadRaw {
            variable,
            start,
            end,
            max_values,
            bounding,
            filter,
            reply,
        } => {
            let _ = reply.send(store.read_raw(&variable, start, end, max_values, bounding, filter));
        }
        WorkItem::Count {
            variable,
            start,
            end,
            filter,
            reply,
        } => {
            let _ = reply.send(store.count(&variable, start, end, filter));
        }
        WorkItem::DeleteInterval {
            variable,
            start,
            end,
            reply,
        } => {
            let _ = reply.send(store.delete_interval(&variable, start, end));
        }
        WorkItem::LatestTimestampDb { variable, reply } => {
            let _ = reply.send(store.latest_timestamp_db(&variable));
        }
        WorkItem::Modify {
            variable,
            mode,
            data,
            reply,
        } => {
            let _ = reply.send(store.modify(&variable, mode, &data));
        }
        WorkItem::DeleteVariables { variables, reply } => {
            let _ = reply.send(store.delete_variables(&variables));
        }
    }
}
