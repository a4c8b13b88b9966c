//! Historian: time-series capture of variable values.
//!
//! One [`worker::WorkerHandle`] per configured database serialises all DB
//! access on a dedicated thread; the [`HistorianManager`] routes traffic to
//! the owning module's worker and reports history-change notifications back
//! to the supervisor.

use crate::config::Settings;
use crate::error::{MediatorError, Result};
use crate::modules::Notification;
use crate::values::{
    AlarmOrEvent, HistoryChange, Severity, Timestamp, VariableRef, VariableValue, VTQ, VTTQ,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub mod sqlite;
pub mod worker;

/// Strategy for reducing a range read to at most N samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundingMethod {
    TakeFirstN,
    TakeLastN,
    CompressToN,
}

/// Per-read filter over the quality component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFilter {
    ExcludeNone,
    ExcludeBad,
    ExcludeNonGood,
}

/// Mode of a targeted history modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyMode {
    Insert,
    Update,
    Upsert,
    ReplaceAll,
    Delete,
}

/// Routes variable-history traffic to the owning module's worker.
///
/// Cheaply cloneable; the routing tables are fixed at startup.
#[derive(Clone)]
pub struct HistorianManager {
    workers: Arc<HashMap<String, worker::WorkerHandle>>,
    module_db: Arc<HashMap<String, String>>,
    notif_tx: mpsc::UnboundedSender<Notification>,
    check_warning_ms: i64,
}

impl HistorianManager {
    /// Spawns one worker per configured database and builds the
    /// module-to-database routing map.
    pub fn new(settings: &Settings, notif_tx: mpsc::UnboundedSender<Notification>) -> Self {
        let mut workers = HashMap::new();
        for db in &settings.history_dbs {
            workers.insert(
                db.name.clone(),
                worker::spawn(&db.name, &db.file, db.prioritize_reads),
            );
        }
        let mut module_db = HashMap::new();
        for m in &settings.modules {
            if let Some(db) = &m.history_db {
                module_db.insert(m.id.clone(), db.clone());
            }
        }
        HistorianManager {
            workers: Arc::new(workers),
            module_db: Arc::new(module_db),
            notif_tx,
            check_warning_ms: settings.timestamp_check_warning_ms,
        }
    }

    fn worker_for(&self, variable: &VariableRef) -> Result<&worker::WorkerHandle> {
        let db = self.module_db.get(variable.module()).ok_or_else(|| {
            MediatorError::request(format!(
                "module '{}' has no historian database",
                variable.module()
            ))
        })?;
        self.workers
            .get(db)
            .ok_or_else(|| MediatorError::internal(format!("historian db '{db}' not running")))
    }

    /// Non-blocking append of a value batch. Emits a stale-timestamp
    /// warning when a sample deviates from wall clock beyond the configured
    /// threshold (the value is still appended) and reports the touched
    /// history interval per variable after a successful commit.
    pub fn append(&self, values: Vec<VariableValue>) {
        if values.is_empty() {
            return;
        }
        self.check_timestamps(&values);

        // Group by worker; a module's batch always lands on one database.
        let mut by_db: HashMap<String, Vec<VariableValue>> = HashMap::new();
        for vv in values {
            match self.module_db.get(vv.variable.module()) {
                Some(db) => by_db.entry(db.clone()).or_default().push(vv),
                None => {
                    warn!(variable = %vv.variable, "history value for module without database dropped")
                }
            }
        }

        for (db, batch) in by_db {
            let Some(handle) = self.workers.get(&db) else { continue };
            let handle = handle.clone();
            let notif_tx = self.notif_tx.clone();
            let changes = interval_per_variable(&batch);
            tokio::spawn(async move {
                match handle.append(batch).await {
                    Ok(errors) => {
                        for e in errors.iter().filter(|e| !e.is_empty()) {
                            warn!(db = handle.name(), error = %e, "history append item failed");
                        }
                        let _ = notif_tx.send(Notification::VarHistoryChanged(changes));
                    }
                    Err(e) => warn!(db = handle.name(), error = %e, "history append failed"),
                }
            });
        }
    }

    fn check_timestamps(&self, values: &[VariableValue]) {
        if self.check_warning_ms <= 0 {
            return;
        }
        let now = Timestamp::now();
        let offenders: Vec<&VariableValue> = values
            .iter()
            .filter(|vv| vv.vtq.time.abs_diff_millis(now) > self.check_warning_ms)
            .collect();
        if let Some(first) = offenders.first() {
            let event = AlarmOrEvent::new(
                first.variable.module(),
                Severity::Warning,
                "TimestampCheckWarning",
                format!(
                    "{} value(s) deviate from wall clock by more than {} ms, first: {} at {}",
                    offenders.len(),
                    self.check_warning_ms,
                    first.variable,
                    first.vtq.time
                ),
            );
            let _ = self.notif_tx.send(Notification::AlarmOrEvent(event));
        }
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
        self.worker_for(&variable)?
            .read_raw(variable, start, end, max_values, bounding, filter)
            .await
    }

    pub async fn count(
        &self,
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
        filter: QualityFilter,
    ) -> Result<i64> {
        self.worker_for(&variable)?
            .count(variable, start, end, filter)
            .await
    }

    pub async fn delete_interval(
        &self,
        variable: VariableRef,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<i64> {
        let deleted = self
            .worker_for(&variable)?
            .delete_interval(variable.clone(), start, end)
            .await?;
        if deleted > 0 {
            self.notify_change(vec![HistoryChange {
                variable,
                start,
                end,
            }]);
        }
        Ok(deleted)
    }

    pub async fn latest_timestamp_db(&self, variable: VariableRef) -> Result<Option<Timestamp>> {
        self.worker_for(&variable)?
            .latest_timestamp_db(variable)
            .await
    }

    pub async fn modify(
        &self,
        variable: VariableRef,
        mode: ModifyMode,
        data: Vec<VTQ>,
    ) -> Result<()> {
        let interval = data.iter().map(|v| v.time).fold(None, |acc, t| match acc {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        });
        self.worker_for(&variable)?
            .modify(variable.clone(), mode, data)
            .await?;
        if let Some((start, end)) = interval {
            self.notify_change(vec![HistoryChange {
                variable,
                start,
                end,
            }]);
        }
        Ok(())
    }

    pub async fn delete_variables(&self, variables: Vec<VariableRef>) -> Result<()> {
        let mut by_db: HashMap<String, Vec<VariableRef>> = HashMap::new();
        for v in variables {
            let db = self
                .module_db
                .get(v.module())
                .ok_or_else(|| {
                    MediatorError::request(format!("module '{}' has no historian database", v.module()))
                })?
                .clone();
            by_db.entry(db).or_default().push(v);
        }
        for (db, vars) in by_db {
            let handle = self
                .workers
                .get(&db)
                .ok_or_else(|| MediatorError::internal(format!("historian db '{db}' not running")))?;
            handle.delete_variables(vars).await?;
        }
        Ok(())
    }

    fn notify_change(&self, changes: Vec<HistoryChange>) {
        let _ = self.notif_tx.send(Notification::VarHistoryChanged(changes));
    }

    /// Terminates all workers; queued work fails with `Terminated`.
    pub async fn shutdown(&self) {
        for handle in self.workers.values() {
            if let Err(e) = handle.terminate().await {
                warn!(db = handle.name(), error = %e, "historian worker shutdown failed");
            }
        }
    }
}

/// Min/max timestamp per variable of a batch, in first-seen order.
fn interval_per_variable(values: &[VariableValue]) -> Vec<HistoryChange> {
    let mut order: Vec<VariableRef> = Vec::new();
    let mut bounds: HashMap<VariableRef, (Timestamp, Timestamp)> = HashMap::new();
    for vv in values {
        let t = vv.vtq.time;
        bounds
            .entry(vv.variable.clone())
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(t);
                *hi = (*hi).max(t);
            })
            .or_insert_with(|| {
                order.push(vv.variable.clone());
                (t, t)
            });
    }
    order
        .into_iter()
        .map(|v| {
            let (start, end) = bounds[&v];
            HistoryChange {
                variable: v,
                start,
                end,
            }
        })
        .collect()
}
