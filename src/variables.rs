//! Per-module variable store.
//!
//! Holds the current `VTQ` of every declared variable and persists the lot
//! to a snapshot file. Mutated only on the supervisor's execution context.

use crate::error::{MediatorError, Result};
use crate::modules::{ObjectInfo, VariableInfo};
use crate::values::{VarChange, VariableRef, VariableValue, VTQ};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::warn;

struct StoredVariable {
    vtq: VTQ,
    descriptor: VariableInfo,
}

pub struct VariableStore {
    entries: HashMap<VariableRef, StoredVariable>,
    reject_older: bool,
}

impl VariableStore {
    pub fn new(reject_older: bool) -> VariableStore {
        VariableStore {
            entries: HashMap::new(),
            reject_older,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, variable: &VariableRef) -> Result<VTQ> {
        self.entries
            .get(variable)
            .map(|e| e.vtq.clone())
            .ok_or_else(|| MediatorError::request(format!("unknown variable '{variable}'")))
    }

    pub fn contains(&self, variable: &VariableRef) -> bool {
        self.entries.contains_key(variable)
    }

    pub fn history_enabled(&self, variable: &VariableRef) -> bool {
        self.entries
            .get(variable)
            .map(|e| e.descriptor.history)
            .unwrap_or(false)
    }

    /// Applies a batch of updates atomically. The output preserves input
    /// order; entries for unknown variables or (when enabled) stale
    /// timestamps are skipped.
    pub fn update(&mut self, batch: &[VariableValue]) -> Vec<VarChange> {
        let mut changes = Vec::with_capacity(batch.len());
        for vv in batch {
            let Some(entry) = self.entries.get_mut(&vv.variable) else {
                warn!(variable = %vv.variable, "update for undeclared variable dropped");
                continue;
            };
            if self.reject_older
                && !entry.vtq.time.is_empty()
                && vv.vtq.time < entry.vtq.time
            {
                warn!(variable = %vv.variable, "stale-timestamp update rejected");
                continue;
            }
            let previous = if entry.vtq.time.is_empty() {
                None
            } else {
                Some(entry.vtq.clone())
            };
            entry.vtq = vv.vtq.clone();
            changes.push(VarChange {
                variable: vv.variable.clone(),
                previous,
                current: vv.vtq.clone(),
            });
        }
        changes
    }

    /// Reconciles the store with the module's declared object set: values
    /// with an unchanged descriptor survive, new variables are seeded with
    /// their default, removed ones are dropped.
    pub fn sync(&mut self, objects: &[ObjectInfo]) {
        let mut next: HashMap<VariableRef, StoredVariable> = HashMap::new();
        for obj in objects {
            for var in &obj.variables {
                let variable = obj.id.variable(&var.name);
                let vtq = match self.entries.remove(&variable) {
                    Some(existing) if existing.descriptor == *var => existing.vtq,
                    _ => VTQ::empty(var.default_value.clone()),
                };
                next.insert(
                    variable,
                    StoredVariable {
                        vtq,
                        descriptor: var.clone(),
                    },
                );
            }
        }
        self.entries = next;
    }

    /// Current content as a batch, ordered by reference for stable output.
    pub fn snapshot(&self) -> Vec<VariableValue> {
        let mut values: Vec<VariableValue> = self
            .entries
            .iter()
            .map(|(k, v)| VariableValue::new(k.clone(), v.vtq.clone()))
            .collect();
        values.sort_by(|a, b| a.variable.cmp(&b.variable));
        values
    }

    /// Writes the snapshot to `path` via temp file, fsync and rename.
    pub fn flush(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| MediatorError::internal(format!("variables serialize: {e}")))?;

        let mut file = File::create(&tmp)
            .map_err(|e| MediatorError::internal(format!("create {}: {e}", tmp.display())))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| MediatorError::internal(format!("write {}: {e}", tmp.display())))?;
        drop(file);

        fs::rename(&tmp, path)
            .map_err(|e| MediatorError::internal(format!("rename to {}: {e}", path.display())))?;
        Ok(())
    }

    /// Applies a persisted snapshot onto the declared entries. Values for
    /// variables no longer declared are ignored; a missing file is a fresh
    /// store.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(MediatorError::internal(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        let values: Vec<VariableValue> = serde_json::from_slice(&bytes)
            .map_err(|e| MediatorError::internal(format!("variables parse: {e}")))?;
        for vv in values {
            if let Some(entry) = self.entries.get_mut(&vv.variable) {
                entry.vtq = vv.vtq;
            }
        }
        Ok(())
    }
}
