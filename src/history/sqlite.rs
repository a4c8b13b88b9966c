//! SQLite-backed channel store for one historian database.
//!
//! All access happens on the owning worker thread; the connection is never
//! shared. Every channel (one per variable) has a row in `channel_defs` and
//! its own data table; creating both is atomic with the appends that first
//! reference the channel.

use super::{BoundingMethod, ModifyMode, QualityFilter};
use crate::error::{MediatorError, Result};
use crate::values::{Quality, Timestamp, VariableRef, VariableValue, VTQ, VTTQ};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

struct Channel {
    table: String,
}

pub struct SqliteStore {
    conn: Connection,
    channels: HashMap<VariableRef, Channel>,
    table_names: HashSet<String>,
}

impl SqliteStore {
    pub fn open(file: &str) -> Result<SqliteStore> {
        let conn = Connection::open(file)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS channel_defs (
                obj TEXT NOT NULL,
                var TEXT NOT NULL,
                type TEXT NOT NULL,
                table_name TEXT NOT NULL UNIQUE,
                PRIMARY KEY (obj, var))",
            [],
        )?;

        let mut store = SqliteStore {
            conn,
            channels: HashMap::new(),
            table_names: HashSet::new(),
        };
        store.load_channels()?;
        info!(file, channels = store.channels.len(), "historian database open");
        Ok(store)
    }

    fn load_channels(&mut self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT obj, var, table_name FROM channel_defs")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (obj, var, table) = row?;
            let object: crate::values::ObjectRef = obj
                .parse()
                .map_err(|e: String| MediatorError::internal(e))?;
            self.table_names.insert(table.clone());
            self.channels.insert(object.variable(var), Channel { table });
        }
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Looks up the channel for `variable`, creating its index row and data
    /// table inside `tx` when missing. Newly created channels are recorded
    /// in `created` and folded into the cache after commit.
    fn channel_table(
        tx: &rusqlite::Transaction<'_>,
        channels: &HashMap<VariableRef, Channel>,
        table_names: &HashSet<String>,
        created: &mut Vec<(VariableRef, String)>,
        variable: &VariableRef,
    ) -> Result<String> {
        if let Some(ch) = channels.get(variable) {
            return Ok(ch.table.clone());
        }
        if let Some((_, t)) = created.iter().find(|(v, _)| v == variable) {
            return Ok(t.clone());
        }

        let name = derive_table_name(variable, |candidate| {
            table_names.contains(candidate) || created.iter().any(|(_, t)| t == candidate)
        });
        tx.execute(
            "INSERT OR IGNORE INTO channel_defs (obj, var, type, table_name)
             VALUES (?1, ?2, ?3, ?4)",
            params![variable.object.to_string(), variable.name, "Json", name],
        )?;
        tx.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (
                    time INTEGER PRIMARY KEY,
                    diffDB INTEGER,
                    quality INTEGER,
                    data TEXT)"
            ),
            [],
        )?;
        debug!(variable = %variable, table = %name, "channel created");
        created.push((variable.clone(), name.clone()));
        Ok(name)
    }

    fn adopt_created(&mut self, created: Vec<(VariableRef, String)>) {
        for (variable, table) in created {
            self.table_names.insert(table.clone());
            self.channels.insert(variable, Channel { table });
        }
    }

    /// Appends a batch inside one transaction, creating missing channels in
    /// the same transaction. Returns per-value error strings (empty entries
    /// mean success); a transaction-level failure fails the whole batch.
    pub fn append_batch(&mut self, values: &[VariableValue]) -> Result<Vec<String>> {
        let now = Timestamp::now();
        let mut errors = vec![String::new(); values.len()];
        let mut created: Vec<(VariableRef, String)> = Vec::new();

        {
            let SqliteStore {
                conn,
                channels,
                table_names,
            } = self;
            let tx = conn.transaction()?;

            for (i, vv) in values.iter().enumerate() {
                let table =
                    Self::channel_table(&tx, channels, table_names, &mut created, &vv.variable)?;
                let data = match serde_json::to_string(&vv.vtq.value) {
                    Ok(d) => d,
                    Err(e) => {
                        errors[i] = format!("{}: {e}", vv.variable);
                        continue;
                    }
                };
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO \"{table}\" (time, diffDB, quality, data)
                         VALUES (?1, ?2, ?3, ?4)"
                    ),
                    params![
                        vv.vtq.time.millis(),
                        now.millis() - vv.vtq.time.millis(),
                        vv.vtq.quality.to_db(),
                        data
                    ],
                )?;
            }
            tx.commit()?;
        }

        self.adopt_created(created);
        Ok(errors)
    }

    fn filter_clause(filter: QualityFilter) -> &'static str {
        match filter {
            QualityFilter::ExcludeNone => "",
            QualityFilter::ExcludeBad => " AND quality >= 1",
            QualityFilter::ExcludeNonGood => " AND quality = 2",
        }
    }

    /// Range read in ascending time order, reduced to at most `max_values`
    /// rows by the bounding method.
    pub fn read_raw(
        &self,
        variable: &VariableRef,
        start: Timestamp,
        end: Timestamp,
        max_values: usize,
        bounding: BoundingMethod,
        filter: QualityFilter,
    ) -> Result<Vec<VTTQ>> {
        if max_values == 0 {
            return Ok(Vec::new());
        }
        let Some(channel) = self.channels.get(variable) else {
            return Ok(Vec::new());
        };

        let base = format!(
            "SELECT time, diffDB, quality, data FROM \"{}\"
             WHERE time >= ?1 AND time <= ?2{}",
            channel.table,
            Self::filter_clause(filter)
        );
        // SQLite LIMIT operands must fit a signed 64-bit integer.
        let limit = max_values.min(i64::MAX as usize);
        let sql = match bounding {
            BoundingMethod::TakeFirstN => format!("{base} ORDER BY time ASC LIMIT {limit}"),
            BoundingMethod::TakeLastN => format!("{base} ORDER BY time DESC LIMIT {limit}"),
            BoundingMethod::CompressToN => format!("{base} ORDER BY time ASC"),
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![start.millis(), end.millis()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (time, diff_db, quality, data) = row?;
            let value = serde_json::from_str(&data)
                .map_err(|e| MediatorError::internal(format!("corrupt value at {time}: {e}")))?;
            result.push(VTTQ {
                value,
                time: Timestamp::from_millis(time),
                time_db: Timestamp::from_millis(time + diff_db),
                quality: Quality::from_db(quality),
            });
        }

        match bounding {
            BoundingMethod::TakeFirstN => {}
            BoundingMethod::TakeLastN => result.reverse(),
            BoundingMethod::CompressToN => result = compress_to_n(result, max_values),
        }
        Ok(result)
    }

    pub fn count(
        &self,
        variable: &VariableRef,
        start: Timestamp,
        end: Timestamp,
        filter: QualityFilter,
    ) -> Result<i64> {
        let Some(channel) = self.channels.get(variable) else {
            return Ok(0);
        };
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE time >= ?1 AND time <= ?2{}",
            channel.table,
            Self::filter_clause(filter)
        );
        let count =
            self.conn
                .query_row(&sql, params![start.millis(), end.millis()], |row| {
                    row.get::<_, i64>(0)
                })?;
        Ok(count)
    }

    /// Deletes all rows in the closed interval; returns the number removed.
    pub fn delete_interval(
        &self,
        variable: &VariableRef,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<i64> {
        let Some(channel) = self.channels.get(variable) else {
            return Ok(0);
        };
        let deleted = self.conn.execute(
            &format!("DELETE FROM \"{}\" WHERE time >= ?1 AND time <= ?2", channel.table),
            params![start.millis(), end.millis()],
        )?;
        Ok(deleted as i64)
    }

    /// Latest database insertion timestamp over the channel, if any.
    pub fn latest_timestamp_db(&self, variable: &VariableRef) -> Result<Option<Timestamp>> {
        let Some(channel) = self.channels.get(variable) else {
            return Ok(None);
        };
        let latest = self
            .conn
            .query_row(
                &format!("SELECT MAX(time + diffDB) FROM \"{}\"", channel.table),
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(latest.map(Timestamp::from_millis))
    }

    /// Targeted modification of historian rows. Transactional: precondition
    /// violations roll back the entire call. Missing channels are created
    /// within the same transaction.
    pub fn modify(
        &mut self,
        variable: &VariableRef,
        mode: ModifyMode,
        data: &[VTQ],
    ) -> Result<()> {
        let now = Timestamp::now();
        let mut created: Vec<(VariableRef, String)> = Vec::new();

        let SqliteStore {
            conn,
            channels,
            table_names,
        } = self;
        let tx = conn.transaction()?;
        let table = Self::channel_table(&tx, channels, table_names, &mut created, variable)?;
        match mode {
            ModifyMode::Insert | ModifyMode::Update => {
                for vtq in data {
                    let exists = tx
                        .query_row(
                            &format!("SELECT 1 FROM \"{table}\" WHERE time = ?1"),
                            params![vtq.time.millis()],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();
                    if mode == ModifyMode::Insert && exists {
                        return Err(MediatorError::Conflict(format!(
                            "timestamp {} already exists for '{variable}'",
                            vtq.time
                        )));
                    }
                    if mode == ModifyMode::Update && !exists {
                        return Err(MediatorError::Conflict(format!(
                            "timestamp {} missing for '{variable}'",
                            vtq.time
                        )));
                    }
                }
                for vtq in data {
                    insert_row(&tx, &table, vtq, now)?;
                }
            }
            ModifyMode::Upsert => {
                for vtq in data {
                    insert_row(&tx, &table, vtq, now)?;
                }
            }
            ModifyMode::ReplaceAll => {
                tx.execute(&format!("DELETE FROM \"{table}\""), [])?;
                for vtq in data {
                    insert_row(&tx, &table, vtq, now)?;
                }
            }
            ModifyMode::Delete => {
                for vtq in data {
                    tx.execute(
                        &format!("DELETE FROM \"{table}\" WHERE time = ?1"),
                        params![vtq.time.millis()],
                    )?;
                }
            }
        }
        tx.commit()?;
        self.adopt_created(created);
        Ok(())
    }

    /// Drops the channels of the given variables entirely (index rows and
    /// data tables) in one transaction.
    pub fn delete_variables(&mut self, variables: &[VariableRef]) -> Result<()> {
        {
            let SqliteStore { conn, channels, .. } = self;
            let tx = conn.transaction()?;
            for variable in variables {
                if let Some(channel) = channels.get(variable) {
                    tx.execute(&format!("DROP TABLE IF EXISTS \"{}\"", channel.table), [])?;
                    tx.execute(
                        "DELETE FROM channel_defs WHERE obj = ?1 AND var = ?2",
                        params![variable.object.to_string(), variable.name],
                    )?;
                }
            }
            tx.commit()?;
        }
        for variable in variables {
            if let Some(channel) = self.channels.remove(variable) {
                self.table_names.remove(&channel.table);
            }
        }
        Ok(())
    }
}

/// Table name for a new channel: the sanitized `obj`/`var` pair, suffixed
/// on collision. The mapping is persisted in `channel_defs`, so later
/// renames never orphan a data table.
fn derive_table_name(variable: &VariableRef, taken: impl Fn(&str) -> bool) -> String {
    let sanitize = |s: &str| {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>()
    };
    let mut base = format!(
        "ch_{}_{}",
        sanitize(&variable.object.to_string()),
        sanitize(&variable.name)
    );
    base.truncate(56);
    let mut name = base.clone();
    let mut suffix = 2;
    while taken(&name) {
        name = format!("{base}_{suffix}");
        suffix += 1;
    }
    name
}

fn insert_row(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    vtq: &VTQ,
    now: Timestamp,
) -> Result<()> {
    let data = serde_json::to_string(&vtq.value)
        .map_err(|e| MediatorError::internal(format!("value serialize: {e}")))?;
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO \"{table}\" (time, diffDB, quality, data)
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![
            vtq.time.millis(),
            now.millis() - vtq.time.millis(),
            vtq.quality.to_db(),
            data
        ],
    )?;
    Ok(())
}

/// Uniform downsampling without interpolation: keeps at most `max` of the
/// source rows, always retaining the last one. Fewer source rows than `max`
/// pass through unchanged.
fn compress_to_n(rows: Vec<VTTQ>, max: usize) -> Vec<VTTQ> {
    if rows.len() <= max {
        return rows;
    }
    if max == 1 {
        let last = rows.into_iter().next_back();
        return last.into_iter().collect();
    }
    let len = rows.len();
    let mut kept: Vec<VTTQ> = Vec::with_capacity(max);
    for i in 0..max {
        let idx = i * (len - 1) / (max - 1);
        kept.push(rows[idx].clone());
    }
    kept.dedup_by(|a, b| a.time == b.time);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::ObjectRef;
    use serde_json::json;

    fn var(name: &str) -> VariableRef {
        ObjectRef::new("io", "dev").variable(name)
    }

    fn value(v: &VariableRef, x: f64, t: i64) -> VariableValue {
        VariableValue::new(v.clone(), VTQ::good(json!(x), Timestamp::from_millis(t)))
    }

    fn open_store() -> SqliteStore {
        SqliteStore::open(":memory:").unwrap()
    }

    #[test]
    fn append_creates_channel_and_preserves_order() {
        let mut store = open_store();
        let v = var("Temp");
        let errors = store
            .append_batch(&[value(&v, 1.0, 100), value(&v, 2.0, 200)])
            .unwrap();
        assert!(errors.iter().all(String::is_empty));
        assert_eq!(store.channel_count(), 1);

        let rows = store
            .read_raw(
                &v,
                Timestamp::EMPTY,
                Timestamp::MAX,
                usize::MAX,
                BoundingMethod::TakeFirstN,
                QualityFilter::ExcludeNone,
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].time < rows[1].time);
        assert_eq!(rows[0].value, json!(1.0));
        assert!(rows[0].time_db >= rows[0].time);
    }

    #[test]
    fn two_variables_get_distinct_tables() {
        let mut store = open_store();
        store
            .append_batch(&[value(&var("A"), 1.0, 1), value(&var("B"), 2.0, 1)])
            .unwrap();
        assert_eq!(store.channel_count(), 2);
        assert_eq!(
            store
                .count(&var("A"), Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone)
                .unwrap(),
            1
        );
    }

    #[test]
    fn channels_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hist.db");
        let path = file.to_str().unwrap();

        let v = var("Temp");
        {
            let mut store = SqliteStore::open(path).unwrap();
            store.append_batch(&[value(&v, 1.5, 10)]).unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        assert_eq!(store.channel_count(), 1);
        let rows = store
            .read_raw(
                &v,
                Timestamp::EMPTY,
                Timestamp::MAX,
                10,
                BoundingMethod::TakeFirstN,
                QualityFilter::ExcludeNone,
            )
            .unwrap();
        assert_eq!(rows[0].value, json!(1.5));
    }

    #[test]
    fn read_raw_bounding_methods() {
        let mut store = open_store();
        let v = var("Temp");
        let batch: Vec<VariableValue> =
            (0..10).map(|i| value(&v, i as f64, i * 10)).collect();
        store.append_batch(&batch).unwrap();

        let first = store
            .read_raw(&v, Timestamp::EMPTY, Timestamp::MAX, 3,
                BoundingMethod::TakeFirstN, QualityFilter::ExcludeNone)
            .unwrap();
        assert_eq!(first.iter().map(|r| r.time.millis()).collect::<Vec<_>>(), vec![0, 10, 20]);

        let last = store
            .read_raw(&v, Timestamp::EMPTY, Timestamp::MAX, 3,
                BoundingMethod::TakeLastN, QualityFilter::ExcludeNone)
            .unwrap();
        assert_eq!(last.iter().map(|r| r.time.millis()).collect::<Vec<_>>(), vec![70, 80, 90]);

        let compressed = store
            .read_raw(&v, Timestamp::EMPTY, Timestamp::MAX, 4,
                BoundingMethod::CompressToN, QualityFilter::ExcludeNone)
            .unwrap();
        assert!(compressed.len() <= 4);
        assert_eq!(compressed.first().unwrap().time.millis(), 0);
        assert_eq!(compressed.last().unwrap().time.millis(), 90);
    }

    #[test]
    fn compress_with_fewer_rows_passes_through() {
        let mut store = open_store();
        let v = var("Temp");
        store.append_batch(&[value(&v, 1.0, 1), value(&v, 2.0, 2)]).unwrap();
        let rows = store
            .read_raw(&v, Timestamp::EMPTY, Timestamp::MAX, 10,
                BoundingMethod::CompressToN, QualityFilter::ExcludeNone)
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn max_values_zero_is_empty_not_error() {
        let mut store = open_store();
        let v = var("Temp");
        store.append_batch(&[value(&v, 1.0, 1)]).unwrap();
        let rows = store
            .read_raw(&v, Timestamp::EMPTY, Timestamp::MAX, 0,
                BoundingMethod::TakeFirstN, QualityFilter::ExcludeNone)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn quality_filters() {
        let mut store = open_store();
        let v = var("Temp");
        store
            .append_batch(&[
                VariableValue::new(v.clone(), VTQ::new(json!(1), Timestamp::from_millis(1), Quality::Bad)),
                VariableValue::new(v.clone(), VTQ::new(json!(2), Timestamp::from_millis(2), Quality::Uncertain)),
                VariableValue::new(v.clone(), VTQ::new(json!(3), Timestamp::from_millis(3), Quality::Good)),
            ])
            .unwrap();

        let all = store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone).unwrap();
        let not_bad = store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeBad).unwrap();
        let good = store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNonGood).unwrap();
        assert_eq!((all, not_bad, good), (3, 2, 1));
    }

    #[test]
    fn modify_insert_conflicts_on_duplicate() {
        let mut store = open_store();
        let v = var("Temp");
        store
            .modify(&v, ModifyMode::Insert, &[VTQ::good(json!(1), Timestamp::from_millis(5))])
            .unwrap();

        let err = store
            .modify(
                &v,
                ModifyMode::Insert,
                &[
                    VTQ::good(json!(9), Timestamp::from_millis(6)),
                    VTQ::good(json!(2), Timestamp::from_millis(5)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, MediatorError::Conflict(_)));

        // No partial insertion: timestamp 6 must not exist.
        assert_eq!(
            store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone).unwrap(),
            1
        );
    }

    #[test]
    fn modify_update_requires_existing() {
        let mut store = open_store();
        let v = var("Temp");
        let err = store
            .modify(&v, ModifyMode::Update, &[VTQ::good(json!(1), Timestamp::from_millis(5))])
            .unwrap_err();
        assert!(matches!(err, MediatorError::Conflict(_)));
    }

    #[test]
    fn modify_upsert_replaces_by_timestamp() {
        let mut store = open_store();
        let v = var("Temp");
        let t = Timestamp::from_millis(5);
        store.modify(&v, ModifyMode::Upsert, &[VTQ::good(json!("x"), t)]).unwrap();
        store.modify(&v, ModifyMode::Upsert, &[VTQ::good(json!("y"), t)]).unwrap();

        let rows = store
            .read_raw(&v, Timestamp::EMPTY, Timestamp::MAX, 10,
                BoundingMethod::TakeFirstN, QualityFilter::ExcludeNone)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, json!("y"));
    }

    #[test]
    fn modify_replace_all_and_delete() {
        let mut store = open_store();
        let v = var("Temp");
        store
            .append_batch(&[value(&v, 1.0, 1), value(&v, 2.0, 2), value(&v, 3.0, 3)])
            .unwrap();

        store
            .modify(&v, ModifyMode::ReplaceAll, &[VTQ::good(json!(9.0), Timestamp::from_millis(7))])
            .unwrap();
        assert_eq!(
            store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone).unwrap(),
            1
        );

        store
            .modify(&v, ModifyMode::Delete, &[VTQ::good(json!(0), Timestamp::from_millis(7))])
            .unwrap();
        assert_eq!(
            store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone).unwrap(),
            0
        );
    }

    #[test]
    fn delete_interval_and_latest_db_timestamp() {
        let mut store = open_store();
        let v = var("Temp");
        let batch: Vec<VariableValue> = (1..=5).map(|i| value(&v, i as f64, i * 100)).collect();
        store.append_batch(&batch).unwrap();

        assert!(store.latest_timestamp_db(&v).unwrap().is_some());

        let deleted = store
            .delete_interval(&v, Timestamp::from_millis(200), Timestamp::from_millis(400))
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(
            store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone).unwrap(),
            2
        );
    }

    #[test]
    fn delete_variables_drops_channel() {
        let mut store = open_store();
        let v = var("Temp");
        store.append_batch(&[value(&v, 1.0, 1)]).unwrap();
        store.delete_variables(&[v.clone()]).unwrap();
        assert_eq!(store.channel_count(), 0);
        assert_eq!(
            store.count(&v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone).unwrap(),
            0
        );
    }

    #[test]
    fn latest_timestamp_of_unknown_variable_is_none() {
        let store = open_store();
        assert!(store.latest_timestamp_db(&var("Nope")).unwrap().is_none());
    }
}
