//! Value primitives shared by every other component.
//!
//! The fundamental observation record is the [`VTQ`] (value, timestamp,
//! quality). The historian extends it to a [`VTTQ`] by adding the database
//! insertion timestamp. Variables are addressed by [`VariableRef`], which
//! nests an [`ObjectRef`]; both have a canonical text encoding
//! (`module:object` and `module:object.name`) used on the wire, in logs and
//! as the historian channel key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch.
///
/// `EMPTY` (zero) and `MAX` act as sentinels for unbounded range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EMPTY: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub fn now() -> Timestamp {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Timestamp {
        Timestamp(ms)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Saturating addition, clamped to the sentinel range.
    pub fn add_millis(&self, ms: i64) -> Timestamp {
        Timestamp(self.0.saturating_add(ms).max(0))
    }

    pub fn sub_millis(&self, ms: i64) -> Timestamp {
        self.add_millis(-ms)
    }

    pub fn checked_add(&self, ms: i64) -> Option<Timestamp> {
        let v = self.0.checked_add(ms)?;
        (v >= 0).then_some(Timestamp(v))
    }

    /// Absolute distance to another timestamp in milliseconds.
    pub fn abs_diff_millis(&self, other: Timestamp) -> i64 {
        (self.0 - other.0).abs()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Timestamp::EMPTY {
            return write!(f, "Empty");
        }
        if *self == Timestamp::MAX {
            return write!(f, "Max");
        }
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{} ms", self.0),
        }
    }
}

/// Quality of an observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quality {
    Bad,
    Uncertain,
    Good,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, Quality::Bad)
    }

    pub fn is_not_bad(&self) -> bool {
        !self.is_bad()
    }

    /// Integer encoding used in the historian data tables.
    pub fn to_db(self) -> i64 {
        match self {
            Quality::Bad => 0,
            Quality::Uncertain => 1,
            Quality::Good => 2,
        }
    }

    pub fn from_db(v: i64) -> Quality {
        match v {
            2 => Quality::Good,
            1 => Quality::Uncertain,
            _ => Quality::Bad,
        }
    }
}

/// Variable payloads are JSON values; structural equality is JSON equality.
pub type DataValue = serde_json::Value;

/// Serde representation for [`DataValue`] fields that must survive the
/// binary codec: human-readable formats keep native JSON, non-human-readable
/// ones (bincode) carry the JSON text, since self-describing values cannot
/// be decoded there.
pub mod json_value {
    use super::DataValue;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &DataValue, ser: S) -> Result<S::Ok, S::Error> {
        if ser.is_human_readable() {
            value.serialize(ser)
        } else {
            ser.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DataValue, D::Error> {
        if de.is_human_readable() {
            DataValue::deserialize(de)
        } else {
            let text = String::deserialize(de)?;
            serde_json::from_str(&text).map_err(serde::de::Error::custom)
        }
    }
}

/// Value with timestamp and quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VTQ {
    #[serde(with = "json_value")]
    pub value: DataValue,
    pub time: Timestamp,
    pub quality: Quality,
}

impl VTQ {
    pub fn new(value: DataValue, time: Timestamp, quality: Quality) -> VTQ {
        VTQ {
            value,
            time,
            quality,
        }
    }

    pub fn good(value: DataValue, time: Timestamp) -> VTQ {
        VTQ::new(value, time, Quality::Good)
    }

    /// Placeholder for a variable that has never produced a value.
    pub fn empty(default: DataValue) -> VTQ {
        VTQ::new(default, Timestamp::EMPTY, Quality::Bad)
    }
}

/// A `VTQ` extended with the database insertion timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VTTQ {
    #[serde(with = "json_value")]
    pub value: DataValue,
    pub time: Timestamp,
    pub time_db: Timestamp,
    pub quality: Quality,
}

impl VTTQ {
    pub fn from_vtq(vtq: VTQ, time_db: Timestamp) -> VTTQ {
        VTTQ {
            value: vtq.value,
            time: vtq.time,
            time_db,
            quality: vtq.quality,
        }
    }
}

impl From<VTTQ> for VTQ {
    fn from(v: VTTQ) -> VTQ {
        VTQ::new(v.value, v.time, v.quality)
    }
}

/// Globally identifies a configured object: `module:object`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub module: String,
    pub object: String,
}

impl ObjectRef {
    pub fn new(module: impl Into<String>, object: impl Into<String>) -> ObjectRef {
        ObjectRef {
            module: module.into(),
            object: object.into(),
        }
    }

    pub fn variable(&self, name: impl Into<String>) -> VariableRef {
        VariableRef {
            object: self.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.object)
    }
}

impl FromStr for ObjectRef {
    type Err = String;

    fn from_str(s: &str) -> Result<ObjectRef, String> {
        let (module, object) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid object reference '{s}': missing ':'"))?;
        if module.is_empty() || object.is_empty() {
            return Err(format!("invalid object reference '{s}'"));
        }
        Ok(ObjectRef::new(module, object))
    }
}

/// Identifies a variable on an object: `module:object.name`.
///
/// The variable name is everything after the last `.`; object ids may
/// themselves contain dots, variable names may not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableRef {
    pub object: ObjectRef,
    pub name: String,
}

impl VariableRef {
    pub fn new(object: ObjectRef, name: impl Into<String>) -> VariableRef {
        VariableRef {
            object,
            name: name.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.object.module
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.name)
    }
}

impl FromStr for VariableRef {
    type Err = String;

    fn from_str(s: &str) -> Result<VariableRef, String> {
        let (object, name) = s
            .rsplit_once('.')
            .ok_or_else(|| format!("invalid variable reference '{s}': missing '.'"))?;
        if name.is_empty() {
            return Err(format!("invalid variable reference '{s}': empty name"));
        }
        Ok(VariableRef {
            object: object.parse()?,
            name: name.to_string(),
        })
    }
}

// Both reference types travel as their canonical string form in JSON and
// the binary codec.
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                let s = String::deserialize(de)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(ObjectRef);
string_serde!(VariableRef);

/// The unit of every write and change-notification batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    pub variable: VariableRef,
    pub vtq: VTQ,
}

impl VariableValue {
    pub fn new(variable: VariableRef, vtq: VTQ) -> VariableValue {
        VariableValue { variable, vtq }
    }
}

/// Result entry of a variable-store update: previous and current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarChange {
    pub variable: VariableRef,
    pub previous: Option<VTQ>,
    pub current: VTQ,
}

/// Interval of history touched by a committed append or modify batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryChange {
    pub variable: VariableRef,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Severity of an alarm or event. Ordered so that subscriptions can filter
/// with a minimum severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Info,
    Warning,
    Alarm,
}

/// An entry of the alarm/event stream, either module-reported or
/// supervisor-generated (`SysStartup`, `ModuleRestart`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmOrEvent {
    pub module_id: String,
    pub time: Timestamp,
    pub severity: Severity,
    pub event_type: String,
    pub message: String,
}

impl AlarmOrEvent {
    pub fn new(
        module_id: impl Into<String>,
        severity: Severity,
        event_type: impl Into<String>,
        message: impl Into<String>,
    ) -> AlarmOrEvent {
        AlarmOrEvent {
            module_id: module_id.into(),
            time: Timestamp::now(),
            severity,
            event_type: event_type.into(),
            message: message.into(),
        }
    }
}
