//! Built-in signal simulator module.
//!
//! Generates a periodic signal (sine or ramp) on one object so that a
//! default configuration produces live variable traffic without hardware.

use super::{
    ConfigPatch, DataType, Module, ModuleConfig, ModuleContext, ObjectInfo, VarReadResult,
    VarWriteResult, VariableInfo,
};
use crate::values::{DataValue, ObjectRef, Timestamp, VariableRef, VariableValue, VTQ};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const OBJECT_ID: &str = "Signal";
const VAR_VALUE: &str = "Value";
const VAR_PERIOD: &str = "Period";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Shape {
    Sine,
    Ramp,
}

pub struct Simulator {
    ctx: Option<ModuleContext>,
    shape: Shape,
    period_ms: u64,
    amplitude: f64,
    cycle: u64,
    steps_per_period: u64,
}

impl Simulator {
    pub fn new() -> Simulator {
        Simulator {
            ctx: None,
            shape: Shape::Sine,
            period_ms: 1_000,
            amplitude: 1.0,
            cycle: 0,
            steps_per_period: 20,
        }
    }

    fn object_ref(&self) -> ObjectRef {
        let module = self.ctx.as_ref().map(|c| c.module_id()).unwrap_or("sim");
        ObjectRef::new(module, OBJECT_ID)
    }

    fn value_ref(&self) -> VariableRef {
        self.object_ref().variable(VAR_VALUE)
    }

    fn current_value(&self) -> f64 {
        let phase = (self.cycle % self.steps_per_period) as f64 / self.steps_per_period as f64;
        match self.shape {
            Shape::Sine => self.amplitude * (phase * std::f64::consts::TAU).sin(),
            Shape::Ramp => self.amplitude * phase,
        }
    }

    fn objects(&self) -> Vec<ObjectInfo> {
        let id = self.object_ref();
        let mut members = HashMap::new();
        members.insert("Shape".to_string(), json!(match self.shape {
            Shape::Sine => "sine",
            Shape::Ramp => "ramp",
        }));
        members.insert("Amplitude".to_string(), json!(self.amplitude));
        vec![ObjectInfo {
            id: id.clone(),
            name: OBJECT_ID.to_string(),
            type_name: "SignalGenerator".to_string(),
            parent: None,
            location: None,
            variables: vec![
                VariableInfo::new(VAR_VALUE, DataType::Float64, json!(0.0)).with_history(),
                VariableInfo::new(VAR_PERIOD, DataType::Int64, json!(1_000)),
            ],
            members,
        }]
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for Simulator {
    async fn init(
        &mut self,
        ctx: ModuleContext,
        config: ModuleConfig,
    ) -> Result<Vec<ObjectInfo>> {
        if let Some(v) = config.get("period_ms").and_then(|v| v.as_u64()) {
            if v == 0 {
                bail!("period_ms must be positive");
            }
            self.period_ms = v;
        }
        if let Some(v) = config.get("amplitude").and_then(|v| v.as_f64()) {
            self.amplitude = v;
        }
        if let Some(v) = config.get("shape").and_then(|v| v.as_str()) {
            self.shape = match v {
                "sine" => Shape::Sine,
                "ramp" => Shape::Ramp,
                other => bail!("unknown shape '{other}'"),
            };
        }
        self.ctx = Some(ctx);
        Ok(self.objects())
    }

    async fn run_cycle(&mut self) -> Result<Duration> {
        self.cycle = self.cycle.wrapping_add(1);
        let value = self.current_value();
        if let Some(ctx) = &self.ctx {
            ctx.notify_variable_values_changed(vec![VariableValue::new(
                self.value_ref(),
                VTQ::good(json!(value), Timestamp::now()),
            )]);
        }
        Ok(Duration::from_millis(
            self.period_ms / self.steps_per_period.max(1),
        ))
    }

    async fn write_variables(&mut self, values: Vec<VariableValue>) -> VarWriteResult {
        let mut result = VarWriteResult::ok();
        let mut changed = Vec::new();
        for vv in values {
            if vv.variable.object != self.object_ref() {
                result.failed.push(super::FailedVariable::new(
                    vv.variable,
                    "unknown object",
                ));
                continue;
            }
            let name = vv.variable.name.clone();
            match name.as_str() {
                VAR_PERIOD => match vv.vtq.value.as_u64() {
                    Some(ms) if ms > 0 => {
                        self.period_ms = ms;
                        changed.push(vv);
                    }
                    _ => result.failed.push(super::FailedVariable::new(
                        vv.variable,
                        "Period must be a positive integer",
                    )),
                },
                VAR_VALUE => result.failed.push(super::FailedVariable::new(
                    vv.variable,
                    "Value is read-only",
                )),
                _ => result
                    .failed
                    .push(super::FailedVariable::new(vv.variable, "unknown variable")),
            }
        }
        if let (Some(ctx), false) = (&self.ctx, changed.is_empty()) {
            ctx.notify_variable_values_changed(changed);
        }
        result
    }

    async fn read_variables(&mut self, refs: Vec<VariableRef>) -> VarReadResult {
        let mut result = VarReadResult::default();
        let now = Timestamp::now();
        for r in refs {
            let known = r.object == self.object_ref();
            let value = if known && r.name == VAR_VALUE {
                json!(self.current_value())
            } else if known && r.name == VAR_PERIOD {
                json!(self.period_ms)
            } else {
                result
                    .failed
                    .push(super::FailedVariable::new(r, "unknown variable"));
                continue;
            };
            result.values.push(VariableValue::new(r, VTQ::good(value, now)));
        }
        result
    }

    async fn update_config(&mut self, patch: ConfigPatch) -> Result<Vec<ObjectInfo>> {
        for m in &patch.update_or_delete_members {
            if m.object != self.object_ref() {
                bail!("unknown object '{}'", m.object);
            }
            match (m.member.as_str(), &m.value) {
                ("Amplitude", Some(v)) => {
                    self.amplitude = v
                        .as_f64()
                        .ok_or_else(|| anyhow::anyhow!("Amplitude must be a number"))?;
                }
                ("Shape", Some(v)) => {
                    self.shape = match v.as_str() {
                        Some("sine") => Shape::Sine,
                        Some("ramp") => Shape::Ramp,
                        _ => bail!("Shape must be 'sine' or 'ramp'"),
                    };
                }
                (member, _) => bail!("member '{member}' is not configurable"),
            }
        }
        if !patch.update_or_delete_objects.is_empty() || !patch.add_array_elements.is_empty() {
            bail!("simulator objects cannot be added or removed");
        }
        if let Some(ctx) = &self.ctx {
            ctx.notify_config_changed(vec![self.object_ref()]);
        }
        Ok(self.objects())
    }

    async fn call_method(
        &mut self,
        name: &str,
        _parameters: HashMap<String, String>,
    ) -> Result<DataValue> {
        match name {
            "Reset" => {
                self.cycle = 0;
                Ok(json!(true))
            }
            "GetInfo" => Ok(json!({
                "shape": match self.shape { Shape::Sine => "sine", Shape::Ramp => "ramp" },
                "period_ms": self.period_ms,
                "amplitude": self.amplitude,
            })),
            other => bail!("unknown method '{other}'"),
        }
    }
}
