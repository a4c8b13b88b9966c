//! Module system: the contract every hosted module implements and the
//! runner task that owns a module instance.
//!
//! A module is a pluggable functional unit (data-acquisition driver, calc
//! engine, alarm engine). It declares a forest of objects with typed
//! variables at init time, then produces value changes and alarms while
//! running.
//!
//! # Execution contract
//!
//! Each module instance is owned by exactly one runner task — its
//! single-threaded domain. The supervisor posts operations into the
//! runner's inbox and awaits replies over oneshot channels; the runner
//! interleaves those operations with the module's own `run_cycle` timer.
//! A module is therefore never invoked concurrently on two threads, as a
//! scheduling property of the inbox rather than of any lock.
//!
//! # Notifications
//!
//! Modules talk back through [`ModuleContext`], a one-way handle exposing
//! only the notification calls. Notifications may originate on any thread;
//! they are re-posted onto the supervisor's execution context.

use crate::values::{AlarmOrEvent, DataValue, HistoryChange, VariableRef, VariableValue};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub mod registry;
pub mod sim;

/// Data type of a variable as declared by its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float64,
    String,
    Json,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "Bool",
            DataType::Int64 => "Int64",
            DataType::Float64 => "Float64",
            DataType::String => "String",
            DataType::Json => "Json",
        }
    }
}

/// Descriptor of one variable on an object. Changing any field of a
/// descriptor invalidates the stored value on the next sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "one")]
    pub dimension: u32,
    pub default_value: DataValue,
    /// Whether value changes of this variable are captured by the historian.
    #[serde(default)]
    pub history: bool,
}

fn one() -> u32 {
    1
}

impl VariableInfo {
    pub fn new(name: impl Into<String>, data_type: DataType, default_value: DataValue) -> Self {
        VariableInfo {
            name: name.into(),
            data_type,
            dimension: 1,
            default_value,
            history: false,
        }
    }

    pub fn with_history(mut self) -> Self {
        self.history = true;
        self
    }
}

/// One configured object in a module's object forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: crate::values::ObjectRef,
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub parent: Option<crate::values::ObjectRef>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableInfo>,
    /// Configuration members exposed for browsing (`GetMemberValues`).
    #[serde(default)]
    pub members: HashMap<String, DataValue>,
}

/// Module-specific configuration parameters from the `[modules.config]`
/// table.
pub type ModuleConfig = HashMap<String, DataValue>;

/// A config mutation request (`UpdateConfig`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default)]
    pub update_or_delete_objects: Vec<ObjectPatch>,
    #[serde(default)]
    pub update_or_delete_members: Vec<MemberPatch>,
    #[serde(default)]
    pub add_array_elements: Vec<ArrayElementAdd>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub object: crate::values::ObjectRef,
    /// `None` deletes the object; `Some` replaces its member set.
    pub members: Option<HashMap<String, DataValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberPatch {
    pub object: crate::values::ObjectRef,
    pub member: String,
    /// `None` deletes the member.
    pub value: Option<DataValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayElementAdd {
    pub object: crate::values::ObjectRef,
    pub member: String,
    pub values: Vec<DataValue>,
}

/// Outcome of a device write: per-variable failures, empty when all applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarWriteResult {
    pub failed: Vec<FailedVariable>,
}

impl VarWriteResult {
    pub fn ok() -> VarWriteResult {
        VarWriteResult::default()
    }

    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a device read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarReadResult {
    pub values: Vec<VariableValue>,
    pub failed: Vec<FailedVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedVariable {
    pub variable: VariableRef,
    pub error: String,
}

impl FailedVariable {
    pub fn new(variable: VariableRef, error: impl Into<String>) -> FailedVariable {
        FailedVariable {
            variable,
            error: error.into(),
        }
    }
}

/// Notifications flowing from modules (and the historian manager) onto the
/// supervisor's execution context.
#[derive(Debug)]
pub enum Notification {
    VariableValuesChanged {
        module_id: String,
        values: Vec<VariableValue>,
    },
    ConfigChanged {
        module_id: String,
        objects: Vec<crate::values::ObjectRef>,
    },
    AlarmOrEvent(AlarmOrEvent),
    VarHistoryChanged(Vec<HistoryChange>),
    /// The runner task of a module ended; `error` is set when it failed.
    RunnerFinished {
        module_id: String,
        error: Option<String>,
    },
}

/// The one-way back-reference a module holds onto the supervisor. Only
/// exposes the notification calls; cloning is cheap.
#[derive(Clone)]
pub struct ModuleContext {
    module_id: String,
    tx: mpsc::UnboundedSender<Notification>,
}

impl ModuleContext {
    pub fn new(module_id: impl Into<String>, tx: mpsc::UnboundedSender<Notification>) -> Self {
        ModuleContext {
            module_id: module_id.into(),
            tx,
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn notify_variable_values_changed(&self, values: Vec<VariableValue>) {
        let _ = self.tx.send(Notification::VariableValuesChanged {
            module_id: self.module_id.clone(),
            values,
        });
    }

    pub fn notify_config_changed(&self, objects: Vec<crate::values::ObjectRef>) {
        let _ = self.tx.send(Notification::ConfigChanged {
            module_id: self.module_id.clone(),
            objects,
        });
    }

    pub fn notify_alarm_or_event(&self, event: AlarmOrEvent) {
        let _ = self.tx.send(Notification::AlarmOrEvent(event));
    }
}

/// Contract implemented by every hosted module.
#[async_trait]
pub trait Module: Send {
    /// Initialise and declare the module's object forest. Called once per
    /// instance, before the runner starts.
    async fn init(&mut self, ctx: ModuleContext, config: ModuleConfig)
        -> Result<Vec<ObjectInfo>>;

    /// One iteration of the module's run loop; returns the delay until the
    /// next iteration. An error marks the module as failed and triggers the
    /// restart path.
    async fn run_cycle(&mut self) -> Result<Duration>;

    /// Applies a batch of writes to the underlying device/engine.
    async fn write_variables(&mut self, values: Vec<VariableValue>) -> VarWriteResult;

    /// Reads fresh values from the underlying device/engine (sync reads
    /// bypass the in-memory store).
    async fn read_variables(&mut self, refs: Vec<VariableRef>) -> VarReadResult;

    /// Applies a configuration patch and returns the updated object forest.
    async fn update_config(&mut self, patch: ConfigPatch) -> Result<Vec<ObjectInfo>>;

    /// Invokes a module-defined method.
    async fn call_method(
        &mut self,
        name: &str,
        parameters: HashMap<String, String>,
    ) -> Result<DataValue>;

    /// Releases resources acquired during init. Called on the shutdown path
    /// after the run loop has ended.
    async fn init_abort(&mut self) {}
}

/// Operations posted into a module's inbox by the supervisor. Each variant
/// carries a oneshot responder, mirroring the request/response pattern of
/// the supervisor commands.
#[derive(Debug)]
pub enum ModuleRequest {
    WriteVariables {
        values: Vec<VariableValue>,
        reply: oneshot::Sender<VarWriteResult>,
    },
    ReadVariables {
        refs: Vec<VariableRef>,
        reply: oneshot::Sender<VarReadResult>,
    },
    UpdateConfig {
        patch: ConfigPatch,
        reply: oneshot::Sender<Result<Vec<ObjectInfo>>>,
    },
    CallMethod {
        name: String,
        parameters: HashMap<String, String>,
        reply: oneshot::Sender<Result<DataValue>>,
    },
}

impl ModuleRequest {
    pub fn write_variables(
        values: Vec<VariableValue>,
    ) -> (Self, oneshot::Receiver<VarWriteResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::WriteVariables {
                values,
                reply: tx,
            },
            rx,
        )
    }

    pub fn read_variables(refs: Vec<VariableRef>) -> (Self, oneshot::Receiver<VarReadResult>) {
        let (tx, rx) = oneshot::channel();
        (Self::ReadVariables { refs, reply: tx }, rx)
    }

    pub fn update_config(
        patch: ConfigPatch,
    ) -> (Self, oneshot::Receiver<Result<Vec<ObjectInfo>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::UpdateConfig { patch, reply: tx }, rx)
    }

    pub fn call_method(
        name: String,
        parameters: HashMap<String, String>,
    ) -> (Self, oneshot::Receiver<Result<DataValue>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::CallMethod {
                name,
                parameters,
                reply: tx,
            },
            rx,
        )
    }
}

/// Handle to a running module: its inbox, shutdown token and runner task.
pub struct ModuleHandle {
    pub inbox: mpsc::Sender<ModuleRequest>,
    pub shutdown: CancellationToken,
    pub task: tokio::task::JoinHandle<Result<()>>,
}

/// Inbox capacity per module. Requests beyond this apply backpressure to
/// the posting side.
const INBOX_CAPACITY: usize = 64;

/// Spawns the runner task owning `module`. The runner interleaves inbox
/// operations with the module's `run_cycle` timer until the shutdown token
/// fires or a cycle fails.
pub fn spawn_runner(module: Box<dyn Module>) -> ModuleHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(run_module(module, rx, shutdown.clone()));
    ModuleHandle {
        inbox: tx,
        shutdown,
        task,
    }
}

async fn run_module(
    mut module: Box<dyn Module>,
    mut inbox: mpsc::Receiver<ModuleRequest>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut next_cycle = Duration::from_millis(0);
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                module.init_abort().await;
                return Ok(());
            }

            Some(req) = inbox.recv() => {
                dispatch(module.as_mut(), req).await;
            }

            _ = tokio::time::sleep(next_cycle) => {
                next_cycle = module.run_cycle().await?;
            }
        }
    }
}

async fn dispatch(module: &mut dyn Module, req: ModuleRequest) {
    match req {
        ModuleRequest::WriteVariables { values, reply } => {
            let _ = reply.send(module.write_variables(values).await);
        }
        ModuleRequest::ReadVariables { refs, reply } => {
            let _ = reply.send(module.read_variables(refs).await);
        }
        ModuleRequest::UpdateConfig { patch, reply } => {
            let _ = reply.send(module.update_config(patch).await);
        }
        ModuleRequest::CallMethod {
            name,
            parameters,
            reply,
        } => {
            let _ = reply.send(module.call_method(&name, parameters).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{ObjectRef, VTQ};
    use serde_json::json;

    struct CountingModule {
        cycles: u32,
        fail_at: Option<u32>,
    }

    #[async_trait]
    impl Module for CountingModule {
        async fn init(
            &mut self,
            _ctx: ModuleContext,
            _config: ModuleConfig,
        ) -> Result<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }

        async fn run_cycle(&mut self) -> Result<Duration> {
            self.cycles += 1;
            if Some(self.cycles) == self.fail_at {
                anyhow::bail!("cycle {} failed", self.cycles);
            }
            Ok(Duration::from_millis(1))
        }

        async fn write_variables(&mut self, values: Vec<VariableValue>) -> VarWriteResult {
            VarWriteResult {
                failed: values
                    .into_iter()
                    .map(|v| FailedVariable::new(v.variable, "read-only"))
                    .collect(),
            }
        }

        async fn read_variables(&mut self, refs: Vec<VariableRef>) -> VarReadResult {
            VarReadResult {
                values: refs
                    .into_iter()
                    .map(|r| {
                        VariableValue::new(
                            r,
                            VTQ::good(json!(self.cycles), crate::values::Timestamp::now()),
                        )
                    })
                    .collect(),
                failed: Vec::new(),
            }
        }

        async fn update_config(&mut self, _patch: ConfigPatch) -> Result<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }

        async fn call_method(
            &mut self,
            name: &str,
            _parameters: HashMap<String, String>,
        ) -> Result<DataValue> {
            Ok(json!({ "method": name, "cycles": self.cycles }))
        }
    }

    #[tokio::test]
    async fn runner_stops_on_shutdown_token() {
        let handle = spawn_runner(Box::new(CountingModule {
            cycles: 0,
            fail_at: None,
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown.cancel();
        let result = handle.task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn runner_returns_error_on_failed_cycle() {
        let handle = spawn_runner(Box::new(CountingModule {
            cycles: 0,
            fail_at: Some(3),
        }));
        let result = handle.task.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn inbox_requests_are_answered() {
        let handle = spawn_runner(Box::new(CountingModule {
            cycles: 0,
            fail_at: None,
        }));

        let var = ObjectRef::new("m", "obj").variable("v");
        let (req, rx) = ModuleRequest::read_variables(vec![var.clone()]);
        handle.inbox.send(req).await.unwrap();
        let result = rx.await.unwrap();
        assert_eq!(result.values.len(), 1);
        assert_eq!(result.values[0].variable, var);

        let (req, rx) = ModuleRequest::call_method("Ping".to_string(), HashMap::new());
        handle.inbox.send(req).await.unwrap();
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["method"], json!("Ping"));

        handle.shutdown.cancel();
        handle.task.await.unwrap().unwrap();
    }
}
