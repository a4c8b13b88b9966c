//! Shared fixtures: a controllable test module, settings builders and a
//! session helper acting as the WebSocket pump.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use rust_mediator::auth::AuthManager;
use rust_mediator::config::{HistoryDbSettings, ModuleSettings, Settings, UserSettings};
use rust_mediator::modules::registry::ModuleRegistry;
use rust_mediator::modules::{
    ConfigPatch, DataType, FailedVariable, Module, ModuleConfig, ModuleContext, ObjectInfo,
    VarReadResult, VarWriteResult, VariableInfo,
};
use rust_mediator::network::protocol::EventFrame;
use rust_mediator::supervisor::{SupervisorCommand, SupervisorHandle};
use rust_mediator::values::{
    DataValue, ObjectRef, Timestamp, VariableRef, VariableValue, VTQ,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Behaviour knobs of one test-module instance.
#[derive(Clone, Default)]
pub struct TestBehavior {
    /// Fail `run_cycle` once this cycle count is reached.
    pub fail_on_cycle: Option<u64>,
    /// Delay inside `init`.
    pub init_delay: Duration,
    /// Fail `init` outright.
    pub init_fail: bool,
}

/// Observations shared between the test body and module instances created
/// by the supervisor.
#[derive(Default)]
pub struct Probe {
    /// Module ids in the order their `init` was entered.
    pub init_order: Mutex<Vec<String>>,
    /// Number of instances created per factory.
    pub instances: AtomicU32,
}

pub struct TestModule {
    behavior: TestBehavior,
    probe: Arc<Probe>,
    ctx: Option<ModuleContext>,
    cycles: u64,
    written: HashMap<VariableRef, VTQ>,
}

impl TestModule {
    pub fn new(behavior: TestBehavior, probe: Arc<Probe>) -> TestModule {
        TestModule {
            behavior,
            probe,
            ctx: None,
            cycles: 0,
            written: HashMap::new(),
        }
    }

    fn object_ref(&self) -> ObjectRef {
        let module = self.ctx.as_ref().map(|c| c.module_id()).unwrap_or("test");
        ObjectRef::new(module, "dev")
    }
}

#[async_trait]
impl Module for TestModule {
    async fn init(
        &mut self,
        ctx: ModuleContext,
        _config: ModuleConfig,
    ) -> Result<Vec<ObjectInfo>> {
        self.probe
            .init_order
            .lock()
            .unwrap()
            .push(ctx.module_id().to_string());
        if !self.behavior.init_delay.is_zero() {
            tokio::time::sleep(self.behavior.init_delay).await;
        }
        if self.behavior.init_fail {
            anyhow::bail!("init failure requested");
        }
        self.ctx = Some(ctx);
        let id = self.object_ref();
        Ok(vec![ObjectInfo {
            id: id.clone(),
            name: "dev".to_string(),
            type_name: "TestDevice".to_string(),
            parent: None,
            location: None,
            variables: vec![
                VariableInfo::new("Temp", DataType::Float64, json!(0.0)).with_history(),
                VariableInfo::new("Mode", DataType::String, json!("idle")),
            ],
            members: HashMap::from([("Description".to_string(), json!("test device"))]),
        }])
    }

    async fn run_cycle(&mut self) -> Result<Duration> {
        self.cycles += 1;
        if Some(self.cycles) == self.behavior.fail_on_cycle {
            anyhow::bail!("cycle {} failed as requested", self.cycles);
        }
        Ok(Duration::from_millis(50))
    }

    async fn write_variables(&mut self, values: Vec<VariableValue>) -> VarWriteResult {
        let mut result = VarWriteResult::ok();
        let mut applied = Vec::new();
        for vv in values {
            if vv.variable.object == self.object_ref() {
                self.written.insert(vv.variable.clone(), vv.vtq.clone());
                applied.push(vv);
            } else {
                result
                    .failed
                    .push(FailedVariable::new(vv.variable, "unknown object"));
            }
        }
        // Echo accepted writes back as value changes, like a driver
        // confirming the device state.
        if let (Some(ctx), false) = (&self.ctx, applied.is_empty()) {
            ctx.notify_variable_values_changed(applied);
        }
        result
    }

    async fn read_variables(&mut self, refs: Vec<VariableRef>) -> VarReadResult {
        let mut result = VarReadResult::default();
        for r in refs {
            match self.written.get(&r) {
                Some(vtq) => result.values.push(VariableValue::new(r, vtq.clone())),
                None => result.values.push(VariableValue::new(
                    r,
                    VTQ::good(json!(0.0), Timestamp::now()),
                )),
            }
        }
        result
    }

    async fn update_config(&mut self, _patch: ConfigPatch) -> Result<Vec<ObjectInfo>> {
        anyhow::bail!("test module is not configurable")
    }

    async fn call_method(
        &mut self,
        name: &str,
        parameters: HashMap<String, String>,
    ) -> Result<DataValue> {
        Ok(json!({ "method": name, "parameters": parameters }))
    }
}

/// Registers a test-module factory under `impl_class`, counting instances
/// and applying `behavior` keyed by instance number.
pub fn register_test_module<F>(registry: &mut ModuleRegistry, impl_class: &str, probe: Arc<Probe>, behavior_for: F)
where
    F: Fn(u32) -> TestBehavior + Send + Sync + 'static,
{
    registry.register(impl_class, move || {
        let n = probe.instances.fetch_add(1, Ordering::SeqCst);
        Box::new(TestModule::new(behavior_for(n), probe.clone()))
    });
}

pub fn module_settings(id: &str, impl_class: &str, concurrent_init: bool) -> ModuleSettings {
    ModuleSettings {
        id: id.to_string(),
        name: id.to_string(),
        impl_class: impl_class.to_string(),
        enabled: true,
        concurrent_init,
        password: String::new(),
        variables_file: None,
        history_db: Some("main".to_string()),
        config: HashMap::new(),
    }
}

pub fn base_settings(modules: Vec<ModuleSettings>) -> Settings {
    Settings {
        modules,
        history_dbs: vec![HistoryDbSettings {
            name: "main".to_string(),
            file: ":memory:".to_string(),
            prioritize_reads: true,
        }],
        users: vec![UserSettings {
            login: "op".to_string(),
            password: "secret".to_string(),
            roles: vec!["Operator".to_string()],
        }],
        ..Settings::default()
    }
}

/// Full login handshake; returns an authenticated session id.
pub async fn login(handle: &SupervisorHandle) -> String {
    let resp = handle
        .command(|reply| SupervisorCommand::Login {
            login: "op".to_string(),
            is_module: false,
            reply,
        })
        .await
        .expect("login");
    let hash = AuthManager::compute_digest("secret", resp.challenge, &resp.session);
    handle
        .command(|reply| SupervisorCommand::Authenticate {
            session: resp.session.clone(),
            hash,
            reply,
        })
        .await
        .expect("authenticate");
    resp.session
}

/// Acts as the WebSocket pump: pulls the next event frame and acks it.
pub async fn next_frame(
    handle: &SupervisorHandle,
    session: &str,
    deadline: Duration,
) -> Option<EventFrame> {
    let (tx, rx) = oneshot::channel();
    handle
        .post(SupervisorCommand::WsNext {
            session: session.to_string(),
            reply: tx,
        })
        .await;
    let frame = tokio::time::timeout(deadline, rx).await.ok()?.ok()?;
    handle
        .post(SupervisorCommand::WsAck {
            session: session.to_string(),
        })
        .await;
    Some(frame)
}

/// Polls `check` until it passes or the deadline expires.
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Lifecycle state of one module as reported by `GetModules`.
pub async fn module_state(handle: &SupervisorHandle, session: &str, module_id: &str) -> String {
    handle
        .command(|reply| SupervisorCommand::GetModules {
            session: session.to_string(),
            reply,
        })
        .await
        .expect("GetModules")
        .into_iter()
        .find(|m| m.id == module_id)
        .map(|m| m.state)
        .unwrap_or_default()
}

pub fn test_var(module: &str) -> VariableRef {
    ObjectRef::new(module, "dev").variable("Temp")
}
