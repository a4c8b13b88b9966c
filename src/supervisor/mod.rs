//! Module supervisor: lifecycle state machine, restart-on-failure and the
//! single execution context every shared mutation runs on.
//!
//! The supervisor is an actor: commands arrive over an mpsc channel with
//! oneshot responders, module notifications over a second (unbounded)
//! channel. Module states, variable stores, the object registry, sessions
//! and subscription tables live inside the actor and are mutated nowhere
//! else. Long module operations (init, shutdown) are awaited inline on the
//! actor; request handlers instead receive their reply through a
//! continuation task so the actor never blocks on a module's inbox.

use crate::auth::{AuthManager, LoginUser};
use crate::config::{ModuleSettings, Settings};
use crate::error::{MediatorError, Result};
use crate::history::HistorianManager;
use crate::modules::registry::ModuleRegistry;
use crate::modules::{
    spawn_runner, ConfigPatch, FailedVariable, Module, ModuleContext, ModuleRequest, Notification,
    ObjectInfo, VarWriteResult,
};
use crate::network::protocol::{
    LocationInfo, LoginResponse, MemberValue, MetaInfos, ModuleInfo, ObjectValue, SubOptions,
    TypeMeta, WriteResponse,
};
use crate::network::session::{Session, VarSubscription};
use crate::values::{
    AlarmOrEvent, DataValue, ObjectRef, Severity, VarChange, VariableRef, VariableValue, VTQ,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Watchdog for a module's run task during shutdown and restart.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(10);
/// Delay between a failed run loop and the restart attempt.
const RESTART_DELAY: Duration = Duration::from_secs(1);
/// Main loop tick.
const TICK: Duration = Duration::from_millis(100);
/// Abandonment sweep cadence, in ticks.
const SWEEP_TICKS: u32 = 10;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Lifecycle state of one module. Transitions are monotonic except for the
/// `Running -> (fail) -> Created` loop of the restart path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModuleLifecycle {
    Created,
    InitComplete,
    InitError,
    Running,
    ShutdownStarted,
    ShutdownCompleted,
}

/// Commands posted onto the supervisor's execution context.
pub enum SupervisorCommand {
    // Authentication & session management
    Login {
        login: String,
        is_module: bool,
        reply: Reply<LoginResponse>,
    },
    Authenticate {
        session: String,
        hash: i64,
        reply: Reply<LoginUser>,
    },
    Logout {
        session: String,
        reply: Reply<()>,
    },
    GetLoginUser {
        session: String,
        reply: Reply<LoginUser>,
    },

    // Discovery
    GetModules {
        session: String,
        reply: Reply<Vec<ModuleInfo>>,
    },
    GetLocations {
        session: String,
        reply: Reply<Vec<LocationInfo>>,
    },
    GetMetaInfos {
        session: String,
        module_id: String,
        reply: Reply<MetaInfos>,
    },
    GetAllObjects {
        session: String,
        module_id: String,
        reply: Reply<Vec<ObjectInfo>>,
    },
    GetAllObjectsOfType {
        session: String,
        module_id: String,
        type_name: String,
        reply: Reply<Vec<ObjectInfo>>,
    },
    GetAllObjectsWithVariablesOfType {
        session: String,
        module_id: String,
        type_name: String,
        reply: Reply<Vec<ObjectInfo>>,
    },
    GetObjectsByID {
        session: String,
        objects: Vec<ObjectRef>,
        reply: Reply<Vec<ObjectInfo>>,
    },
    GetObjectValuesByID {
        session: String,
        objects: Vec<ObjectRef>,
        reply: Reply<Vec<ObjectValue>>,
    },
    GetChildrenOfObjects {
        session: String,
        objects: Vec<ObjectRef>,
        reply: Reply<Vec<ObjectInfo>>,
    },
    GetParentOfObject {
        session: String,
        object: ObjectRef,
        reply: Reply<Option<ObjectInfo>>,
    },
    GetRootObject {
        session: String,
        module_id: String,
        reply: Reply<ObjectInfo>,
    },
    GetMemberValues {
        session: String,
        object: ObjectRef,
        members: Vec<String>,
        reply: Reply<Vec<MemberValue>>,
    },

    // Data access
    ReadVariables {
        session: String,
        variables: Vec<VariableRef>,
        reply: Reply<Vec<VTQ>>,
    },
    ReadVariablesIgnoreMissing {
        session: String,
        variables: Vec<VariableRef>,
        reply: Reply<Vec<VariableValue>>,
    },
    ReadVariablesSync {
        session: String,
        variables: Vec<VariableRef>,
        ignore_missing: bool,
        reply: Reply<Vec<VariableValue>>,
    },
    ReadAllVariablesOfObjectTree {
        session: String,
        root: ObjectRef,
        reply: Reply<Vec<VariableValue>>,
    },
    WriteVariables {
        session: String,
        values: Vec<VariableValue>,
        ignore_missing: bool,
        sync: bool,
        reply: Reply<WriteResponse>,
    },

    // Config & methods
    UpdateConfig {
        session: String,
        module_id: String,
        patch: ConfigPatch,
        reply: Reply<()>,
    },
    ApplyConfigObjects {
        module_id: String,
        objects: Vec<ObjectInfo>,
        reply: Reply<()>,
    },
    CallMethod {
        session: String,
        module_id: String,
        method_name: String,
        parameters: HashMap<String, String>,
        reply: Reply<DataValue>,
    },

    // Event subscriptions
    EnableAlarmsAndEvents {
        session: String,
        min_severity: Severity,
        reply: Reply<()>,
    },
    DisableAlarmsAndEvents {
        session: String,
        reply: Reply<()>,
    },
    EnableConfigChangedEvents {
        session: String,
        objects: Vec<ObjectRef>,
        reply: Reply<()>,
    },
    EnableVariableHistoryChangedEvents {
        session: String,
        reply: Reply<()>,
    },
    EnableVariableValueChangedEvents {
        session: String,
        options: SubOptions,
        variables: Vec<VariableRef>,
        roots: Vec<ObjectRef>,
        reply: Reply<()>,
    },
    DisableChangeEvents {
        session: String,
        variables: bool,
        history: bool,
        config: bool,
        reply: Reply<()>,
    },

    // WebSocket pump
    WsBind {
        session: String,
        reply: Reply<()>,
    },
    WsNext {
        session: String,
        reply: oneshot::Sender<crate::network::protocol::EventFrame>,
    },
    WsAck {
        session: String,
    },

    // Internal
    RestartModule {
        module_id: String,
        retry: u32,
    },
}

/// Handle the network layer (and `main`) uses to reach the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    pub historian: HistorianManager,
    starting: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl SupervisorHandle {
    /// Whether module startup is still in progress (503 for most requests).
    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::Acquire)
    }

    /// Requests process-wide shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token fired on process-wide shutdown (listener teardown etc.).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sends a command built around a fresh reply channel and awaits the
    /// result.
    pub async fn command<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SupervisorCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| MediatorError::Connectivity("supervisor stopped".to_string()))?;
        rx.await
            .map_err(|_| MediatorError::internal("supervisor dropped reply"))?
    }

    /// Fire-and-forget post (WebSocket acks, internal commands).
    pub async fn post(&self, cmd: SupervisorCommand) {
        let _ = self.cmd_tx.send(cmd).await;
    }
}

struct RunningModule {
    inbox: mpsc::Sender<ModuleRequest>,
    shutdown: CancellationToken,
    done: oneshot::Receiver<()>,
}

struct ModuleState {
    settings: ModuleSettings,
    lifecycle: ModuleLifecycle,
    last_error: Option<String>,
    is_restarting: bool,
    /// Initialised instance waiting for its runner (between init and start).
    pending: Option<Box<dyn Module>>,
    handle: Option<RunningModule>,
    store: crate::variables::VariableStore,
    objects: Vec<ObjectInfo>,
}

impl ModuleState {
    fn variables_file(&self) -> Option<PathBuf> {
        self.settings.variables_file.as_ref().map(PathBuf::from)
    }
}

pub struct Supervisor {
    settings: Settings,
    registry: ModuleRegistry,
    modules: Vec<ModuleState>,
    sessions: HashMap<String, Session>,
    auth: AuthManager,
    historian: HistorianManager,
    notif_tx: mpsc::UnboundedSender<Notification>,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    starting: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tick_count: u32,
}

/// Spawns the supervisor actor. The returned handle is the only way in;
/// the join handle resolves when the process shuts down.
pub fn spawn(
    settings: Settings,
    registry: ModuleRegistry,
) -> (
    SupervisorHandle,
    tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    let historian = HistorianManager::new(&settings, notif_tx.clone());
    let starting = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();

    let handle = SupervisorHandle {
        cmd_tx: cmd_tx.clone(),
        historian: historian.clone(),
        starting: starting.clone(),
        shutdown: shutdown.clone(),
    };

    let auth = AuthManager::from_settings(&settings);
    let supervisor = Supervisor {
        settings,
        registry,
        modules: Vec::new(),
        sessions: HashMap::new(),
        auth,
        historian,
        notif_tx,
        cmd_tx,
        starting,
        shutdown,
        tick_count: 0,
    };

    let task = tokio::spawn(supervisor.run(cmd_rx, notif_rx));
    (handle, task)
}

impl Supervisor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SupervisorCommand>,
        mut notif_rx: mpsc::UnboundedReceiver<Notification>,
    ) -> anyhow::Result<()> {
        if let Err(e) = self.startup().await {
            error!(error = %e, "startup failed, shutting down");
            self.shutdown_modules().await;
            self.historian.shutdown().await;
            return Err(e);
        }
        self.starting.store(false, Ordering::Release);
        self.write_start_complete_file();
        self.emit_event(AlarmOrEvent::new(
            "",
            Severity::Info,
            "SysStartup",
            "startup complete, all modules initialised",
        ));

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                Some(n) = notif_rx.recv() => self.handle_notification(n),
                _ = tick.tick() => self.on_tick(),
            }
        }

        info!("supervisor shutting down");
        self.shutdown_modules().await;
        self.historian.shutdown().await;
        self.remove_start_complete_file();
        Ok(())
    }

    // -- startup ----------------------------------------------------------

    async fn startup(&mut self) -> anyhow::Result<()> {
        for m in self.settings.modules.clone() {
            if !m.enabled {
                info!(module = %m.id, "module disabled, skipping");
                continue;
            }
            self.modules.push(ModuleState {
                settings: m,
                lifecycle: ModuleLifecycle::Created,
                last_error: None,
                is_restarting: false,
                pending: None,
                handle: None,
                store: crate::variables::VariableStore::new(
                    self.settings.reject_older_timestamps,
                ),
                objects: Vec::new(),
            });
        }

        // Sequential phase: declared order, one at a time.
        let sequential: Vec<usize> = (0..self.modules.len())
            .filter(|&i| !self.modules[i].settings.concurrent_init)
            .collect();
        for idx in sequential {
            let result = self.init_instance(idx).await;
            if let Err(e) = self.apply_init_result(idx, result) {
                return self.fail_startup(e).await;
            }
        }

        // Concurrent phase: everything else in parallel.
        let concurrent: Vec<usize> = (0..self.modules.len())
            .filter(|&i| self.modules[i].settings.concurrent_init)
            .collect();
        let mut futures = Vec::new();
        for idx in concurrent {
            let settings = self.modules[idx].settings.clone();
            let ctx = ModuleContext::new(settings.id.clone(), self.notif_tx.clone());
            let instance = self.registry.create(&settings.impl_class);
            futures.push(async move {
                let result = match instance {
                    Ok(mut module) => module
                        .init(ctx, settings.config.clone())
                        .await
                        .map(|objects| (module, objects)),
                    Err(e) => Err(e),
                };
                (idx, result)
            });
        }
        let mut failure: Option<anyhow::Error> = None;
        for (idx, result) in join_all(futures).await {
            if let Err(e) = self.apply_init_result(idx, result) {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return self.fail_startup(e).await;
        }

        // All inits complete: start the run loops.
        for idx in 0..self.modules.len() {
            if self.modules[idx].lifecycle == ModuleLifecycle::InitComplete {
                self.start_module(idx);
            }
        }
        info!(modules = self.modules.len(), "all modules running");
        Ok(())
    }

    async fn init_instance(
        &mut self,
        idx: usize,
    ) -> anyhow::Result<(Box<dyn Module>, Vec<ObjectInfo>)> {
        let settings = self.modules[idx].settings.clone();
        let ctx = ModuleContext::new(settings.id.clone(), self.notif_tx.clone());
        let mut module = self.registry.create(&settings.impl_class)?;
        let objects = module.init(ctx, settings.config.clone()).await?;
        Ok((module, objects))
    }

    /// Records the outcome of one module init; on success the store is
    /// synced against the declared objects and the variables file applied.
    fn apply_init_result(
        &mut self,
        idx: usize,
        result: anyhow::Result<(Box<dyn Module>, Vec<ObjectInfo>)>,
    ) -> anyhow::Result<()> {
        let state = &mut self.modules[idx];
        match result {
            Ok((module, objects)) => {
                state.store.sync(&objects);
                if let Some(path) = state.variables_file() {
                    if let Err(e) = state.store.load(&path) {
                        warn!(module = %state.settings.id, error = %e, "variables file not loaded");
                    }
                }
                state.objects = objects;
                state.lifecycle = ModuleLifecycle::InitComplete;
                state.pending = Some(module);
                info!(module = %state.settings.id, "module init complete");
                Ok(())
            }
            Err(e) => {
                state.lifecycle = ModuleLifecycle::InitError;
                state.last_error = Some(e.to_string());
                error!(module = %state.settings.id, error = %e, "module init failed");
                Err(anyhow::anyhow!(
                    "init of module '{}' failed: {e}",
                    state.settings.id
                ))
            }
        }
    }

    async fn fail_startup(&mut self, e: anyhow::Error) -> anyhow::Result<()> {
        self.emit_event(AlarmOrEvent::new(
            "",
            Severity::Alarm,
            "InitFailed",
            e.to_string(),
        ));
        self.shutdown_modules().await;
        Err(e)
    }

    /// Spawns the runner for an init-complete module and watches its task.
    fn start_module(&mut self, idx: usize) {
        let state = &mut self.modules[idx];
        let Some(module) = state.pending.take() else {
            return;
        };

        let handle = spawn_runner(module);
        let (done_tx, done_rx) = oneshot::channel();
        let module_id = state.settings.id.clone();
        let notif = self.notif_tx.clone();
        let task = handle.task;
        tokio::spawn(async move {
            let error = match task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("run task panicked: {e}")),
            };
            let _ = done_tx.send(());
            let _ = notif.send(Notification::RunnerFinished { module_id, error });
        });

        state.handle = Some(RunningModule {
            inbox: handle.inbox,
            shutdown: handle.shutdown,
            done: done_rx,
        });
        state.lifecycle = ModuleLifecycle::Running;
    }

    // -- shutdown ---------------------------------------------------------

    /// Fans shutdown out to all applicable modules in parallel and awaits
    /// completion with the 10 s watchdog per module.
    async fn shutdown_modules(&mut self) {
        // Modules initialised but never started (aborted startup) still get
        // their init released.
        let aborted: Vec<Box<dyn Module>> = self
            .modules
            .iter_mut()
            .filter_map(|s| s.pending.take())
            .collect();
        for mut module in aborted {
            module.init_abort().await;
        }

        let mut waits = Vec::new();
        for state in &mut self.modules {
            if let Some(handle) = state.handle.take() {
                state.lifecycle = ModuleLifecycle::ShutdownStarted;
                handle.shutdown.cancel();
                waits.push((state.settings.id.clone(), handle.done));
            }
        }

        let results = join_all(waits.into_iter().map(|(id, done)| async move {
            let timed_out = timeout(SHUTDOWN_WATCHDOG, done).await.is_err();
            (id, timed_out)
        }))
        .await;

        for (id, timed_out) in results {
            if timed_out {
                self.emit_event(AlarmOrEvent::new(
                    id.clone(),
                    Severity::Warning,
                    "ShutdownTimeout",
                    format!("module '{id}' did not stop within {SHUTDOWN_WATCHDOG:?}"),
                ));
            }
        }

        for state in &mut self.modules {
            if state.lifecycle == ModuleLifecycle::ShutdownStarted
                || state.lifecycle == ModuleLifecycle::InitComplete
            {
                if let Some(path) = state.variables_file() {
                    if let Err(e) = state.store.flush(&path) {
                        warn!(module = %state.settings.id, error = %e, "variables flush failed");
                    }
                }
                state.lifecycle = ModuleLifecycle::ShutdownCompleted;
            }
        }
    }

    /// Restart path: shutdown with watchdog, recreate, re-init, rerun.
    async fn restart_module(&mut self, idx: usize) -> anyhow::Result<()> {
        let module_id = self.modules[idx].settings.id.clone();

        if let Some(handle) = self.modules[idx].handle.take() {
            handle.shutdown.cancel();
            if timeout(SHUTDOWN_WATCHDOG, handle.done).await.is_err() {
                self.emit_event(AlarmOrEvent::new(
                    module_id.clone(),
                    Severity::Warning,
                    "ShutdownTimeout",
                    format!("module '{module_id}' did not stop within {SHUTDOWN_WATCHDOG:?}"),
                ));
            }
        }
        self.modules[idx].lifecycle = ModuleLifecycle::Created;

        let result = self.init_instance(idx).await;
        self.apply_init_result(idx, result)?;
        self.start_module(idx);
        Ok(())
    }

    // -- tick -------------------------------------------------------------

    fn on_tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);

        // Abandonment sweep at ~1 Hz: purge silently.
        if self.tick_count % SWEEP_TICKS == 0 {
            let idle = Duration::from_secs(self.settings.session_idle_seconds);
            let abandoned: Vec<String> = self
                .sessions
                .values()
                .filter(|s| s.is_abandoned(idle))
                .map(|s| s.id.clone())
                .collect();
            for id in abandoned {
                info!(session = %id, "session abandoned, purging");
                self.sessions.remove(&id);
            }
        }

        // Periodic variable flush.
        let flush_ticks =
            (self.settings.variables_flush_interval_ms / TICK.as_millis() as u64).max(1) as u32;
        if self.tick_count % flush_ticks == 0 {
            for state in &self.modules {
                if let Some(path) = state.variables_file() {
                    if let Err(e) = state.store.flush(&path) {
                        warn!(module = %state.settings.id, error = %e, "variables flush failed");
                    }
                }
            }
        }
    }

    // -- start-complete file ----------------------------------------------

    fn write_start_complete_file(&self) {
        if let Some(path) = &self.settings.start_complete_file {
            let now = chrono::Local::now().to_rfc3339();
            if let Err(e) = std::fs::write(path, now) {
                warn!(path = %path, error = %e, "start-complete file not written");
            }
        }
    }

    fn remove_start_complete_file(&self) {
        if let Some(path) = &self.settings.start_complete_file {
            let _ = std::fs::remove_file(path);
        }
    }

    // -- notifications ----------------------------------------------------

    fn handle_notification(&mut self, n: Notification) {
        match n {
            Notification::VariableValuesChanged { module_id, values } => {
                self.on_variable_values_changed(&module_id, values);
            }
            Notification::ConfigChanged { objects, .. } => {
                for session in self.sessions.values_mut() {
                    let matching: Vec<ObjectRef> = objects
                        .iter()
                        .filter(|o| session.matches_config(o))
                        .cloned()
                        .collect();
                    session.enqueue_config(matching);
                }
            }
            Notification::AlarmOrEvent(event) => self.fan_out_alarm(event),
            Notification::VarHistoryChanged(changes) => {
                for session in self.sessions.values_mut() {
                    if session.subscriptions.var_history {
                        session.enqueue_history(changes.clone());
                    }
                }
            }
            Notification::RunnerFinished { module_id, error } => {
                self.on_runner_finished(&module_id, error);
            }
        }
    }

    fn on_variable_values_changed(&mut self, module_id: &str, values: Vec<VariableValue>) {
        let Some(idx) = self.module_index(module_id) else {
            warn!(module = module_id, "notification from unknown module dropped");
            return;
        };
        let changes: Vec<VarChange> = self.modules[idx].store.update(&values);
        if changes.is_empty() {
            return;
        }

        let history: Vec<VariableValue> = changes
            .iter()
            .filter(|c| self.modules[idx].store.history_enabled(&c.variable))
            .map(|c| VariableValue::new(c.variable.clone(), c.current.clone()))
            .collect();
        if !history.is_empty() {
            self.historian.append(history);
        }

        let applied: Vec<VariableValue> = changes
            .into_iter()
            .map(|c| VariableValue::new(c.variable, c.current))
            .collect();
        self.fan_out_values(&applied);
    }

    fn fan_out_values(&mut self, values: &[VariableValue]) {
        let modules = &self.modules;
        let parent_of = |obj: &ObjectRef| -> Option<ObjectRef> {
            modules
                .iter()
                .flat_map(|m| m.objects.iter())
                .find(|o| &o.id == obj)
                .and_then(|o| o.parent.clone())
        };
        for session in self.sessions.values_mut() {
            let matching: Vec<VariableValue> = values
                .iter()
                .filter(|vv| session.matches_variable(&vv.variable, parent_of))
                .cloned()
                .collect();
            session.enqueue_values(matching);
        }
    }

    fn fan_out_alarm(&mut self, event: AlarmOrEvent) {
        for session in self.sessions.values_mut() {
            if session.matches_alarm(&event) {
                session.enqueue_alarm(event.clone());
            }
        }
    }

    /// Supervisor-generated events go through the same stream as module
    /// alarms.
    fn emit_event(&mut self, event: AlarmOrEvent) {
        info!(
            event = %event.event_type,
            module = %event.module_id,
            severity = ?event.severity,
            "{}",
            event.message
        );
        self.fan_out_alarm(event);
    }

    fn on_runner_finished(&mut self, module_id: &str, error: Option<String>) {
        let Some(idx) = self.module_index(module_id) else {
            return;
        };
        if self.modules[idx].lifecycle != ModuleLifecycle::Running {
            return; // expected during shutdown or restart
        }

        let message = error
            .unwrap_or_else(|| "run loop returned unexpectedly".to_string());
        self.modules[idx].last_error = Some(message.clone());
        self.modules[idx].lifecycle = ModuleLifecycle::Created;
        self.modules[idx].handle = None;
        self.emit_event(AlarmOrEvent::new(
            module_id,
            Severity::Alarm,
            "ModuleRunError",
            message,
        ));

        // Wait a moment, then schedule the restart on the actor.
        let cmd_tx = self.cmd_tx.clone();
        let module_id = module_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DELAY).await;
            let _ = cmd_tx
                .send(SupervisorCommand::RestartModule {
                    module_id,
                    retry: 0,
                })
                .await;
        });
    }

    async fn handle_restart_command(&mut self, module_id: String, retry: u32) {
        let Some(idx) = self.module_index(&module_id) else {
            return;
        };
        if self.modules[idx].is_restarting {
            return; // coalesce overlapping restart requests
        }
        if self.modules[idx].lifecycle == ModuleLifecycle::Running {
            return; // already recovered
        }
        self.modules[idx].is_restarting = true;

        let result = self.restart_module(idx).await;
        self.modules[idx].is_restarting = false;

        match result {
            Ok(()) => {
                self.emit_event(AlarmOrEvent::new(
                    module_id,
                    Severity::Warning,
                    "ModuleRestart",
                    format!("module restarted after failure (attempt {})", retry + 1),
                ));
            }
            Err(e) => {
                self.emit_event(AlarmOrEvent::new(
                    module_id.clone(),
                    Severity::Alarm,
                    "ModuleRestartError",
                    format!("restart attempt {} failed: {e}", retry + 1),
                ));
                // Capped linear backoff, retried indefinitely.
                let backoff = Duration::from_secs(((retry as u64) + 1).min(10));
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = cmd_tx
                        .send(SupervisorCommand::RestartModule {
                            module_id,
                            retry: retry + 1,
                        })
                        .await;
                });
            }
        }
    }

    // -- command handling --------------------------------------------------

    fn module_index(&self, module_id: &str) -> Option<usize> {
        self.modules
            .iter()
            .position(|m| m.settings.id == module_id)
    }

    fn module_state(&self, module_id: &str) -> Result<&ModuleState> {
        self.modules
            .iter()
            .find(|m| m.settings.id == module_id)
            .ok_or_else(|| MediatorError::request(format!("unknown module '{module_id}'")))
    }

    /// Validates the session and bumps its activity timestamp.
    fn session_check(&mut self, id: &str) -> Result<&mut Session> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| MediatorError::request("invalid session"))?;
        if !session.is_authenticated() {
            return Err(MediatorError::request("session not authenticated"));
        }
        session.touch();
        Ok(session)
    }

    fn find_object(&self, object: &ObjectRef) -> Option<&ObjectInfo> {
        self.module_state(&object.module)
            .ok()?
            .objects
            .iter()
            .find(|o| &o.id == object)
    }

    /// All objects of the subtree rooted at `root`, root first. Each object
    /// is visited once, so a malformed (cyclic) parent relation cannot hang
    /// the walk.
    fn object_tree(&self, root: &ObjectRef) -> Vec<&ObjectInfo> {
        let Ok(state) = self.module_state(&root.module) else {
            return Vec::new();
        };
        let mut visited: std::collections::HashSet<&ObjectRef> = std::collections::HashSet::new();
        let mut result: Vec<&ObjectInfo> = Vec::new();
        let mut frontier: Vec<&ObjectRef> = vec![root];
        while let Some(current) = frontier.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(obj) = state.objects.iter().find(|o| &o.id == current) {
                result.push(obj);
            }
            for child in state.objects.iter().filter(|o| o.parent.as_ref() == Some(current)) {
                frontier.push(&child.id);
            }
        }
        result
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        use SupervisorCommand as C;
        match cmd {
            C::Login {
                login,
                is_module,
                reply,
            } => {
                let _ = reply.send(self.do_login(login, is_module));
            }
            C::Authenticate {
                session,
                hash,
                reply,
            } => {
                let _ = reply.send(self.do_authenticate(&session, hash));
            }
            C::Logout { session, reply } => {
                self.sessions.remove(&session);
                let _ = reply.send(Ok(()));
            }
            C::GetLoginUser { session, reply } => {
                let result = self.session_check(&session).and_then(|s| {
                    s.user
                        .clone()
                        .ok_or_else(|| MediatorError::internal("session without identity"))
                });
                let _ = reply.send(result);
            }

            C::GetModules { session, reply } => {
                let result = self.session_check(&session).map(|_| ());
                let _ = reply.send(result.map(|_| {
                    self.modules
                        .iter()
                        .map(|m| ModuleInfo {
                            id: m.settings.id.clone(),
                            name: m.settings.name.clone(),
                            enabled: m.settings.enabled,
                            state: format!("{:?}", m.lifecycle),
                        })
                        .collect()
                }));
            }
            C::GetLocations { session, reply } => {
                let result = self.session_check(&session).map(|_| ());
                let _ = reply.send(result.map(|_| {
                    self.settings
                        .locations
                        .iter()
                        .map(|l| LocationInfo {
                            id: l.id.clone(),
                            name: l.name.clone(),
                            parent: l.parent.clone(),
                        })
                        .collect()
                }));
            }
            C::GetMetaInfos {
                session,
                module_id,
                reply,
            } => {
                let _ = reply.send(self.do_get_meta_infos(&session, &module_id));
            }
            C::GetAllObjects {
                session,
                module_id,
                reply,
            } => {
                let result = self
                    .session_check(&session)
                    .map(|_| ())
                    .and_then(|_| self.module_state(&module_id).map(|m| m.objects.clone()));
                let _ = reply.send(result);
            }
            C::GetAllObjectsOfType {
                session,
                module_id,
                type_name,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    self.module_state(&module_id).map(|m| {
                        m.objects
                            .iter()
                            .filter(|o| o.type_name == type_name)
                            .cloned()
                            .collect()
                    })
                });
                let _ = reply.send(result);
            }
            C::GetAllObjectsWithVariablesOfType {
                session,
                module_id,
                type_name,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    self.module_state(&module_id).map(|m| {
                        m.objects
                            .iter()
                            .filter(|o| {
                                o.variables
                                    .iter()
                                    .any(|v| v.data_type.as_str() == type_name)
                            })
                            .cloned()
                            .collect()
                    })
                });
                let _ = reply.send(result);
            }
            C::GetObjectsByID {
                session,
                objects,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    objects
                        .iter()
                        .map(|id| {
                            self.find_object(id).cloned().ok_or_else(|| {
                                MediatorError::request(format!("unknown object '{id}'"))
                            })
                        })
                        .collect()
                });
                let _ = reply.send(result);
            }
            C::GetObjectValuesByID {
                session,
                objects,
                reply,
            } => {
                let _ = reply.send(self.do_get_object_values(&session, &objects));
            }
            C::GetChildrenOfObjects {
                session,
                objects,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).map(|_| {
                    self.modules
                        .iter()
                        .flat_map(|m| m.objects.iter())
                        .filter(|o| {
                            o.parent
                                .as_ref()
                                .map(|p| objects.contains(p))
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect()
                });
                let _ = reply.send(result);
            }
            C::GetParentOfObject {
                session,
                object,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    let obj = self
                        .find_object(&object)
                        .ok_or_else(|| MediatorError::request(format!("unknown object '{object}'")))?;
                    Ok(obj.parent.as_ref().and_then(|p| self.find_object(p)).cloned())
                });
                let _ = reply.send(result);
            }
            C::GetRootObject {
                session,
                module_id,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    self.module_state(&module_id)?
                        .objects
                        .iter()
                        .find(|o| o.parent.is_none())
                        .cloned()
                        .ok_or_else(|| {
                            MediatorError::request(format!("module '{module_id}' has no root object"))
                        })
                });
                let _ = reply.send(result);
            }
            C::GetMemberValues {
                session,
                object,
                members,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    let obj = self
                        .find_object(&object)
                        .ok_or_else(|| MediatorError::request(format!("unknown object '{object}'")))?;
                    if members.is_empty() {
                        let mut all: Vec<MemberValue> = obj
                            .members
                            .iter()
                            .map(|(k, v)| MemberValue {
                                member: k.clone(),
                                value: v.clone(),
                            })
                            .collect();
                        all.sort_by(|a, b| a.member.cmp(&b.member));
                        Ok(all)
                    } else {
                        members
                            .iter()
                            .map(|m| {
                                obj.members
                                    .get(m)
                                    .map(|v| MemberValue {
                                        member: m.clone(),
                                        value: v.clone(),
                                    })
                                    .ok_or_else(|| {
                                        MediatorError::request(format!(
                                            "object '{object}' has no member '{m}'"
                                        ))
                                    })
                            })
                            .collect()
                    }
                });
                let _ = reply.send(result);
            }

            C::ReadVariables {
                session,
                variables,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).and_then(|_| {
                    variables
                        .iter()
                        .map(|v| {
                            self.module_state(v.module())
                                .and_then(|m| m.store.get(v))
                        })
                        .collect()
                });
                let _ = reply.send(result);
            }
            C::ReadVariablesIgnoreMissing {
                session,
                variables,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).map(|_| {
                    variables
                        .iter()
                        .filter_map(|v| {
                            self.module_state(v.module())
                                .ok()
                                .and_then(|m| m.store.get(v).ok())
                                .map(|vtq| VariableValue::new(v.clone(), vtq))
                        })
                        .collect()
                });
                let _ = reply.send(result);
            }
            C::ReadVariablesSync {
                session,
                variables,
                ignore_missing,
                reply,
            } => {
                if let Err(e) = self.session_check(&session) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.dispatch_sync_read(variables, ignore_missing, reply);
            }
            C::ReadAllVariablesOfObjectTree {
                session,
                root,
                reply,
            } => {
                let result = self.session_check(&session).map(|_| ()).map(|_| {
                    let store = self
                        .module_state(&root.module)
                        .map(|m| &m.store)
                        .ok();
                    self.object_tree(&root)
                        .iter()
                        .flat_map(|obj| {
                            obj.variables.iter().map(move |v| obj.id.variable(&v.name))
                        })
                        .filter_map(|r| {
                            store
                                .and_then(|s| s.get(&r).ok())
                                .map(|vtq| VariableValue::new(r, vtq))
                        })
                        .collect()
                });
                let _ = reply.send(result);
            }
            C::WriteVariables {
                session,
                values,
                ignore_missing,
                sync,
                reply,
            } => {
                if let Err(e) = self.session_check(&session) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.dispatch_write(values, ignore_missing, sync, reply);
            }

            C::UpdateConfig {
                session,
                module_id,
                patch,
                reply,
            } => {
                if let Err(e) = self.session_check(&session) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.dispatch_update_config(module_id, patch, reply);
            }
            C::ApplyConfigObjects {
                module_id,
                objects,
                reply,
            } => {
                let result = match self.module_index(&module_id) {
                    Some(idx) => {
                        self.modules[idx].store.sync(&objects);
                        self.modules[idx].objects = objects;
                        Ok(())
                    }
                    None => Err(MediatorError::request(format!(
                        "unknown module '{module_id}'"
                    ))),
                };
                let _ = reply.send(result);
            }
            C::CallMethod {
                session,
                module_id,
                method_name,
                parameters,
                reply,
            } => {
                if let Err(e) = self.session_check(&session) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.dispatch_call_method(module_id, method_name, parameters, reply);
            }

            C::EnableAlarmsAndEvents {
                session,
                min_severity,
                reply,
            } => {
                let result = self.session_check(&session).map(|s| {
                    s.subscriptions.alarms = Some(min_severity);
                });
                let _ = reply.send(result);
            }
            C::DisableAlarmsAndEvents { session, reply } => {
                let result = self.session_check(&session).map(|s| {
                    s.subscriptions.alarms = None;
                });
                let _ = reply.send(result);
            }
            C::EnableConfigChangedEvents {
                session,
                objects,
                reply,
            } => {
                let result = self.session_check(&session).map(|s| {
                    s.subscriptions.config = Some(objects.into_iter().collect());
                });
                let _ = reply.send(result);
            }
            C::EnableVariableHistoryChangedEvents { session, reply } => {
                let result = self.session_check(&session).map(|s| {
                    s.subscriptions.var_history = true;
                });
                let _ = reply.send(result);
            }
            C::EnableVariableValueChangedEvents {
                session,
                options,
                variables,
                roots,
                reply,
            } => {
                let _ = reply.send(self.do_enable_var_values(&session, options, variables, roots));
            }
            C::DisableChangeEvents {
                session,
                variables,
                history,
                config,
                reply,
            } => {
                let result = self.session_check(&session).map(|s| {
                    if variables {
                        s.subscriptions.var_values = None;
                    }
                    if history {
                        s.subscriptions.var_history = false;
                    }
                    if config {
                        s.subscriptions.config = None;
                    }
                });
                let _ = reply.send(result);
            }

            C::WsBind { session, reply } => {
                let result = self.session_check(&session).map(|_| ());
                let _ = reply.send(result);
            }
            C::WsNext { session, reply } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.next_event(reply);
                }
                // Unknown session: reply is dropped, the pump sees a closed
                // channel and shuts the socket.
            }
            C::WsAck { session } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.ack();
                }
            }

            C::RestartModule { module_id, retry } => {
                self.handle_restart_command(module_id, retry).await;
            }
        }
    }

    // -- command implementations ------------------------------------------

    fn do_login(&mut self, login: String, is_module: bool) -> Result<LoginResponse> {
        self.auth.lookup(&login, is_module)?;
        let id = uuid::Uuid::new_v4().to_string();
        let challenge = AuthManager::issue_challenge();
        self.sessions
            .insert(id.clone(), Session::new(id.clone(), login, challenge));
        Ok(LoginResponse {
            session: id,
            challenge,
        })
    }

    fn do_authenticate(&mut self, session_id: &str, hash: i64) -> Result<LoginUser> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| MediatorError::request("invalid session"))?;
        let login = session.login.clone();
        match self.auth.verify(&login, session.challenge, session_id, hash) {
            Ok(user) => {
                session.user = Some(user.clone());
                session.touch();
                Ok(user)
            }
            Err(e) => {
                session.auth_attempts += 1;
                let attempts = session.auth_attempts;
                if attempts >= 3 {
                    self.sessions.remove(session_id);
                }
                Err(e)
            }
        }
    }

    fn do_get_meta_infos(&mut self, session: &str, module_id: &str) -> Result<MetaInfos> {
        self.session_check(session)?;
        let state = self.module_state(module_id)?;
        let mut types: Vec<TypeMeta> = Vec::new();
        for obj in &state.objects {
            if !types.iter().any(|t| t.type_name == obj.type_name) {
                types.push(TypeMeta {
                    type_name: obj.type_name.clone(),
                    variables: obj.variables.clone(),
                });
            }
        }
        Ok(MetaInfos {
            module_id: module_id.to_string(),
            types,
        })
    }

    fn do_get_object_values(
        &mut self,
        session: &str,
        objects: &[ObjectRef],
    ) -> Result<Vec<ObjectValue>> {
        self.session_check(session)?;
        objects
            .iter()
            .map(|id| {
                let obj = self
                    .find_object(id)
                    .ok_or_else(|| MediatorError::request(format!("unknown object '{id}'")))?;
                let store = &self.module_state(&id.module)?.store;
                let values = obj
                    .variables
                    .iter()
                    .filter_map(|v| {
                        let r = id.variable(&v.name);
                        store.get(&r).ok().map(|vtq| VariableValue::new(r, vtq))
                    })
                    .collect();
                Ok(ObjectValue {
                    object: id.clone(),
                    values,
                })
            })
            .collect()
    }

    fn do_enable_var_values(
        &mut self,
        session: &str,
        options: SubOptions,
        variables: Vec<VariableRef>,
        roots: Vec<ObjectRef>,
    ) -> Result<()> {
        // Collect initial values before borrowing the session mutably.
        let initial: Vec<VariableValue> = if options.send_initial {
            let mut refs: Vec<VariableRef> = variables.clone();
            for root in &roots {
                for obj in self.object_tree(root) {
                    refs.extend(obj.variables.iter().map(|v| obj.id.variable(&v.name)));
                }
            }
            refs.sort();
            refs.dedup();
            refs.into_iter()
                .filter_map(|r| {
                    self.module_state(r.module())
                        .ok()
                        .and_then(|m| m.store.get(&r).ok())
                        .map(|vtq| VariableValue::new(r, vtq))
                })
                .collect()
        } else {
            Vec::new()
        };

        let session = self.session_check(session)?;
        session.subscriptions.var_values = Some(VarSubscription {
            options,
            variables: variables.into_iter().collect(),
            roots,
        });
        session.enqueue_values(initial);
        Ok(())
    }

    /// Groups refs by owning module and posts the write into each module's
    /// inbox. A continuation task collects the device results and resolves
    /// the client's reply; the actor itself never awaits.
    fn dispatch_write(
        &mut self,
        values: Vec<VariableValue>,
        ignore_missing: bool,
        sync: bool,
        reply: Reply<WriteResponse>,
    ) {
        let mut by_module: HashMap<String, Vec<VariableValue>> = HashMap::new();
        let mut missing: Vec<FailedVariable> = Vec::new();
        for vv in values {
            let known = self
                .module_state(vv.variable.module())
                .map(|m| m.store.contains(&vv.variable))
                .unwrap_or(false);
            if known {
                by_module
                    .entry(vv.variable.module().to_string())
                    .or_default()
                    .push(vv);
            } else {
                missing.push(FailedVariable::new(vv.variable, "unknown variable"));
            }
        }
        if !ignore_missing && !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|f| f.variable.to_string()).collect();
            let _ = reply.send(Err(MediatorError::request(format!(
                "unknown variable(s): {}",
                names.join(", ")
            ))));
            return;
        }

        let mut receivers = Vec::new();
        for (module_id, batch) in by_module {
            match self.post_to_module(&module_id, ModuleRequest::write_variables(batch)) {
                Ok(rx) => receivers.push(rx),
                Err(e) => missing.push(FailedVariable::new(
                    // Attribute the failure to the module, not one variable.
                    ObjectRef::new(module_id, "*").variable("*"),
                    e.to_string(),
                )),
            }
        }

        if !sync {
            // Async flavour: reply as soon as the writes are posted.
            let _ = reply.send(Ok(WriteResponse { failed: missing }));
            return;
        }
        tokio::spawn(async move {
            let mut failed = missing;
            for rx in receivers {
                match rx.await {
                    Ok(VarWriteResult { failed: f }) => failed.extend(f),
                    Err(_) => { /* module went away; restart path reports it */ }
                }
            }
            let _ = reply.send(Ok(WriteResponse { failed }));
        });
    }

    fn dispatch_sync_read(
        &mut self,
        variables: Vec<VariableRef>,
        ignore_missing: bool,
        reply: Reply<Vec<VariableValue>>,
    ) {
        let mut by_module: HashMap<String, Vec<VariableRef>> = HashMap::new();
        let mut missing: Vec<VariableRef> = Vec::new();
        for v in variables {
            let known = self
                .module_state(v.module())
                .map(|m| m.store.contains(&v))
                .unwrap_or(false);
            if known {
                by_module.entry(v.module().to_string()).or_default().push(v);
            } else {
                missing.push(v);
            }
        }
        if !ignore_missing && !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|v| v.to_string()).collect();
            let _ = reply.send(Err(MediatorError::request(format!(
                "unknown variable(s): {}",
                names.join(", ")
            ))));
            return;
        }

        let mut receivers = Vec::new();
        for (module_id, refs) in by_module {
            if let Ok(rx) = self.post_to_module(&module_id, ModuleRequest::read_variables(refs)) {
                receivers.push(rx);
            }
        }
        tokio::spawn(async move {
            let mut values = Vec::new();
            let mut failed = Vec::new();
            for rx in receivers {
                if let Ok(result) = rx.await {
                    values.extend(result.values);
                    failed.extend(result.failed);
                }
            }
            if !ignore_missing && !failed.is_empty() {
                let names: Vec<String> =
                    failed.iter().map(|f| f.variable.to_string()).collect();
                let _ = reply.send(Err(MediatorError::request(format!(
                    "read failed for: {}",
                    names.join(", ")
                ))));
            } else {
                let _ = reply.send(Ok(values));
            }
        });
    }

    fn dispatch_update_config(
        &mut self,
        module_id: String,
        patch: ConfigPatch,
        reply: Reply<()>,
    ) {
        let (req, rx) = ModuleRequest::update_config(patch);
        if let Err(e) = self.post_to_module_raw(&module_id, req) {
            let _ = reply.send(Err(e));
            return;
        }
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(objects)) => {
                    // Apply the refreshed object forest on the actor, then
                    // complete the client's request.
                    let (tx, apply_rx) = oneshot::channel();
                    let _ = cmd_tx
                        .send(SupervisorCommand::ApplyConfigObjects {
                            module_id,
                            objects,
                            reply: tx,
                        })
                        .await;
                    let result = apply_rx
                        .await
                        .unwrap_or_else(|_| Err(MediatorError::internal("supervisor stopped")));
                    let _ = reply.send(result);
                }
                Ok(Err(e)) => {
                    let _ = reply.send(Err(MediatorError::request(e.to_string())));
                }
                Err(_) => {
                    let _ = reply.send(Err(MediatorError::internal("module stopped")));
                }
            }
        });
    }

    fn dispatch_call_method(
        &mut self,
        module_id: String,
        method_name: String,
        parameters: HashMap<String, String>,
        reply: Reply<DataValue>,
    ) {
        let (req, rx) = ModuleRequest::call_method(method_name, parameters);
        if let Err(e) = self.post_to_module_raw(&module_id, req) {
            let _ = reply.send(Err(e));
            return;
        }
        tokio::spawn(async move {
            let result = match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(MediatorError::request(e.to_string())),
                Err(_) => Err(MediatorError::internal("module stopped")),
            };
            let _ = reply.send(result);
        });
    }

    fn post_to_module<T>(
        &self,
        module_id: &str,
        (req, rx): (ModuleRequest, oneshot::Receiver<T>),
    ) -> Result<oneshot::Receiver<T>> {
        self.post_to_module_raw(module_id, req)?;
        Ok(rx)
    }

    fn post_to_module_raw(&self, module_id: &str, req: ModuleRequest) -> Result<()> {
        let state = self.module_state(module_id)?;
        let handle = state.handle.as_ref().ok_or_else(|| {
            MediatorError::request(format!("module '{module_id}' is not running"))
        })?;
        handle.inbox.try_send(req).map_err(|_| {
            MediatorError::request(format!("module '{module_id}' inbox full or closed"))
        })
    }
}

