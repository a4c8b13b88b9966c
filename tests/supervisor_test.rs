//! End-to-end supervisor scenarios: cold start, crash & restart, and the
//! write/read round-trip through store and historian.

mod common;

use common::*;
use rust_mediator::history::{BoundingMethod, QualityFilter};
use rust_mediator::modules::registry::ModuleRegistry;
use rust_mediator::network::protocol::EventFrame;
use rust_mediator::supervisor::{self, SupervisorCommand};
use rust_mediator::values::{Severity, Timestamp, VariableValue, VTQ};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn cold_start_inits_sequential_before_concurrent() {
    let probe = Arc::new(Probe::default());
    let mut registry = ModuleRegistry::new();
    register_test_module(&mut registry, "TestA", probe.clone(), |_| TestBehavior {
        init_delay: Duration::from_millis(100),
        ..TestBehavior::default()
    });
    register_test_module(&mut registry, "TestB", probe.clone(), |_| {
        TestBehavior::default()
    });

    let dir = tempfile::tempdir().unwrap();
    let start_file = dir.path().join("started.txt");
    let mut settings = base_settings(vec![
        module_settings("a", "TestA", false),
        module_settings("b", "TestB", true),
    ]);
    settings.start_complete_file = Some(start_file.to_str().unwrap().to_string());

    let (handle, task) = supervisor::spawn(settings, registry);
    let session = login(&handle).await;

    let ready = wait_for(Duration::from_secs(5), || {
        let handle = handle.clone();
        let session = session.clone();
        async move {
            module_state(&handle, &session, "a").await == "Running"
                && module_state(&handle, &session, "b").await == "Running"
        }
    })
    .await;
    assert!(ready, "modules did not reach Running");

    // Sequential module 'a' enters init strictly before concurrent 'b',
    // despite 'a' sleeping 100 ms in init.
    let order = probe.init_order.lock().unwrap().clone();
    assert_eq!(order, vec!["a".to_string(), "b".to_string()]);

    // Start-complete file exists while running, disappears on shutdown.
    assert!(start_file.exists(), "start-complete file missing");
    handle.shutdown();
    task.await.unwrap().unwrap();
    assert!(!start_file.exists(), "start-complete file not removed");
}

#[tokio::test]
async fn crash_and_restart_recovers_module_and_keeps_variables() {
    let probe = Arc::new(Probe::default());
    let mut registry = ModuleRegistry::new();
    // First instance fails its run loop at cycle 10 (~500 ms in); the
    // recreated instance runs clean.
    register_test_module(&mut registry, "Flaky", probe.clone(), |instance| {
        TestBehavior {
            fail_on_cycle: (instance == 0).then_some(10),
            ..TestBehavior::default()
        }
    });

    let (handle, task) = supervisor::spawn(
        base_settings(vec![module_settings("a", "Flaky", false)]),
        registry,
    );
    let session = login(&handle).await;
    handle
        .command(|reply| SupervisorCommand::EnableAlarmsAndEvents {
            session: session.clone(),
            min_severity: Severity::Info,
            reply,
        })
        .await
        .unwrap();

    // Seed a value before the crash.
    let var = test_var("a");
    handle
        .command(|reply| SupervisorCommand::WriteVariables {
            session: session.clone(),
            values: vec![VariableValue::new(
                var.clone(),
                VTQ::good(json!(42.0), Timestamp::now()),
            )],
            ignore_missing: false,
            sync: true,
            reply,
        })
        .await
        .unwrap();

    // Collect events until both run-error and restart were observed.
    let mut saw_run_error = false;
    let mut saw_restart = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(12);
    while std::time::Instant::now() < deadline && !(saw_run_error && saw_restart) {
        if let Some(EventFrame::OnAlarmOrEvent { events }) =
            next_frame(&handle, &session, Duration::from_secs(2)).await
        {
            for e in events {
                match e.event_type.as_str() {
                    "ModuleRunError" => saw_run_error = true,
                    "ModuleRestart" => saw_restart = true,
                    _ => {}
                }
            }
        }
    }
    assert!(saw_run_error, "no ModuleRunError event");
    assert!(saw_restart, "no ModuleRestart event");

    let recovered = wait_for(Duration::from_secs(5), || {
        let handle = handle.clone();
        let session = session.clone();
        async move { module_state(&handle, &session, "a").await == "Running" }
    })
    .await;
    assert!(recovered, "module not Running after restart");
    assert!(probe.instances.load(std::sync::atomic::Ordering::SeqCst) >= 2);

    // The in-memory value survived the crash and the store re-sync.
    let values = handle
        .command(|reply| SupervisorCommand::ReadVariables {
            session: session.clone(),
            variables: vec![var.clone()],
            reply,
        })
        .await
        .unwrap();
    assert_eq!(values[0].value, json!(42.0));

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn write_read_roundtrip_reaches_store_and_historian() {
    let probe = Arc::new(Probe::default());
    let mut registry = ModuleRegistry::new();
    register_test_module(&mut registry, "Dev", probe, |_| TestBehavior::default());

    let (handle, task) = supervisor::spawn(
        base_settings(vec![module_settings("a", "Dev", false)]),
        registry,
    );
    let session = login(&handle).await;

    let var = test_var("a");
    let t0 = Timestamp::now();
    let result = handle
        .command(|reply| SupervisorCommand::WriteVariables {
            session: session.clone(),
            values: vec![VariableValue::new(var.clone(), VTQ::good(json!(42.0), t0))],
            ignore_missing: false,
            sync: true,
            reply,
        })
        .await
        .unwrap();
    assert!(result.failed.is_empty());

    // Current value: the module echoed the write back into the store.
    let stored = wait_for(Duration::from_secs(3), || {
        let handle = handle.clone();
        let session = session.clone();
        let var = var.clone();
        async move {
            handle
                .command(|reply| SupervisorCommand::ReadVariables {
                    session,
                    variables: vec![var],
                    reply,
                })
                .await
                .map(|v| v[0].value == json!(42.0))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(stored, "write did not reach the variable store");

    // History: Temp is history-enabled, so the historian captured it.
    let in_history = wait_for(Duration::from_secs(3), || {
        let handle = handle.clone();
        let var = var.clone();
        async move {
            handle
                .historian
                .read_raw(
                    var,
                    Timestamp::EMPTY,
                    Timestamp::MAX,
                    10,
                    BoundingMethod::TakeFirstN,
                    QualityFilter::ExcludeNone,
                )
                .await
                .map(|rows| rows.iter().any(|r| r.value == json!(42.0) && r.time == t0))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(in_history, "write did not reach the historian");

    let count = handle
        .historian
        .count(var, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone)
        .await
        .unwrap();
    assert!(count >= 1);

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn init_failure_aborts_startup() {
    let probe = Arc::new(Probe::default());
    let mut registry = ModuleRegistry::new();
    register_test_module(&mut registry, "Good", probe.clone(), |_| {
        TestBehavior::default()
    });
    register_test_module(&mut registry, "Broken", probe, |_| TestBehavior {
        init_fail: true,
        ..TestBehavior::default()
    });

    let (handle, task) = supervisor::spawn(
        base_settings(vec![
            module_settings("good", "Good", false),
            module_settings("broken", "Broken", false),
        ]),
        registry,
    );

    // The supervisor task ends on its own with the init error.
    let result = task.await.unwrap();
    assert!(result.is_err(), "startup should have failed");
    assert!(handle.is_starting(), "startup must not be marked complete");
}
