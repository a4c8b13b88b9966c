//! Historian worker properties: ordering, counting, modify semantics,
//! read prioritisation and concurrent channel creation.

use rust_mediator::history::{worker, BoundingMethod, ModifyMode, QualityFilter};
use rust_mediator::values::{ObjectRef, Quality, Timestamp, VariableRef, VariableValue, VTQ};
use serde_json::json;

fn var(name: &str) -> VariableRef {
    ObjectRef::new("io", "dev").variable(name)
}

fn value(v: &VariableRef, x: f64, t: i64) -> VariableValue {
    VariableValue::new(v.clone(), VTQ::good(json!(x), Timestamp::from_millis(t)))
}

async fn read_all(handle: &worker::WorkerHandle, v: &VariableRef) -> Vec<rust_mediator::values::VTTQ> {
    handle
        .read_raw(
            v.clone(),
            Timestamp::EMPTY,
            Timestamp::MAX,
            usize::MAX,
            BoundingMethod::TakeFirstN,
            QualityFilter::ExcludeNone,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn sequential_appends_read_back_in_time_order() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    w.append(vec![value(&v, 1.0, 100)]).await.unwrap();
    w.append(vec![value(&v, 2.0, 200)]).await.unwrap();

    let rows = read_all(&w, &v).await;
    assert_eq!(rows.len(), 2);
    assert!(rows[0].time < rows[1].time);
    assert_eq!(rows[0].value, json!(1.0));
    assert_eq!(rows[1].value, json!(2.0));
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn upsert_at_same_timestamp_keeps_last_value() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    let t = Timestamp::from_millis(5);
    w.modify(v.clone(), ModifyMode::Upsert, vec![VTQ::good(json!("x"), t)])
        .await
        .unwrap();
    w.modify(v.clone(), ModifyMode::Upsert, vec![VTQ::good(json!("y"), t)])
        .await
        .unwrap();

    let rows = read_all(&w, &v).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, json!("y"));
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn count_matches_read_raw_length() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    let batch: Vec<VariableValue> = (0..25).map(|i| value(&v, i as f64, i * 7)).collect();
    w.append(batch).await.unwrap();

    let count = w
        .count(v.clone(), Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone)
        .await
        .unwrap();
    let rows = read_all(&w, &v).await;
    assert_eq!(count as usize, rows.len());
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn insert_conflict_leaves_no_partial_rows() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    w.modify(
        v.clone(),
        ModifyMode::Insert,
        vec![VTQ::good(json!(1), Timestamp::from_millis(10))],
    )
    .await
    .unwrap();

    let err = w
        .modify(
            v.clone(),
            ModifyMode::Insert,
            vec![
                VTQ::good(json!(2), Timestamp::from_millis(20)),
                VTQ::good(json!(3), Timestamp::from_millis(10)),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 409);

    let rows = read_all(&w, &v).await;
    assert_eq!(rows.len(), 1, "conflicting batch must not apply partially");
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn read_raw_zero_max_values_is_empty() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    w.append(vec![value(&v, 1.0, 1)]).await.unwrap();
    let rows = w
        .read_raw(
            v.clone(),
            Timestamp::EMPTY,
            Timestamp::MAX,
            0,
            BoundingMethod::TakeFirstN,
            QualityFilter::ExcludeNone,
        )
        .await
        .unwrap();
    assert!(rows.is_empty());
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn compress_with_enough_budget_returns_rows_unchanged() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    w.append((0..5).map(|i| value(&v, i as f64, i * 10)).collect())
        .await
        .unwrap();
    let rows = w
        .read_raw(
            v.clone(),
            Timestamp::EMPTY,
            Timestamp::MAX,
            10,
            BoundingMethod::CompressToN,
            QualityFilter::ExcludeNone,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn quality_filters_exclude_bad_and_non_good() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    w.append(vec![
        VariableValue::new(v.clone(), VTQ::new(json!(1), Timestamp::from_millis(1), Quality::Bad)),
        VariableValue::new(
            v.clone(),
            VTQ::new(json!(2), Timestamp::from_millis(2), Quality::Uncertain),
        ),
        VariableValue::new(v.clone(), VTQ::new(json!(3), Timestamp::from_millis(3), Quality::Good)),
    ])
    .await
    .unwrap();

    let not_bad = w
        .count(v.clone(), Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeBad)
        .await
        .unwrap();
    let good = w
        .count(v.clone(), Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNonGood)
        .await
        .unwrap();
    assert_eq!((not_bad, good), (2, 1));
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn concurrent_appends_create_exactly_one_channel() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hist.db");
    let path = file.to_str().unwrap().to_string();

    let w = worker::spawn("t", &path, true);
    let v = var("Fresh");

    // Two concurrent submitters racing on a brand-new channel.
    let (w1, v1) = (w.clone(), v.clone());
    let (w2, v2) = (w.clone(), v.clone());
    let a = tokio::spawn(async move { w1.append(vec![value(&v1, 1.0, 1)]).await });
    let b = tokio::spawn(async move { w2.append(vec![value(&v2, 2.0, 2)]).await });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(read_all(&w, &v).await.len(), 2);
    w.terminate().await.unwrap();

    // Reopening the database shows a single channel row.
    let reopened = rust_mediator::history::sqlite::SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.channel_count(), 1);
}

#[tokio::test]
async fn prioritised_read_completes_before_later_appends() {
    use tokio::sync::oneshot;

    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");

    // First wave committed and visible.
    let first: Vec<VariableValue> = (0..50).map(|i| value(&v, i as f64, i)).collect();
    w.append(first).await.unwrap();

    // One synchronous burst: the read, then fifty more appends. Queue
    // order puts the read ahead of the second wave, and prioritisation
    // keeps it there, so the read observes exactly the first fifty rows.
    let (read_tx, read_rx) = oneshot::channel();
    w.post(worker::WorkItem::ReadRaw {
        variable: v.clone(),
        start: Timestamp::EMPTY,
        end: Timestamp::MAX,
        max_values: usize::MAX,
        bounding: BoundingMethod::TakeFirstN,
        filter: QualityFilter::ExcludeNone,
        reply: read_tx,
    })
    .unwrap();
    let mut append_promises = Vec::new();
    for i in 50..100 {
        let (tx, rx) = oneshot::channel();
        w.post(worker::WorkItem::Append {
            values: vec![value(&v, i as f64, i)],
            reply: tx,
        })
        .unwrap();
        append_promises.push(rx);
    }

    let rows = read_rx.await.unwrap().unwrap();
    assert_eq!(rows.len(), 50, "read must see only pre-read commits");

    for rx in append_promises {
        rx.await.unwrap().unwrap();
    }
    let count = w
        .count(v, Timestamp::EMPTY, Timestamp::MAX, QualityFilter::ExcludeNone)
        .await
        .unwrap();
    assert_eq!(count, 100);
    w.terminate().await.unwrap();
}

#[tokio::test]
async fn delete_interval_and_latest_timestamp() {
    let w = worker::spawn("t", ":memory:", true);
    let v = var("Temp");
    w.append((1..=5).map(|i| value(&v, i as f64, i * 100)).collect())
        .await
        .unwrap();

    assert!(w.latest_timestamp_db(v.clone()).await.unwrap().is_some());
    let deleted = w
        .delete_interval(v.clone(), Timestamp::from_millis(200), Timestamp::from_millis(400))
        .await
        .unwrap();
    assert_eq!(deleted, 3);
    assert_eq!(read_all(&w, &v).await.len(), 2);
    w.terminate().await.unwrap();
}
