//! Routing and aggregation behaviour of the router facade
//!
//! Every test runs against probe shards so it can assert both the merged
//! result and which shards a call actually reached.

mod common;

use arrakis_shard_router::{
    BackendError, Condition, Direction, Filter, KeySource, RouteDecision, ShardError, ShardKey,
    ShardTopology,
};
use common::{character, facade, ids, inventory, record, reset, table, total_calls};
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

/// Per-shard rows A=[x1], B=[], C=[x2, x3] in topology order, each on the
/// shard its id maps to
async fn scattered() -> (arrakis_shard_router::Model, Vec<std::sync::Arc<common::ProbeBackend>>) {
    let decl = character();
    let (model, probes) = facade(decl.clone(), 3);
    let t = table(&decl);
    probes[0].seed(&t, vec![json!({"id": 3, "name": "x1"})]).await;
    probes[2]
        .seed(&t, vec![json!({"id": 2, "name": "x2"}), json!({"id": 5, "name": "x3"})])
        .await;
    (model, probes)
}

#[test]
fn shard_index_is_key_mod_shard_count() {
    let (model, _) = facade(character(), 3);
    for k in 0..200i64 {
        let index = model.shard_index(&ShardKey::Int(k)).unwrap();
        assert_eq!(index, (k % 3) as usize);
        assert!(index < 3);
    }
}

#[test]
fn empty_topology_fails_at_construction() {
    let err = ShardTopology::new("character", Vec::new()).unwrap_err();
    assert!(matches!(err, ShardError::EmptyTopology { .. }));
}

#[tokio::test]
async fn create_then_find_by_pk_round_trips_through_one_shard() {
    let (model, probes) = facade(character(), 3);

    let created = model
        .create(record(json!({"id": 7, "name": "arrakeen"})))
        .await
        .unwrap();
    assert_eq!(created["id"], json!(7));
    assert_eq!(probes[1].row_count("character"), 1);
    assert_eq!(probes[0].row_count("character"), 0);
    assert_eq!(probes[2].row_count("character"), 0);

    reset(&probes);
    let found = model.find_by_pk(7).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("arrakeen"));
    assert_eq!(total_calls(&probes), vec![0, 1, 0]);
}

#[tokio::test]
async fn keyless_count_sums_every_shard() {
    let decl = character();
    let (model, probes) = facade(decl.clone(), 3);
    let t = table(&decl);
    for (probe, n) in probes.iter().zip([3, 5, 2]) {
        probe
            .seed(&t, (0..n).map(|i| json!({ "id": i })).collect())
            .await;
    }

    assert_eq!(model.count(&Filter::new()).await.unwrap(), 10);
    assert_eq!(total_calls(&probes), vec![1, 1, 1]);
}

#[tokio::test]
async fn keyless_find_concatenates_in_topology_order() {
    let (model, probes) = scattered().await;

    let rows = model.find_all(&Filter::new()).await.unwrap();
    assert_eq!(ids(&rows), vec![3, 2, 5]);
    assert_eq!(total_calls(&probes), vec![1, 1, 1]);
}

#[tokio::test]
async fn keyless_find_is_not_globally_sorted() {
    let (model, _) = scattered().await;

    let filter = Filter::new().order_by("id", Direction::Desc);
    let rows = model.find_all(&filter).await.unwrap();
    // Each shard sorts its own rows; shards stay in topology order.
    assert_eq!(ids(&rows), vec![3, 5, 2]);
}

#[tokio::test]
async fn keyless_find_one_stops_at_first_shard_with_a_match() {
    let (model, probes) = scattered().await;

    let found = model.find_one(&Filter::new()).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("x1"));
    assert_eq!(total_calls(&probes), vec![1, 0, 0]);

    reset(&probes);
    let found = model
        .find_one(&Filter::new().and(Condition::Ne("name".into(), json!("x1"))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["name"], json!("x2"));
    assert_eq!(total_calls(&probes), vec![1, 1, 1]);

    reset(&probes);
    let none = model
        .find_one(&Filter::new().and(Condition::Gt("id".into(), json!(100))))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn keyed_reads_touch_only_the_owning_shard() {
    let (model, probes) = scattered().await;

    let rows = model.find_all(&Filter::by("id", 2)).await.unwrap();
    assert_eq!(ids(&rows), vec![2]);
    assert_eq!(total_calls(&probes), vec![0, 0, 1]);

    reset(&probes);
    assert_eq!(model.count(&Filter::by("id", 3)).await.unwrap(), 1);
    assert_eq!(total_calls(&probes), vec![1, 0, 0]);
}

#[tokio::test]
async fn find_and_count_fan_out_applies_limit_per_shard() {
    let decl = character();
    let (model, probes) = facade(decl.clone(), 3);
    let t = table(&decl);
    for probe in &probes {
        probe
            .seed(&t, (0..4).map(|i| json!({ "id": i })).collect())
            .await;
    }

    let page = model
        .find_and_count_all(&Filter::new().limit(2))
        .await
        .unwrap();
    // Current behaviour: every shard returns its own 2-row window.
    assert_eq!(page.rows.len(), 6);
    assert_eq!(page.count, 12);
}

#[tokio::test]
async fn exists_ors_across_shards() {
    let (model, _) = scattered().await;

    assert!(model.exists(&Filter::by("name", "x3")).await.unwrap());
    assert!(!model.exists(&Filter::by("name", "x9")).await.unwrap());
}

#[tokio::test]
async fn increment_without_key_is_rejected_before_any_shard_call() {
    let (model, probes) = facade(inventory(), 3);

    let err = model.increment(&["count"], &Filter::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ShardError::MissingDistributionValue { ref model, attempted: KeySource::Filter }
            if model == "inventory"
    ));
    assert_eq!(total_calls(&probes), vec![0, 0, 0]);
}

#[tokio::test]
async fn increment_with_key_updates_one_shard() {
    let (model, probes) = facade(inventory(), 3);
    model
        .create(record(json!({"id": 1, "player_id": 5, "count": 1})))
        .await
        .unwrap();

    let affected = model
        .increment_by(&["count"], 4, &Filter::by("player_id", 5))
        .await
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(probes[2].rows("inventory")[0]["count"], json!(5));

    model
        .decrement(&["count"], &Filter::by("player_id", 5))
        .await
        .unwrap();
    assert_eq!(probes[2].rows("inventory")[0]["count"], json!(4));
}

#[tokio::test]
async fn mutations_without_payload_key_fail() {
    let (model, probes) = facade(inventory(), 2);

    let payload = record(json!({"id": 1, "item": "crysknife"}));
    for err in [
        model.create(payload.clone()).await.unwrap_err(),
        model.upsert(payload.clone()).await.unwrap_err(),
        model.build(payload.clone()).unwrap_err(),
        model
            .bulk_create(vec![record(json!({"player_id": 1})), payload.clone()])
            .await
            .unwrap_err(),
    ] {
        assert!(matches!(
            err,
            ShardError::MissingDistributionValue { attempted: KeySource::Payload, .. }
        ));
    }

    let err = model
        .find_or_create(&Filter::by("id", 1), record(json!({"player_id": 1})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ShardError::MissingDistributionValue { attempted: KeySource::Filter, .. }
    ));
    assert_eq!(total_calls(&probes), vec![0, 0]);
}

#[tokio::test]
async fn find_or_create_and_upsert_stay_on_one_shard() {
    let (model, probes) = facade(inventory(), 2);
    let filter = Filter::by("player_id", 3).eq("item", "stillsuit");

    let (row, created) = model
        .find_or_create(&filter, record(json!({"qty": 1})))
        .await
        .unwrap();
    assert!(created);
    assert_eq!(row["item"], json!("stillsuit"));

    let (_, created) = model
        .find_or_create(&filter, record(json!({"qty": 1})))
        .await
        .unwrap();
    assert!(!created);

    let id = row["id"].clone();
    let (row, created) = model
        .upsert(record(json!({"id": id, "player_id": 3, "qty": 2})))
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(row["qty"], json!(2));

    assert_eq!(probes[1].row_count("inventory"), 1);
    assert_eq!(probes[0].calls(), 0);
}

#[tokio::test]
async fn find_or_build_does_not_write_until_saved() {
    let (model, probes) = facade(inventory(), 2);

    let (mut draft, built) = model
        .find_or_build(&Filter::by("player_id", 4), record(json!({"item": "maker hook"})))
        .await
        .unwrap();
    assert!(built);
    assert_eq!(draft.shard(), 0);
    assert_eq!(probes[0].row_count("inventory"), 0);

    draft.save().await.unwrap();
    assert_eq!(probes[0].row_count("inventory"), 1);

    let (draft, built) = model
        .find_or_build(&Filter::by("player_id", 4), record(json!({})))
        .await
        .unwrap();
    assert!(!built);
    assert!(draft.is_persisted());
}

#[tokio::test]
async fn build_binds_draft_to_owning_shard() {
    let (model, probes) = facade(character(), 3);

    let mut draft = model.build(record(json!({"id": 5}))).unwrap();
    assert_eq!(draft.shard(), 2);
    draft.save().await.unwrap();
    assert_eq!(probes[2].row_count("character"), 1);
}

#[tokio::test]
async fn bulk_create_groups_per_shard_and_keeps_input_order() {
    let (model, probes) = facade(inventory(), 3);

    let payloads = (0..6)
        .map(|i| record(json!({"id": 10 + i, "player_id": 5 - i})))
        .collect();
    let created = model.bulk_create(payloads).await.unwrap();

    assert_eq!(ids(&created), vec![10, 11, 12, 13, 14, 15]);
    assert_eq!(total_calls(&probes), vec![1, 1, 1]);
    for probe in &probes {
        assert_eq!(probe.row_count("inventory"), 2);
    }
    for row in probes[0].rows("inventory") {
        assert_eq!(row["player_id"].as_i64().unwrap() % 3, 0);
    }
}

#[tokio::test]
async fn update_and_destroy_fan_out_and_sum() {
    let (model, _) = scattered().await;

    let affected = model
        .update(record(json!({"name": "renamed"})), &Filter::new())
        .await
        .unwrap();
    assert_eq!(affected, 3);

    let destroyed = model
        .destroy(&Filter::new().and(Condition::In("id".into(), vec![json!(3), json!(5)])))
        .await
        .unwrap();
    assert_eq!(destroyed, 2);
    assert_eq!(model.count(&Filter::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn update_refuses_to_rewrite_distribution_key() {
    let (model, probes) = facade(inventory(), 2);

    let err = model
        .update(record(json!({"player_id": 9})), &Filter::by("player_id", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::DistributionKeyUpdate { .. }));
    assert_eq!(total_calls(&probes), vec![0, 0]);
}

#[tokio::test]
async fn truncate_runs_on_every_shard() {
    let (model, probes) = scattered().await;

    model.truncate().await.unwrap();
    assert_eq!(total_calls(&probes), vec![1, 1, 1]);
    assert_eq!(model.count(&Filter::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn find_by_pk_scans_sequentially_when_not_sharded_by_pk() {
    let decl = inventory();
    let (model, probes) = facade(decl.clone(), 3);
    let t = table(&decl);
    probes[1]
        .seed(&t, vec![json!({"id": 42, "player_id": 1})])
        .await;

    let found = model.find_by_pk(42).await.unwrap().unwrap();
    assert_eq!(found["player_id"], json!(1));
    assert_eq!(total_calls(&probes), vec![1, 1, 0]);
}

#[tokio::test]
async fn fan_out_failure_reports_failing_shard_and_discards_partials() {
    let (model, probes) = scattered().await;
    let cause = BackendError::Driver("disk full".to_string());
    probes[1].fail_with(cause.clone());

    let err = model.find_all(&Filter::new()).await.unwrap_err();
    match &err {
        ShardError::AggregateFailure { shard, operation, .. } => {
            assert_eq!(*shard, 1);
            assert_eq!(*operation, "find_all");
        }
        other => panic!("expected AggregateFailure, got {other:?}"),
    }
    assert_eq!(err.backend_error(), Some(&cause));
}

#[tokio::test]
async fn single_shard_errors_pass_through_unwrapped() {
    let (model, _) = facade(character(), 3);
    assert_ok!(model.create(record(json!({"id": 4}))).await);

    let err = assert_err!(model.create(record(json!({"id": 4}))).await);
    assert!(matches!(
        err,
        ShardError::Backend { shard: 1, source: BackendError::ConstraintViolation { .. } }
    ));
}

#[tokio::test]
async fn cancellation_aborts_outstanding_shard_calls() {
    let (model, probes) = scattered().await;
    probes[2].delay_by(Duration::from_secs(30));

    let token = CancellationToken::new();
    let cancellable = model.with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let err = cancellable.count(&Filter::new()).await.unwrap_err();
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err.root_cause(), ShardError::Cancelled { shard: 2 }));
    assert_eq!(err.failed_shard(), Some(2));

    // The original handle keeps its own token.
    probes[2].delay_by(Duration::from_millis(0));
    assert_eq!(model.count(&Filter::new()).await.unwrap(), 3);
}

#[tokio::test]
async fn slow_shard_hits_per_shard_timeout() {
    let (model, probes) = scattered().await;
    let model = model.with_shard_timeout(Some(Duration::from_millis(20)));
    probes[0].delay_by(Duration::from_secs(30));

    let err = model.count(&Filter::new()).await.unwrap_err();
    assert!(matches!(err.root_cause(), ShardError::Timeout { shard: 0, .. }));
}

#[tokio::test]
async fn iterate_all_drains_shards_one_after_another() {
    let (model, probes) = scattered().await;
    let model = model.with_page_size(1);

    let rows = model.collect_all(Filter::new()).await.unwrap();
    assert_eq!(ids(&rows), vec![3, 2, 5]);

    reset(&probes);
    let keyed: Vec<_> = model.iterate_all(Filter::by("id", 5)).collect().await;
    assert_eq!(keyed.len(), 1);
    assert_eq!(probes[0].calls(), 0);
    assert_eq!(probes[1].calls(), 0);
    assert!(probes[2].calls() >= 1);
}

#[tokio::test]
async fn iterate_all_is_lazy() {
    let (model, probes) = scattered().await;
    let model = model.with_page_size(1);

    let mut stream = model.iterate_all(Filter::new());
    assert_eq!(total_calls(&probes), vec![0, 0, 0]);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first["id"], json!(3));
    // Only shard A has been opened so far.
    assert_eq!(probes[1].calls(), 0);
    assert_eq!(probes[2].calls(), 0);
}

#[tokio::test]
async fn draft_refuses_save_after_distribution_key_edit() {
    let (model, probes) = facade(character(), 3);

    let mut draft = model.build(record(json!({"id": 7, "name": "sietch"}))).unwrap();
    assert_eq!(draft.shard(), 1);
    draft.values_mut().insert("id".to_string(), json!(8));

    let err = draft.save().await.unwrap_err();
    assert!(matches!(err, ShardError::DistributionKeyUpdate { ref key, .. } if key == "id"));
    assert_eq!(total_calls(&probes), vec![0, 0, 0]);
    assert!(model.find_by_pk(8).await.unwrap().is_none());

    draft.values_mut().insert("id".to_string(), json!(7));
    draft.save().await.unwrap();
    assert_eq!(probes[1].row_count("character"), 1);
    assert!(model.find_by_pk(7).await.unwrap().is_some());
}

#[tokio::test]
async fn found_draft_keeps_its_key_pinned() {
    let (model, probes) = facade(inventory(), 3);
    model
        .create(record(json!({"id": 1, "player_id": 4, "item": "fremkit"})))
        .await
        .unwrap();

    let (mut draft, built) = model
        .find_or_build(&Filter::by("player_id", 4), record(json!({})))
        .await
        .unwrap();
    assert!(!built);
    draft.values_mut().insert("player_id".to_string(), json!(5));
    assert_err!(draft.save().await);

    draft.values_mut().insert("player_id".to_string(), json!(4));
    draft.values_mut().insert("item".to_string(), json!("paracompass"));
    assert_ok!(draft.save().await);
    assert_eq!(probes[1].rows("inventory")[0]["item"], json!("paracompass"));
}

#[tokio::test]
async fn keys_beyond_i64_route_by_identity() {
    let (model, probes) = facade(character(), 3);

    let created = model.create(record(json!({"id": u64::MAX}))).await.unwrap();
    assert_eq!(created["id"], json!(u64::MAX));
    let expected = (u64::MAX % 3) as usize;
    assert_eq!(probes[expected].row_count("character"), 1);

    reset(&probes);
    assert!(model.find_by_pk(u64::MAX).await.unwrap().is_some());
    assert_eq!(probes[expected].calls(), 1);
    assert_eq!(total_calls(&probes).iter().sum::<usize>(), 1);
}

#[tokio::test]
async fn fan_out_reaches_shards_concurrently() {
    let (model, probes) = scattered().await;
    for probe in &probes {
        probe.delay_by(Duration::from_millis(200));
    }

    let started = std::time::Instant::now();
    assert_eq!(model.count(&Filter::new()).await.unwrap(), 3);
    let elapsed = started.elapsed();

    // One shard's latency, not the sum of all three.
    assert!(elapsed < Duration::from_millis(500), "fan-out took {elapsed:?}");
    assert_eq!(total_calls(&probes), vec![1, 1, 1]);
}

#[test]
fn route_filter_reports_the_decision_without_calling_shards() {
    let (model, probes) = facade(inventory(), 3);

    assert_eq!(
        model.route_filter(&Filter::by("player_id", 5)),
        RouteDecision::SingleShard(2)
    );
    assert_eq!(model.route_filter(&Filter::by("item", "lasgun")), RouteDecision::FanOutAll);
    assert_eq!(total_calls(&probes), vec![0, 0, 0]);
}
