//! Integration tests for incremental execution.

use bgql_runtime::{
    Context, ExecutionOutcome, Executor, FieldInfo, Iteration, PlanNode, QueryPlan, Repeater,
    ResolverError, ResolverMap, ResponseStream,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn into_stream(outcome: ExecutionOutcome) -> ResponseStream {
    match outcome {
        ExecutionOutcome::Stream(stream) => stream,
        ExecutionOutcome::Single(response) => panic!("expected a stream, got {response:?}"),
    }
}

async fn payloads(outcome: ExecutionOutcome) -> Vec<Value> {
    into_stream(outcome)
        .map(|payload| serde_json::to_value(payload.expect("payload")).expect("serializable"))
        .collect()
        .await
}

async fn wait_for(flag: &AtomicBool) -> bool {
    for _ in 0..50 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    flag.load(Ordering::SeqCst)
}

fn user_plan(deferred: PlanNode) -> QueryPlan {
    QueryPlan::query(PlanNode::field(
        FieldInfo::new("user", "Query", "User"),
        PlanNode::Parallel(vec![PlanNode::leaf(FieldInfo::new("id", "User", "ID")), deferred]),
    ))
}

/// One deferred fragment over a root that resolves immediately.
#[tokio::test]
async fn test_single_deferred_fragment() {
    init_tracing();
    let executor = Executor::new();
    let plan = user_plan(PlanNode::defer(
        PlanNode::leaf(FieldInfo::new("name", "User", "String")),
        None,
    ));
    let root = json!({"user": {"id": "1", "name": "Alice"}});

    let outcome = executor.execute_with_root(&plan, root, &Context::new()).await;

    assert_eq!(
        payloads(outcome).await,
        vec![
            json!({"data": {"user": {"id": "1"}}, "hasNext": true}),
            json!({"data": {"name": "Alice"}, "path": ["user"], "hasNext": false}),
        ]
    );
}

/// Without incremental work the result is a plain single response.
#[tokio::test]
async fn test_no_incremental_work_is_single() {
    let executor = Executor::new();
    let plan = user_plan(PlanNode::leaf(FieldInfo::new("name", "User", "String")));
    let root = json!({"user": {"id": "1", "name": "Alice"}});

    let response = executor
        .execute_with_root(&plan, root, &Context::new())
        .await
        .into_single()
        .expect("single result");

    assert_eq!(
        serde_json::to_value(response).unwrap(),
        json!({"data": {"user": {"id": "1", "name": "Alice"}}})
    );
}

/// Sibling deferred fragments are delivered as they complete.
#[tokio::test]
async fn test_sibling_defers_in_completion_order() {
    init_tracing();
    let mut resolvers = ResolverMap::new();
    resolvers.register_async("Query", "slow", |_parent, _args, _ctx, _info| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!("slow"))
    });
    resolvers.register_async("Query", "quick", |_parent, _args, _ctx, _info| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(json!("quick"))
    });
    let executor = Executor::with_resolvers(resolvers);

    let plan = QueryPlan::query(PlanNode::Parallel(vec![
        PlanNode::leaf(FieldInfo::new("__typename", "Query", "String")),
        PlanNode::defer(PlanNode::leaf(FieldInfo::new("slow", "Query", "String")), Some("slow")),
        PlanNode::defer(PlanNode::leaf(FieldInfo::new("quick", "Query", "String")), Some("quick")),
    ]));

    let outcome = executor.execute(&plan, &Context::new()).await;

    assert_eq!(
        payloads(outcome).await,
        vec![
            json!({"data": {"__typename": "Query"}, "hasNext": true}),
            json!({"data": {"quick": "quick"}, "path": [], "label": "quick", "hasNext": true}),
            json!({"data": {"slow": "slow"}, "path": [], "label": "slow", "hasNext": false}),
        ]
    );
}

/// Errors of a deferred fragment only appear on its own payload.
#[tokio::test]
async fn test_deferred_error_is_local() {
    let mut resolvers = ResolverMap::new();
    resolvers.register_fn("Query", "broken", |_parent, _args, _ctx, _info| {
        Err(ResolverError::Custom("broken field".to_string()))
    });
    let executor = Executor::with_resolvers(resolvers);

    let plan = QueryPlan::query(PlanNode::Parallel(vec![
        PlanNode::leaf(FieldInfo::new("ok", "Query", "Int")),
        PlanNode::defer(PlanNode::leaf(FieldInfo::new("broken", "Query", "Int")), None),
    ]));

    let outcome = executor
        .execute_with_root(&plan, json!({"ok": 1}), &Context::new())
        .await;

    assert_eq!(
        payloads(outcome).await,
        vec![
            json!({"data": {"ok": 1}, "hasNext": true}),
            json!({
                "data": {"broken": null},
                "errors": [{"message": "broken field", "path": ["broken"]}],
                "path": [],
                "hasNext": false
            }),
        ]
    );
}

/// A streamed list delivers one payload per item after the initial ones.
#[tokio::test]
async fn test_stream_list_items() {
    let executor = Executor::new();
    let plan = QueryPlan::query(PlanNode::stream(
        PlanNode::field(
            FieldInfo::new("users", "Query", "User"),
            PlanNode::leaf(FieldInfo::new("id", "User", "ID")),
        ),
        Some("users"),
        1,
    ));
    let root = json!({"users": [
        {"id": "1", "name": "A"},
        {"id": "2", "name": "B"},
        {"id": "3", "name": "C"}
    ]});

    let outcome = executor.execute_with_root(&plan, root, &Context::new()).await;

    assert_eq!(
        payloads(outcome).await,
        vec![
            json!({"data": {"users": [{"id": "1"}]}, "hasNext": true}),
            json!({"items": [{"id": "2"}], "path": ["users", 1], "label": "users", "hasNext": true}),
            json!({"items": [{"id": "3"}], "path": ["users", 2], "label": "users", "hasNext": false}),
        ]
    );
}

/// A list short enough to fit the initial count is not streamed at all.
#[tokio::test]
async fn test_stream_within_initial_count() {
    let executor = Executor::new();
    let plan = QueryPlan::query(PlanNode::stream(
        PlanNode::leaf(FieldInfo::new("numbers", "Query", "Int")),
        None,
        5,
    ));

    let outcome = executor
        .execute_with_root(&plan, json!({"numbers": [1, 2]}), &Context::new())
        .await;

    let response = outcome.into_single().expect("single result");
    assert_eq!(response.data, Some(json!({"numbers": [1, 2]})));
}

/// Items of a stream resolver are pulled as the stream produces them.
#[tokio::test]
async fn test_stream_resolver_items() {
    init_tracing();
    let mut resolvers = ResolverMap::new();
    resolvers.register_stream("Query", "numbers", |_parent, _args, _ctx, _info| {
        Ok(Repeater::from_stream(futures::stream::iter(vec![
            Ok(json!(1)),
            Ok(json!(2)),
            Ok(json!(3)),
        ])))
    });
    let executor = Executor::with_resolvers(resolvers);
    let plan = QueryPlan::query(PlanNode::stream(
        PlanNode::leaf(FieldInfo::new("numbers", "Query", "Int")),
        None,
        2,
    ));

    let outcome = executor.execute(&plan, &Context::new()).await;

    assert_eq!(
        payloads(outcome).await,
        vec![
            json!({"data": {"numbers": [1, 2]}, "hasNext": true}),
            json!({"items": [3], "path": ["numbers", 2], "hasNext": true}),
            json!({"path": ["numbers"], "hasNext": false}),
        ]
    );
}

/// Closing an incremental result stops the resolver stream still feeding it.
#[tokio::test]
async fn test_close_stops_streamed_source() {
    let started = Arc::new(AtomicBool::new(false));
    let torn_down = Arc::new(AtomicBool::new(false));
    let flags = (Arc::clone(&started), Arc::clone(&torn_down));
    let mut resolvers = ResolverMap::new();
    resolvers.register_stream("Query", "ticks", move |_parent, _args, _ctx, _info| {
        let (started, flag) = (Arc::clone(&flags.0), Arc::clone(&flags.1));
        Ok(Repeater::new(|push, stop| async move {
            started.store(true, Ordering::SeqCst);
            push.send(json!(1)).await?;
            stop.stopped().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
    });
    let executor = Executor::with_resolvers(resolvers);
    let plan = QueryPlan::query(PlanNode::stream(
        PlanNode::leaf(FieldInfo::new("ticks", "Query", "Int")),
        None,
        0,
    ));

    let stream = into_stream(executor.execute(&plan, &Context::new()).await);
    let initial = stream.next().unwrap().await.unwrap().into_next().unwrap();
    assert_eq!(initial.data, Some(json!({"ticks": []})));
    assert_eq!(initial.has_next, Some(true));
    assert!(wait_for(&started).await);

    assert_eq!(stream.close().await, Ok(Iteration::Done(None)));
    assert_eq!(stream.next().unwrap().await, Ok(Iteration::Done(None)));
    assert!(wait_for(&torn_down).await);
}
