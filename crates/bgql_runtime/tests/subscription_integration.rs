//! Integration tests for subscriptions.

use bgql_runtime::{
    Context, ExecutionOutcome, Executor, FieldInfo, Iteration, PlanNode, PubSub, QueryPlan,
    Repeater, ResolverMap, Response, ResponseStream,
};
use futures::StreamExt;
use serde_json::{json, Value};
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

async fn next_payload(stream: &ResponseStream) -> Value {
    let payload = stream
        .next()
        .expect("pull queue overflowed")
        .await
        .expect("payload")
        .into_next()
        .expect("stream ended");
    serde_json::to_value(payload).expect("serializable")
}

fn email(from: &str, subject: &str, unread: u32, total: u32) -> Value {
    json!({
        "email": {"from": from, "subject": subject, "message": "..."},
        "inbox": {"unread": unread, "total": total}
    })
}

fn email_plan() -> QueryPlan {
    QueryPlan::subscription(PlanNode::field(
        FieldInfo::new("importantEmail", "Subscription", "EmailEvent"),
        PlanNode::Parallel(vec![
            PlanNode::field(
                FieldInfo::new("email", "EmailEvent", "Email"),
                PlanNode::Parallel(vec![
                    PlanNode::leaf(FieldInfo::new("from", "Email", "String")),
                    PlanNode::leaf(FieldInfo::new("subject", "Email", "String")),
                ]),
            ),
            PlanNode::defer(
                PlanNode::field(
                    FieldInfo::new("inbox", "EmailEvent", "Inbox"),
                    PlanNode::Parallel(vec![
                        PlanNode::leaf(FieldInfo::new("unread", "Inbox", "Int")),
                        PlanNode::leaf(FieldInfo::new("total", "Inbox", "Int")),
                    ]),
                ),
                None,
            ),
        ]),
    ))
}

fn email_resolvers(pubsub: &PubSub) -> ResolverMap {
    let pubsub = pubsub.clone();
    let mut resolvers = ResolverMap::new();
    resolvers.register_subscription(
        "Subscription",
        "importantEmail",
        move |_root, _args, _ctx, _info| {
            let pubsub = pubsub.clone();
            async move { Ok(pubsub.subscribe("emails").await) }
        },
    );
    resolvers.register_fn("Subscription", "importantEmail", |event, _args, _ctx, _info| {
        Ok(event.clone())
    });
    resolvers
}

#[tokio::test]
async fn test_deferred_payloads_per_event() {
    init_tracing();
    let pubsub = PubSub::new();
    let executor = Executor::with_resolvers(email_resolvers(&pubsub));

    let stream = into_stream(executor.subscribe(&email_plan(), &Context::new()).await);
    let pending = stream.next().unwrap();

    assert_eq!(
        pubsub
            .publish("emails", email("yuzhi@graphql.org", "Alright", 1, 2))
            .await,
        1
    );
    let first = pending.await.unwrap().into_next().unwrap();
    assert_eq!(
        serde_json::to_value(first).unwrap(),
        json!({
            "data": {"importantEmail": {"email": {"from": "yuzhi@graphql.org", "subject": "Alright"}}},
            "hasNext": true
        })
    );
    assert_eq!(
        next_payload(&stream).await,
        json!({
            "data": {"inbox": {"unread": 1, "total": 2}},
            "path": ["importantEmail"],
            "hasNext": false
        })
    );

    pubsub
        .publish("emails", email("hyo@graphql.org", "Tools", 2, 3))
        .await;
    assert_eq!(
        next_payload(&stream).await,
        json!({
            "data": {"importantEmail": {"email": {"from": "hyo@graphql.org", "subject": "Tools"}}},
            "hasNext": true
        })
    );

    // A new event arrives before the previous event's deferred payload was read.
    pubsub
        .publish("emails", email("adam@graphql.org", "Important", 3, 4))
        .await;
    assert_eq!(
        next_payload(&stream).await,
        json!({
            "data": {"inbox": {"unread": 2, "total": 3}},
            "path": ["importantEmail"],
            "hasNext": false
        })
    );
    assert_eq!(
        next_payload(&stream).await,
        json!({
            "data": {"importantEmail": {"email": {"from": "adam@graphql.org", "subject": "Important"}}},
            "hasNext": true
        })
    );

    // The client disconnects before the deferred payload is consumed.
    assert_eq!(stream.close().await, Ok(Iteration::Done(None)));
    assert_eq!(stream.next().unwrap().await, Ok(Iteration::Done(None)));
    assert_eq!(stream.close().await, Ok(Iteration::Done(None)));
}

/// Payloads of a later event never overtake those of an earlier one, even
/// when the later event's work finishes first.
#[tokio::test]
async fn test_event_payloads_are_not_interleaved() {
    init_tracing();
    let mut resolvers = ResolverMap::new();
    resolvers.register_subscription("Subscription", "tick", |_root, _args, _ctx, _info| async {
        Ok(Repeater::from_stream(futures::stream::iter(vec![
            Ok(json!({"name": "A", "delay": 40})),
            Ok(json!({"name": "B", "delay": 0})),
        ])))
    });
    resolvers.register_fn("Subscription", "tick", |event, _args, _ctx, _info| {
        Ok(event.clone())
    });
    resolvers.register_async("Tick", "detail", |parent, _args, _ctx, _info| async move {
        let delay = parent["delay"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(json!(format!("{}-detail", parent["name"].as_str().unwrap_or_default())))
    });
    let executor = Executor::with_resolvers(resolvers);

    let plan = QueryPlan::subscription(PlanNode::field(
        FieldInfo::new("tick", "Subscription", "Tick"),
        PlanNode::Parallel(vec![
            PlanNode::leaf(FieldInfo::new("name", "Tick", "String")),
            PlanNode::defer(PlanNode::leaf(FieldInfo::new("detail", "Tick", "String")), None),
        ]),
    ));

    let payloads: Vec<Value> = into_stream(executor.subscribe(&plan, &Context::new()).await)
        .map(|payload| serde_json::to_value(payload.unwrap()).unwrap())
        .collect()
        .await;

    assert_eq!(
        payloads,
        vec![
            json!({"data": {"tick": {"name": "A"}}, "hasNext": true}),
            json!({"data": {"detail": "A-detail"}, "path": ["tick"], "hasNext": false}),
            json!({"data": {"tick": {"name": "B"}}, "hasNext": true}),
            json!({"data": {"detail": "B-detail"}, "path": ["tick"], "hasNext": false}),
        ]
    );
}

#[tokio::test]
async fn test_subscription_on_single_results() {
    let pubsub = PubSub::new();
    let mut resolvers = ResolverMap::new();
    let hub = pubsub.clone();
    resolvers.register_subscription("Subscription", "count", move |_root, _args, _ctx, _info| {
        let hub = hub.clone();
        async move { Ok(hub.subscribe("count").await) }
    });
    resolvers.register_fn("Subscription", "count", |event, _args, _ctx, _info| {
        Ok(event.clone())
    });
    let executor = Executor::with_resolvers(resolvers);
    let plan = QueryPlan::subscription(PlanNode::leaf(FieldInfo::new(
        "count",
        "Subscription",
        "Int",
    )));

    let stream = into_stream(executor.subscribe(&plan, &Context::new()).await);
    for i in 0..3 {
        pubsub.publish("count", json!(i)).await;
    }

    for i in 0..3 {
        let payload = stream.next().unwrap().await.unwrap();
        assert_eq!(payload, Iteration::Next(Response::data(json!({"count": i}))));
    }
    assert_eq!(stream.close().await, Ok(Iteration::Done(None)));
}
