//! Subscription execution.
//!
//! A subscription resolves the subscribe function of its first root field
//! into a source event stream, then executes the plan once per event with the
//! event as root value. Each execution's payloads are delivered in full
//! before any payload of the next event.

use crate::executor::{Context, ExecutionOutcome, Executor};
use crate::query::QueryPlan;
use crate::resolver::{ResolverArgs, ResolverInfo, ValueStream};
use crate::response::{FieldError, PathSegment, Response};
use bgql_repeater::{flatten, Iteration, Nested, Push, Repeater, Stop};
use serde_json::Value;
use tracing::{debug, trace};

type EventPayloads = Nested<Response, FieldError>;

impl Executor {
    /// Subscribes to a subscription plan with an empty root value.
    pub async fn subscribe(&self, plan: &QueryPlan, ctx: &Context) -> ExecutionOutcome {
        let root = Value::Object(serde_json::Map::new());
        self.subscribe_with_root(plan, root, ctx).await
    }

    /// Subscribes to a subscription plan, handing `root` to the subscribe
    /// function.
    ///
    /// Fails with a single error response when the source event stream
    /// cannot be created. Otherwise the outcome is a stream with the payloads
    /// of every event, in event order.
    pub async fn subscribe_with_root(
        &self,
        plan: &QueryPlan,
        root: Value,
        ctx: &Context,
    ) -> ExecutionOutcome {
        let source = match self.create_source_event_stream(plan, &root, ctx).await {
            Ok(source) => source,
            Err(response) => return ExecutionOutcome::Single(response),
        };

        let executor = self.clone();
        let plan = plan.clone();
        let ctx = ctx.clone();
        let events: Repeater<EventPayloads, FieldError> =
            Repeater::with_buffer(self.config().subscription_buffer, move |push, stop| async move {
                let outcome = pump(&executor, &plan, &ctx, &source, &push, &stop).await;
                trace!("closing source event stream");
                let closed = source.close().await;
                outcome?;
                closed?;
                Ok(())
            });

        ExecutionOutcome::Stream(flatten(events))
    }

    /// Calls the subscribe function of the first root field.
    ///
    /// The error response carries the failure under the root field's path.
    pub async fn create_source_event_stream(
        &self,
        plan: &QueryPlan,
        root: &Value,
        ctx: &Context,
    ) -> Result<ValueStream, Response> {
        let Some(field) = plan.first_root_field() else {
            return Err(Response::error(FieldError::new(
                "Subscription must select a root field",
            )));
        };
        let path = vec![PathSegment::Field(field.response_key().to_string())];

        let Some(subscriber) = self
            .resolvers()
            .get_subscriber(&field.parent_type, &field.name)
        else {
            return Err(Response::error(
                FieldError::new(format!(
                    "Subscription field \"{}\" must return an event stream",
                    field.name
                ))
                .with_path(path),
            ));
        };

        let args = ResolverArgs::from_pairs(field.arguments.clone());
        let info = ResolverInfo::new(&field.name, &field.parent_type)
            .with_return_type(&field.return_type)
            .with_path(path.clone());

        debug!(field = %field.name, "creating source event stream");
        subscriber
            .subscribe(root, &args, ctx, &info)
            .await
            .map_err(|e| Response::error(FieldError::from(e).with_path(path)))
    }
}

/// Runs one execution per source event until the source ends or the
/// subscription is closed.
async fn pump(
    executor: &Executor,
    plan: &QueryPlan,
    ctx: &Context,
    source: &ValueStream,
    push: &Push<EventPayloads, FieldError>,
    stop: &Stop<EventPayloads, FieldError>,
) -> Result<(), FieldError> {
    loop {
        let pull = source
            .next()
            .map_err(|overflow| FieldError::new(overflow.to_string()))?;
        let step = tokio::select! {
            biased;
            () = stop.stopped() => return Ok(()),
            step = pull => step?,
        };
        let Iteration::Next(event) = step else {
            debug!("source event stream ended");
            return Ok(());
        };

        trace!("executing subscription event");
        let payloads = match executor.execute_with_root(plan, event, ctx).await {
            ExecutionOutcome::Single(response) => Nested::Item(response),
            ExecutionOutcome::Stream(stream) => Nested::Stream(stream),
        };
        push.send(payloads).await?;
    }
}
