//! Runtime for Better GraphQL.
//!
//! This crate provides the GraphQL execution runtime:
//! - `executor`: Query execution
//! - `query`: Query plans
//! - `resolver`: Field resolvers and subscribe functions
//! - `response`: Responses and incremental payloads
//! - `streaming`: @defer/@stream delivery
//! - `subscription`: Subscription execution
//! - `pubsub`: In-process event hub for subscriptions

pub mod executor;
pub mod pubsub;
pub mod query;
pub mod resolver;
pub mod response;
pub mod streaming;
pub mod subscription;

pub use bgql_repeater::{BufferPolicy, Iteration, Repeater};
pub use executor::{Context, ExecutionOutcome, Executor, ExecutorConfig};
pub use pubsub::PubSub;
pub use query::{FieldInfo, OperationKind, PlanNode, QueryPlan};
pub use resolver::{
    FnSubscriber, ResolvedValue, Resolver, ResolverArgs, ResolverError, ResolverInfo, ResolverMap,
    Subscriber, ValueStream,
};
pub use response::{FieldError, PathSegment, Response};
pub use streaming::{IncrementalPublisher, ResponseStream};
