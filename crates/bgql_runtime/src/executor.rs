//! Query execution for Better GraphQL.

use crate::query::{FieldInfo, PlanNode, QueryPlan};
use crate::resolver::{ResolvedValue, ResolverArgs, ResolverInfo, ResolverMap, ValueStream};
use crate::response::{FieldError, PathSegment, Response};
use crate::streaming::{Completion, IncrementalPublisher, IncrementalRegistry, ResponseStream};
use bgql_repeater::{BufferPolicy, Iteration, Repeater};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Enable per-field tracing.
    pub tracing: bool,
    /// Buffer of the payload stream of an incremental result.
    pub stream_buffer: BufferPolicy,
    /// Buffer between the source event stream and the consumer of a
    /// subscription.
    pub subscription_buffer: BufferPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tracing: false,
            stream_buffer: BufferPolicy::Fixed(0),
            subscription_buffer: BufferPolicy::Fixed(0),
        }
    }
}

/// The result of executing an operation.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// A plain single result.
    Single(Response),
    /// An incremental result or a subscription.
    Stream(ResponseStream),
}

impl ExecutionOutcome {
    /// Returns true for [`ExecutionOutcome::Stream`].
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns the single result, if this is one.
    pub fn into_single(self) -> Option<Response> {
        match self {
            Self::Single(response) => Some(response),
            Self::Stream(_) => None,
        }
    }

    /// Returns the payload stream, wrapping a single result in a stream of
    /// one.
    pub fn into_stream(self) -> ResponseStream {
        match self {
            Self::Single(response) => Repeater::new(move |push, _stop| async move {
                push.send(response).await?;
                Ok(())
            }),
            Self::Stream(stream) => stream,
        }
    }
}

/// The query executor.
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    resolvers: Arc<ResolverMap>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish()
    }
}

impl Executor {
    /// Creates a new executor.
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
            resolvers: Arc::new(ResolverMap::new()),
        }
    }

    /// Creates an executor with configuration.
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self {
            config,
            resolvers: Arc::new(ResolverMap::new()),
        }
    }

    /// Creates an executor with resolvers.
    pub fn with_resolvers(resolvers: ResolverMap) -> Self {
        Self {
            config: ExecutorConfig::default(),
            resolvers: Arc::new(resolvers),
        }
    }

    /// Creates an executor with config and resolvers.
    pub fn new_with(config: ExecutorConfig, resolvers: ResolverMap) -> Self {
        Self {
            config,
            resolvers: Arc::new(resolvers),
        }
    }

    /// Gets a reference to the resolvers.
    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    /// Gets a reference to the configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes a query plan against an empty root object.
    pub async fn execute(&self, plan: &QueryPlan, ctx: &Context) -> ExecutionOutcome {
        self.execute_with_root(plan, Value::Object(serde_json::Map::new()), ctx)
            .await
    }

    /// Executes a query plan against `root`.
    ///
    /// Without `@defer` or `@stream` work the outcome is a single response.
    /// Otherwise it is a payload stream starting with the initial result.
    pub async fn execute_with_root(
        &self,
        plan: &QueryPlan,
        root: Value,
        ctx: &Context,
    ) -> ExecutionOutcome {
        let exec_ctx = ExecutionContext {
            ctx: ctx.clone(),
            resolvers: Arc::clone(&self.resolvers),
            config: self.config.clone(),
            errors: Arc::new(RwLock::new(Vec::new())),
            incremental: IncrementalRegistry::default(),
        };

        if self.config.tracing {
            debug!(operation = ?plan.operation_name, kind = ?plan.operation_kind, "executing plan");
        }

        let data = execute_node(&plan.root, root, Vec::new(), &exec_ctx).await;
        let errors = exec_ctx.take_errors().await;
        let response = Response::data(data).with_errors(errors);

        if exec_ctx.incremental.is_empty() {
            ExecutionOutcome::Single(response)
        } else {
            debug!("execution has incremental work");
            let publisher = IncrementalPublisher::new(exec_ctx.incremental);
            ExecutionOutcome::Stream(publisher.publish(response, self.config.stream_buffer))
        }
    }
}

/// Executes a plan node.
fn execute_node<'a>(
    node: &'a PlanNode,
    parent: Value,
    path: Vec<PathSegment>,
    ctx: &'a ExecutionContext,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Value> + Send + 'a>> {
    Box::pin(async move {
        match node {
            PlanNode::Sequence(nodes) => execute_sequence(nodes, parent, path, ctx).await,
            PlanNode::Parallel(nodes) => execute_parallel(nodes, parent, path, ctx).await,
            PlanNode::Field {
                info,
                response_name,
                children,
            } => execute_field(info, response_name, children, parent, path, ctx).await,
            PlanNode::Leaf { field } => execute_leaf(field, parent, path, ctx).await,
            PlanNode::TypeCondition { type_name, node } => {
                // Without __typename the condition is assumed to hold
                match parent.get("__typename").and_then(|v| v.as_str()) {
                    Some(typename) if typename != type_name => empty_object(),
                    _ => execute_node(node, parent, path, ctx).await,
                }
            }
            PlanNode::Defer { node, label } => {
                defer_node(node, label.clone(), parent, path, ctx);
                empty_object()
            }
            PlanNode::Stream {
                node,
                label,
                initial_count,
            } => execute_stream(node, label.clone(), *initial_count, parent, path, ctx).await,
            PlanNode::Conditional { condition, node } => {
                if *condition {
                    execute_node(node, parent, path, ctx).await
                } else {
                    empty_object()
                }
            }
        }
    })
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn merge_into(result: &mut serde_json::Map<String, Value>, value: Value) {
    if let Value::Object(map) = value {
        for (k, v) in map {
            result.insert(k, v);
        }
    }
}

/// Executes nodes sequentially.
async fn execute_sequence(
    nodes: &[PlanNode],
    parent: Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> Value {
    let mut result = serde_json::Map::new();

    for node in nodes {
        let value = execute_node(node, parent.clone(), path.clone(), ctx).await;
        merge_into(&mut result, value);
    }

    Value::Object(result)
}

/// Executes nodes concurrently.
async fn execute_parallel(
    nodes: &[PlanNode],
    parent: Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> Value {
    let values = join_all(
        nodes
            .iter()
            .map(|node| execute_node(node, parent.clone(), path.clone(), ctx)),
    )
    .await;

    let mut result = serde_json::Map::new();
    for value in values {
        merge_into(&mut result, value);
    }
    Value::Object(result)
}

/// Executes a field with nested selections.
async fn execute_field(
    info: &FieldInfo,
    response_name: &str,
    children: &PlanNode,
    parent: Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> Value {
    let mut field_path = path;
    field_path.push(PathSegment::Field(response_name.to_string()));

    let resolved = resolve_field(info, &parent, field_path.clone(), ctx).await;
    let value = collect_value(resolved, &field_path, ctx).await;
    let result = complete_value(Some(children), value, field_path, ctx).await;

    let mut obj = serde_json::Map::new();
    obj.insert(response_name.to_string(), result);
    Value::Object(obj)
}

/// Executes a leaf field.
async fn execute_leaf(
    info: &FieldInfo,
    parent: Value,
    mut path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> Value {
    let response_key = info.response_key();
    path.push(PathSegment::Field(response_key.to_string()));

    let resolved = resolve_field(info, &parent, path.clone(), ctx).await;
    let value = collect_value(resolved, &path, ctx).await;

    let mut obj = serde_json::Map::new();
    obj.insert(response_key.to_string(), value);
    Value::Object(obj)
}

/// Runs the sub-selection over a resolved value. Lists are completed item by
/// item, concurrently.
async fn complete_value(
    children: Option<&PlanNode>,
    value: Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> Value {
    let Some(children) = children else {
        return value;
    };
    match value {
        Value::Array(items) => {
            let results = join_all(items.into_iter().enumerate().map(|(i, item)| {
                let mut child_path = path.clone();
                child_path.push(PathSegment::Index(i));
                execute_node(children, item, child_path, ctx)
            }))
            .await;
            Value::Array(results)
        }
        Value::Null => Value::Null,
        other => execute_node(children, other, path, ctx).await,
    }
}

/// Resolves a single field. `path` ends with the field's response key.
async fn resolve_field(
    info: &FieldInfo,
    parent: &Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> ResolvedValue {
    // Handle __typename specially
    if info.is_introspection && info.name == "__typename" {
        return ResolvedValue::Value(Value::String(info.parent_type.clone()));
    }

    if ctx.config.tracing {
        trace!(field = %info.name, parent_type = %info.parent_type, ?path, "resolving field");
    }

    let args = ResolverArgs::from_pairs(info.arguments.clone());

    let resolver_info = ResolverInfo::new(&info.name, &info.parent_type)
        .with_return_type(&info.return_type)
        .with_path(path.clone());

    match ctx.resolvers.get(&info.parent_type, &info.name) {
        Some(r) => match r.resolve(parent, &args, &ctx.ctx, &resolver_info).await {
            Ok(resolved) => resolved,
            Err(e) => {
                ctx.record_error(FieldError::from(e).with_path(path)).await;
                ResolvedValue::Value(Value::Null)
            }
        },
        // No resolver found, try default property access
        None => ResolvedValue::Value(parent.get(&info.name).cloned().unwrap_or(Value::Null)),
    }
}

/// Turns a resolved value into a plain value, draining a stream into a list.
async fn collect_value(
    resolved: ResolvedValue,
    path: &[PathSegment],
    ctx: &ExecutionContext,
) -> Value {
    let stream = match resolved {
        ResolvedValue::Value(value) => return value,
        ResolvedValue::Stream(stream) => stream,
    };

    let mut source = ListSource::Stream(stream);
    let mut items = Vec::new();
    while let Some(item) = source.next_item().await {
        match item {
            Ok(item) => items.push(item),
            Err(err) => {
                ctx.record_error(err.with_path(path.to_vec())).await;
                return Value::Null;
            }
        }
    }
    Value::Array(items)
}

/// Registers a deferred fragment. It runs with its own error list.
fn defer_node(
    node: &PlanNode,
    label: Option<String>,
    parent: Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) {
    trace!(?label, ?path, "deferring fragment");
    let node = node.clone();
    let unit = ctx.fork();
    ctx.incremental.spawn(async move {
        let data = execute_node(&node, parent, path.clone(), &unit).await;
        let errors = unit.take_errors().await;
        Completion::Deferred {
            path,
            label,
            data,
            errors,
        }
    });
}

/// Executes a streamed list field: the first `initial_count` items go into
/// the initial result, the rest are delivered one payload per item.
async fn execute_stream(
    node: &PlanNode,
    label: Option<String>,
    initial_count: usize,
    parent: Value,
    path: Vec<PathSegment>,
    ctx: &ExecutionContext,
) -> Value {
    let (info, response_name, children) = match node {
        PlanNode::Field {
            info,
            response_name,
            children,
        } => (info, response_name.as_str(), Some(&**children)),
        PlanNode::Leaf { field } => (field, field.response_key(), None),
        other => return execute_node(other, parent, path, ctx).await,
    };

    let mut field_path = path;
    field_path.push(PathSegment::Field(response_name.to_string()));

    let mut source = match resolve_field(info, &parent, field_path.clone(), ctx).await {
        ResolvedValue::Value(Value::Array(items)) => ListSource::Items(items.into_iter()),
        ResolvedValue::Stream(stream) => ListSource::Stream(stream),
        ResolvedValue::Value(other) => {
            // Not a list, nothing to stream.
            let value = complete_value(children, other, field_path, ctx).await;
            let mut obj = serde_json::Map::new();
            obj.insert(response_name.to_string(), value);
            return Value::Object(obj);
        }
    };

    let mut items = Vec::new();
    let mut failed = false;
    while items.len() < initial_count {
        match source.next_item().await {
            Some(Ok(item)) => {
                let mut item_path = field_path.clone();
                item_path.push(PathSegment::Index(items.len()));
                items.push(complete_value(children, item, item_path, ctx).await);
            }
            Some(Err(err)) => {
                ctx.record_error(err.with_path(field_path.clone())).await;
                failed = true;
                break;
            }
            None => break,
        }
    }

    let mut obj = serde_json::Map::new();
    if failed {
        obj.insert(response_name.to_string(), Value::Null);
        return Value::Object(obj);
    }

    let exhausted = source.is_exhausted() || items.len() < initial_count;
    if !exhausted {
        trace!(?label, path = ?field_path, initial = items.len(), "streaming remaining items");
        let record = StreamRecord {
            source,
            children: children.cloned(),
            path: field_path,
            label,
            index: items.len(),
            ctx: ctx.clone(),
        };
        ctx.incremental.spawn(stream_items(record));
    }

    obj.insert(response_name.to_string(), Value::Array(items));
    Value::Object(obj)
}

/// Where the items of a list come from.
enum ListSource {
    Items(std::vec::IntoIter<Value>),
    Stream(ValueStream),
}

impl ListSource {
    async fn next_item(&mut self) -> Option<Result<Value, FieldError>> {
        match self {
            Self::Items(items) => items.next().map(Ok),
            Self::Stream(stream) => {
                let step = match stream.next() {
                    Ok(pull) => pull.await,
                    Err(overflow) => Err(FieldError::new(overflow.to_string())),
                };
                match step {
                    Ok(Iteration::Next(item)) => Some(Ok(item)),
                    Ok(Iteration::Done(_)) => None,
                    Err(err) => Some(Err(err)),
                }
            }
        }
    }

    /// True once a list source is known to have no more items. A stream
    /// only tells by ending.
    fn is_exhausted(&self) -> bool {
        match self {
            Self::Items(items) => items.len() == 0,
            Self::Stream(_) => false,
        }
    }
}

/// The remainder of a streamed list.
struct StreamRecord {
    source: ListSource,
    children: Option<PlanNode>,
    path: Vec<PathSegment>,
    label: Option<String>,
    index: usize,
    ctx: ExecutionContext,
}

/// Delivers the next item of a streamed list and registers the one after it.
fn stream_items(mut record: StreamRecord) -> BoxFuture<'static, Completion> {
    async move {
        match record.source.next_item().await {
            Some(Ok(item)) => {
                let unit = record.ctx.fork();
                let mut item_path = record.path.clone();
                item_path.push(PathSegment::Index(record.index));
                let item =
                    complete_value(record.children.as_ref(), item, item_path.clone(), &unit).await;
                let errors = unit.take_errors().await;

                let label = record.label.clone();
                if !record.source.is_exhausted() {
                    record.index += 1;
                    let registry = record.ctx.incremental.clone();
                    registry.spawn(stream_items(record));
                }
                Completion::Items {
                    path: item_path,
                    label,
                    items: vec![item],
                    errors,
                }
            }
            Some(Err(err)) => Completion::StreamFailed {
                errors: vec![err.with_path(record.path.clone())],
                path: record.path,
                label: record.label,
            },
            None => Completion::StreamEnded {
                path: record.path,
                label: record.label,
            },
        }
    }
    .boxed()
}

/// Execution context.
#[derive(Clone)]
struct ExecutionContext {
    ctx: Context,
    resolvers: Arc<ResolverMap>,
    config: ExecutorConfig,
    errors: Arc<RwLock<Vec<FieldError>>>,
    incremental: IncrementalRegistry,
}

impl ExecutionContext {
    /// A context for one unit of incremental work: same registry, own errors.
    fn fork(&self) -> Self {
        Self {
            errors: Arc::new(RwLock::new(Vec::new())),
            ..self.clone()
        }
    }

    async fn record_error(&self, error: FieldError) {
        self.errors.write().await.push(error);
    }

    async fn take_errors(&self) -> Vec<FieldError> {
        std::mem::take(&mut *self.errors.write().await)
    }
}

/// Execution context.
#[derive(Debug, Clone)]
pub struct Context {
    /// Request-scoped data.
    pub data: HashMap<String, serde_json::Value>,
    /// Variables from the request.
    pub variables: HashMap<String, serde_json::Value>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new context.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    /// Creates a context with variables.
    pub fn with_variables(variables: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: HashMap::new(),
            variables,
        }
    }

    /// Sets a value in the context.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
    }

    /// Gets a value from the context.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a variable by name.
    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Gets a variable as a specific type.
    pub fn variable_as<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        self.variables
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
