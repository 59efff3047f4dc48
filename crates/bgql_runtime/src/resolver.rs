//! Resolver system for Better GraphQL.
//!
//! This module provides the resolver trait and infrastructure for field resolution,
//! and the subscribe side of subscription root fields.

use crate::executor::Context;
use crate::response::{FieldError, PathSegment};
use bgql_repeater::Repeater;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// A stream of values produced by a resolver or a subscribe function.
pub type ValueStream = Repeater<Value, FieldError>;

/// Arguments passed to a resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverArgs {
    args: IndexMap<String, Value>,
}

impl ResolverArgs {
    /// Creates new resolver args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from a list of (name, value) pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ResolverError> {
        self.args
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ResolverError::ArgumentParseError(name.to_string(), e.to_string()))
            })
    }

    /// Returns all arguments.
    pub fn all(&self) -> &IndexMap<String, Value> {
        &self.args
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    /// The field name being resolved.
    pub field_name: String,

    /// The return type name.
    pub return_type: String,

    /// The parent type name.
    pub parent_type: String,

    /// Path to this field.
    pub path: Vec<PathSegment>,
}

impl ResolverInfo {
    /// Creates new resolver info.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            return_type: String::new(),
            parent_type: parent_type.into(),
            path: Vec::new(),
        }
    }

    /// Sets the return type.
    #[must_use]
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    /// Sets the path.
    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }
}

/// What a resolver produced for a field.
#[derive(Debug)]
pub enum ResolvedValue {
    /// A complete value.
    Value(Value),
    /// List items produced over time. Collected into a list unless the
    /// field is streamed.
    Stream(ValueStream),
}

impl From<Value> for ResolvedValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<ValueStream> for ResolvedValue {
    fn from(stream: ValueStream) -> Self {
        Self::Stream(stream)
    }
}

/// Result type for resolver functions.
pub type ResolverResult = Result<Value, ResolverError>;

/// Future type for resolvers.
pub type ResolverFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ResolvedValue, ResolverError>> + Send + 'a>>;

/// Future type for subscribe functions.
pub type SubscriberFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ValueStream, ResolverError>> + Send + 'a>>;

/// Error from a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    /// Field not found.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// Missing required argument.
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// Argument parse error.
    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParseError(String, String),

    /// Custom error.
    #[error("{0}")]
    Custom(String),
}

impl From<ResolverError> for FieldError {
    fn from(error: ResolverError) -> Self {
        FieldError::new(error.to_string())
    }
}

/// Trait for field resolvers.
pub trait Resolver: Send + Sync {
    /// Resolves a field value.
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;
}

/// Trait for the subscribe side of a subscription root field.
///
/// Returns the source event stream; every event it yields becomes the root
/// value of one execution.
pub trait Subscriber: Send + Sync {
    /// Creates the source event stream.
    fn subscribe<'a>(
        &'a self,
        root: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> SubscriberFuture<'a>;
}

/// A boxed resolver.
pub type BoxedResolver = Box<dyn Resolver>;

/// A boxed subscriber.
pub type BoxedSubscriber = Box<dyn Subscriber>;

/// A sync resolver function.
pub type SyncResolverFn =
    Arc<dyn Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync>;

/// A wrapper for sync resolver functions.
pub struct FnResolver {
    func: SyncResolverFn,
}

impl FnResolver {
    /// Creates a new function resolver.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Resolver for FnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = (self.func)(parent, args, ctx, info).map(ResolvedValue::Value);
        Box::pin(async move { result })
    }
}

/// An async resolver function type.
pub type AsyncResolverFn = Arc<
    dyn Fn(Value, ResolverArgs, Context, ResolverInfo) -> ResolverFuture<'static> + Send + Sync,
>;

/// A wrapper for async resolver functions.
pub struct AsyncFnResolver {
    func: AsyncResolverFn,
}

impl AsyncFnResolver {
    /// Creates a new async function resolver.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |parent, args, ctx, info| -> ResolverFuture<'static> {
                let fut = f(parent, args, ctx, info);
                Box::pin(async move { fut.await.map(ResolvedValue::Value) })
            }),
        }
    }
}

impl Resolver for AsyncFnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let parent = parent.clone();
        let args = args.clone();
        let ctx = ctx.clone();
        let info = info.clone();
        let func = Arc::clone(&self.func);
        Box::pin(async move { func(parent, args, ctx, info).await })
    }
}

/// A stream resolver function type.
pub type StreamResolverFn = Arc<
    dyn Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> Result<ValueStream, ResolverError>
        + Send
        + Sync,
>;

/// A wrapper for resolvers producing list items over time.
pub struct StreamResolver {
    func: StreamResolverFn,
}

impl StreamResolver {
    /// Creates a new stream resolver.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> Result<ValueStream, ResolverError>
            + Send
            + Sync
            + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Resolver for StreamResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = (self.func)(parent, args, ctx, info).map(ResolvedValue::Stream);
        Box::pin(async move { result })
    }
}

/// A subscribe function type.
pub type SubscribeFn = Arc<
    dyn Fn(Value, ResolverArgs, Context, ResolverInfo) -> SubscriberFuture<'static> + Send + Sync,
>;

/// A wrapper for async subscribe functions.
pub struct FnSubscriber {
    func: SubscribeFn,
}

impl FnSubscriber {
    /// Creates a new subscriber.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, ResolverError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |root, args, ctx, info| -> SubscriberFuture<'static> {
                Box::pin(f(root, args, ctx, info))
            }),
        }
    }
}

impl Subscriber for FnSubscriber {
    fn subscribe<'a>(
        &'a self,
        root: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> SubscriberFuture<'a> {
        (self.func)(root.clone(), args.clone(), ctx.clone(), info.clone())
    }
}

/// Default resolver that accesses properties from the parent object.
pub struct DefaultResolver;

impl Resolver for DefaultResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        _args: &'a ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let field_name = &info.field_name;
        let result = match parent {
            Value::Object(map) => {
                if let Some(value) = map.get(field_name) {
                    Ok(value.clone())
                } else {
                    // Try snake_case version
                    let snake_case = to_snake_case(field_name);
                    Ok(map.get(&snake_case).cloned().unwrap_or(Value::Null))
                }
            }
            Value::Null => Ok(Value::Null),
            _ => Err(ResolverError::FieldNotFound(field_name.clone())),
        };
        Box::pin(async move { result.map(ResolvedValue::Value) })
    }
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Storage for resolvers organized by type and field.
#[derive(Default)]
pub struct ResolverMap {
    /// Resolvers indexed by "TypeName.fieldName".
    resolvers: FxHashMap<String, BoxedResolver>,

    /// Subscribe functions indexed by "TypeName.fieldName".
    subscribers: FxHashMap<String, BoxedSubscriber>,

    /// Default resolver for unregistered fields.
    default_resolver: Option<BoxedResolver>,

    /// Subscribe function for unregistered subscription fields.
    default_subscriber: Option<BoxedSubscriber>,
}

impl ResolverMap {
    /// Creates a new resolver map.
    pub fn new() -> Self {
        Self {
            resolvers: FxHashMap::default(),
            subscribers: FxHashMap::default(),
            default_resolver: Some(Box::new(DefaultResolver)),
            default_subscriber: None,
        }
    }

    /// Registers a resolver for a specific type and field.
    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.resolvers.insert(key, Box::new(resolver));
    }

    /// Registers a sync function as a resolver.
    pub fn register_fn<F>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, field_name, FnResolver::new(f));
    }

    /// Registers an async function as a resolver.
    pub fn register_async<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.register(type_name, field_name, AsyncFnResolver::new(f));
    }

    /// Registers a function returning list items over time.
    pub fn register_stream<F>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> Result<ValueStream, ResolverError>
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, field_name, StreamResolver::new(f));
    }

    /// Registers the subscribe function of a subscription root field.
    pub fn register_subscription<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, ResolverError>> + Send + 'static,
    {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.subscribers.insert(key, Box::new(FnSubscriber::new(f)));
    }

    /// Gets a resolver for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&dyn Resolver> {
        let key = format!("{}.{}", type_name, field_name);
        self.resolvers
            .get(&key)
            .map(|r| r.as_ref())
            .or(self.default_resolver.as_ref().map(|r| r.as_ref()))
    }

    /// Gets the subscribe function for a type and field.
    pub fn get_subscriber(&self, type_name: &str, field_name: &str) -> Option<&dyn Subscriber> {
        let key = format!("{}.{}", type_name, field_name);
        self.subscribers
            .get(&key)
            .map(|s| s.as_ref())
            .or(self.default_subscriber.as_ref().map(|s| s.as_ref()))
    }

    /// Sets the default resolver.
    pub fn set_default<R: Resolver + 'static>(&mut self, resolver: R) {
        self.default_resolver = Some(Box::new(resolver));
    }

    /// Removes the default resolver.
    pub fn remove_default(&mut self) {
        self.default_resolver = None;
    }

    /// Sets the subscribe function used for subscription fields without
    /// their own.
    pub fn set_default_subscriber<S: Subscriber + 'static>(&mut self, subscriber: S) {
        self.default_subscriber = Some(Box::new(subscriber));
    }
}

impl Debug for ResolverMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .field("subscriber_count", &self.subscribers.len())
            .field("has_default", &self.default_resolver.is_some())
            .field("has_default_subscriber", &self.default_subscriber.is_some())
            .finish()
    }
}
