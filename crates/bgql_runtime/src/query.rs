//! Query plans for Better GraphQL.
//!
//! A plan is the output of field collection: the executor walks it without
//! looking at the document again.

use serde_json::Value;

/// The kind of operation a plan executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

/// A query plan.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// The root node of the plan.
    pub root: PlanNode,
    /// The operation name.
    pub operation_name: Option<String>,
    /// The operation kind.
    pub operation_kind: OperationKind,
}

impl QueryPlan {
    /// Creates a query plan.
    pub fn query(root: PlanNode) -> Self {
        Self {
            root,
            operation_name: None,
            operation_kind: OperationKind::Query,
        }
    }

    /// Creates a subscription plan.
    pub fn subscription(root: PlanNode) -> Self {
        Self {
            root,
            operation_name: None,
            operation_kind: OperationKind::Subscription,
        }
    }

    /// Sets the operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Returns the first root field, in plan order.
    pub fn first_root_field(&self) -> Option<&FieldInfo> {
        self.root.first_field()
    }
}

/// Information about a field to resolve.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// The field name.
    pub name: String,
    /// The alias, if any.
    pub alias: Option<String>,
    /// The type the field is defined on.
    pub parent_type: String,
    /// The field's return type name.
    pub return_type: String,
    /// Coerced arguments.
    pub arguments: Vec<(String, Value)>,
    /// Whether this is an introspection field.
    pub is_introspection: bool,
}

impl FieldInfo {
    /// Creates field info.
    pub fn new(
        name: impl Into<String>,
        parent_type: impl Into<String>,
        return_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            is_introspection: name.starts_with("__"),
            name,
            alias: None,
            parent_type: parent_type.into(),
            return_type: return_type.into(),
            arguments: Vec::new(),
        }
    }

    /// Sets the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.push((name.into(), value));
        self
    }

    /// The key this field is written under in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A node in the query plan.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Sequential execution.
    Sequence(Vec<PlanNode>),
    /// Parallel execution.
    Parallel(Vec<PlanNode>),
    /// A field with a sub-selection.
    Field {
        info: FieldInfo,
        response_name: String,
        children: Box<PlanNode>,
    },
    /// A leaf field to resolve.
    Leaf { field: FieldInfo },
    /// A node that only applies to one concrete type.
    TypeCondition {
        type_name: String,
        node: Box<PlanNode>,
    },
    /// A deferred node.
    Defer {
        node: Box<PlanNode>,
        label: Option<String>,
    },
    /// A streamed list field. `node` is the `Field` or `Leaf` producing the
    /// list.
    Stream {
        node: Box<PlanNode>,
        label: Option<String>,
        initial_count: usize,
    },
    /// A node included depending on `@include`/`@skip`.
    Conditional {
        condition: bool,
        node: Box<PlanNode>,
    },
}

impl PlanNode {
    /// A field with a sub-selection, written under its response key.
    pub fn field(info: FieldInfo, children: PlanNode) -> Self {
        Self::Field {
            response_name: info.response_key().to_string(),
            info,
            children: Box::new(children),
        }
    }

    /// A leaf field.
    pub fn leaf(field: FieldInfo) -> Self {
        Self::Leaf { field }
    }

    /// Defers `node`.
    pub fn defer(node: PlanNode, label: Option<&str>) -> Self {
        Self::Defer {
            node: Box::new(node),
            label: label.map(str::to_string),
        }
    }

    /// Streams the list produced by `node` after `initial_count` items.
    pub fn stream(node: PlanNode, label: Option<&str>, initial_count: usize) -> Self {
        Self::Stream {
            node: Box::new(node),
            label: label.map(str::to_string),
            initial_count,
        }
    }

    fn first_field(&self) -> Option<&FieldInfo> {
        match self {
            Self::Sequence(nodes) | Self::Parallel(nodes) => {
                nodes.iter().find_map(PlanNode::first_field)
            }
            Self::Field { info, .. } => Some(info),
            Self::Leaf { field } => Some(field),
            Self::TypeCondition { node, .. }
            | Self::Defer { node, .. }
            | Self::Stream { node, .. } => node.first_field(),
            Self::Conditional { condition, node } => {
                if *condition {
                    node.first_field()
                } else {
                    None
                }
            }
        }
    }
}
