//! Incremental column resolution and event evaluation.
//!
//! Every column in the query starts out pending against the root of its
//! namespace's schema tree. Each committed node insertion advances the
//! columns pending against the node's parent whose next token matches the
//! node's key: a column whose last token matched is resolved to the node,
//! any other column becomes pending against the node itself (if it's an
//! object). A column may resolve to many nodes over the life of a stream.

use std::collections::{HashMap, HashSet};

use crate::ir_stream::IrUnitHandler;
use crate::log_event::{KeyNamespace, KeyValuePairLogEvent};
use crate::schema_tree::{NodeId, NodeLocator, NodeType, ROOT_ID};

use super::ast::{ColumnDescriptor, Expression, FilterOperation, LiteralType, LiteralTypeSet};
use super::error::QueryError;
use super::evaluate::{literal_type_of, node_type_literal_types, should_evaluate, CompiledFilter};
use super::QueryConfig;

/// Called once per node a projected column resolves to, with the node's
/// namespace (`true` for auto-generated), its id and the projected key as
/// given to [`QueryHandler::create`].
pub type ProjectionCallback = Box<dyn FnMut(bool, NodeId, &str) -> anyhow::Result<()>>;

/// Result of evaluating a query (or a sub-expression) against one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstEvaluationResult {
    True,
    False,
    /// Not evaluated: none of the columns involved can appear in the stream
    /// as seen so far. Logical operators ignore pruned operands.
    Pruned,
}

impl From<bool> for AstEvaluationResult {
    fn from(value: bool) -> Self {
        if value {
            AstEvaluationResult::True
        } else {
            AstEvaluationResult::False
        }
    }
}

/// Query tree with filters replaced by their index in `QueryHandler::filters`.
#[derive(Debug)]
enum CompiledExpression {
    And(Vec<CompiledExpression>),
    Or(Vec<CompiledExpression>),
    Not(Box<CompiledExpression>),
    Filter(usize),
}

fn compile_expression(
    expression: Expression,
    config: &QueryConfig,
    filters: &mut Vec<CompiledFilter>,
) -> Result<CompiledExpression, QueryError> {
    let compile_all = |children: Vec<Expression>, filters: &mut Vec<CompiledFilter>| {
        children
            .into_iter()
            .map(|child| compile_expression(child, config, filters))
            .collect::<Result<Vec<_>, _>>()
    };
    Ok(match expression {
        Expression::And(children) => CompiledExpression::And(compile_all(children, filters)?),
        Expression::Or(children) => CompiledExpression::Or(compile_all(children, filters)?),
        Expression::Not(child) => {
            CompiledExpression::Not(Box::new(compile_expression(*child, config, filters)?))
        }
        Expression::Filter(filter) => {
            filters.push(CompiledFilter::compile(filter, config)?);
            CompiledExpression::Filter(filters.len() - 1)
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ColumnRef {
    Filter(usize),
    Projection(usize),
}

#[derive(Debug)]
struct Projection {
    key: String,
    column: ColumnDescriptor,
    literal_types: LiteralTypeSet,
}

fn parse_projection(key: &str) -> Result<ColumnDescriptor, QueryError> {
    let column = ColumnDescriptor::parse(key).map_err(|err| match err {
        QueryError::InvalidColumn { reason, .. } => QueryError::InvalidProjection {
            column: key.to_string(),
            reason,
        },
        err => err,
    })?;
    if column.has_wildcard() {
        return Err(QueryError::InvalidProjection {
            column: key.to_string(),
            reason: "wildcards aren't allowed",
        });
    }
    Ok(column)
}

pub struct QueryHandler {
    expression: Option<CompiledExpression>,
    filters: Vec<CompiledFilter>,
    projections: Vec<Projection>,
    projection_callback: Option<ProjectionCallback>,
    /// `(namespace, parent id)` → columns waiting for a child of that node,
    /// with the index of the token the child has to match.
    partial_resolutions: HashMap<(KeyNamespace, NodeId), Vec<(ColumnRef, usize)>>,
    resolutions: HashMap<ColumnRef, Vec<NodeId>>,
}

impl QueryHandler {
    /// Builds a handler for `expression` (`None` matches every event).
    ///
    /// `projections` are wildcard-free keys, each with the literal types it
    /// should be reported for.
    pub fn create(
        expression: Option<Expression>,
        projections: Vec<(String, LiteralTypeSet)>,
        config: QueryConfig,
        projection_callback: Option<ProjectionCallback>,
    ) -> Result<Self, QueryError> {
        let mut filters = Vec::new();
        let expression = expression
            .map(|expression| compile_expression(expression, &config, &mut filters))
            .transpose()?;

        let mut seen = HashSet::new();
        let mut parsed = Vec::with_capacity(projections.len());
        for (key, literal_types) in projections {
            let column = parse_projection(&key)?;
            if !seen.insert(column.clone()) {
                return Err(QueryError::InvalidProjection {
                    column: key,
                    reason: "projected more than once",
                });
            }
            parsed.push(Projection {
                key,
                column,
                literal_types,
            });
        }

        let mut handler = Self {
            expression,
            filters,
            projections: parsed,
            projection_callback,
            partial_resolutions: HashMap::new(),
            resolutions: HashMap::new(),
        };
        let columns: Vec<ColumnRef> = (0..handler.filters.len())
            .map(ColumnRef::Filter)
            .chain((0..handler.projections.len()).map(ColumnRef::Projection))
            .collect();
        for column_ref in columns {
            let namespace = handler.column(column_ref).namespace();
            handler
                .partial_resolutions
                .entry((namespace, ROOT_ID))
                .or_default()
                .push((column_ref, 0));
        }
        Ok(handler)
    }

    fn column(&self, column_ref: ColumnRef) -> &ColumnDescriptor {
        match column_ref {
            ColumnRef::Filter(idx) => self.filters[idx].filter().column(),
            ColumnRef::Projection(idx) => &self.projections[idx].column,
        }
    }

    /// Node ids resolved so far for every query column equal to `column`.
    pub fn resolved_node_ids(&self, column: &ColumnDescriptor) -> Vec<NodeId> {
        let mut node_ids: Vec<NodeId> = self
            .resolutions
            .iter()
            .filter(|(column_ref, _)| self.column(**column_ref) == column)
            .flat_map(|(_, node_ids)| node_ids.iter().copied())
            .collect();
        node_ids.sort_unstable();
        node_ids.dedup();
        node_ids
    }

    fn resolve(
        &mut self,
        column_ref: ColumnRef,
        is_auto_generated: bool,
        node_type: NodeType,
        node_id: NodeId,
    ) -> anyhow::Result<()> {
        let node_literal_types = node_type_literal_types(node_type);
        match column_ref {
            ColumnRef::Filter(idx) => {
                let filter = &self.filters[idx];
                if filter.filter().operation().requires_operand()
                    && !filter.comparable_types().intersects(node_literal_types)
                    && !node_literal_types.contains(LiteralType::Array)
                {
                    return Ok(());
                }
            }
            ColumnRef::Projection(idx) => {
                let projection = &self.projections[idx];
                if !projection.literal_types.intersects(node_literal_types) {
                    return Ok(());
                }
                if let Some(callback) = self.projection_callback.as_mut() {
                    callback(is_auto_generated, node_id, &projection.key)?;
                }
            }
        }
        self.resolutions.entry(column_ref).or_default().push(node_id);
        Ok(())
    }

    /// Evaluates the query against `event`. Columns are only looked up among
    /// the nodes they resolved to, so every insertion the event depends on
    /// must already have been handled.
    pub fn evaluate_kv_pair_log_event(
        &self,
        event: &KeyValuePairLogEvent,
    ) -> Result<AstEvaluationResult, QueryError> {
        match &self.expression {
            Some(expression) => self.evaluate_expression(expression, event),
            None => Ok(AstEvaluationResult::True),
        }
    }

    fn evaluate_expression(
        &self,
        expression: &CompiledExpression,
        event: &KeyValuePairLogEvent,
    ) -> Result<AstEvaluationResult, QueryError> {
        match expression {
            CompiledExpression::And(children) => {
                let mut all_pruned = true;
                for child in children {
                    match self.evaluate_expression(child, event)? {
                        AstEvaluationResult::False => return Ok(AstEvaluationResult::False),
                        AstEvaluationResult::True => all_pruned = false,
                        AstEvaluationResult::Pruned => {}
                    }
                }
                Ok(if all_pruned {
                    AstEvaluationResult::Pruned
                } else {
                    AstEvaluationResult::True
                })
            }
            CompiledExpression::Or(children) => {
                let mut all_pruned = true;
                for child in children {
                    match self.evaluate_expression(child, event)? {
                        AstEvaluationResult::True => return Ok(AstEvaluationResult::True),
                        AstEvaluationResult::False => all_pruned = false,
                        AstEvaluationResult::Pruned => {}
                    }
                }
                Ok(if all_pruned {
                    AstEvaluationResult::Pruned
                } else {
                    AstEvaluationResult::False
                })
            }
            CompiledExpression::Not(child) => Ok(match self.evaluate_expression(child, event)? {
                AstEvaluationResult::True => AstEvaluationResult::False,
                AstEvaluationResult::False => AstEvaluationResult::True,
                AstEvaluationResult::Pruned => AstEvaluationResult::Pruned,
            }),
            CompiledExpression::Filter(idx) => self.evaluate_filter(*idx, event),
        }
    }

    fn evaluate_filter(
        &self,
        idx: usize,
        event: &KeyValuePairLogEvent,
    ) -> Result<AstEvaluationResult, QueryError> {
        let filter = &self.filters[idx];
        let namespace = filter.filter().column().namespace();
        let operation = filter.filter().operation();
        let node_ids = self
            .resolutions
            .get(&ColumnRef::Filter(idx))
            .map_or(&[][..], Vec::as_slice);
        let pairs = event.node_id_value_pairs(namespace);

        if !operation.requires_operand() {
            let exists = node_ids.iter().any(|node_id| pairs.contains_key(node_id));
            return Ok((exists == (operation == FilterOperation::Exists)).into());
        }
        if node_ids.is_empty() {
            return Ok(AstEvaluationResult::Pruned);
        }

        let tree = event.schema_tree(namespace);
        let comparable_types = filter.comparable_types();
        for node_id in node_ids {
            let Some(value) = pairs.get(node_id) else {
                continue;
            };
            let literal_type = literal_type_of(tree.node_type(*node_id)?, value.as_ref());
            if should_evaluate(comparable_types, literal_type)
                && filter.evaluate(literal_type, value.as_ref())?
            {
                return Ok(AstEvaluationResult::True);
            }
        }
        Ok(AstEvaluationResult::False)
    }
}

impl IrUnitHandler for QueryHandler {
    fn handle_schema_tree_node_insertion(
        &mut self,
        is_auto_generated: bool,
        locator: &NodeLocator,
        node_id: NodeId,
    ) -> anyhow::Result<()> {
        let namespace = KeyNamespace::from_is_auto_generated(is_auto_generated);
        let Some(pending) = self
            .partial_resolutions
            .get(&(namespace, locator.parent_id))
        else {
            return Ok(());
        };

        let mut advanced = Vec::new();
        let mut resolved = Vec::new();
        for &(column_ref, token_idx) in pending {
            let tokens = self.column(column_ref).tokens();
            let Some(token) = tokens.get(token_idx) else {
                continue;
            };
            if !token.matches(&locator.key_name) {
                continue;
            }
            if token_idx + 1 == tokens.len() {
                resolved.push(column_ref);
            } else if locator.node_type == NodeType::Obj {
                advanced.push((column_ref, token_idx + 1));
            }
        }

        if !advanced.is_empty() {
            self.partial_resolutions
                .insert((namespace, node_id), advanced);
        }
        for column_ref in resolved {
            self.resolve(column_ref, is_auto_generated, locator.node_type, node_id)?;
        }
        Ok(())
    }
}
