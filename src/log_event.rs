//! Validated key-value pair log events.
//!
//! A [`KeyValuePairLogEvent`] pairs two shared schema trees (auto-generated and
//! user-generated keys) with a leaf-node-id → value map for each, plus the UTC
//! offset in effect when the event was produced. Construction validates every
//! pair against its tree; once built, an event is immutable.
//!
//! The trees are shared, not owned: they keep growing after the event is built,
//! but every id the event references stays valid because ids are append-only.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use crate::encoded_text::EncodedTextError;
use crate::schema_tree::{NodeId, NodeType, SchemaTree, SchemaTreeError, ROOT_ID};
use crate::value::{Value, ValueKind};

/// Leaf node id → value. `None` is the empty object.
pub type NodeIdValuePairs = BTreeMap<NodeId, Option<Value>>;

/// UTC offset in seconds.
pub type UtcOffset = i64;

/// Which of the two independent key spaces a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyNamespace {
    AutoGenerated,
    UserGenerated,
}

impl KeyNamespace {
    pub fn is_auto_generated(self) -> bool {
        self == KeyNamespace::AutoGenerated
    }

    pub fn from_is_auto_generated(is_auto_generated: bool) -> Self {
        if is_auto_generated {
            KeyNamespace::AutoGenerated
        } else {
            KeyNamespace::UserGenerated
        }
    }
}

impl fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyNamespace::AutoGenerated => f.write_str("auto-generated"),
            KeyNamespace::UserGenerated => f.write_str("user-generated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LogEventError {
    #[error("{namespace} key can't be the schema tree root")]
    RootKey { namespace: KeyNamespace },
    #[error("{namespace} key: {source}")]
    SchemaTree {
        namespace: KeyNamespace,
        #[source]
        source: SchemaTreeError,
    },
    #[error("{namespace} key {node_id} of type {node_type} can't hold {}", describe_value(.value))]
    TypeMismatch {
        namespace: KeyNamespace,
        node_id: NodeId,
        node_type: NodeType,
        value: Option<ValueKind>,
    },
    #[error("{namespace} key '{key_name}' appears twice under parent {parent_id}")]
    DuplicateKeyName {
        namespace: KeyNamespace,
        parent_id: NodeId,
        key_name: String,
    },
    #[error("{namespace} key {ancestor_id} is an ancestor of key {node_id}")]
    AncestorConflict {
        namespace: KeyNamespace,
        ancestor_id: NodeId,
        node_id: NodeId,
    },
    #[error("failed to decode encoded text: {0}")]
    EncodedText(#[from] EncodedTextError),
    #[error("float value {0} has no JSON representation")]
    NonFiniteFloat(f64),
    #[error("unstructured array isn't valid JSON: {0}")]
    InvalidArray(String),
}

fn describe_value(value: &Option<ValueKind>) -> String {
    match value {
        Some(kind) => format!("a {kind} value"),
        None => "an empty object".to_string(),
    }
}

/// Returns true if a key of `node_type` may hold `value`.
pub fn is_value_compatible(node_type: NodeType, value: Option<&Value>) -> bool {
    match (node_type, value) {
        (NodeType::Obj, None | Some(Value::Null)) => true,
        (_, None) => false,
        (NodeType::Int, Some(Value::Int(_))) => true,
        (NodeType::Float, Some(Value::Float(_))) => true,
        (NodeType::Bool, Some(Value::Bool(_))) => true,
        (NodeType::Str, Some(Value::Str(_))) => true,
        (NodeType::Str | NodeType::UnstructuredArray, Some(v)) => v.is_encoded_text(),
        _ => false,
    }
}

fn validate_node_id_value_pairs(
    namespace: KeyNamespace,
    tree: &SchemaTree,
    pairs: &NodeIdValuePairs,
) -> Result<(), LogEventError> {
    let tree_err = |source| LogEventError::SchemaTree { namespace, source };

    // (parent id, key name) -> the node that claimed it in this event
    let mut claimed_keys: HashMap<(NodeId, String), NodeId> = HashMap::new();

    for (&node_id, value) in pairs {
        if node_id == ROOT_ID {
            return Err(LogEventError::RootKey { namespace });
        }
        let node_type = tree.node_type(node_id).map_err(tree_err)?;
        if !is_value_compatible(node_type, value.as_ref()) {
            return Err(LogEventError::TypeMismatch {
                namespace,
                node_id,
                node_type,
                value: value.as_ref().map(Value::kind),
            });
        }

        let mut current = node_id;
        loop {
            let (parent_id, key_name) = tree
                .with_node(current, |node| (node.parent_id, node.key_name.clone()))
                .map_err(tree_err)?;
            let Some(parent_id) = parent_id else {
                break;
            };
            if current != node_id && pairs.contains_key(&current) {
                return Err(LogEventError::AncestorConflict {
                    namespace,
                    ancestor_id: current,
                    node_id,
                });
            }
            match claimed_keys.entry((parent_id, key_name)) {
                Entry::Occupied(entry) => {
                    if *entry.get() != current {
                        return Err(LogEventError::DuplicateKeyName {
                            namespace,
                            parent_id,
                            key_name: entry.key().1.clone(),
                        });
                    }
                    // The rest of the path was claimed by an earlier key.
                    break;
                }
                Entry::Vacant(entry) => {
                    entry.insert(current);
                }
            }
            current = parent_id;
        }
    }
    Ok(())
}

fn value_to_json(node_type: NodeType, value: Option<&Value>) -> Result<JsonValue, LogEventError> {
    let json = match value {
        None => JsonValue::Object(Map::new()),
        Some(Value::Null) => JsonValue::Null,
        Some(Value::Int(v)) => JsonValue::from(*v),
        Some(Value::Float(v)) => Number::from_f64(*v)
            .map(JsonValue::Number)
            .ok_or(LogEventError::NonFiniteFloat(*v))?,
        Some(Value::Bool(v)) => JsonValue::Bool(*v),
        Some(Value::Str(v)) => JsonValue::String(v.clone()),
        Some(encoded) => {
            let text = encoded.decode_encoded_text()?.unwrap_or_default();
            if node_type == NodeType::UnstructuredArray {
                serde_json::from_str(&text)
                    .map_err(|e| LogEventError::InvalidArray(e.to_string()))?
            } else {
                JsonValue::String(text)
            }
        }
    };
    Ok(json)
}

fn pairs_to_json(
    namespace: KeyNamespace,
    tree: &SchemaTree,
    pairs: &NodeIdValuePairs,
) -> Result<Map<String, JsonValue>, LogEventError> {
    let tree_err = |source| LogEventError::SchemaTree { namespace, source };
    let mut root = Map::new();
    for (&node_id, value) in pairs {
        let node_type = tree.node_type(node_id).map_err(tree_err)?;
        let path = tree.key_path(node_id).map_err(tree_err)?;
        let Some((leaf, parents)) = path.split_last() else {
            return Err(LogEventError::RootKey { namespace });
        };

        let mut object = &mut root;
        for key in parents {
            let entry = object
                .entry(key.clone())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            object = match entry {
                JsonValue::Object(map) => map,
                _ => {
                    return Err(LogEventError::AncestorConflict {
                        namespace,
                        ancestor_id: node_id,
                        node_id,
                    })
                }
            };
        }
        object.insert(leaf.clone(), value_to_json(node_type, value.as_ref())?);
    }
    Ok(root)
}

/// An immutable, validated log event.
#[derive(Debug, Clone)]
pub struct KeyValuePairLogEvent {
    auto_gen_keys_schema_tree: Arc<SchemaTree>,
    user_gen_keys_schema_tree: Arc<SchemaTree>,
    auto_gen_node_id_value_pairs: NodeIdValuePairs,
    user_gen_node_id_value_pairs: NodeIdValuePairs,
    utc_offset: UtcOffset,
}

impl KeyValuePairLogEvent {
    /// Validates both pair sets against their trees and builds the event.
    ///
    /// Every key must be an existing, non-root node whose type accepts the
    /// value, no key may be an ancestor of another, and no two keys in one
    /// namespace may share a key name under the same parent.
    pub fn create(
        auto_gen_keys_schema_tree: Arc<SchemaTree>,
        user_gen_keys_schema_tree: Arc<SchemaTree>,
        auto_gen_node_id_value_pairs: NodeIdValuePairs,
        user_gen_node_id_value_pairs: NodeIdValuePairs,
        utc_offset: UtcOffset,
    ) -> Result<Self, LogEventError> {
        validate_node_id_value_pairs(
            KeyNamespace::AutoGenerated,
            &auto_gen_keys_schema_tree,
            &auto_gen_node_id_value_pairs,
        )?;
        validate_node_id_value_pairs(
            KeyNamespace::UserGenerated,
            &user_gen_keys_schema_tree,
            &user_gen_node_id_value_pairs,
        )?;
        Ok(Self {
            auto_gen_keys_schema_tree,
            user_gen_keys_schema_tree,
            auto_gen_node_id_value_pairs,
            user_gen_node_id_value_pairs,
            utc_offset,
        })
    }

    pub fn auto_gen_keys_schema_tree(&self) -> &Arc<SchemaTree> {
        &self.auto_gen_keys_schema_tree
    }

    pub fn user_gen_keys_schema_tree(&self) -> &Arc<SchemaTree> {
        &self.user_gen_keys_schema_tree
    }

    pub fn auto_gen_node_id_value_pairs(&self) -> &NodeIdValuePairs {
        &self.auto_gen_node_id_value_pairs
    }

    pub fn user_gen_node_id_value_pairs(&self) -> &NodeIdValuePairs {
        &self.user_gen_node_id_value_pairs
    }

    pub fn schema_tree(&self, namespace: KeyNamespace) -> &Arc<SchemaTree> {
        match namespace {
            KeyNamespace::AutoGenerated => &self.auto_gen_keys_schema_tree,
            KeyNamespace::UserGenerated => &self.user_gen_keys_schema_tree,
        }
    }

    pub fn node_id_value_pairs(&self, namespace: KeyNamespace) -> &NodeIdValuePairs {
        match namespace {
            KeyNamespace::AutoGenerated => &self.auto_gen_node_id_value_pairs,
            KeyNamespace::UserGenerated => &self.user_gen_node_id_value_pairs,
        }
    }

    pub fn utc_offset(&self) -> UtcOffset {
        self.utc_offset
    }

    /// Renders the auto-generated and user-generated pairs as nested JSON
    /// objects, in that order.
    pub fn serialize_to_json(
        &self,
    ) -> Result<(Map<String, JsonValue>, Map<String, JsonValue>), LogEventError> {
        let auto_gen = pairs_to_json(
            KeyNamespace::AutoGenerated,
            &self.auto_gen_keys_schema_tree,
            &self.auto_gen_node_id_value_pairs,
        )?;
        let user_gen = pairs_to_json(
            KeyNamespace::UserGenerated,
            &self.user_gen_keys_schema_tree,
            &self.user_gen_node_id_value_pairs,
        )?;
        Ok((auto_gen, user_gen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoded_text::{EightByteEncoding, EncodedTextAst, FourByteEncoding};
    use crate::schema_tree::NodeLocator;
    use serde_json::json;

    /// root -> a (Obj, 1) -> b (Int, 2)
    fn build_tree() -> Arc<SchemaTree> {
        let tree = SchemaTree::new();
        tree.insert_node(&NodeLocator::new(ROOT_ID, "a", NodeType::Obj))
            .unwrap();
        tree.insert_node(&NodeLocator::new(1, "b", NodeType::Int))
            .unwrap();
        Arc::new(tree)
    }

    fn create_user_gen(
        tree: &Arc<SchemaTree>,
        pairs: NodeIdValuePairs,
    ) -> Result<KeyValuePairLogEvent, LogEventError> {
        KeyValuePairLogEvent::create(
            Arc::new(SchemaTree::new()),
            tree.clone(),
            NodeIdValuePairs::new(),
            pairs,
            0,
        )
    }

    #[test]
    fn test_create_int_pair() {
        let tree = build_tree();
        let pairs = NodeIdValuePairs::from([(2, Some(Value::Int(5)))]);
        let event = create_user_gen(&tree, pairs.clone()).unwrap();
        assert_eq!(event.user_gen_node_id_value_pairs(), &pairs);
        assert!(event.auto_gen_node_id_value_pairs().is_empty());
        assert_eq!(event.utc_offset(), 0);
    }

    #[test]
    fn test_type_mismatch() {
        let tree = build_tree();
        let err = create_user_gen(
            &tree,
            NodeIdValuePairs::from([(2, Some(Value::from("five")))]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LogEventError::TypeMismatch {
                node_id: 2,
                node_type: NodeType::Int,
                value: Some(ValueKind::Str),
                ..
            }
        ));

        let err =
            create_user_gen(&tree, NodeIdValuePairs::from([(1, Some(Value::Int(1)))])).unwrap_err();
        assert!(matches!(err, LogEventError::TypeMismatch { node_id: 1, .. }));

        let err = create_user_gen(&tree, NodeIdValuePairs::from([(2, None)])).unwrap_err();
        assert!(matches!(
            err,
            LogEventError::TypeMismatch { value: None, .. }
        ));
    }

    #[test]
    fn test_value_compatibility_table() {
        let four = Value::FourByteEncodedTextAst(EncodedTextAst::<FourByteEncoding>::encode("a 1"));
        let eight =
            Value::EightByteEncodedTextAst(EncodedTextAst::<EightByteEncoding>::encode("a 1"));

        assert!(is_value_compatible(NodeType::Obj, None));
        assert!(is_value_compatible(NodeType::Obj, Some(&Value::Null)));
        assert!(!is_value_compatible(NodeType::Obj, Some(&Value::Int(1))));
        assert!(is_value_compatible(NodeType::Float, Some(&Value::Float(1.5))));
        assert!(!is_value_compatible(NodeType::Float, Some(&Value::Int(1))));
        assert!(is_value_compatible(NodeType::Bool, Some(&Value::Bool(true))));
        assert!(is_value_compatible(NodeType::Str, Some(&Value::from("x"))));
        assert!(is_value_compatible(NodeType::Str, Some(&four)));
        assert!(is_value_compatible(NodeType::Str, Some(&eight)));
        assert!(is_value_compatible(NodeType::UnstructuredArray, Some(&eight)));
        assert!(!is_value_compatible(
            NodeType::UnstructuredArray,
            Some(&Value::from("[]"))
        ));
        assert!(!is_value_compatible(NodeType::Int, Some(&Value::Null)));
    }

    #[test]
    fn test_structural_validation() {
        let tree = build_tree();
        // b as Float under a: same key name as the Int b.
        tree.insert_node(&NodeLocator::new(1, "b", NodeType::Float))
            .unwrap();

        let err = create_user_gen(&tree, NodeIdValuePairs::from([(0, None)])).unwrap_err();
        assert!(matches!(err, LogEventError::RootKey { .. }));

        let err =
            create_user_gen(&tree, NodeIdValuePairs::from([(42, Some(Value::Int(1)))])).unwrap_err();
        assert!(matches!(
            err,
            LogEventError::SchemaTree {
                source: SchemaTreeError::OutOfBounds(42),
                ..
            }
        ));

        let err = create_user_gen(
            &tree,
            NodeIdValuePairs::from([(2, Some(Value::Int(1))), (3, Some(Value::Float(1.0)))]),
        )
        .unwrap_err();
        assert!(matches!(err, LogEventError::DuplicateKeyName { .. }));

        let err = create_user_gen(
            &tree,
            NodeIdValuePairs::from([(1, None), (2, Some(Value::Int(1)))]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LogEventError::AncestorConflict {
                ancestor_id: 1,
                node_id: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_namespaces_are_independent() {
        let tree = build_tree();
        let event = KeyValuePairLogEvent::create(
            tree.clone(),
            tree.clone(),
            NodeIdValuePairs::from([(2, Some(Value::Int(1)))]),
            NodeIdValuePairs::from([(2, Some(Value::Int(2)))]),
            3600,
        )
        .unwrap();
        assert_eq!(
            event.node_id_value_pairs(KeyNamespace::AutoGenerated)[&2],
            Some(Value::Int(1))
        );
        assert_eq!(
            event.node_id_value_pairs(KeyNamespace::UserGenerated)[&2],
            Some(Value::Int(2))
        );
    }

    #[test]
    fn test_serialize_to_json() {
        let tree = build_tree();
        let c = tree
            .insert_node(&NodeLocator::new(1, "c", NodeType::UnstructuredArray))
            .unwrap();
        let d = tree
            .insert_node(&NodeLocator::new(ROOT_ID, "d", NodeType::Str))
            .unwrap();
        let e = tree
            .insert_node(&NodeLocator::new(ROOT_ID, "e", NodeType::Obj))
            .unwrap();
        let f = tree
            .insert_node(&NodeLocator::new(ROOT_ID, "f", NodeType::Obj))
            .unwrap();

        let pairs = NodeIdValuePairs::from([
            (2, Some(Value::Int(5))),
            (
                c,
                Some(Value::EightByteEncodedTextAst(EncodedTextAst::encode(
                    "[1,\"x y\",2.5]",
                ))),
            ),
            (
                d,
                Some(Value::FourByteEncodedTextAst(EncodedTextAst::encode(
                    "took 12 ms",
                ))),
            ),
            (e, None),
            (f, Some(Value::Null)),
        ]);
        let event = create_user_gen(&tree, pairs).unwrap();
        let (auto_gen, user_gen) = event.serialize_to_json().unwrap();
        assert!(auto_gen.is_empty());
        assert_eq!(
            JsonValue::Object(user_gen),
            json!({
                "a": {"b": 5, "c": [1, "x y", 2.5]},
                "d": "took 12 ms",
                "e": {},
                "f": null
            })
        );
    }
}
