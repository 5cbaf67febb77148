//! State-delta representation and its application/merge rules.
//!
//! A patch is an ordered list of primitive operations (add/replace/remove)
//! describing the transition of a projected state tree from one tick to the
//! next. Patches are generated by structurally diffing two snapshots and
//! applied in order on the receiving side.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One step of a patch path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    pub fn key(name: impl Into<String>) -> Self {
        PathSegment::Key(name.into())
    }

    pub fn index(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(name: &str) -> Self {
        PathSegment::Key(name.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(name: String) -> Self {
        PathSegment::Key(name)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Sequence of keys/indices from the projected-state root.
pub type PatchPath = Vec<PathSegment>;

/// A single primitive state operation.
///
/// Serializes to the wire shape `{"op": "replace", "path": ["x"], "value": 1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: PatchPath, value: Value },
    Replace { path: PatchPath, value: Value },
    Remove { path: PatchPath },
}

impl PatchOp {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            PatchOp::Add { path, .. } => path,
            PatchOp::Replace { path, .. } => path,
            PatchOp::Remove { path } => path,
        }
    }
}

/// Failure to apply a patch operation.
///
/// A missing parent container indicates a projection/patch ordering bug and
/// is always reported to the caller rather than skipped.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("parent path does not resolve for `{path}`")]
    MissingParent { path: String },
    #[error("replace target does not exist at `{path}`")]
    MissingTarget { path: String },
    #[error("array index out of bounds at `{path}`")]
    IndexOutOfBounds { path: String },
    #[error("cannot remove the state root")]
    RemoveRoot,
}

/// Two snapshots that cannot be diffed into a patch.
#[derive(Debug, Error)]
#[error("projected states are structurally incompatible: {0}")]
pub struct DiffError(pub &'static str);

/// Applies a patch list in order. Operations mutate `state` as they succeed;
/// callers that need all-or-nothing semantics apply against a clone and
/// commit on success (see `mirror::StateMirror`).
pub fn apply_patch(state: &mut Value, patches: &[PatchOp]) -> Result<(), PatchError> {
    for op in patches {
        apply_op(state, op)?;
    }
    Ok(())
}

fn apply_op(state: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Add { path, value } => write_value(state, path, value.clone(), true),
        PatchOp::Replace { path, value } => write_value(state, path, value.clone(), false),
        PatchOp::Remove { path } => remove_value(state, path),
    }
}

fn write_value(
    state: &mut Value,
    path: &[PathSegment],
    value: Value,
    upsert: bool,
) -> Result<(), PatchError> {
    let Some((leaf, parent_path)) = path.split_last() else {
        // An empty path addresses the root itself.
        *state = value;
        return Ok(());
    };

    let parent = resolve_parent(state, parent_path, path)?;
    match (parent, leaf) {
        (Value::Object(map), PathSegment::Key(key)) => {
            // `add` of an existing member replaces its value (RFC 6902), so
            // re-applying a cumulative patch stays convergent.
            if !upsert && !map.contains_key(key) {
                return Err(PatchError::MissingTarget {
                    path: render_path(path),
                });
            }
            map.insert(key.clone(), value);
            Ok(())
        }
        (Value::Array(items), PathSegment::Index(index)) => {
            if upsert {
                if *index > items.len() {
                    return Err(PatchError::IndexOutOfBounds {
                        path: render_path(path),
                    });
                }
                items.insert(*index, value);
            } else {
                if *index >= items.len() {
                    return Err(PatchError::IndexOutOfBounds {
                        path: render_path(path),
                    });
                }
                items[*index] = value;
            }
            Ok(())
        }
        _ => Err(PatchError::MissingParent {
            path: render_path(path),
        }),
    }
}

fn remove_value(state: &mut Value, path: &[PathSegment]) -> Result<(), PatchError> {
    let Some((leaf, parent_path)) = path.split_last() else {
        return Err(PatchError::RemoveRoot);
    };

    let parent = resolve_parent(state, parent_path, path)?;
    match (parent, leaf) {
        // Removing an already-absent leaf is a no-op: the cumulative patch
        // for a tick window may repeat a removal the receiver already applied.
        (Value::Object(map), PathSegment::Key(key)) => {
            map.remove(key);
            Ok(())
        }
        (Value::Array(items), PathSegment::Index(index)) => {
            if *index < items.len() {
                items.remove(*index);
            }
            Ok(())
        }
        _ => Err(PatchError::MissingParent {
            path: render_path(path),
        }),
    }
}

fn resolve_parent<'a>(
    state: &'a mut Value,
    parent_path: &[PathSegment],
    full_path: &[PathSegment],
) -> Result<&'a mut Value, PatchError> {
    let mut node = state;
    for segment in parent_path {
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
            _ => None,
        }
        .ok_or_else(|| PatchError::MissingParent {
            path: render_path(full_path),
        })?;
    }
    Ok(node)
}

fn render_path(path: &[PathSegment]) -> String {
    let mut rendered = String::new();
    for segment in path {
        rendered.push('/');
        match segment {
            PathSegment::Key(key) => rendered.push_str(key),
            PathSegment::Index(index) => rendered.push_str(&index.to_string()),
        }
    }
    rendered
}

/// Structurally diffs two projected snapshots into a patch list.
///
/// Object members are compared recursively; scalars and arrays are replaced
/// wholesale. Both roots must be objects; anything else means the projection
/// produced something a patch stream cannot describe incrementally, and the
/// caller falls back to a full-state send.
pub fn diff(old: &Value, new: &Value) -> Result<Vec<PatchOp>, DiffError> {
    let (Value::Object(old_map), Value::Object(new_map)) = (old, new) else {
        return Err(DiffError("both snapshot roots must be objects"));
    };

    let mut patches = Vec::new();
    diff_objects(&mut Vec::new(), old_map, new_map, &mut patches);
    Ok(patches)
}

fn diff_objects(
    path: &mut PatchPath,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    patches: &mut Vec<PatchOp>,
) {
    for key in old.keys() {
        if !new.contains_key(key) {
            path.push(PathSegment::key(key.clone()));
            patches.push(PatchOp::Remove { path: path.clone() });
            path.pop();
        }
    }

    for (key, new_value) in new {
        path.push(PathSegment::key(key.clone()));
        match old.get(key) {
            None => patches.push(PatchOp::Add {
                path: path.clone(),
                value: new_value.clone(),
            }),
            Some(old_value) => {
                if old_value != new_value {
                    if let (Value::Object(old_child), Value::Object(new_child)) =
                        (old_value, new_value)
                    {
                        diff_objects(path, old_child, new_child, patches);
                    } else {
                        patches.push(PatchOp::Replace {
                            path: path.clone(),
                            value: new_value.clone(),
                        });
                    }
                }
            }
        }
        path.pop();
    }
}

/// Last-write-wins minimization of a concatenated patch list: drops every
/// operation that a later operation at the same path, or at an ancestor path,
/// fully supersedes. Purely a size optimization: applying the unsquashed
/// list yields the same state.
pub fn squash(patches: &[PatchOp]) -> Vec<PatchOp> {
    let mut kept: Vec<PatchOp> = Vec::new();
    for op in patches.iter().rev() {
        let superseded = kept
            .iter()
            .any(|later| is_path_prefix(later.path(), op.path()));
        if !superseded {
            kept.push(op.clone());
        }
    }
    kept.reverse();
    kept
}

fn is_path_prefix(prefix: &[PathSegment], path: &[PathSegment]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path.iter()).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> PatchPath {
        segments.iter().map(|s| PathSegment::key(*s)).collect()
    }

    #[test]
    fn test_diff_emits_add_replace_remove() {
        let old = json!({"x": 0, "gone": true, "nested": {"a": 1, "b": 2}});
        let new = json!({"x": 1, "nested": {"a": 1, "b": 3}, "fresh": "hi"});

        let patches = diff(&old, &new).unwrap();

        assert!(patches.contains(&PatchOp::Remove {
            path: path(&["gone"])
        }));
        assert!(patches.contains(&PatchOp::Replace {
            path: path(&["x"]),
            value: json!(1)
        }));
        assert!(patches.contains(&PatchOp::Replace {
            path: path(&["nested", "b"]),
            value: json!(3)
        }));
        assert!(patches.contains(&PatchOp::Add {
            path: path(&["fresh"]),
            value: json!("hi")
        }));
        assert_eq!(patches.len(), 4);
    }

    #[test]
    fn test_diff_identical_snapshots_is_empty() {
        let state = json!({"a": {"b": [1, 2, 3]}});
        assert!(diff(&state, &state).unwrap().is_empty());
    }

    #[test]
    fn test_diff_replaces_arrays_wholesale() {
        let old = json!({"items": [1, 2]});
        let new = json!({"items": [1, 2, 3]});

        let patches = diff(&old, &new).unwrap();

        assert_eq!(
            patches,
            vec![PatchOp::Replace {
                path: path(&["items"]),
                value: json!([1, 2, 3]),
            }]
        );
    }

    #[test]
    fn test_diff_rejects_non_object_roots() {
        assert!(diff(&json!(3), &json!({"a": 1})).is_err());
        assert!(diff(&json!({"a": 1}), &json!("scalar")).is_err());
    }

    #[test]
    fn test_diff_then_apply_reconstructs_new_state() {
        let old = json!({"players": {"alice": {"x": 0, "y": 0}}, "round": 1});
        let new = json!({"players": {"bob": {"x": 5, "y": 2}}, "round": 2});

        let patches = diff(&old, &new).unwrap();
        let mut state = old.clone();
        apply_patch(&mut state, &patches).unwrap();

        assert_eq!(state, new);
    }

    #[test]
    fn test_add_upserts_existing_member() {
        let mut state = json!({"x": 1});
        apply_patch(
            &mut state,
            &[PatchOp::Add {
                path: path(&["x"]),
                value: json!(2),
            }],
        )
        .unwrap();
        assert_eq!(state, json!({"x": 2}));
    }

    #[test]
    fn test_remove_missing_leaf_is_noop() {
        let mut state = json!({"x": 1});
        apply_patch(
            &mut state,
            &[PatchOp::Remove {
                path: path(&["ghost"]),
            }],
        )
        .unwrap();
        assert_eq!(state, json!({"x": 1}));
    }

    #[test]
    fn test_missing_parent_is_reported() {
        let mut state = json!({"x": 1});
        let result = apply_patch(
            &mut state,
            &[PatchOp::Add {
                path: path(&["missing", "child"]),
                value: json!(1),
            }],
        );
        assert!(matches!(result, Err(PatchError::MissingParent { .. })));
    }

    #[test]
    fn test_replace_missing_target_is_reported() {
        let mut state = json!({"x": 1});
        let result = apply_patch(
            &mut state,
            &[PatchOp::Replace {
                path: path(&["ghost"]),
                value: json!(1),
            }],
        );
        assert!(matches!(result, Err(PatchError::MissingTarget { .. })));
    }

    #[test]
    fn test_empty_path_replaces_root() {
        let mut state = json!({"x": 1});
        apply_patch(
            &mut state,
            &[PatchOp::Replace {
                path: Vec::new(),
                value: json!({"y": 2}),
            }],
        )
        .unwrap();
        assert_eq!(state, json!({"y": 2}));
    }

    #[test]
    fn test_remove_root_is_rejected() {
        let mut state = json!({"x": 1});
        let result = apply_patch(&mut state, &[PatchOp::Remove { path: Vec::new() }]);
        assert!(matches!(result, Err(PatchError::RemoveRoot)));
    }

    #[test]
    fn test_array_index_operations() {
        let mut state = json!({"items": [1, 2, 3]});
        apply_patch(
            &mut state,
            &[
                PatchOp::Replace {
                    path: vec![PathSegment::key("items"), PathSegment::index(1)],
                    value: json!(9),
                },
                PatchOp::Remove {
                    path: vec![PathSegment::key("items"), PathSegment::index(0)],
                },
            ],
        )
        .unwrap();
        assert_eq!(state, json!({"items": [9, 3]}));
    }

    #[test]
    fn test_squash_keeps_last_write_per_path() {
        let patches = vec![
            PatchOp::Replace {
                path: path(&["x"]),
                value: json!(1),
            },
            PatchOp::Replace {
                path: path(&["x"]),
                value: json!(2),
            },
        ];

        assert_eq!(
            squash(&patches),
            vec![PatchOp::Replace {
                path: path(&["x"]),
                value: json!(2),
            }]
        );
    }

    #[test]
    fn test_squash_ancestor_supersedes_descendants() {
        let patches = vec![
            PatchOp::Replace {
                path: path(&["player", "x"]),
                value: json!(1),
            },
            PatchOp::Remove {
                path: path(&["player"]),
            },
        ];

        assert_eq!(
            squash(&patches),
            vec![PatchOp::Remove {
                path: path(&["player"]),
            }]
        );
    }

    #[test]
    fn test_squash_keeps_parent_then_child_sequence() {
        let patches = vec![
            PatchOp::Add {
                path: path(&["player"]),
                value: json!({}),
            },
            PatchOp::Add {
                path: path(&["player", "x"]),
                value: json!(3),
            },
        ];

        assert_eq!(squash(&patches), patches);
    }

    #[test]
    fn test_patch_op_wire_shape() {
        let op = PatchOp::Replace {
            path: path(&["x"]),
            value: json!(1),
        };
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded, json!({"op": "replace", "path": ["x"], "value": 1}));

        let decoded: PatchOp = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_path_segment_wire_shape() {
        let mixed: PatchPath = vec![PathSegment::key("items"), PathSegment::index(2)];
        let encoded = serde_json::to_value(&mixed).unwrap();
        assert_eq!(encoded, json!(["items", 2]));

        let decoded: PatchPath = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, mixed);
    }
}
