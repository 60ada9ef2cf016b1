//! Patch edit operations
//!
//! An edit addresses a location with a path of object-key / array-index steps.
//! Paths arrive either as a JSON array (`["rows", 0, "name"]`) or as a JSON
//! Pointer string (`"/rows/0/name"`). A whole edit list is applied to a working
//! copy and only handed back if every edit succeeded.

use std::fmt;

use serde::de::Deserializer;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────

/// One step of an edit path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Object member name (or a decimal array index in pointer form)
    Key(String),
    /// Array position
    Index(usize),
    /// One past the end of an array (`-`)
    Append,
}

/// A location inside the document; empty means the root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditPath(pub Vec<PathStep>);

impl EditPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a JSON Pointer (RFC 6901)
    pub fn from_pointer(pointer: &str) -> Result<Self> {
        if pointer.is_empty() {
            return Ok(Self::root());
        }
        let rest = pointer
            .strip_prefix('/')
            .ok_or_else(|| Error::malformed(format!("JSON pointer must start with '/': {}", pointer)))?;

        let steps = rest
            .split('/')
            .map(|token| {
                let token = token.replace("~1", "/").replace("~0", "~");
                if token == "-" {
                    PathStep::Append
                } else {
                    PathStep::Key(token)
                }
            })
            .collect();

        Ok(Self(steps))
    }
}

impl From<Vec<PathStep>> for EditPath {
    fn from(steps: Vec<PathStep>) -> Self {
        Self(steps)
    }
}

impl fmt::Display for EditPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for step in &self.0 {
            match step {
                PathStep::Key(k) => write!(f, "/{}", k.replace('~', "~0").replace('/', "~1"))?,
                PathStep::Index(i) => write!(f, "/{}", i)?,
                PathStep::Append => f.write_str("/-")?,
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPath {
    Pointer(String),
    Steps(Vec<RawStep>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    Index(usize),
    Key(String),
}

impl<'de> Deserialize<'de> for EditPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawPath::deserialize(deserializer)? {
            RawPath::Pointer(pointer) => {
                EditPath::from_pointer(&pointer).map_err(serde::de::Error::custom)
            }
            RawPath::Steps(steps) => Ok(EditPath(
                steps
                    .into_iter()
                    .map(|step| match step {
                        RawStep::Index(i) => PathStep::Index(i),
                        RawStep::Key(k) if k == "-" => PathStep::Append,
                        RawStep::Key(k) => PathStep::Key(k),
                    })
                    .collect(),
            )),
        }
    }
}

impl Serialize for EditPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for step in &self.0 {
            match step {
                PathStep::Key(k) => seq.serialize_element(k)?,
                PathStep::Index(i) => seq.serialize_element(i)?,
                PathStep::Append => seq.serialize_element("-")?,
            }
        }
        seq.end()
    }
}

// ─────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────

/// A single edit
///
/// `add` and `replace` both set a value; they only differ on arrays, where
/// `add` inserts and `replace` overwrites an existing element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: EditPath, value: Value },
    Replace { path: EditPath, value: Value },
    Remove { path: EditPath },
}

impl PatchOp {
    pub fn path(&self) -> &EditPath {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SetMode {
    Insert,
    Overwrite,
}

/// Apply `ops` in order to a copy of `document`
///
/// Returns the edited copy, or the first error; `document` itself is never
/// touched, so a failing edit leaves no partial result behind.
pub fn apply_ops(document: &Value, ops: &[PatchOp]) -> Result<Value> {
    let mut working = document.clone();
    for op in ops {
        apply_op(&mut working, op)?;
    }
    Ok(working)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Add { path, value } => set_at(doc, path, value.clone(), SetMode::Insert),
        PatchOp::Replace { path, value } => set_at(doc, path, value.clone(), SetMode::Overwrite),
        PatchOp::Remove { path } => remove_at(doc, path),
    }
}

fn set_at(doc: &mut Value, path: &EditPath, value: Value, mode: SetMode) -> Result<()> {
    let Some((last, parents)) = path.steps().split_last() else {
        *doc = value;
        return Ok(());
    };

    match parent_mut(doc, parents, path)? {
        Value::Object(map) => {
            // Members are add-or-replace under either op
            let key = object_key(last, path)?;
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            match (array_slot(last, path)?, mode) {
                (Slot::End, SetMode::Insert) => items.push(value),
                (Slot::At(i), SetMode::Insert) if i <= len => items.insert(i, value),
                (Slot::At(i), SetMode::Overwrite) if i < len => items[i] = value,
                (slot, _) => {
                    return Err(Error::patch_path(
                        path,
                        format!("array index {} out of bounds (len {})", slot, len),
                    ))
                }
            }
            Ok(())
        }
        other => Err(Error::patch_path(path, format!("cannot set inside {}", type_name(other)))),
    }
}

fn remove_at(doc: &mut Value, path: &EditPath) -> Result<()> {
    let Some((last, parents)) = path.steps().split_last() else {
        return Err(Error::patch_path(path, "cannot remove the document root"));
    };

    match parent_mut(doc, parents, path)? {
        Value::Object(map) => {
            let key = object_key(last, path)?;
            map.remove(&key)
                .map(|_| ())
                .ok_or_else(|| Error::patch_path(path, format!("no member '{}'", key)))
        }
        Value::Array(items) => match array_slot(last, path)? {
            Slot::At(i) if i < items.len() => {
                items.remove(i);
                Ok(())
            }
            slot => Err(Error::patch_path(
                path,
                format!("array index {} out of bounds (len {})", slot, items.len()),
            )),
        },
        other => Err(Error::patch_path(path, format!("cannot remove inside {}", type_name(other)))),
    }
}

/// Walk every step but the last, requiring each to exist
fn parent_mut<'a>(doc: &'a mut Value, steps: &[PathStep], path: &EditPath) -> Result<&'a mut Value> {
    let mut node = doc;
    for step in steps {
        node = match node {
            Value::Object(map) => child_member(map, step, path)?,
            Value::Array(items) => match array_slot(step, path)? {
                Slot::At(i) => {
                    let len = items.len();
                    items.get_mut(i).ok_or_else(|| {
                        Error::patch_path(path, format!("array index {} out of bounds (len {})", i, len))
                    })?
                }
                Slot::End => return Err(Error::patch_path(path, "'-' is only valid as the last step")),
            },
            other => {
                return Err(Error::patch_path(path, format!("cannot descend into {}", type_name(other))))
            }
        };
    }
    Ok(node)
}

fn child_member<'a>(map: &'a mut Map<String, Value>, step: &PathStep, path: &EditPath) -> Result<&'a mut Value> {
    let key = object_key(step, path)?;
    map.get_mut(&key)
        .ok_or_else(|| Error::patch_path(path, format!("no member '{}'", key)))
}

fn object_key(step: &PathStep, path: &EditPath) -> Result<String> {
    match step {
        PathStep::Key(k) => Ok(k.clone()),
        PathStep::Index(i) => Ok(i.to_string()),
        PathStep::Append => Err(Error::patch_path(path, "'-' does not address an object member")),
    }
}

enum Slot {
    At(usize),
    End,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::At(i) => write!(f, "{}", i),
            Slot::End => f.write_str("-"),
        }
    }
}

fn array_slot(step: &PathStep, path: &EditPath) -> Result<Slot> {
    match step {
        PathStep::Index(i) => Ok(Slot::At(*i)),
        PathStep::Append => Ok(Slot::End),
        PathStep::Key(k) => k
            .parse::<usize>()
            .map(Slot::At)
            .map_err(|_| Error::patch_path(path, format!("'{}' is not an array index", k))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(raw: Value) -> Vec<PatchOp> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_replace_member() {
        let doc = json!({"count": 1});
        let out = apply_ops(&doc, &ops(json!([{"op": "replace", "path": ["count"], "value": 7}]))).unwrap();
        assert_eq!(out, json!({"count": 7}));
    }

    #[test]
    fn test_add_creates_member_and_inserts_into_arrays() {
        let doc = json!({"rows": ["a", "c"]});
        let out = apply_ops(
            &doc,
            &ops(json!([
                {"op": "add", "path": ["rows", 1], "value": "b"},
                {"op": "add", "path": "/rows/-", "value": "d"},
                {"op": "add", "path": ["title"], "value": "Sheet"}
            ])),
        )
        .unwrap();
        assert_eq!(out, json!({"rows": ["a", "b", "c", "d"], "title": "Sheet"}));
    }

    #[test]
    fn test_replace_missing_member_adds_it() {
        let doc = json!({"count": 1});
        let out = apply_ops(&doc, &ops(json!([{"op": "replace", "path": "/title", "value": "Sheet"}]))).unwrap();
        assert_eq!(out, json!({"count": 1, "title": "Sheet"}));
    }

    #[test]
    fn test_replace_array_element_requires_existing_index() {
        let doc = json!({"rows": [1, 2]});
        let out = apply_ops(&doc, &ops(json!([{"op": "replace", "path": "/rows/1", "value": 9}]))).unwrap();
        assert_eq!(out, json!({"rows": [1, 9]}));

        let err = apply_ops(&doc, &ops(json!([{"op": "replace", "path": "/rows/2", "value": 9}]))).unwrap_err();
        assert!(matches!(err, Error::PatchPath { .. }));
    }

    #[test]
    fn test_remove() {
        let doc = json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]});
        let out = apply_ops(
            &doc,
            &ops(json!([
                {"op": "remove", "path": ["a", "b"]},
                {"op": "remove", "path": ["list", 0]}
            ])),
        )
        .unwrap();
        assert_eq!(out, json!({"a": {"c": 2}, "list": [2, 3]}));
    }

    #[test]
    fn test_root_replace_and_root_remove() {
        let doc = json!({"old": true});
        let out = apply_ops(&doc, &ops(json!([{"op": "replace", "path": [], "value": [1]}]))).unwrap();
        assert_eq!(out, json!([1]));

        let err = apply_ops(&doc, &ops(json!([{"op": "remove", "path": ""}]))).unwrap_err();
        assert!(matches!(err, Error::PatchPath { .. }));
    }

    #[test]
    fn test_unreachable_path_fails_whole_list() {
        let doc = json!({"count": 1});
        let edits = ops(json!([
            {"op": "replace", "path": ["count"], "value": 2},
            {"op": "add", "path": ["missing", "deep"], "value": 3}
        ]));

        let err = apply_ops(&doc, &edits).unwrap_err();
        assert!(err.to_string().contains("/missing/deep"));
        // Input untouched
        assert_eq!(doc, json!({"count": 1}));
    }

    #[test]
    fn test_descend_into_scalar_fails() {
        let doc = json!({"count": 1});
        let err = apply_ops(&doc, &ops(json!([{"op": "add", "path": "/count/x", "value": 0}]))).unwrap_err();
        assert!(err.to_string().contains("a number"));
    }

    #[test]
    fn test_pointer_escapes() {
        let path = EditPath::from_pointer("/a~1b/c~0d").unwrap();
        assert_eq!(
            path.steps(),
            &[PathStep::Key("a/b".into()), PathStep::Key("c~d".into())]
        );
        assert_eq!(path.to_string(), "/a~1b/c~0d");
        assert!(EditPath::from_pointer("no-slash").is_err());
    }

    #[test]
    fn test_path_serializes_as_steps() {
        let path = EditPath(vec![PathStep::Key("rows".into()), PathStep::Index(2), PathStep::Append]);
        assert_eq!(serde_json::to_value(&path).unwrap(), json!(["rows", 2, "-"]));
    }
}
