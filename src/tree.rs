//! Tree values as the database returns them, and the path flattening used by
//! the backup files.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Number, Value};

/// A leaf value. The database has no null leaves: null means absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Number(Number),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar(Scalar),
    Branch(BTreeMap<String, Node>),
}

impl Scalar {
    /// Reads a value back from its text form in a backup file.
    ///
    /// `true`/`false` become booleans and canonical JSON numbers become
    /// numbers; everything else stays a string. Text like `007` or `1e5`
    /// does not round-trip as a number, so it stays a string.
    pub fn infer(text: &str) -> Scalar {
        match text {
            "true" => return Scalar::Bool(true),
            "false" => return Scalar::Bool(false),
            _ => {}
        }
        if let Ok(number) = serde_json::from_str::<Number>(text) {
            if number.to_string() == text {
                return Scalar::Number(number);
            }
        }
        Scalar::String(text.to_string())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::String(s) => f.write_str(s),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::String(s) => Value::String(s),
            Scalar::Number(n) => Value::Number(n),
            Scalar::Bool(b) => Value::Bool(b),
        }
    }
}

impl Node {
    /// Converts a decoded JSON value. Returns `None` for null.
    ///
    /// Arrays are how the REST API renders children with sequential integer
    /// keys, so they become branches keyed by index. Null slots are skipped.
    pub fn from_json(value: &Value) -> Option<Node> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Node::Scalar(Scalar::Bool(*b))),
            Value::Number(n) => Some(Node::Scalar(Scalar::Number(n.clone()))),
            Value::String(s) => Some(Node::Scalar(Scalar::String(s.clone()))),
            Value::Array(items) => Some(Node::Branch(
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, item)| Node::from_json(item).map(|n| (idx.to_string(), n)))
                    .collect(),
            )),
            Value::Object(map) => Some(Node::Branch(
                map.iter()
                    .filter_map(|(key, item)| Node::from_json(item).map(|n| (key.clone(), n)))
                    .collect(),
            )),
        }
    }

    #[cfg(test)]
    pub fn to_json(&self) -> Value {
        match self {
            Node::Scalar(scalar) => scalar.clone().into(),
            Node::Branch(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Joins a child key onto a path without producing a leading or doubled `/`.
pub fn join_path(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}/{key}")
    }
}

/// Flattens `node` into absolute path -> scalar records rooted at `base_path`.
pub fn flatten(node: &Node, base_path: &str) -> BTreeMap<String, Scalar> {
    let mut out = BTreeMap::new();
    flatten_into(node, base_path, &mut out);
    out
}

/// Flattens a raw JSON value. Null contributes nothing.
pub fn flatten_value(value: &Value, base_path: &str) -> BTreeMap<String, Scalar> {
    match Node::from_json(value) {
        Some(node) => flatten(&node, base_path),
        None => BTreeMap::new(),
    }
}

fn flatten_into(node: &Node, path: &str, out: &mut BTreeMap<String, Scalar>) {
    match node {
        Node::Scalar(scalar) => {
            out.insert(path.to_string(), scalar.clone());
        }
        Node::Branch(children) => {
            for (key, child) in children {
                flatten_into(child, &join_path(path, key), out);
            }
        }
    }
}

/// Rebuilds a tree from path -> scalar records.
///
/// A later record whose path runs through an earlier scalar replaces that
/// scalar with a branch.
#[cfg(test)]
pub fn unflatten<I>(records: I) -> Node
where
    I: IntoIterator<Item = (String, Scalar)>,
{
    let mut root = BTreeMap::new();
    for (path, scalar) in records {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            continue;
        };
        let mut cursor = &mut root;
        for segment in parents {
            let entry = cursor
                .entry((*segment).to_string())
                .or_insert_with(|| Node::Branch(BTreeMap::new()));
            if let Node::Scalar(_) = entry {
                *entry = Node::Branch(BTreeMap::new());
            }
            cursor = match entry {
                Node::Branch(children) => children,
                Node::Scalar(_) => unreachable!("scalar replaced by branch above"),
            };
        }
        cursor.insert((*leaf).to_string(), Node::Scalar(scalar));
    }
    Node::Branch(root)
}
