//! Flat parameter dictionaries exchanged between environments, services and
//! storage.
//!
//! Keys follow dotted names for hierarchical grids (`subgrid.name`). The `$`
//! prefix inside string values is resolved against the enclosing composite's
//! parameters prior to merge.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A single parameter value: tunable assignments, service arguments, and
/// benchmark results all use this representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    /// Convert a JSON scalar; rejects arrays and objects.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(ParamValue::Null),
            Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else {
                    Ok(ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::String(s) => Ok(ParamValue::Text(s.clone())),
            other => Err(Error::config(format!(
                "expected a scalar parameter value, got: {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Int(i) => Value::from(*i),
            ParamValue::Float(f) => Value::from(*f),
            ParamValue::Text(s) => Value::String(s.clone()),
            ParamValue::Null => Value::Null,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Flat, ordered name -> value map with dotted keys.
pub type ParamDict = BTreeMap<String, ParamValue>;

/// Overwrite the intersection of `dest` with values from `source`, then pull
/// in any of the `required` keys that `dest` is still missing. A required key
/// absent from both sides is a configuration error.
pub fn merge_params(dest: &mut ParamDict, source: &ParamDict, required: &[&str]) -> Result<()> {
    let shared: Vec<String> = dest
        .keys()
        .filter(|k| source.contains_key(*k))
        .cloned()
        .collect();
    for key in shared {
        if let Some(value) = source.get(&key) {
            dest.insert(key, value.clone());
        }
    }
    for key in required {
        if dest.contains_key(*key) {
            continue;
        }
        match source.get(*key) {
            Some(value) => {
                dest.insert((*key).to_string(), value.clone());
            }
            None => {
                return Err(Error::config(format!("missing required parameter: {key}")));
            }
        }
    }
    Ok(())
}

/// A path trie indexed by dimension name; dotted parameter names are split on
/// `.` at the boundary and reconstituted through this structure.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamNode {
    Leaf(ParamValue),
    Branch(BTreeMap<String, ParamNode>),
}

impl ParamNode {
    fn insert(&mut self, path: &[&str], value: ParamValue) -> Result<()> {
        match self {
            ParamNode::Branch(children) => {
                let (head, rest) = match path.split_first() {
                    Some(split) => split,
                    None => {
                        return Err(Error::config("empty parameter path"));
                    }
                };
                if rest.is_empty() {
                    children.insert(head.to_string(), ParamNode::Leaf(value));
                    return Ok(());
                }
                let child = children
                    .entry(head.to_string())
                    .or_insert_with(|| ParamNode::Branch(BTreeMap::new()));
                child.insert(rest, value)
            }
            ParamNode::Leaf(_) => Err(Error::config(format!(
                "parameter path collides with a scalar at: {}",
                path.join(".")
            ))),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ParamNode::Leaf(value) => value.to_json(),
            ParamNode::Branch(children) => Value::Object(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Reconstitute a nested JSON object from dotted parameter names.
pub fn unflatten_params(params: &ParamDict) -> Result<Value> {
    let mut root = ParamNode::Branch(BTreeMap::new());
    for (name, value) in params {
        let path: Vec<&str> = name.split('.').collect();
        root.insert(&path, value.clone())?;
    }
    Ok(root.to_json())
}

/// Flatten a nested JSON object into dotted parameter names.
pub fn flatten_params(value: &Value) -> Result<ParamDict> {
    let mut params = ParamDict::new();
    flatten_into("", value, &mut params)?;
    Ok(params)
}

fn flatten_into(prefix: &str, value: &Value, params: &mut ParamDict) -> Result<()> {
    match value {
        Value::Object(fields) => {
            for (key, child) in fields {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&name, child, params)?;
            }
            Ok(())
        }
        scalar => {
            if prefix.is_empty() {
                return Err(Error::config("cannot flatten a top-level scalar"));
            }
            params.insert(prefix.to_string(), ParamValue::from_json(scalar)?);
            Ok(())
        }
    }
}

/// Substitute `$name` / `${name}` references against `params`, leaving
/// unknown references untouched. `$$` escapes a literal dollar sign.
pub fn substitute(template: &str, params: &ParamDict) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                match params.get(&name) {
                    Some(value) if closed => out.push_str(&value.to_string()),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some((_, n)) if n.is_ascii_alphabetic() || *n == '_' => {
                let mut name = String::new();
                while let Some((_, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || *n == '_' {
                        name.push(*n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match params.get(&name) {
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Resolve `$name` references inside the string values of `args` against the
/// parent parameters. A value that is exactly one reference keeps the typed
/// parent value instead of its textual form.
pub fn resolve_references(args: &ParamDict, parent: &ParamDict) -> ParamDict {
    args.iter()
        .map(|(key, value)| {
            let resolved = match value {
                ParamValue::Text(s) if s.contains('$') => {
                    let name = s.strip_prefix('$').map(|n| n.trim_matches(['{', '}']));
                    match name.and_then(|n| parent.get(n)) {
                        Some(parent_value) if is_whole_reference(s) => parent_value.clone(),
                        _ => ParamValue::Text(substitute(s, parent)),
                    }
                }
                other => other.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

fn is_whole_reference(s: &str) -> bool {
    let Some(body) = s.strip_prefix('$') else {
        return false;
    };
    let body = body
        .strip_prefix('{')
        .and_then(|b| b.strip_suffix('}'))
        .unwrap_or(body);
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && body.chars().next().is_some_and(|c| !c.is_ascii_digit())
}
