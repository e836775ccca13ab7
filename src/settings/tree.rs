//! Configuration tree over `serde_yaml::Value`.
//!
//! Layering rules:
//! - `overlay`: mappings merge key by key, recursively; any other value in
//!   the overlay replaces the base value. The overlay always wins.
//! - `replace_section`: the whole subtree at a key is swapped out. Model
//!   bundles use this for their `agent` and `env` documents.
//!
//! Interpolation is resolved lazily when a section is extracted, so an
//! overlay that changes `env.train.size` is seen by every `${env.train.size}`.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use super::expr;
use super::SettingsError;
use crate::config::MAX_INTERPOLATION_DEPTH;

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }
}

impl ConfigTree {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SettingsError> {
        let root = serde_yaml::from_str(text).map_err(|source| SettingsError::Parse {
            origin: None,
            source,
        })?;
        Ok(Self { root })
    }

    /// Load one YAML document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let root = serde_yaml::from_str(&text).map_err(|source| SettingsError::Parse {
            origin: Some(path.to_path_buf()),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Look up a dotted path. Sequence elements are addressed by index.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for seg in split_path(path) {
            node = match node {
                Value::Mapping(m) => m.get(seg)?,
                Value::Sequence(s) => s.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set a dotted path, creating intermediate mappings as needed.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let segs: Vec<&str> = split_path(path).collect();
        set_in(&mut self.root, &segs, value.into());
    }

    /// Merge `other` on top of this tree. Later overlay wins per key.
    pub fn overlay(&mut self, other: &ConfigTree) {
        merge_into(&mut self.root, &other.root);
    }

    /// Replace the subtree at `key` wholesale.
    pub fn replace_section(&mut self, key: &str, section: ConfigTree) {
        self.set(key, section.root);
    }

    /// Clone out the subtree at `key`.
    pub fn section(&self, key: &str) -> Option<ConfigTree> {
        self.get(key).cloned().map(ConfigTree::from_value)
    }

    /// Resolve every interpolation in the tree.
    pub fn resolve(&self) -> Result<ConfigTree, SettingsError> {
        Ok(Self {
            root: self.resolve_value(&self.root, 0)?,
        })
    }

    /// Resolve and deserialize the subtree at `path`.
    pub fn extract<T: DeserializeOwned>(&self, path: &str) -> Result<T, SettingsError> {
        let node = self
            .get(path)
            .ok_or_else(|| SettingsError::MissingKey(path.to_string()))?;
        let resolved = self.resolve_value(node, 0)?;
        serde_yaml::from_value(resolved).map_err(|source| SettingsError::Shape {
            key: path.to_string(),
            source,
        })
    }

    pub fn to_yaml_string(&self) -> String {
        serde_yaml::to_string(&self.root).unwrap_or_else(|e| format!("<unprintable: {e}>"))
    }

    fn resolve_value(&self, value: &Value, depth: usize) -> Result<Value, SettingsError> {
        match value {
            Value::String(s) => self.resolve_string(s, depth),
            Value::Sequence(items) => items
                .iter()
                .map(|v| self.resolve_value(v, depth))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Sequence),
            Value::Mapping(m) => {
                let mut out = Mapping::with_capacity(m.len());
                for (k, v) in m {
                    out.insert(k.clone(), self.resolve_value(v, depth)?);
                }
                Ok(Value::Mapping(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, text: &str, depth: usize) -> Result<Value, SettingsError> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(SettingsError::InterpolationDepth(text.to_string()));
        }
        let spans = find_interpolations(text)?;
        if spans.is_empty() {
            return Ok(Value::String(text.to_string()));
        }

        // A lone interpolation keeps the referenced value's type.
        if spans.len() == 1 && spans[0].0 == 0 && spans[0].1 == text.len() {
            return self.resolve_span(&text[2..text.len() - 1], depth);
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in spans {
            out.push_str(&text[cursor..start]);
            let inner = &text[start + 2..end - 1];
            let value = self.resolve_span(inner, depth)?;
            out.push_str(&scalar_text(&value).ok_or_else(|| {
                SettingsError::NonScalarInterpolation {
                    key: inner.to_string(),
                }
            })?);
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        Ok(Value::String(out))
    }

    fn resolve_span(&self, inner: &str, depth: usize) -> Result<Value, SettingsError> {
        let inner = inner.trim();
        if let Some(body) = inner.strip_prefix("eval:") {
            let body = strip_quotes(body.trim());
            let substituted = self.resolve_string(body, depth + 1)?;
            let source = scalar_text(&substituted).ok_or_else(|| {
                SettingsError::NonScalarInterpolation {
                    key: body.to_string(),
                }
            })?;
            let n = expr::evaluate(&source).map_err(|source_err| SettingsError::Expr {
                expr: source.clone(),
                source: source_err,
            })?;
            return Ok(n.into());
        }

        let target = self
            .get(inner)
            .ok_or_else(|| SettingsError::MissingKey(inner.to_string()))?;
        self.resolve_value(target, depth + 1)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn set_in(node: &mut Value, segs: &[&str], value: Value) {
    let Some((first, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(m) = node {
        let child = m
            .entry(Value::String((*first).to_string()))
            .or_insert(Value::Null);
        set_in(child, rest, value);
    }
}

fn merge_into(base: &mut Value, over: &Value) {
    match (base, over) {
        (Value::Mapping(b), Value::Mapping(o)) => {
            for (k, v) in o {
                let nested = v.is_mapping() && b.get(k).is_some_and(Value::is_mapping);
                if !nested {
                    b.insert(k.clone(), v.clone());
                } else if let Some(existing) = b.get_mut(k) {
                    merge_into(existing, v);
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

/// Byte ranges of top-level `${...}` spans, brace-balanced.
fn find_interpolations(text: &str) -> Result<Vec<(usize, usize)>, SettingsError> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            let start = i;
            let mut level = 0usize;
            let mut j = i + 1;
            let mut closed = None;
            while j < bytes.len() {
                match bytes[j] {
                    b'{' => level += 1,
                    b'}' => {
                        level -= 1;
                        if level == 0 {
                            closed = Some(j + 1);
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            let end = closed.ok_or_else(|| SettingsError::MalformedInterpolation(text.to_string()))?;
            spans.push((start, end));
            i = end;
        } else {
            i += 1;
        }
    }
    Ok(spans)
}

fn strip_quotes(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')));
    if quoted {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}
