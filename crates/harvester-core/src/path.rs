//! Field paths into nested records.
//!
//! A path such as `metadata.titles[0].titleText` parses into a sequence of
//! [`PathStep`]s, each naming a field and optionally an index into the array
//! held by that field. Paths are applied through the [`PathNode`] trait, so the
//! walker only depends on a handful of container primitives.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("empty field path")]
    Empty,
    #[error("malformed segment '{0}'")]
    Malformed(String),
    #[error("'{0}' is not an object")]
    NotAnObject(String),
    #[error("'{0}' is not an array")]
    NotAnArray(String),
    #[error("index {index} out of range for '{field}' (len {len})")]
    IndexOutOfRange {
        field: String,
        index: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub field: String,
    pub index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    steps: Vec<PathStep>,
}

impl FieldPath {
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PathError::Empty);
        }
        let mut steps = Vec::new();
        for segment in input.split('.') {
            steps.push(parse_segment(segment)?);
        }
        Ok(FieldPath { steps })
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// True when `self` equals `prefix` or lies underneath it.
    /// An indexed step matches an unindexed prefix step of the same field.
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        if prefix.steps.len() > self.steps.len() {
            return false;
        }
        self.steps
            .iter()
            .zip(&prefix.steps)
            .all(|(own, pre)| own.field == pre.field && (pre.index.is_none() || pre.index == own.index))
    }
}

fn parse_segment(segment: &str) -> Result<PathStep, PathError> {
    let malformed = || PathError::Malformed(segment.to_string());
    match segment.find('[') {
        None => {
            if segment.is_empty() || segment.contains(']') {
                return Err(malformed());
            }
            Ok(PathStep {
                field: segment.to_string(),
                index: None,
            })
        }
        Some(open) => {
            let field = &segment[..open];
            let rest = &segment[open + 1..];
            let digits = rest.strip_suffix(']').ok_or_else(malformed)?;
            if field.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let index = digits.parse::<usize>().map_err(|_| malformed())?;
            Ok(PathStep {
                field: field.to_string(),
                index: Some(index),
            })
        }
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&step.field)?;
            if let Some(index) = step.index {
                write!(f, "[{}]", index)?;
            }
        }
        Ok(())
    }
}

/// Container kinds the walker creates for missing intermediate steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Array,
}

/// Container primitives a tree must offer to be walked by a [`FieldPath`].
pub trait PathNode: Sized {
    fn empty(kind: NodeKind) -> Self;
    fn null() -> Self;
    fn is_null(&self) -> bool;
    fn field(&self, name: &str) -> Option<&Self>;
    fn element(&self, index: usize) -> Option<&Self>;
    /// Mutable field access, inserting `empty(kind)` when missing or null.
    fn field_or_insert(&mut self, name: &str, kind: NodeKind) -> Option<&mut Self>;
    fn array_len(&self) -> Option<usize>;
    fn element_mut(&mut self, index: usize) -> Option<&mut Self>;
    fn push(&mut self, value: Self) -> bool;
    fn put_field(&mut self, name: &str, value: Self) -> bool;
    fn remove_field(&mut self, name: &str) -> bool;
}

/// Read the value at `path`. Missing steps yield `None`.
pub fn get<'a, N: PathNode>(root: &'a N, path: &FieldPath) -> Option<&'a N> {
    let mut node = root;
    for step in path.steps() {
        node = node.field(&step.field)?;
        if let Some(index) = step.index {
            node = node.element(index)?;
        }
    }
    Some(node)
}

/// Write `value` at `path`, creating missing intermediate containers.
///
/// A null value written to a plain field removes the key. Writing at index
/// `len` appends; a larger index is an error.
pub fn set<N: PathNode>(root: &mut N, path: &FieldPath, value: N) -> Result<(), PathError> {
    let steps = path.steps();
    let (last, parents) = steps.split_last().ok_or(PathError::Empty)?;

    let mut node = root;
    for (i, step) in parents.iter().enumerate() {
        let kind = if step.index.is_some() {
            NodeKind::Array
        } else {
            NodeKind::Object
        };
        node = node
            .field_or_insert(&step.field, kind)
            .ok_or_else(|| PathError::NotAnObject(prefix_display(steps, i)))?;
        if let Some(index) = step.index {
            node = element_or_append(node, index, &step.field, NodeKind::Object)?;
        }
    }

    let display = path.to_string();
    match last.index {
        None => {
            let written = if value.is_null() {
                node.field(&last.field).is_none() || node.remove_field(&last.field)
            } else {
                node.put_field(&last.field, value)
            };
            if !written {
                return Err(PathError::NotAnObject(display));
            }
        }
        Some(index) => {
            let array = node
                .field_or_insert(&last.field, NodeKind::Array)
                .ok_or_else(|| PathError::NotAnObject(display.clone()))?;
            let len = array.array_len().ok_or(PathError::NotAnArray(display))?;
            if index < len {
                if let Some(slot) = array.element_mut(index) {
                    *slot = value;
                }
            } else if index == len {
                array.push(value);
            } else {
                return Err(PathError::IndexOutOfRange {
                    field: last.field.clone(),
                    index,
                    len,
                });
            }
        }
    }
    Ok(())
}

fn element_or_append<'a, N: PathNode>(
    node: &'a mut N,
    index: usize,
    field: &str,
    kind: NodeKind,
) -> Result<&'a mut N, PathError> {
    let len = node
        .array_len()
        .ok_or_else(|| PathError::NotAnArray(field.to_string()))?;
    if index == len {
        node.push(N::empty(kind));
    } else if index > len {
        return Err(PathError::IndexOutOfRange {
            field: field.to_string(),
            index,
            len,
        });
    }
    node.element_mut(index)
        .ok_or_else(|| PathError::NotAnArray(field.to_string()))
}

fn prefix_display(steps: &[PathStep], upto: usize) -> String {
    FieldPath {
        steps: steps[..=upto].to_vec(),
    }
    .to_string()
}

impl PathNode for serde_json::Value {
    fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Object => serde_json::Value::Object(serde_json::Map::new()),
            NodeKind::Array => serde_json::Value::Array(Vec::new()),
        }
    }

    fn null() -> Self {
        serde_json::Value::Null
    }

    fn is_null(&self) -> bool {
        serde_json::Value::is_null(self)
    }

    fn field(&self, name: &str) -> Option<&Self> {
        self.as_object()?.get(name)
    }

    fn element(&self, index: usize) -> Option<&Self> {
        self.as_array()?.get(index)
    }

    fn field_or_insert(&mut self, name: &str, kind: NodeKind) -> Option<&mut Self> {
        let map = self.as_object_mut()?;
        let entry = map.entry(name.to_string()).or_insert(serde_json::Value::Null);
        if entry.is_null() {
            *entry = Self::empty(kind);
        }
        Some(entry)
    }

    fn array_len(&self) -> Option<usize> {
        self.as_array().map(Vec::len)
    }

    fn element_mut(&mut self, index: usize) -> Option<&mut Self> {
        self.as_array_mut()?.get_mut(index)
    }

    fn push(&mut self, value: Self) -> bool {
        match self.as_array_mut() {
            Some(items) => {
                items.push(value);
                true
            }
            None => false,
        }
    }

    fn put_field(&mut self, name: &str, value: Self) -> bool {
        match self.as_object_mut() {
            Some(map) => {
                map.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }

    fn remove_field(&mut self, name: &str) -> bool {
        match self.as_object_mut() {
            Some(map) => {
                map.remove(name);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_fields_and_indices() {
        let p = path("metadata.titles[2].titleText");
        assert_eq!(p.steps().len(), 3);
        assert_eq!(p.steps()[1].field, "titles");
        assert_eq!(p.steps()[1].index, Some(2));
        assert_eq!(p.to_string(), "metadata.titles[2].titleText");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(FieldPath::parse(""), Err(PathError::Empty));
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("a[x]").is_err());
        assert!(FieldPath::parse("a[1").is_err());
        assert!(FieldPath::parse("[1]").is_err());
        assert!(FieldPath::parse("a[0][1]").is_err());
    }

    #[test]
    fn test_get_walks_objects_and_arrays() {
        let doc = json!({"metadata": {"titles": [{"titleText": "a"}, {"titleText": "b"}]}});
        assert_eq!(get(&doc, &path("metadata.titles[1].titleText")), Some(&json!("b")));
        assert_eq!(get(&doc, &path("metadata.titles[5].titleText")), None);
        assert_eq!(get(&doc, &path("metadata.missing")), None);
    }

    #[test]
    fn test_set_creates_intermediates_and_appends() {
        let mut doc = json!({"metadata": {}});
        set(&mut doc, &path("metadata.keywords[0].keywordLabel"), json!("soil")).unwrap();
        set(&mut doc, &path("metadata.keywords[1]"), json!({"keywordLabel": "water"})).unwrap();
        assert_eq!(
            doc,
            json!({"metadata": {"keywords": [{"keywordLabel": "soil"}, {"keywordLabel": "water"}]}})
        );
    }

    #[test]
    fn test_set_rejects_gap_index() {
        let mut doc = json!({"metadata": {"keywords": []}});
        let err = set(&mut doc, &path("metadata.keywords[3]"), json!("x")).unwrap_err();
        assert!(matches!(err, PathError::IndexOutOfRange { index: 3, len: 0, .. }));
    }

    #[test]
    fn test_set_null_removes_key() {
        let mut doc = json!({"metadata": {"language": "en", "assetType": "Dataset"}});
        set(&mut doc, &path("metadata.language"), serde_json::Value::Null).unwrap();
        assert_eq!(doc, json!({"metadata": {"assetType": "Dataset"}}));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = json!({"metadata": "flat"});
        assert!(set(&mut doc, &path("metadata.language"), json!("en")).is_err());
    }

    #[test]
    fn test_starts_with() {
        let protected = path("metadata.externalSourceInformation");
        assert!(path("metadata.externalSourceInformation.externalSourceURI").starts_with(&protected));
        assert!(path("metadata.externalSourceInformation").starts_with(&protected));
        assert!(!path("metadata.titles[0]").starts_with(&protected));
        assert!(path("metadata.titles[0].titleText").starts_with(&path("metadata.titles")));
    }
}
