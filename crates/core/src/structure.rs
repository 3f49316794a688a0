//! # Structures - Nested Values with Stable Leaf Keys
//!
//! A `Structure<T>` is a tree whose leaves are values (spaces, leaf
//! operations, runtime tensors) and whose internal nodes are ordered
//! mappings or fixed-arity tuples. It is how multi-tensor values travel
//! through single-valued call interfaces.
//!
//! ## Flat keys
//!
//! Flattening walks the tree depth-first (dict entries in key order, tuple
//! entries by position) and names every leaf by its path:
//!
//! | Node | Key segment |
//! |------|-------------|
//! | root leaf | `""` |
//! | dict entry `name` | `/name` |
//! | tuple entry `i` | `/[i]` |
//!
//! So `{"a": (x, y), "b": z}` flattens to `/a/[0]`, `/a/[1]`, `/b`. Keys
//! depend only on the path, never on how often or in which order the tree
//! is flattened, which is what lets split graph functions line up leaves of
//! different arguments.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::CoreError;

/// A nested container of leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Structure<T> {
    /// A single value.
    Leaf(T),
    /// A fixed-arity sequence of sub-structures.
    Tuple(Vec<Structure<T>>),
    /// A mapping from names to sub-structures, iterated in key order.
    Dict(BTreeMap<String, Structure<T>>),
}

/// The shape of a structure with the leaves stripped away.
pub type Template = Structure<()>;

impl<T> Structure<T> {
    /// Wrap a single value.
    pub fn leaf(value: T) -> Self {
        Structure::Leaf(value)
    }

    /// Build a tuple from its entries.
    pub fn tuple(items: impl IntoIterator<Item = Structure<T>>) -> Self {
        Structure::Tuple(items.into_iter().collect())
    }

    /// Build a dict from `(name, structure)` pairs.
    pub fn dict<K: Into<String>>(items: impl IntoIterator<Item = (K, Structure<T>)>) -> Self {
        Structure::Dict(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// True for tuples and dicts; a bare leaf is not structured.
    pub fn is_structured(&self) -> bool {
        !matches!(self, Structure::Leaf(_))
    }

    /// The leaf value, if this is a bare leaf.
    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Structure::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Consume into the leaf value, if this is a bare leaf.
    pub fn into_leaf(self) -> Option<T> {
        match self {
            Structure::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Number of leaves in the tree.
    pub fn num_leaves(&self) -> usize {
        match self {
            Structure::Leaf(_) => 1,
            Structure::Tuple(items) => items.iter().map(Structure::num_leaves).sum(),
            Structure::Dict(items) => items.values().map(Structure::num_leaves).sum(),
        }
    }

    /// Apply `f` to every leaf, keeping the tree shape.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Structure<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(&self, f: &mut impl FnMut(&T) -> U) -> Structure<U> {
        match self {
            Structure::Leaf(value) => Structure::Leaf(f(value)),
            Structure::Tuple(items) => {
                Structure::Tuple(items.iter().map(|item| item.map_inner(f)).collect())
            }
            Structure::Dict(items) => Structure::Dict(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_inner(f)))
                    .collect(),
            ),
        }
    }

    /// Apply a fallible `f` to every leaf, stopping at the first error.
    pub fn try_map<U, E>(&self, mut f: impl FnMut(&T) -> Result<U, E>) -> Result<Structure<U>, E> {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<U, E>(
        &self,
        f: &mut impl FnMut(&T) -> Result<U, E>,
    ) -> Result<Structure<U>, E> {
        Ok(match self {
            Structure::Leaf(value) => Structure::Leaf(f(value)?),
            Structure::Tuple(items) => Structure::Tuple(
                items
                    .iter()
                    .map(|item| item.try_map_inner(f))
                    .collect::<Result<_, E>>()?,
            ),
            Structure::Dict(items) => Structure::Dict(
                items
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.try_map_inner(f)?)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    /// The tree shape without its leaves.
    pub fn template(&self) -> Template {
        self.map(|_| ())
    }

    /// Leaf keys in flatten order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.num_leaves());
        self.visit(String::new(), &mut |key, _| keys.push(key));
        keys
    }

    fn visit<'s>(&'s self, prefix: String, f: &mut impl FnMut(String, &'s T)) {
        match self {
            Structure::Leaf(value) => f(prefix, value),
            Structure::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.visit(format!("{prefix}/[{i}]"), f);
                }
            }
            Structure::Dict(items) => {
                for (name, item) in items {
                    item.visit(format!("{prefix}/{name}"), f);
                }
            }
        }
    }

    fn visit_owned(self, prefix: String, f: &mut impl FnMut(String, T)) {
        match self {
            Structure::Leaf(value) => f(prefix, value),
            Structure::Tuple(items) => {
                for (i, item) in items.into_iter().enumerate() {
                    item.visit_owned(format!("{prefix}/[{i}]"), f);
                }
            }
            Structure::Dict(items) => {
                for (name, item) in items {
                    item.visit_owned(format!("{prefix}/{name}"), f);
                }
            }
        }
    }

    /// Flatten into a leaf-key → leaf mapping (cloning the leaves).
    pub fn flatten(&self) -> Flattened<T>
    where
        T: Clone,
    {
        let mut entries = Vec::with_capacity(self.num_leaves());
        self.visit(String::new(), &mut |key, value| entries.push((key, value.clone())));
        Flattened { entries }
    }

    /// Flatten into a leaf-key → leaf mapping, consuming the tree.
    pub fn into_flattened(self) -> Flattened<T> {
        let mut entries = Vec::new();
        self.visit_owned(String::new(), &mut |key, value| entries.push((key, value)));
        Flattened { entries }
    }

    /// Rebuild a structure shaped like `template` from a flat mapping.
    ///
    /// Every key the template produces must be present exactly once and no
    /// other keys may remain. Empty tuples and dicts in the template come
    /// back empty.
    pub fn unflatten<U>(flat: Flattened<T>, template: &Structure<U>) -> Result<Self, CoreError> {
        let expected = flat.len();
        let mut by_key: HashMap<String, T> = HashMap::with_capacity(expected);
        for (key, value) in flat.entries {
            if by_key.insert(key.clone(), value).is_some() {
                return Err(CoreError::StructureMismatch {
                    reason: format!("duplicate flat key '{key}'"),
                });
            }
        }
        let rebuilt = Self::take_like(&mut by_key, template, String::new())?;
        if let Some(extra) = by_key.keys().next() {
            return Err(CoreError::StructureMismatch {
                reason: format!("flat key '{extra}' does not appear in the template"),
            });
        }
        Ok(rebuilt)
    }

    fn take_like<U>(
        by_key: &mut HashMap<String, T>,
        template: &Structure<U>,
        prefix: String,
    ) -> Result<Self, CoreError> {
        Ok(match template {
            Structure::Leaf(_) => match by_key.remove(&prefix) {
                Some(value) => Structure::Leaf(value),
                None => {
                    return Err(CoreError::StructureMismatch {
                        reason: format!("missing flat key '{prefix}'"),
                    })
                }
            },
            Structure::Tuple(items) => Structure::Tuple(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Self::take_like(by_key, item, format!("{prefix}/[{i}]")))
                    .collect::<Result<_, _>>()?,
            ),
            Structure::Dict(items) => Structure::Dict(
                items
                    .iter()
                    .map(|(name, item)| {
                        Ok((
                            name.clone(),
                            Self::take_like(by_key, item, format!("{prefix}/{name}"))?,
                        ))
                    })
                    .collect::<Result<_, CoreError>>()?,
            ),
        })
    }

    /// Whether `other` has exactly the same tree shape.
    pub fn same_structure<U>(&self, other: &Structure<U>) -> bool {
        match (self, other) {
            (Structure::Leaf(_), Structure::Leaf(_)) => true,
            (Structure::Tuple(a), Structure::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Structure::Dict(a), Structure::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_structure(vb))
            }
            _ => false,
        }
    }
}

impl<T> Structure<Structure<T>> {
    /// Collapse a structure of structures into one tree, replacing each
    /// outer leaf by the inner structure it holds.
    pub fn join(self) -> Structure<T> {
        match self {
            Structure::Leaf(inner) => inner,
            Structure::Tuple(items) => Structure::Tuple(items.into_iter().map(Self::join).collect()),
            Structure::Dict(items) => {
                Structure::Dict(items.into_iter().map(|(k, v)| (k, v.join())).collect())
            }
        }
    }
}

impl<T> From<T> for Structure<T> {
    fn from(value: T) -> Self {
        Structure::Leaf(value)
    }
}

impl<T: fmt::Display> fmt::Display for Structure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Structure::Leaf(value) => write!(f, "{value}"),
            Structure::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Structure::Dict(items) => {
                write!(f, "{{")?;
                for (i, (name, item)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ============================================================================
// Flattened mappings
// ============================================================================

/// An ordered leaf-key → leaf mapping produced by [`Structure::flatten`].
#[derive(Debug, Clone, PartialEq)]
pub struct Flattened<T> {
    entries: Vec<(String, T)>,
}

impl<T> Flattened<T> {
    /// An empty mapping.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry; keys are kept in insertion order.
    pub fn push(&mut self, key: impl Into<String>, value: T) {
        self.entries.push((key.into(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Values in key order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up a leaf by key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// True when both mappings have the same key set (order ignored).
    pub fn same_keys<U>(&self, other: &Flattened<U>) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut mine: Vec<&str> = self.keys().collect();
        let mut theirs: Vec<&str> = other.keys().collect();
        mine.sort_unstable();
        theirs.sort_unstable();
        mine == theirs
    }

    /// Rebuild a structure from the keys alone.
    ///
    /// Works for every non-empty tree; empty tuples and dicts leave no keys
    /// behind, so use [`Structure::unflatten`] with a template for those.
    pub fn unflatten(self) -> Result<Structure<T>, CoreError> {
        let entries = self
            .entries
            .into_iter()
            .map(|(key, value)| Ok((parse_key(&key)?, value)))
            .collect::<Result<Vec<_>, CoreError>>()?;
        if entries.is_empty() {
            return Err(CoreError::StructureMismatch {
                reason: "cannot unflatten an empty mapping without a template".to_string(),
            });
        }
        build_from_segments(entries)
    }
}

impl<T> Default for Flattened<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>, T> FromIterator<(K, T)> for Flattened<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl<T> IntoIterator for Flattened<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Index(usize),
    Name(String),
}

fn parse_key(key: &str) -> Result<Vec<Segment>, CoreError> {
    if key.is_empty() {
        return Ok(Vec::new());
    }
    let rest = key.strip_prefix('/').ok_or_else(|| CoreError::StructureMismatch {
        reason: format!("flat key '{key}' must start with '/'"),
    })?;
    rest.split('/')
        .map(|segment| {
            if let Some(index) = segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                index
                    .parse()
                    .map(Segment::Index)
                    .map_err(|_| CoreError::StructureMismatch {
                        reason: format!("bad tuple index in flat key '{key}'"),
                    })
            } else if segment.is_empty() {
                Err(CoreError::StructureMismatch {
                    reason: format!("empty segment in flat key '{key}'"),
                })
            } else {
                Ok(Segment::Name(segment.to_string()))
            }
        })
        .collect()
}

fn build_from_segments<T>(entries: Vec<(Vec<Segment>, T)>) -> Result<Structure<T>, CoreError> {
    if entries.iter().any(|(segments, _)| segments.is_empty()) {
        return match <[_; 1]>::try_from(entries) {
            Ok([(_, value)]) => Ok(Structure::Leaf(value)),
            Err(_) => Err(CoreError::StructureMismatch {
                reason: "a leaf key collides with a container key".to_string(),
            }),
        };
    }

    let mut groups: BTreeMap<Segment, Vec<(Vec<Segment>, T)>> = BTreeMap::new();
    for (mut segments, value) in entries {
        let head = segments.remove(0);
        groups.entry(head).or_default().push((segments, value));
    }

    let all_indices = groups.keys().all(|s| matches!(s, Segment::Index(_)));
    let all_names = groups.keys().all(|s| matches!(s, Segment::Name(_)));

    if all_indices {
        let mut items = Vec::with_capacity(groups.len());
        for (expected, (segment, group)) in groups.into_iter().enumerate() {
            if segment != Segment::Index(expected) {
                return Err(CoreError::StructureMismatch {
                    reason: format!("tuple index {expected} is missing"),
                });
            }
            items.push(build_from_segments(group)?);
        }
        Ok(Structure::Tuple(items))
    } else if all_names {
        let mut items = BTreeMap::new();
        for (segment, group) in groups {
            if let Segment::Name(name) = segment {
                items.insert(name, build_from_segments(group)?);
            }
        }
        Ok(Structure::Dict(items))
    } else {
        Err(CoreError::StructureMismatch {
            reason: "tuple and dict keys mixed at one level".to_string(),
        })
    }
}
