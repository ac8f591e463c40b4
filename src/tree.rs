//! Nested containers of tensors.
//!
//! [`Tree`] is the structure returned by modules (a single tensor, or e.g.
//! `(outputs, state)` for unrolled cores). [`Store`] holds parameters and
//! state keyed by module path and name. Both expose their leaves in a stable
//! order, with a printable path, and can be rebuilt leaf by leaf.

use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// A leaf-by-leaf view over a nested container of tensors.
pub trait Leaves: Sized {
    /// Every leaf with its path, in a deterministic order.
    fn leaves_with_path(&self) -> Vec<(String, &Tensor)>;

    /// Rebuilds the container with `f` applied to every leaf.
    fn map_leaves<F: FnMut(&Tensor) -> Tensor>(&self, f: F) -> Self;

    fn leaves(&self) -> Vec<&Tensor> {
        self.leaves_with_path().into_iter().map(|(_, t)| t).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Leaf(Tensor),
    Seq(Vec<Tree>),
    Map(BTreeMap<String, Tree>),
}

impl Tree {
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Tree)>,
        K: Into<String>,
    {
        Tree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Tree::Leaf(t) => Some(t),
            _ => None,
        }
    }

    /// Child `index` of a `Seq`.
    pub fn get(&self, index: usize) -> Option<&Tree> {
        match self {
            Tree::Seq(items) => items.get(index),
            _ => None,
        }
    }

    /// Child `key` of a `Map`.
    pub fn field(&self, key: &str) -> Option<&Tree> {
        match self {
            Tree::Map(items) => items.get(key),
            _ => None,
        }
    }

    /// `true` when both trees have the same nesting (leaf values may differ).
    pub fn same_structure(&self, other: &Tree) -> bool {
        match (self, other) {
            (Tree::Leaf(_), Tree::Leaf(_)) => true,
            (Tree::Seq(a), Tree::Seq(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Tree::Map(a), Tree::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, x), (kb, y))| ka == kb && x.same_structure(y))
            }
            _ => false,
        }
    }

    /// Combines two trees of the same structure leaf by leaf.
    ///
    /// Returns `Ok(None)` when the structures differ.
    pub fn try_zip_map<E, F>(&self, other: &Tree, mut f: F) -> Result<Option<Tree>, E>
    where
        F: FnMut(&Tensor, &Tensor) -> Result<Tensor, E>,
    {
        if !self.same_structure(other) {
            return Ok(None);
        }
        let rhs = other.leaves();
        let mut rhs = rhs.into_iter();
        let mut failure = None;
        let zipped = self.map_leaves(|lhs| {
            let result = match rhs.next() {
                Some(r) if failure.is_none() => f(lhs, r),
                _ => return lhs.clone(),
            };
            result.unwrap_or_else(|e| {
                failure = Some(e);
                lhs.clone()
            })
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(Some(zipped)),
        }
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        match self {
            Tree::Leaf(t) => out.push((prefix.to_string(), t)),
            Tree::Seq(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_leaves(&format!("{}[{}]", prefix, i), out);
                }
            }
            Tree::Map(items) => {
                for (key, item) in items {
                    item.collect_leaves(&format!("{}['{}']", prefix, key), out);
                }
            }
        }
    }

    fn rebuild<F: FnMut(&Tensor) -> Tensor>(&self, f: &mut F) -> Tree {
        match self {
            Tree::Leaf(t) => Tree::Leaf(f(t)),
            Tree::Seq(items) => Tree::Seq(items.iter().map(|item| item.rebuild(f)).collect()),
            Tree::Map(items) => Tree::Map(
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.rebuild(f)))
                    .collect(),
            ),
        }
    }
}

impl From<Tensor> for Tree {
    fn from(t: Tensor) -> Self {
        Tree::Leaf(t)
    }
}

impl Leaves for Tree {
    fn leaves_with_path(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.collect_leaves("", &mut out);
        out
    }

    fn map_leaves<F: FnMut(&Tensor) -> Tensor>(&self, mut f: F) -> Self {
        self.rebuild(&mut f)
    }
}

/// Parameters or state of a transformed function: `module -> name -> tensor`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Store {
    modules: BTreeMap<String, BTreeMap<String, Tensor>>,
}

/// Learned parameters.
pub type Params = Store;
/// Mutable module state (running statistics, counters, ...).
pub type State = Store;

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&Tensor> {
        self.modules.get(module).and_then(|entries| entries.get(name))
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.get(module, name).is_some()
    }

    /// Inserts a tensor, returning the previous value if any.
    pub fn insert(&mut self, module: &str, name: &str, value: Tensor) -> Option<Tensor> {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), value)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Number of tensors across all modules.
    pub fn len(&self) -> usize {
        self.modules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The store as a two-level `Tree::Map`.
    pub fn to_tree(&self) -> Tree {
        Tree::Map(
            self.modules
                .iter()
                .map(|(module, entries)| {
                    let inner = entries
                        .iter()
                        .map(|(name, t)| (name.clone(), Tree::Leaf(t.clone())))
                        .collect();
                    (module.clone(), Tree::Map(inner))
                })
                .collect(),
        )
    }
}

impl Leaves for Store {
    fn leaves_with_path(&self) -> Vec<(String, &Tensor)> {
        self.modules
            .iter()
            .flat_map(|(module, entries)| {
                entries
                    .iter()
                    .map(move |(name, t)| (format!("{}/{}", module, name), t))
            })
            .collect()
    }

    fn map_leaves<F: FnMut(&Tensor) -> Tensor>(&self, mut f: F) -> Self {
        let modules = self
            .modules
            .iter()
            .map(|(module, entries)| {
                let entries = entries
                    .iter()
                    .map(|(name, t)| (name.clone(), f(t)))
                    .collect();
                (module.clone(), entries)
            })
            .collect();
        Self { modules }
    }
}

impl<A: Leaves, B: Leaves> Leaves for (A, B) {
    fn leaves_with_path(&self) -> Vec<(String, &Tensor)> {
        let mut out: Vec<(String, &Tensor)> = self
            .0
            .leaves_with_path()
            .into_iter()
            .map(|(path, t)| (format!("[0]{}", path), t))
            .collect();
        out.extend(
            self.1
                .leaves_with_path()
                .into_iter()
                .map(|(path, t)| (format!("[1]{}", path), t)),
        );
        out
    }

    fn map_leaves<F: FnMut(&Tensor) -> Tensor>(&self, mut f: F) -> Self {
        (self.0.map_leaves(&mut f), self.1.map_leaves(&mut f))
    }
}
