//! Name-indexed dependency graph

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{Error, Result};

mod reduce;

/// Adjacency index, `vertex -> {neighbour, ...}`
pub(crate) type Edges = BTreeMap<String, BTreeSet<String>>;

/// Vertex set and both edge indexes.
///
/// Every edge is stored twice: `down[from]` contains `to` and `up[to]`
/// contains `from`. Both sides are always written under the same lock.
struct Inner<T> {
    vertices: BTreeMap<String, T>,
    /// `from -> {to, ...}`, the dependents of a vertex
    down: Edges,
    /// `to -> {from, ...}`, the dependencies of a vertex
    up: Edges,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Inner {
            vertices: BTreeMap::new(),
            down: BTreeMap::new(),
            up: BTreeMap::new(),
        }
    }
}

impl<T> Inner<T> {
    fn connect(&mut self, from: &str, to: &str) {
        self.down
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.up
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    fn disconnect(&mut self, from: &str, to: &str) {
        fn remove(edges: &mut Edges, key: &str, value: &str) {
            if let Some(set) = edges.get_mut(key) {
                set.remove(value);
                if set.is_empty() {
                    edges.remove(key);
                }
            }
        }

        remove(&mut self.down, from, to);
        remove(&mut self.up, to, from);
    }

    fn down_vertices(&self, name: &str) -> Vec<String> {
        self.down
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn up_vertices(&self, name: &str) -> Vec<String> {
        self.up
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_consistency(&self) -> Result<()> {
        for (from, tos) in self.down.iter() {
            for to in tos {
                let mirrored = self.up.get(to).is_some_and(|froms| froms.contains(from));
                if !mirrored
                    || !self.vertices.contains_key(from)
                    || !self.vertices.contains_key(to)
                {
                    return Err(Error::Inconsistent {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        for (to, froms) in self.up.iter() {
            for from in froms {
                let mirrored = self.down.get(from).is_some_and(|tos| tos.contains(to));
                if !mirrored {
                    return Err(Error::Inconsistent {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Consistent copy of the graph taken under a single read lock
pub(crate) struct Snapshot<T> {
    pub vertices: BTreeMap<String, T>,
    pub up: Edges,
}

/// A generic directed graph indexed by vertex name
///
/// Vertices carry an opaque payload of type `T`. An edge `from -> to`
/// means that `to` depends on `from`, i.e. `from` must complete before
/// `to` may start.
///
/// The graph can be shared between threads and reshaped concurrently,
/// all operations take `&self`.
///
/// ```rust
/// use kform_dag::Graph;
///
/// let graph: Graph<i32> = Graph::new();
/// graph.add_vertex("root", 0).unwrap();
/// graph.add_vertex("input.x", 1).unwrap();
/// graph.add_vertex("local.y", 2).unwrap();
/// graph.connect("input.x", "local.y");
///
/// // Attach every vertex without dependencies to the root
/// graph.connect_to_root("root").unwrap();
///
/// assert_eq!(graph.down_vertices("root"), vec!["input.x"]);
/// assert_eq!(graph.up_vertices("local.y"), vec!["input.x"]);
/// ```
pub struct Graph<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Graph {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl<T> Graph<T> {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new vertex to the graph
    ///
    /// Returns [`Error::DuplicateVertex`] if a vertex with the same name
    /// already exists, the graph is left unchanged in that case.
    pub fn add_vertex(&self, name: impl Into<String>, payload: T) -> Result<()> {
        let name = name.into();
        let mut inner = self.write();
        if inner.vertices.contains_key(&name) {
            return Err(Error::DuplicateVertex(name));
        }
        inner.vertices.insert(name, payload);
        Ok(())
    }

    /// Replace the payload of an existing vertex
    pub fn update_vertex(&self, name: &str, payload: T) -> Result<()> {
        let mut inner = self.write();
        match inner.vertices.get_mut(name) {
            Some(value) => {
                *value = payload;
                Ok(())
            }
            None => Err(Error::VertexNotFound(name.to_string())),
        }
    }

    /// Add the edge `from -> to`. Connecting an already connected pair is a no-op.
    pub fn connect(&self, from: &str, to: &str) {
        self.write().connect(from, to);
    }

    /// Remove the edge `from -> to`. Disconnecting an unconnected pair is a no-op.
    pub fn disconnect(&self, from: &str, to: &str) {
        self.write().disconnect(from, to);
    }

    /// Return `true` if a vertex with the given name exists
    pub fn vertex_exists(&self, name: &str) -> bool {
        self.read().vertices.contains_key(name)
    }

    /// Number of vertices in the graph
    pub fn len(&self) -> usize {
        self.read().vertices.len()
    }

    /// Return `true` if the graph has no vertices
    pub fn is_empty(&self) -> bool {
        self.read().vertices.is_empty()
    }

    /// Names of all vertices in lexicographic order
    pub fn vertex_names(&self) -> Vec<String> {
        self.read().vertices.keys().cloned().collect()
    }

    /// Names of the vertices that depend on `name`
    pub fn down_vertices(&self, name: &str) -> Vec<String> {
        self.read().down_vertices(name)
    }

    /// Names of the vertices `name` depends on
    pub fn up_vertices(&self, name: &str) -> Vec<String> {
        self.read().up_vertices(name)
    }

    /// Connect `root` to every other vertex that has no dependencies
    ///
    /// This gives the executor a single entry point to the graph.
    pub fn connect_to_root(&self, root: &str) -> Result<()> {
        let mut inner = self.write();
        if !inner.vertices.contains_key(root) {
            return Err(Error::VertexNotFound(root.to_string()));
        }

        let orphans: Vec<String> = inner
            .vertices
            .keys()
            .filter(|name| name.as_str() != root && !inner.up.contains_key(name.as_str()))
            .cloned()
            .collect();

        for name in orphans {
            inner.connect(root, &name);
        }

        Ok(())
    }

    /// Check that every edge references existing vertices and is stored on
    /// both indexes
    pub fn check_consistency(&self) -> Result<()> {
        self.read().check_consistency()
    }

    /// Build the dependency map of every vertex reachable from `from`
    ///
    /// The walk follows the dependents of each vertex, and returns
    /// [`Error::Inconsistent`] if it finds an edge pointing to a vertex
    /// that is not part of the graph.
    pub fn dependency_map(&self, from: &str) -> Result<DependencyMap> {
        fn walk<T>(
            inner: &Inner<T>,
            parent: Option<&str>,
            name: &str,
            map: &mut BTreeMap<String, Vec<String>>,
        ) -> Result<()> {
            if !inner.vertices.contains_key(name) {
                return Err(match parent {
                    Some(parent) => Error::Inconsistent {
                        from: parent.to_string(),
                        to: name.to_string(),
                    },
                    None => Error::VertexNotFound(name.to_string()),
                });
            }

            if map.contains_key(name) {
                return Ok(());
            }

            let deps = inner.up_vertices(name);
            if let Some(dep) = deps.iter().find(|d| !inner.vertices.contains_key(d.as_str())) {
                return Err(Error::Inconsistent {
                    from: dep.clone(),
                    to: name.to_string(),
                });
            }
            map.insert(name.to_string(), deps);

            for child in inner.down_vertices(name) {
                walk(inner, Some(name), &child, map)?;
            }

            Ok(())
        }

        let inner = self.read();
        let mut map = BTreeMap::new();
        walk(&inner, None, from, &mut map)?;
        Ok(DependencyMap(map))
    }

    /// Take a copy of the vertex set and the dependency index, failing if
    /// the graph is not consistent
    pub(crate) fn snapshot(&self) -> Result<Snapshot<T>>
    where
        T: Clone,
    {
        let inner = self.read();
        inner.check_consistency()?;
        Ok(Snapshot {
            vertices: inner.vertices.clone(),
            up: inner.up.clone(),
        })
    }
}

impl<T: Clone> Graph<T> {
    /// Return a copy of the payload for the given vertex
    pub fn get_vertex(&self, name: &str) -> Option<T> {
        self.read().vertices.get(name).cloned()
    }

    /// Return a copy of the full vertex set
    pub fn vertices(&self) -> BTreeMap<String, T> {
        self.read().vertices.clone()
    }
}

/// Vertices and their edges, one vertex per line
///
/// ```text
/// - input.x
///   -> local.y
/// - local.y
/// ```
impl<T> fmt::Display for Graph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        for (i, name) in inner.vertices.keys().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "- {name}")?;
            for to in inner.down_vertices(name) {
                write!(f, "\n  -> {to}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Every vertex reachable from a starting point, mapped to the list of
/// vertices it depends on
pub struct DependencyMap(BTreeMap<String, Vec<String>>);

impl Deref for DependencyMap {
    type Target = BTreeMap<String, Vec<String>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for DependencyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, deps)) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "- {name}")?;
            if !deps.is_empty() {
                write!(f, " <- {}", deps.join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dedent::dedent;
    use pretty_assertions::{assert_eq, assert_str_eq};
    use std::sync::Arc;

    use super::*;

    fn chain() -> Graph<i32> {
        let graph = Graph::new();
        graph.add_vertex("root", 0).unwrap();
        graph.add_vertex("input.x", 1).unwrap();
        graph.add_vertex("local.y", 2).unwrap();
        graph.add_vertex("resource.r", 3).unwrap();
        graph.connect("root", "input.x");
        graph.connect("input.x", "local.y");
        graph.connect("local.y", "resource.r");
        graph
    }

    #[test]
    fn it_rejects_duplicate_vertices() {
        let graph: Graph<i32> = Graph::new();
        graph.add_vertex("a", 1).unwrap();

        let res = graph.add_vertex("a", 2);
        assert_eq!(res, Err(Error::DuplicateVertex("a".to_string())));

        // the first payload is kept
        assert_eq!(graph.get_vertex("a"), Some(1));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn it_updates_existing_vertices_only() {
        let graph: Graph<&str> = Graph::new();
        graph.add_vertex("a", "one").unwrap();

        graph.update_vertex("a", "two").unwrap();
        assert_eq!(graph.get_vertex("a"), Some("two"));

        let res = graph.update_vertex("b", "three");
        assert_eq!(res, Err(Error::VertexNotFound("b".to_string())));
        assert!(!graph.vertex_exists("b"));
    }

    #[test]
    fn it_keeps_both_edge_indexes_in_sync() {
        let graph: Graph<()> = Graph::new();
        graph.add_vertex("a", ()).unwrap();
        graph.add_vertex("b", ()).unwrap();

        graph.connect("a", "b");
        assert_eq!(graph.down_vertices("a"), vec!["b"]);
        assert_eq!(graph.up_vertices("b"), vec!["a"]);

        graph.disconnect("a", "b");
        assert!(graph.down_vertices("a").is_empty());
        assert!(graph.up_vertices("b").is_empty());
    }

    #[test]
    fn connect_and_disconnect_are_idempotent() {
        let graph: Graph<()> = Graph::new();
        graph.add_vertex("a", ()).unwrap();
        graph.add_vertex("b", ()).unwrap();

        graph.connect("a", "b");
        let once = graph.to_string();
        graph.connect("a", "b");
        assert_str_eq!(graph.to_string(), once);
        assert_eq!(graph.up_vertices("b"), vec!["a"]);

        graph.disconnect("a", "b");
        graph.disconnect("a", "b");
        graph.disconnect("b", "a");
        assert!(graph.down_vertices("a").is_empty());
        assert!(graph.check_consistency().is_ok());
    }

    #[test]
    fn it_returns_empty_lists_for_unknown_vertices() {
        let graph: Graph<()> = Graph::new();
        assert!(graph.down_vertices("missing").is_empty());
        assert!(graph.up_vertices("missing").is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn vertices_returns_a_copy() {
        let graph = chain();
        let mut vertices = graph.vertices();
        vertices.insert("other".to_string(), 42);

        assert_eq!(graph.len(), 4);
        assert!(!graph.vertex_exists("other"));
        assert_eq!(
            graph.vertex_names(),
            vec!["input.x", "local.y", "resource.r", "root"]
        );
    }

    #[test]
    fn it_connects_orphans_to_root() {
        let graph: Graph<()> = Graph::new();
        for name in ["root", "input.x", "input.z", "local.y"] {
            graph.add_vertex(name, ()).unwrap();
        }
        graph.connect("input.x", "local.y");

        graph.connect_to_root("root").unwrap();

        assert_eq!(graph.down_vertices("root"), vec!["input.x", "input.z"]);
        assert_eq!(graph.up_vertices("local.y"), vec!["input.x"]);
        assert!(graph.up_vertices("root").is_empty());

        assert_eq!(
            graph.connect_to_root("missing"),
            Err(Error::VertexNotFound("missing".to_string()))
        );
    }

    #[test]
    fn it_builds_the_dependency_map() {
        let graph = chain();
        graph.add_vertex("output.o", 4).unwrap();
        graph.connect("input.x", "output.o");
        graph.connect("local.y", "output.o");

        let map = graph.dependency_map("input.x").unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map["output.o"], vec!["input.x", "local.y"]);
        assert_str_eq!(
            map.to_string(),
            dedent!(
                r#"
                - input.x <- root
                - local.y <- input.x
                - output.o <- input.x, local.y
                - resource.r <- local.y
                "#
            )
        );
    }

    #[test]
    fn it_reports_edges_to_missing_vertices() {
        let graph = chain();
        graph.connect("local.y", "resource.ghost");

        let res = graph.dependency_map("root");
        assert_eq!(
            res,
            Err(Error::Inconsistent {
                from: "local.y".to_string(),
                to: "resource.ghost".to_string()
            })
        );
        assert!(graph.check_consistency().is_err());

        assert_eq!(
            graph.dependency_map("missing"),
            Err(Error::VertexNotFound("missing".to_string()))
        );
    }

    #[test]
    fn it_displays_vertices_and_edges() {
        let graph = chain();
        assert_str_eq!(
            graph.to_string(),
            dedent!(
                r#"
                - input.x
                  -> local.y
                - local.y
                  -> resource.r
                - resource.r
                - root
                  -> input.x
                "#
            )
        );
    }

    #[test]
    fn it_allows_concurrent_construction() {
        let graph: Arc<Graph<usize>> = Arc::new(Graph::new());
        graph.add_vertex("root", 0).unwrap();

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let graph = Arc::clone(&graph);
                std::thread::spawn(move || {
                    let name = format!("resource.r{i}");
                    graph.add_vertex(name.clone(), i).unwrap();
                    graph.connect("root", &name);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(graph.len(), 9);
        assert_eq!(graph.down_vertices("root").len(), 8);
        assert!(graph.check_consistency().is_ok());
    }
}
