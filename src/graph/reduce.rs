use std::collections::HashMap;
use tracing::{instrument, trace};

use super::{Graph, Inner};

/// Depth at which each vertex was last visited during a walk from one root
type Depths = HashMap<String, usize>;

impl<T> Inner<T> {
    /// Walk down from `name` recording the depth of every vertex. A vertex
    /// reachable through multiple paths keeps the depth of the last visit.
    fn label(&self, name: &str, depth: usize, depths: &mut Depths) {
        depths.insert(name.to_string(), depth);
        for child in self.down_vertices(name) {
            self.label(&child, depth + 1, depths);
        }
    }

    /// Walk down from `name` and, on every vertex, keep only the edges coming
    /// from the deepest labeled dependencies.
    fn reduce(&mut self, name: &str, depths: &Depths) {
        let deps = self.up_vertices(name);
        let best = deps
            .iter()
            .filter_map(|dep| depths.get(dep))
            .max()
            .copied()
            .unwrap_or(0);

        if best > 0 {
            for dep in deps {
                match depths.get(&dep) {
                    Some(&depth) if depth != best => {
                        trace!(from = %dep, to = %name, depth, best, "removing redundant edge");
                        self.disconnect(&dep, name);
                    }
                    _ => {}
                }
            }
        }

        for child in self.down_vertices(name) {
            self.reduce(&child, depths);
        }
    }
}

impl<T> Graph<T> {
    /// Remove dependency edges that are implied by a longer path
    ///
    /// Every vertex is used in turn as a temporary root. Vertices reachable
    /// from that root are labeled with their depth on a depth-first walk, then
    /// a second walk drops, for every vertex, the edges coming from
    /// dependencies labeled at a shallower depth than its deepest dependency.
    ///
    /// This is a depth based approximation rather than an exact transitive
    /// reduction. The graph must be acyclic.
    ///
    /// Walks do not remember finished vertices, so a vertex is visited once per
    /// path leading to it from each root. Cost grows with the number of paths
    /// rather than the number of edges, which is exponential in the number of
    /// layers for stacked diamonds.
    ///
    /// ```rust
    /// use kform_dag::Graph;
    ///
    /// let graph: Graph<()> = Graph::new();
    /// for name in ["a", "b", "c"] {
    ///     graph.add_vertex(name, ()).unwrap();
    /// }
    /// graph.connect("a", "b");
    /// graph.connect("b", "c");
    /// graph.connect("a", "c");
    ///
    /// graph.transitive_reduction();
    /// assert_eq!(graph.up_vertices("c"), vec!["b"]);
    /// ```
    #[instrument(level = "debug", skip_all)]
    pub fn transitive_reduction(&self) {
        // Hold the write lock for the whole reduction so passes from different
        // roots never observe each other half way
        let mut inner = self.write();
        let roots: Vec<String> = inner.vertices.keys().cloned().collect();
        for root in roots {
            let mut depths = Depths::new();
            inner.label(&root, 1, &mut depths);
            inner.reduce(&root, &depths);
        }
    }
}
