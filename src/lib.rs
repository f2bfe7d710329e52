//! Dependency graph engine for KRM orchestration packages
//!
//! A package is parsed into named blocks (inputs, locals, resources,
//! providers, ...) and the dependencies between them. This crate provides
//! the two pieces that turn those blocks into an ordered execution:
//!
//! - [`Graph`], a name-indexed directed graph with bidirectional edge
//!   lookup and a [transitive reduction](`Graph::transitive_reduction`)
//!   to drop redundant dependencies.
//! - [`Executor`], which walks the graph concurrently, calling a
//!   [`Handler`] for every vertex once all of its dependencies succeeded.
//!
//! ```rust
//! use async_trait::async_trait;
//! use kform_dag::{Executor, Graph, Handler};
//!
//! struct Render;
//!
//! #[async_trait]
//! impl Handler<u32> for Render {
//!     async fn block_run(&self, name: &str, _value: &u32) -> bool {
//!         !name.starts_with("broken")
//!     }
//! }
//!
//! let graph = Graph::new();
//! graph.add_vertex("root", 0).unwrap();
//! graph.add_vertex("input.replicas", 3).unwrap();
//! graph.add_vertex("broken.local", 0).unwrap();
//! graph.add_vertex("resource.deployment", 1).unwrap();
//! graph.connect("input.replicas", "broken.local");
//! graph.connect("broken.local", "resource.deployment");
//! graph.connect_to_root("root").unwrap();
//!
//! let executor = Executor::new(Render);
//! let status = tokio_test::block_on(executor.run(&graph, "root")).unwrap();
//! assert!(!status.is_success());
//! ```

mod errors;
mod executor;
mod graph;

pub use errors::*;
pub use executor::*;
pub use graph::*;
