use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Structural errors returned by [`Graph`](`crate::Graph`) operations.
///
/// A failed vertex is not an error, it is reported as data by the
/// [`Executor`](`crate::Executor`).
pub enum Error {
    #[error("vertex `{0}` already exists")]
    /// A vertex with the same name was already added to the graph
    DuplicateVertex(String),

    #[error("vertex `{0}` not found")]
    /// The operation references a vertex that is not part of the graph
    VertexNotFound(String),

    #[error("inconsistent graph: edge `{from}` -> `{to}` references a missing vertex or has no mirror edge")]
    /// An edge references a vertex that is absent from the vertex set, or
    /// one side of the edge is missing from the opposite index.
    Inconsistent { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, Error>;
